// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Builder and sanitization for event, pageview and user properties.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::warn;

/// Longest property key (and event name) accepted, in UTF-16 code units.
pub const MAX_KEY_UTF16: usize = 512;

/// Longest property value kept, in UTF-16 code units. Longer values are truncated.
pub const MAX_VALUE_UTF16: usize = 1024;

/// A builder for constructing event, pageview or user properties.
///
/// # Example
///
/// ```
/// use loom_capture_core::Properties;
///
/// let props = Properties::new()
///     .insert("button_name", "checkout")
///     .insert("price", 99.99)
///     .insert("is_premium", true);
/// assert_eq!(props.len(), 3);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Properties {
	inner: Map<String, Value>,
}

impl Properties {
	pub fn new() -> Self {
		Self { inner: Map::new() }
	}

	/// Inserts a key-value pair. Strings, numbers and booleans are recorded;
	/// nulls are dropped during sanitization and anything else is recorded as
	/// its JSON text.
	pub fn insert<K, V>(mut self, key: K, value: V) -> Self
	where
		K: Into<String>,
		V: Into<Value>,
	{
		self.inner.insert(key.into(), value.into());
		self
	}

	/// Merges another Properties into this one; `other` wins on conflicts.
	pub fn merge(mut self, other: Properties) -> Self {
		for (k, v) in other.inner {
			self.inner.insert(k, v);
		}
		self
	}

	pub fn is_empty(&self) -> bool {
		self.inner.is_empty()
	}

	pub fn len(&self) -> usize {
		self.inner.len()
	}

	pub fn get(&self, key: &str) -> Option<&Value> {
		self.inner.get(key)
	}

	/// Produces the stored string form of the properties.
	///
	/// Keys longer than [`MAX_KEY_UTF16`] or consisting only of whitespace are
	/// dropped, values are truncated to [`MAX_VALUE_UTF16`], and blank values are
	/// dropped. `method` names the calling operation in warnings.
	pub fn sanitized(&self, method: &str) -> BTreeMap<String, String> {
		let mut sanitized = BTreeMap::new();
		for (key, value) in &self.inner {
			if key.trim().is_empty() {
				warn!(method, "dropped property with a blank name");
				continue;
			}
			if utf16_len(key) > MAX_KEY_UTF16 {
				warn!(method, key = %key, "dropped property whose name exceeds {MAX_KEY_UTF16} UTF-16 code units");
				continue;
			}
			let Some(text) = value_text(value) else {
				continue;
			};
			let text = match truncate_utf16(&text, MAX_VALUE_UTF16) {
				Some(truncated) => {
					warn!(method, key = %key, "truncated property value exceeding {MAX_VALUE_UTF16} UTF-16 code units");
					truncated.to_string()
				}
				None => text,
			};
			if text.trim().is_empty() {
				warn!(method, key = %key, "dropped property with a blank value");
				continue;
			}
			sanitized.insert(key.clone(), text);
		}
		sanitized
	}
}

impl From<Value> for Properties {
	fn from(value: Value) -> Self {
		match value {
			Value::Object(map) => Self { inner: map },
			_ => Self::new(),
		}
	}
}

impl From<Map<String, Value>> for Properties {
	fn from(map: Map<String, Value>) -> Self {
		Self { inner: map }
	}
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Properties {
	fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
		Self {
			inner: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
		}
	}
}

fn value_text(value: &Value) -> Option<String> {
	match value {
		Value::Null => None,
		Value::String(s) => Some(s.clone()),
		other => Some(other.to_string()),
	}
}

/// Number of UTF-16 code units in `s`.
pub fn utf16_len(s: &str) -> usize {
	s.chars().map(char::len_utf16).sum()
}

/// Returns the longest prefix of `s` fitting in `limit` UTF-16 code units, or
/// `None` when `s` already fits. Never splits a surrogate pair.
pub fn truncate_utf16(s: &str, limit: usize) -> Option<&str> {
	let mut units = 0;
	for (idx, ch) in s.char_indices() {
		units += ch.len_utf16();
		if units > limit {
			return Some(&s[..idx]);
		}
	}
	None
}
