// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Layered capture configuration.
//!
//! Sources produce [`CaptureConfigLayer`]s which are merged in precedence order
//! and finalized into a [`CaptureConfig`] with defaults filled in. Two
//! finalized configs compare equal exactly when recording with them behaves
//! identically, which is what `start` uses to detect a repeated call.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::sources::ConfigSource;

pub const DEFAULT_BASE_URL: &str = "https://loom.ghuntley.com/";
pub const DEFAULT_UPLOAD_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_MESSAGE_BATCH_BYTE_LIMIT: usize = 1_000_000;
pub const DEFAULT_MESSAGE_BATCH_MESSAGE_LIMIT: usize = 200;
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 5 * 60;
pub const DEFAULT_EXTENDED_SESSION_CEILING_SECS: u64 = 30 * 60;
pub const DEFAULT_MESSAGE_BYTE_LIMIT: usize = 786_432;
pub const DEFAULT_PRUNE_AGE_SECS: u64 = 6 * 24 * 60 * 60;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CaptureConfigLayer {
	pub upload_interval_secs: Option<u64>,
	pub base_url: Option<String>,
	pub message_batch_byte_limit: Option<usize>,
	pub message_batch_message_limit: Option<usize>,
	pub session_timeout_secs: Option<u64>,
	pub extended_session_ceiling_secs: Option<u64>,
	pub disable_pageview_title_capture: Option<bool>,
	pub message_byte_limit: Option<usize>,
	pub prune_age_secs: Option<u64>,
	pub request_timeout_secs: Option<u64>,
}

impl CaptureConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.upload_interval_secs.is_some() {
			self.upload_interval_secs = other.upload_interval_secs;
		}
		if other.base_url.is_some() {
			self.base_url = other.base_url;
		}
		if other.message_batch_byte_limit.is_some() {
			self.message_batch_byte_limit = other.message_batch_byte_limit;
		}
		if other.message_batch_message_limit.is_some() {
			self.message_batch_message_limit = other.message_batch_message_limit;
		}
		if other.session_timeout_secs.is_some() {
			self.session_timeout_secs = other.session_timeout_secs;
		}
		if other.extended_session_ceiling_secs.is_some() {
			self.extended_session_ceiling_secs = other.extended_session_ceiling_secs;
		}
		if other.disable_pageview_title_capture.is_some() {
			self.disable_pageview_title_capture = other.disable_pageview_title_capture;
		}
		if other.message_byte_limit.is_some() {
			self.message_byte_limit = other.message_byte_limit;
		}
		if other.prune_age_secs.is_some() {
			self.prune_age_secs = other.prune_age_secs;
		}
		if other.request_timeout_secs.is_some() {
			self.request_timeout_secs = other.request_timeout_secs;
		}
	}

	pub fn finalize(self) -> CaptureConfig {
		let session_timeout = self
			.session_timeout_secs
			.filter(|secs| *secs > 0)
			.unwrap_or(DEFAULT_SESSION_TIMEOUT_SECS);
		let extended_session_ceiling = self
			.extended_session_ceiling_secs
			.unwrap_or(DEFAULT_EXTENDED_SESSION_CEILING_SECS)
			.max(session_timeout);

		CaptureConfig {
			upload_interval: Duration::from_secs(
				self
					.upload_interval_secs
					.filter(|secs| *secs > 0)
					.unwrap_or(DEFAULT_UPLOAD_INTERVAL_SECS),
			),
			base_url: normalize_base_url(self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)),
			message_batch_byte_limit: self
				.message_batch_byte_limit
				.unwrap_or(DEFAULT_MESSAGE_BATCH_BYTE_LIMIT)
				.max(1),
			message_batch_message_limit: self
				.message_batch_message_limit
				.unwrap_or(DEFAULT_MESSAGE_BATCH_MESSAGE_LIMIT)
				.max(1),
			session_timeout: Duration::from_secs(session_timeout),
			extended_session_ceiling: Duration::from_secs(extended_session_ceiling),
			capture_pageview_title: !self.disable_pageview_title_capture.unwrap_or(false),
			message_byte_limit: self
				.message_byte_limit
				.unwrap_or(DEFAULT_MESSAGE_BYTE_LIMIT)
				.max(1),
			prune_age: Duration::from_secs(self.prune_age_secs.unwrap_or(DEFAULT_PRUNE_AGE_SECS)),
			request_timeout: Duration::from_secs(
				self
					.request_timeout_secs
					.filter(|secs| *secs > 0)
					.unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
			),
		}
	}
}

/// Fully resolved capture configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
	pub upload_interval: Duration,
	/// Always ends with `/`.
	pub base_url: String,
	pub message_batch_byte_limit: usize,
	pub message_batch_message_limit: usize,
	pub session_timeout: Duration,
	/// Upper bound applied to externally supplied session expirations.
	pub extended_session_ceiling: Duration,
	pub capture_pageview_title: bool,
	/// Records larger than this are dropped instead of queued.
	pub message_byte_limit: usize,
	/// Age after which inactive sessions and quiescent users are pruned.
	pub prune_age: Duration,
	pub request_timeout: Duration,
}

impl Default for CaptureConfig {
	fn default() -> Self {
		CaptureConfigLayer::default().finalize()
	}
}

impl CaptureConfig {
	pub fn session_timeout_delta(&self) -> chrono::Duration {
		to_delta(self.session_timeout)
	}

	pub fn extended_session_ceiling_delta(&self) -> chrono::Duration {
		to_delta(self.extended_session_ceiling)
	}

	pub fn prune_age_delta(&self) -> chrono::Duration {
		to_delta(self.prune_age)
	}
}

fn to_delta(duration: Duration) -> chrono::Duration {
	// chrono rejects spans beyond i64::MAX milliseconds.
	let secs = duration.as_secs().min((i64::MAX / 1000) as u64) as i64;
	chrono::Duration::seconds(secs)
}

fn normalize_base_url(url: &str) -> String {
	if url.ends_with('/') {
		url.to_string()
	} else {
		format!("{url}/")
	}
}

/// Loads configuration from `sources`, lowest precedence first.
pub fn load_config(sources: Vec<Box<dyn ConfigSource>>) -> Result<CaptureConfig> {
	Ok(load_layer(sources)?.finalize())
}

/// Merges `sources` in precedence order without applying defaults, so further
/// layers can still be stacked on top.
pub fn load_layer(mut sources: Vec<Box<dyn ConfigSource>>) -> Result<CaptureConfigLayer> {
	sources.sort_by_key(|s| s.precedence());

	let mut merged = CaptureConfigLayer::default();
	for source in sources {
		debug!(source = source.name(), "loading capture configuration source");
		merged.merge(source.load()?);
	}

	Ok(merged)
}
