// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Session and pageview records carried on every message.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{PageviewId, SessionId};

/// The session a message belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
	pub id: SessionId,
	/// When the session started.
	pub time: DateTime<Utc>,
}

impl SessionInfo {
	/// Starts a new session at `time`.
	pub fn new_at(time: DateTime<Utc>) -> Self {
		Self {
			id: SessionId::new(),
			time,
		}
	}
}

/// Attribution context for the page or screen a message occurred on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageviewInfo {
	pub id: PageviewId,
	pub time: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub title: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub component: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub url: Option<String>,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub source_properties: BTreeMap<String, String>,
}

impl PageviewInfo {
	/// A bare pageview at `time` with no attribution details, as used for the
	/// unattributed pageview of a new session.
	pub fn new_at(time: DateTime<Utc>) -> Self {
		Self {
			id: PageviewId::new(),
			time,
			title: None,
			component: None,
			url: None,
			source_properties: BTreeMap::new(),
		}
	}

	pub fn clear_title(&mut self) {
		self.title = None;
	}
}
