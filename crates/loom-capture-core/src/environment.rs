// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Durable per-environment state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{EnvironmentId, UserId};
use crate::pageview::{PageviewInfo, SessionInfo};

/// State kept for one environment across process restarts.
///
/// `user_id` is absent until recording first starts in the environment. When
/// it is set, `session_info` belongs to that user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentState {
	pub env_id: EnvironmentId,
	#[serde(default)]
	pub user_id: Option<UserId>,
	#[serde(default)]
	pub identity: Option<String>,
	/// Custom properties attached to every event.
	#[serde(default)]
	pub properties: BTreeMap<String, String>,
	#[serde(default)]
	pub session_info: Option<SessionInfo>,
	#[serde(default)]
	pub session_expiration: Option<DateTime<Utc>>,
	#[serde(default)]
	pub unattributed_pageview: Option<PageviewInfo>,
	#[serde(default)]
	pub last_observed_version: Option<String>,
}

impl EnvironmentState {
	/// A fresh state for an environment that has never recorded.
	pub fn new(env_id: EnvironmentId) -> Self {
		Self {
			env_id,
			user_id: None,
			identity: None,
			properties: BTreeMap::new(),
			session_info: None,
			session_expiration: None,
			unattributed_pageview: None,
			last_observed_version: None,
		}
	}

	pub fn has_identity(&self) -> bool {
		self.identity.is_some()
	}

	/// True when the two states differ in anything other than the session
	/// expiration, which moves on every tracked event.
	pub fn differs_beyond_expiration(&self, other: &EnvironmentState) -> bool {
		let mut normalized = self.clone();
		normalized.session_expiration = other.session_expiration;
		normalized != *other
	}
}
