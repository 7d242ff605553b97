// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Message envelopes persisted in the event queue and upload payloads.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{EnvironmentId, MessageId, SessionId, UserId};
use crate::pageview::PageviewInfo;
use crate::sdk::{LibraryInfo, SdkInfo};

/// Whether the host application was visible when an event was committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppVisibility {
	Foregrounded,
	Backgrounded,
	Unknown,
}

/// The custom or synthetic event carried by an event message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
	Custom {
		name: String,
		#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
		properties: BTreeMap<String, String>,
	},
	/// Emitted once after launch when the host app version differs from the
	/// version observed on the previous launch.
	VersionChange {
		previous_version: String,
		current_version: String,
	},
}

/// What a message records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum MessageKind {
	Session,
	Pageview,
	Event(EventKind),
}

impl MessageKind {
	pub fn name(&self) -> &'static str {
		match self {
			MessageKind::Session => "session",
			MessageKind::Pageview => "pageview",
			MessageKind::Event(_) => "event",
		}
	}
}

/// An immutable envelope stored as one queue row and uploaded as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub id: MessageId,
	pub env_id: EnvironmentId,
	pub user_id: UserId,
	pub session_id: SessionId,
	pub time: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub identity: Option<String>,
	pub library: LibraryInfo,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub source_library: Option<LibraryInfo>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub pageview_info: Option<PageviewInfo>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub app_visibility: Option<AppVisibility>,
	/// Event properties in effect when the message was created.
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub properties: BTreeMap<String, String>,
	#[serde(flatten)]
	pub kind: MessageKind,
}

/// Body of an add-user-properties upload.
///
/// A user's first upload carries `initial` metadata describing the device and
/// application the user was created on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPropertiesPayload {
	pub env_id: EnvironmentId,
	pub user_id: UserId,
	pub library: LibraryInfo,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub properties: BTreeMap<String, String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub initial: Option<SdkInfo>,
}

/// Body of an identify upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyPayload {
	pub env_id: EnvironmentId,
	pub user_id: UserId,
	pub identity: String,
	pub library: LibraryInfo,
	pub time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
	use super::*;

	fn message(kind: MessageKind) -> Message {
		Message {
			id: MessageId::new(),
			env_id: EnvironmentId::new("env1"),
			user_id: UserId::new(),
			session_id: SessionId::new(),
			time: Utc::now(),
			identity: None,
			library: LibraryInfo::current(),
			source_library: None,
			pageview_info: None,
			app_visibility: None,
			properties: BTreeMap::new(),
			kind,
		}
	}

	#[test]
	fn kind_and_payload_are_top_level_fields() {
		let json = serde_json::to_value(message(MessageKind::Event(EventKind::Custom {
			name: "click".to_string(),
			properties: BTreeMap::new(),
		})))
		.unwrap();

		assert_eq!(json["kind"], "event");
		assert_eq!(json["payload"]["type"], "custom");
		assert_eq!(json["payload"]["name"], "click");
	}

	#[test]
	fn session_message_has_no_payload() {
		let json = serde_json::to_value(message(MessageKind::Session)).unwrap();
		assert_eq!(json["kind"], "session");
		assert!(json.get("payload").is_none());
	}

	#[test]
	fn version_change_deserializes() {
		let original = message(MessageKind::Event(EventKind::VersionChange {
			previous_version: "1.0".to_string(),
			current_version: "2.0".to_string(),
		}));
		let json = serde_json::to_string(&original).unwrap();
		let parsed: Message = serde_json::from_str(&json).unwrap();
		assert_eq!(parsed, original);
	}

	#[test]
	fn kind_names() {
		assert_eq!(MessageKind::Session.name(), "session");
		assert_eq!(MessageKind::Pageview.name(), "pageview");
	}
}
