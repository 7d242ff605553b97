// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Builds message envelopes from the current state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use loom_capture_core::{
	AppVisibility, EnvironmentId, EventKind, LibraryInfo, Message, MessageId, MessageKind,
	PageviewInfo, SessionId, UserId,
};

use crate::state::{State, VersionChange};

/// Stamps messages with this SDK's library metadata.
#[derive(Debug, Clone)]
pub struct MessageFactory {
	library: LibraryInfo,
}

impl Default for MessageFactory {
	fn default() -> Self {
		Self::new(LibraryInfo::current())
	}
}

impl MessageFactory {
	pub fn new(library: LibraryInfo) -> Self {
		Self { library }
	}

	pub fn library(&self) -> &LibraryInfo {
		&self.library
	}

	/// The message opening the state's current session. It shares the
	/// session's id and start time.
	pub fn session_message(&self, state: &State) -> Message {
		let session = &state.session_info;
		self.message(
			state,
			MessageId(*session.id.as_uuid()),
			session.time,
			MessageKind::Session,
		)
	}

	/// The message recording `pageview`. It shares the pageview's id and time.
	pub fn pageview_message(
		&self,
		pageview: &PageviewInfo,
		source_library: Option<LibraryInfo>,
		state: &State,
	) -> Message {
		let mut message = self.message(
			state,
			MessageId(*pageview.id.as_uuid()),
			pageview.time,
			MessageKind::Pageview,
		);
		message.pageview_info = Some(pageview.clone());
		message.source_library = source_library;
		message
	}

	/// The synthetic event reporting an app upgrade, attributed to the
	/// session's unattributed pageview.
	pub fn version_change_message(
		&self,
		change: &VersionChange,
		timestamp: DateTime<Utc>,
		state: &State,
	) -> Message {
		let mut message = self.message(
			state,
			MessageId::new(),
			timestamp,
			MessageKind::Event(EventKind::VersionChange {
				previous_version: change.previous_version.clone(),
				current_version: change.current_version.clone(),
			}),
		);
		message.pageview_info = Some(state.unattributed_pageview.clone());
		message
	}

	/// The state-derived part of an event whose kind, attribution and
	/// visibility arrive later.
	pub fn partial_event(
		&self,
		timestamp: DateTime<Utc>,
		source_library: Option<LibraryInfo>,
		state: &State,
	) -> PartialEvent {
		PartialEvent {
			id: MessageId::new(),
			env_id: state.env_id.clone(),
			user_id: state.user_id,
			session_id: state.session_info.id,
			time: timestamp,
			identity: state.identity.clone(),
			library: self.library.clone(),
			source_library,
			properties: state.properties.clone(),
		}
	}

	fn message(
		&self,
		state: &State,
		id: MessageId,
		time: DateTime<Utc>,
		kind: MessageKind,
	) -> Message {
		Message {
			id,
			env_id: state.env_id.clone(),
			user_id: state.user_id,
			session_id: state.session_info.id,
			time,
			identity: state.identity.clone(),
			library: self.library.clone(),
			source_library: None,
			pageview_info: None,
			app_visibility: None,
			properties: state.properties.clone(),
			kind,
		}
	}
}

/// An event message missing its asynchronously supplied parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialEvent {
	pub id: MessageId,
	pub env_id: EnvironmentId,
	pub user_id: UserId,
	pub session_id: SessionId,
	pub time: DateTime<Utc>,
	pub identity: Option<String>,
	pub library: LibraryInfo,
	pub source_library: Option<LibraryInfo>,
	pub properties: BTreeMap<String, String>,
}

impl PartialEvent {
	pub fn complete(
		self,
		kind: EventKind,
		pageview_info: PageviewInfo,
		app_visibility: AppVisibility,
	) -> Message {
		Message {
			id: self.id,
			env_id: self.env_id,
			user_id: self.user_id,
			session_id: self.session_id,
			time: self.time,
			identity: self.identity,
			library: self.library,
			source_library: self.source_library,
			pageview_info: Some(pageview_info),
			app_visibility: Some(app_visibility),
			properties: self.properties,
			kind: MessageKind::Event(kind),
		}
	}
}
