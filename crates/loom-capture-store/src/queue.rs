// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The event queue store contract.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use loom_capture_core::{EnvironmentId, Message, SessionId, UserId};

use crate::error::Result;

/// A queued record as returned for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
	/// Insertion-ordered identifier used to acknowledge the record.
	pub identifier: i64,
	/// The length-prefixed encoded envelope.
	pub payload: Vec<u8>,
}

impl PendingMessage {
	pub fn size(&self) -> usize {
		self.payload.len()
	}
}

/// Everything still owed to the server for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserToUpload {
	pub env_id: EnvironmentId,
	pub user_id: UserId,
	pub identity: Option<String>,
	pub creation_date: DateTime<Utc>,
	/// The initial user record has not been acknowledged yet.
	pub needs_initial_upload: bool,
	/// The identity is set and has not been acknowledged yet.
	pub needs_identity_upload: bool,
	pub pending_user_properties: BTreeMap<String, String>,
	pub session_ids: Vec<SessionId>,
}

/// Arguments of [`EventQueueStore::prune_old_data`].
#[derive(Debug, Clone)]
pub struct PruneRequest {
	pub active_env_id: EnvironmentId,
	pub active_user_id: UserId,
	pub active_session_id: SessionId,
	/// Sessions whose latest message is older than this are removed.
	pub min_last_message_date: DateTime<Utc>,
	/// Quiescent users created before this are removed.
	pub min_user_creation_date: DateTime<Utc>,
}

impl PruneRequest {
	pub fn is_active_user(&self, env_id: &EnvironmentId, user_id: &UserId) -> bool {
		&self.active_env_id == env_id && &self.active_user_id == user_id
	}

	pub fn is_active_session(
		&self,
		env_id: &EnvironmentId,
		user_id: &UserId,
		session_id: &SessionId,
	) -> bool {
		self.is_active_user(env_id, user_id) && &self.active_session_id == session_id
	}
}

/// Durable record of data not yet acknowledged by the server.
///
/// Every operation is atomic on its own; callers never rely on a sequence of
/// calls being applied together. Operations referencing a user or session that
/// does not exist are silent no-ops.
#[async_trait]
pub trait EventQueueStore: Send + Sync {
	/// Inserts the user if absent. An existing user without an identity takes
	/// `identity`; an existing identity or creation date is never overwritten.
	async fn create_new_user_if_needed(
		&self,
		env_id: &EnvironmentId,
		user_id: &UserId,
		identity: Option<&str>,
		creation_date: DateTime<Utc>,
	) -> Result<()>;

	/// Sets the identity of a user that has none.
	async fn set_identity_if_null(
		&self,
		env_id: &EnvironmentId,
		user_id: &UserId,
		identity: &str,
	) -> Result<()>;

	/// Last write wins. The property is marked pending unless the stored value
	/// already matches.
	async fn insert_or_update_user_property(
		&self,
		env_id: &EnvironmentId,
		user_id: &UserId,
		name: &str,
		value: &str,
	) -> Result<()>;

	/// Inserts the session row and its session message the first time a session
	/// is seen. Repeats are no-ops.
	async fn create_session_if_needed(&self, message: &Message) -> Result<()>;

	/// Appends a message to its session's queue if the session exists.
	async fn insert_pending_message(&self, message: &Message) -> Result<()>;

	/// All users with their upload summary.
	async fn users_to_upload(&self) -> Result<Vec<UserToUpload>>;

	/// An insertion-ordered prefix of a session's queue holding at most
	/// `message_limit` records whose sizes sum to at most `byte_limit`. The
	/// first record is always returned even when it alone exceeds `byte_limit`.
	async fn get_pending_encoded_messages(
		&self,
		env_id: &EnvironmentId,
		user_id: &UserId,
		session_id: &SessionId,
		message_limit: usize,
		byte_limit: usize,
	) -> Result<Vec<PendingMessage>>;

	/// Removes exactly the given records; unknown identifiers are ignored.
	async fn delete_sent_messages(&self, identifiers: &[i64]) -> Result<()>;

	async fn set_has_sent_initial_user(&self, env_id: &EnvironmentId, user_id: &UserId)
		-> Result<()>;

	async fn set_has_sent_identity(&self, env_id: &EnvironmentId, user_id: &UserId) -> Result<()>;

	/// Marks a property uploaded if its stored value still equals `value`.
	async fn set_has_sent_user_property(
		&self,
		env_id: &EnvironmentId,
		user_id: &UserId,
		name: &str,
		value: &str,
	) -> Result<()>;

	/// Removes a session and its messages.
	async fn delete_session(
		&self,
		env_id: &EnvironmentId,
		user_id: &UserId,
		session_id: &SessionId,
	) -> Result<()>;

	/// Removes a user with its sessions, messages and properties.
	async fn delete_user(&self, env_id: &EnvironmentId, user_id: &UserId) -> Result<()>;

	/// Removes stale sessions and quiescent users, sparing the active ones.
	///
	/// A session goes when it is not active and either its latest message
	/// predates `min_last_message_date` or it holds no messages. A user goes when
	/// it is not active, was created before `min_user_creation_date`, and has no
	/// sessions, no pending identity and no pending properties.
	async fn prune_old_data(&self, request: &PruneRequest) -> Result<()>;
}

/// Selects the longest prefix of `messages` within `byte_limit`, always keeping
/// the first message.
pub(crate) fn byte_limited_prefix(
	messages: impl IntoIterator<Item = PendingMessage>,
	byte_limit: usize,
) -> Vec<PendingMessage> {
	let mut selected = Vec::new();
	let mut total = 0usize;
	for message in messages {
		let size = message.size();
		if !selected.is_empty() && total.saturating_add(size) > byte_limit {
			break;
		}
		total = total.saturating_add(size);
		selected.push(message);
	}
	selected
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	fn sized(sizes: &[usize]) -> Vec<PendingMessage> {
		sizes
			.iter()
			.enumerate()
			.map(|(idx, size)| PendingMessage {
				identifier: idx as i64,
				payload: vec![0; *size],
			})
			.collect()
	}

	#[test]
	fn prefix_stops_at_first_overflow() {
		let selected = byte_limited_prefix(sized(&[10, 10, 10]), 15);
		assert_eq!(selected.len(), 1);

		let selected = byte_limited_prefix(sized(&[10, 10, 10]), 25);
		assert_eq!(selected.len(), 2);
	}

	#[test]
	fn oversized_first_message_is_returned_alone() {
		let selected = byte_limited_prefix(sized(&[40, 1, 1]), 15);
		assert_eq!(selected.len(), 1);
		assert_eq!(selected[0].size(), 40);
	}

	#[test]
	fn empty_input_selects_nothing() {
		assert!(byte_limited_prefix(Vec::new(), 10).is_empty());
	}

	proptest! {
		#[test]
		fn prefix_respects_limit(sizes in proptest::collection::vec(1usize..50, 0..30), limit in 1usize..200) {
			let input = sized(&sizes);
			let selected = byte_limited_prefix(input.clone(), limit);
			let total: usize = selected.iter().map(PendingMessage::size).sum();

			prop_assert_eq!(&input[..selected.len()], &selected[..]);
			if selected.len() > 1 {
				prop_assert!(total <= limit);
			}
			if !input.is_empty() {
				prop_assert!(!selected.is_empty());
			}
		}
	}
}
