// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Volatile event queue store for tests and hosts that opt out of persistence.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use loom_capture_core::config::DEFAULT_MESSAGE_BYTE_LIMIT;
use loom_capture_core::{codec, EnvironmentId, Message, SessionId, UserId};

use crate::error::Result;
use crate::queue::{byte_limited_prefix, EventQueueStore, PendingMessage, PruneRequest, UserToUpload};

type UserKey = (EnvironmentId, UserId);

#[derive(Debug)]
struct UserEntry {
	identity: Option<String>,
	creation_date: DateTime<Utc>,
	has_sent_user: bool,
	has_sent_identity: bool,
	properties: BTreeMap<String, PropertyEntry>,
	sessions: Vec<SessionEntry>,
}

#[derive(Debug)]
struct PropertyEntry {
	value: String,
	has_been_sent: bool,
}

#[derive(Debug)]
struct SessionEntry {
	id: SessionId,
	last_event_date: DateTime<Utc>,
	messages: Vec<PendingMessage>,
}

#[derive(Debug, Default)]
struct Inner {
	users: BTreeMap<UserKey, UserEntry>,
	next_identifier: i64,
}

impl Inner {
	fn session_mut(
		&mut self,
		env_id: &EnvironmentId,
		user_id: &UserId,
		session_id: &SessionId,
	) -> Option<&mut SessionEntry> {
		self
			.users
			.get_mut(&(env_id.clone(), *user_id))?
			.sessions
			.iter_mut()
			.find(|s| &s.id == session_id)
	}

	fn push_message(&mut self, message: &Message, payload: Vec<u8>) -> bool {
		self.next_identifier += 1;
		let identifier = self.next_identifier;
		match self.session_mut(&message.env_id, &message.user_id, &message.session_id) {
			Some(session) => {
				session.last_event_date = session.last_event_date.max(message.time);
				session.messages.push(PendingMessage { identifier, payload });
				true
			}
			None => false,
		}
	}
}

/// An [`EventQueueStore`] held entirely in memory.
#[derive(Debug)]
pub struct InMemoryEventQueueStore {
	inner: Mutex<Inner>,
	message_byte_limit: usize,
}

impl Default for InMemoryEventQueueStore {
	fn default() -> Self {
		Self::new()
	}
}

impl InMemoryEventQueueStore {
	pub fn new() -> Self {
		Self {
			inner: Mutex::new(Inner::default()),
			message_byte_limit: DEFAULT_MESSAGE_BYTE_LIMIT,
		}
	}

	/// Sets the largest record accepted into the queue.
	pub fn with_message_byte_limit(mut self, limit: usize) -> Self {
		self.message_byte_limit = limit;
		self
	}

	fn lock(&self) -> MutexGuard<'_, Inner> {
		// Every mutation completes before the guard drops, so a poisoned lock
		// still holds consistent data.
		self.inner.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn encode(&self, message: &Message) -> Result<Option<Vec<u8>>> {
		let payload = codec::encode_record(message)?;
		if payload.len() > self.message_byte_limit {
			warn!(
				message_id = %message.id,
				size = payload.len(),
				limit = self.message_byte_limit,
				"dropped message exceeding the byte limit"
			);
			return Ok(None);
		}
		Ok(Some(payload))
	}
}

#[async_trait]
impl EventQueueStore for InMemoryEventQueueStore {
	async fn create_new_user_if_needed(
		&self,
		env_id: &EnvironmentId,
		user_id: &UserId,
		identity: Option<&str>,
		creation_date: DateTime<Utc>,
	) -> Result<()> {
		let mut inner = self.lock();
		let entry = inner
			.users
			.entry((env_id.clone(), *user_id))
			.or_insert_with(|| UserEntry {
				identity: None,
				creation_date,
				has_sent_user: false,
				has_sent_identity: false,
				properties: BTreeMap::new(),
				sessions: Vec::new(),
			});
		if entry.identity.is_none() {
			if let Some(identity) = identity {
				entry.identity = Some(identity.to_string());
				entry.has_sent_identity = false;
			}
		}
		Ok(())
	}

	async fn set_identity_if_null(
		&self,
		env_id: &EnvironmentId,
		user_id: &UserId,
		identity: &str,
	) -> Result<()> {
		let mut inner = self.lock();
		if let Some(user) = inner.users.get_mut(&(env_id.clone(), *user_id)) {
			if user.identity.is_none() {
				user.identity = Some(identity.to_string());
				user.has_sent_identity = false;
			}
		}
		Ok(())
	}

	async fn insert_or_update_user_property(
		&self,
		env_id: &EnvironmentId,
		user_id: &UserId,
		name: &str,
		value: &str,
	) -> Result<()> {
		let mut inner = self.lock();
		let Some(user) = inner.users.get_mut(&(env_id.clone(), *user_id)) else {
			debug!(env_id = %env_id, user_id = %user_id, "dropped property for unknown user");
			return Ok(());
		};
		match user.properties.get_mut(name) {
			Some(existing) if existing.value == value => {}
			Some(existing) => {
				existing.value = value.to_string();
				existing.has_been_sent = false;
			}
			None => {
				user.properties.insert(
					name.to_string(),
					PropertyEntry {
						value: value.to_string(),
						has_been_sent: false,
					},
				);
			}
		}
		Ok(())
	}

	async fn create_session_if_needed(&self, message: &Message) -> Result<()> {
		let Some(payload) = self.encode(message)? else {
			return Ok(());
		};
		let mut inner = self.lock();
		let Some(user) = inner
			.users
			.get_mut(&(message.env_id.clone(), message.user_id))
		else {
			debug!(session_id = %message.session_id, "dropped session for unknown user");
			return Ok(());
		};
		if user.sessions.iter().any(|s| s.id == message.session_id) {
			return Ok(());
		}
		user.sessions.push(SessionEntry {
			id: message.session_id,
			last_event_date: message.time,
			messages: Vec::new(),
		});
		inner.push_message(message, payload);
		Ok(())
	}

	async fn insert_pending_message(&self, message: &Message) -> Result<()> {
		let Some(payload) = self.encode(message)? else {
			return Ok(());
		};
		if !self.lock().push_message(message, payload) {
			debug!(session_id = %message.session_id, "dropped message for unknown session");
		}
		Ok(())
	}

	async fn users_to_upload(&self) -> Result<Vec<UserToUpload>> {
		let inner = self.lock();
		let mut users: Vec<UserToUpload> = inner
			.users
			.iter()
			.map(|((env_id, user_id), user)| UserToUpload {
				env_id: env_id.clone(),
				user_id: *user_id,
				identity: user.identity.clone(),
				creation_date: user.creation_date,
				needs_initial_upload: !user.has_sent_user,
				needs_identity_upload: user.identity.is_some() && !user.has_sent_identity,
				pending_user_properties: user
					.properties
					.iter()
					.filter(|(_, p)| !p.has_been_sent)
					.map(|(name, p)| (name.clone(), p.value.clone()))
					.collect(),
				session_ids: user.sessions.iter().map(|s| s.id).collect(),
			})
			.collect();
		users.sort_by_key(|u| u.creation_date);
		Ok(users)
	}

	async fn get_pending_encoded_messages(
		&self,
		env_id: &EnvironmentId,
		user_id: &UserId,
		session_id: &SessionId,
		message_limit: usize,
		byte_limit: usize,
	) -> Result<Vec<PendingMessage>> {
		let mut inner = self.lock();
		let Some(session) = inner.session_mut(env_id, user_id, session_id) else {
			return Ok(Vec::new());
		};
		let candidates = session.messages.iter().take(message_limit).cloned();
		Ok(byte_limited_prefix(candidates, byte_limit))
	}

	async fn delete_sent_messages(&self, identifiers: &[i64]) -> Result<()> {
		if identifiers.is_empty() {
			return Ok(());
		}
		let mut inner = self.lock();
		for user in inner.users.values_mut() {
			for session in &mut user.sessions {
				session
					.messages
					.retain(|m| !identifiers.contains(&m.identifier));
			}
		}
		Ok(())
	}

	async fn set_has_sent_initial_user(
		&self,
		env_id: &EnvironmentId,
		user_id: &UserId,
	) -> Result<()> {
		if let Some(user) = self.lock().users.get_mut(&(env_id.clone(), *user_id)) {
			user.has_sent_user = true;
		}
		Ok(())
	}

	async fn set_has_sent_identity(&self, env_id: &EnvironmentId, user_id: &UserId) -> Result<()> {
		if let Some(user) = self.lock().users.get_mut(&(env_id.clone(), *user_id)) {
			if user.identity.is_some() {
				user.has_sent_identity = true;
			}
		}
		Ok(())
	}

	async fn set_has_sent_user_property(
		&self,
		env_id: &EnvironmentId,
		user_id: &UserId,
		name: &str,
		value: &str,
	) -> Result<()> {
		if let Some(user) = self.lock().users.get_mut(&(env_id.clone(), *user_id)) {
			if let Some(property) = user.properties.get_mut(name) {
				if property.value == value {
					property.has_been_sent = true;
				}
			}
		}
		Ok(())
	}

	async fn delete_session(
		&self,
		env_id: &EnvironmentId,
		user_id: &UserId,
		session_id: &SessionId,
	) -> Result<()> {
		if let Some(user) = self.lock().users.get_mut(&(env_id.clone(), *user_id)) {
			user.sessions.retain(|s| &s.id != session_id);
		}
		Ok(())
	}

	async fn delete_user(&self, env_id: &EnvironmentId, user_id: &UserId) -> Result<()> {
		self.lock().users.remove(&(env_id.clone(), *user_id));
		Ok(())
	}

	async fn prune_old_data(&self, request: &PruneRequest) -> Result<()> {
		let mut inner = self.lock();

		for ((env_id, user_id), user) in inner.users.iter_mut() {
			user.sessions.retain(|session| {
				request.is_active_session(env_id, user_id, &session.id)
					|| (session.last_event_date >= request.min_last_message_date
						&& !session.messages.is_empty())
			});
		}

		inner.users.retain(|(env_id, user_id), user| {
			let quiescent = user.sessions.is_empty()
				&& !(user.identity.is_some() && !user.has_sent_identity)
				&& user.properties.values().all(|p| p.has_been_sent);
			request.is_active_user(env_id, user_id)
				|| user.creation_date >= request.min_user_creation_date
				|| !quiescent
		});

		Ok(())
	}
}
