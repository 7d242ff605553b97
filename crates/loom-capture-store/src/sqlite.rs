// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! SQLite-backed event queue store.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, instrument, warn};

use loom_capture_core::config::DEFAULT_MESSAGE_BYTE_LIMIT;
use loom_capture_core::{codec, EnvironmentId, Message, SessionId, UserId};

use crate::error::{Result, StoreError};
use crate::pool::{create_memory_pool, create_pool};
use crate::queue::{byte_limited_prefix, EventQueueStore, PendingMessage, PruneRequest, UserToUpload};

const SCHEMA: &[&str] = &[
	r#"
	CREATE TABLE IF NOT EXISTS capture_users (
		env_id TEXT NOT NULL,
		user_id TEXT NOT NULL,
		identity TEXT,
		creation_date TEXT NOT NULL,
		has_sent_user INTEGER NOT NULL DEFAULT 0,
		has_sent_identity INTEGER NOT NULL DEFAULT 0,
		PRIMARY KEY (env_id, user_id)
	)
	"#,
	r#"
	CREATE TABLE IF NOT EXISTS capture_sessions (
		env_id TEXT NOT NULL,
		user_id TEXT NOT NULL,
		session_id TEXT NOT NULL,
		last_event_date TEXT NOT NULL,
		PRIMARY KEY (env_id, user_id, session_id),
		FOREIGN KEY (env_id, user_id)
			REFERENCES capture_users (env_id, user_id) ON DELETE CASCADE
	)
	"#,
	r#"
	CREATE TABLE IF NOT EXISTS capture_pending_messages (
		sequence_number INTEGER PRIMARY KEY AUTOINCREMENT,
		env_id TEXT NOT NULL,
		user_id TEXT NOT NULL,
		session_id TEXT NOT NULL,
		payload BLOB NOT NULL,
		FOREIGN KEY (env_id, user_id, session_id)
			REFERENCES capture_sessions (env_id, user_id, session_id) ON DELETE CASCADE
	)
	"#,
	r#"
	CREATE INDEX IF NOT EXISTS idx_capture_pending_messages_session
		ON capture_pending_messages (env_id, user_id, session_id, sequence_number)
	"#,
	r#"
	CREATE TABLE IF NOT EXISTS capture_user_properties (
		env_id TEXT NOT NULL,
		user_id TEXT NOT NULL,
		name TEXT NOT NULL,
		value TEXT NOT NULL,
		has_been_sent INTEGER NOT NULL DEFAULT 0,
		PRIMARY KEY (env_id, user_id, name),
		FOREIGN KEY (env_id, user_id)
			REFERENCES capture_users (env_id, user_id) ON DELETE CASCADE
	)
	"#,
];

/// Identifiers bound per `DELETE ... IN (...)` statement.
const DELETE_CHUNK: usize = 500;

/// SQLite implementation of the event queue store.
#[derive(Clone)]
pub struct SqliteEventQueueStore {
	pool: SqlitePool,
	message_byte_limit: usize,
}

impl SqliteEventQueueStore {
	/// Opens (creating if missing) the queue database at `path`.
	pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
		Self::from_pool(create_pool(path).await?).await
	}

	/// A private database that lives as long as the store.
	pub async fn in_memory() -> Result<Self> {
		Self::from_pool(create_memory_pool().await?).await
	}

	/// Uses an existing pool, creating the queue tables if needed. The pool must
	/// enforce foreign keys for deletes to cascade.
	pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
		let store = Self {
			pool,
			message_byte_limit: DEFAULT_MESSAGE_BYTE_LIMIT,
		};
		store.migrate().await?;
		Ok(store)
	}

	/// Sets the largest record accepted into the queue.
	pub fn with_message_byte_limit(mut self, limit: usize) -> Self {
		self.message_byte_limit = limit;
		self
	}

	pub fn pool(&self) -> &SqlitePool {
		&self.pool
	}

	#[instrument(skip(self))]
	async fn migrate(&self) -> Result<()> {
		for statement in SCHEMA {
			sqlx::query(statement).execute(&self.pool).await?;
		}
		debug!("queue schema ready");
		Ok(())
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

// Database row structs for mapping
#[derive(sqlx::FromRow)]
struct UserRow {
	env_id: String,
	user_id: String,
	identity: Option<String>,
	creation_date: String,
	has_sent_user: i64,
	has_sent_identity: i64,
}

#[derive(sqlx::FromRow)]
struct SessionRow {
	env_id: String,
	user_id: String,
	session_id: String,
}

#[derive(sqlx::FromRow)]
struct PropertyRow {
	env_id: String,
	user_id: String,
	name: String,
	value: String,
}

#[derive(sqlx::FromRow)]
struct PendingRow {
	sequence_number: i64,
	payload: Vec<u8>,
}

impl TryFrom<UserRow> for UserToUpload {
	type Error = StoreError;

	fn try_from(row: UserRow) -> Result<Self> {
		Ok(UserToUpload {
			env_id: EnvironmentId::new(row.env_id),
			user_id: row
				.user_id
				.parse()
				.map_err(|_| StoreError::InvalidData("invalid user ID".into()))?,
			needs_initial_upload: row.has_sent_user == 0,
			needs_identity_upload: row.identity.is_some() && row.has_sent_identity == 0,
			identity: row.identity,
			creation_date: parse_time(&row.creation_date)?,
			pending_user_properties: BTreeMap::new(),
			session_ids: Vec::new(),
		})
	}
}

fn format_time(time: DateTime<Utc>) -> String {
	// Fixed width so stored dates compare correctly as text.
	time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
	DateTime::parse_from_rfc3339(s)
		.map(|dt| dt.with_timezone(&Utc))
		.map_err(|e| StoreError::InvalidData(format!("invalid date: {e}")))
}

#[async_trait]
impl EventQueueStore for SqliteEventQueueStore {
	#[instrument(skip(self, identity), fields(env_id = %env_id, user_id = %user_id))]
	async fn create_new_user_if_needed(
		&self,
		env_id: &EnvironmentId,
		user_id: &UserId,
		identity: Option<&str>,
		creation_date: DateTime<Utc>,
	) -> Result<()> {
		sqlx::query(
			r#"
			INSERT INTO capture_users (env_id, user_id, identity, creation_date, has_sent_user, has_sent_identity)
			VALUES (?, ?, ?, ?, 0, 0)
			ON CONFLICT (env_id, user_id) DO UPDATE
				SET identity = excluded.identity, has_sent_identity = 0
				WHERE capture_users.identity IS NULL AND excluded.identity IS NOT NULL
			"#,
		)
		.bind(env_id.as_str())
		.bind(user_id.to_string())
		.bind(identity)
		.bind(format_time(creation_date))
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	#[instrument(skip(self, identity), fields(env_id = %env_id, user_id = %user_id))]
	async fn set_identity_if_null(
		&self,
		env_id: &EnvironmentId,
		user_id: &UserId,
		identity: &str,
	) -> Result<()> {
		sqlx::query(
			r#"
			UPDATE capture_users
			SET identity = ?, has_sent_identity = 0
			WHERE env_id = ? AND user_id = ? AND identity IS NULL
			"#,
		)
		.bind(identity)
		.bind(env_id.as_str())
		.bind(user_id.to_string())
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	#[instrument(skip(self, value), fields(env_id = %env_id, user_id = %user_id))]
	async fn insert_or_update_user_property(
		&self,
		env_id: &EnvironmentId,
		user_id: &UserId,
		name: &str,
		value: &str,
	) -> Result<()> {
		sqlx::query(
			r#"
			INSERT INTO capture_user_properties (env_id, user_id, name, value, has_been_sent)
			SELECT ?, ?, ?, ?, 0
			WHERE EXISTS (SELECT 1 FROM capture_users WHERE env_id = ? AND user_id = ?)
			ON CONFLICT (env_id, user_id, name) DO UPDATE
				SET value = excluded.value, has_been_sent = 0
				WHERE capture_user_properties.value != excluded.value
			"#,
		)
		.bind(env_id.as_str())
		.bind(user_id.to_string())
		.bind(name)
		.bind(value)
		.bind(env_id.as_str())
		.bind(user_id.to_string())
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	#[instrument(skip(self, message), fields(session_id = %message.session_id))]
	async fn create_session_if_needed(&self, message: &Message) -> Result<()> {
		let Some(payload) = self.encode(message)? else {
			return Ok(());
		};
		let env_id = message.env_id.as_str();
		let user_id = message.user_id.to_string();
		let session_id = message.session_id.to_string();

		let mut tx = self.pool.begin().await?;
		let inserted = sqlx::query(
			r#"
			INSERT INTO capture_sessions (env_id, user_id, session_id, last_event_date)
			SELECT ?, ?, ?, ?
			WHERE EXISTS (SELECT 1 FROM capture_users WHERE env_id = ? AND user_id = ?)
			ON CONFLICT DO NOTHING
			"#,
		)
		.bind(env_id)
		.bind(&user_id)
		.bind(&session_id)
		.bind(format_time(message.time))
		.bind(env_id)
		.bind(&user_id)
		.execute(&mut *tx)
		.await?
		.rows_affected();

		if inserted == 0 {
			debug!("session already exists or user is unknown");
			return Ok(());
		}

		sqlx::query(
			r#"
			INSERT INTO capture_pending_messages (env_id, user_id, session_id, payload)
			VALUES (?, ?, ?, ?)
			"#,
		)
		.bind(env_id)
		.bind(&user_id)
		.bind(&session_id)
		.bind(payload)
		.execute(&mut *tx)
		.await?;

		tx.commit().await?;
		Ok(())
	}

	#[instrument(skip(self, message), fields(session_id = %message.session_id, kind = message.kind.name()))]
	async fn insert_pending_message(&self, message: &Message) -> Result<()> {
		let Some(payload) = self.encode(message)? else {
			return Ok(());
		};
		let env_id = message.env_id.as_str();
		let user_id = message.user_id.to_string();
		let session_id = message.session_id.to_string();

		let mut tx = self.pool.begin().await?;
		let touched = sqlx::query(
			r#"
			UPDATE capture_sessions
			SET last_event_date = MAX(last_event_date, ?)
			WHERE env_id = ? AND user_id = ? AND session_id = ?
			"#,
		)
		.bind(format_time(message.time))
		.bind(env_id)
		.bind(&user_id)
		.bind(&session_id)
		.execute(&mut *tx)
		.await?
		.rows_affected();

		if touched == 0 {
			debug!("dropped message for unknown session");
			return Ok(());
		}

		sqlx::query(
			r#"
			INSERT INTO capture_pending_messages (env_id, user_id, session_id, payload)
			VALUES (?, ?, ?, ?)
			"#,
		)
		.bind(env_id)
		.bind(&user_id)
		.bind(&session_id)
		.bind(payload)
		.execute(&mut *tx)
		.await?;

		tx.commit().await?;
		Ok(())
	}

	#[instrument(skip(self))]
	async fn users_to_upload(&self) -> Result<Vec<UserToUpload>> {
		let mut tx = self.pool.begin().await?;

		let user_rows: Vec<UserRow> = sqlx::query_as(
			r#"
			SELECT env_id, user_id, identity, creation_date, has_sent_user, has_sent_identity
			FROM capture_users
			ORDER BY creation_date, rowid
			"#,
		)
		.fetch_all(&mut *tx)
		.await?;

		let session_rows: Vec<SessionRow> = sqlx::query_as(
			r#"
			SELECT env_id, user_id, session_id
			FROM capture_sessions
			ORDER BY rowid
			"#,
		)
		.fetch_all(&mut *tx)
		.await?;

		let property_rows: Vec<PropertyRow> = sqlx::query_as(
			r#"
			SELECT env_id, user_id, name, value
			FROM capture_user_properties
			WHERE has_been_sent = 0
			"#,
		)
		.fetch_all(&mut *tx)
		.await?;

		tx.commit().await?;

		let mut sessions: HashMap<(String, String), Vec<SessionId>> = HashMap::new();
		for row in session_rows {
			let session_id = row
				.session_id
				.parse()
				.map_err(|_| StoreError::InvalidData("invalid session ID".into()))?;
			sessions
				.entry((row.env_id, row.user_id))
				.or_default()
				.push(session_id);
		}

		let mut properties: HashMap<(String, String), BTreeMap<String, String>> = HashMap::new();
		for row in property_rows {
			properties
				.entry((row.env_id, row.user_id))
				.or_default()
				.insert(row.name, row.value);
		}

		user_rows
			.into_iter()
			.map(|row| {
				let key = (row.env_id.clone(), row.user_id.clone());
				let mut user = UserToUpload::try_from(row)?;
				user.session_ids = sessions.remove(&key).unwrap_or_default();
				user.pending_user_properties = properties.remove(&key).unwrap_or_default();
				Ok(user)
			})
			.collect()
	}

	#[instrument(skip(self), fields(env_id = %env_id, user_id = %user_id, session_id = %session_id))]
	async fn get_pending_encoded_messages(
		&self,
		env_id: &EnvironmentId,
		user_id: &UserId,
		session_id: &SessionId,
		message_limit: usize,
		byte_limit: usize,
	) -> Result<Vec<PendingMessage>> {
		let rows: Vec<PendingRow> = sqlx::query_as(
			r#"
			SELECT sequence_number, payload
			FROM capture_pending_messages
			WHERE env_id = ? AND user_id = ? AND session_id = ?
			ORDER BY sequence_number
			LIMIT ?
			"#,
		)
		.bind(env_id.as_str())
		.bind(user_id.to_string())
		.bind(session_id.to_string())
		.bind(i64::try_from(message_limit).unwrap_or(i64::MAX))
		.fetch_all(&self.pool)
		.await?;

		let candidates = rows.into_iter().map(|row| PendingMessage {
			identifier: row.sequence_number,
			payload: row.payload,
		});
		Ok(byte_limited_prefix(candidates, byte_limit))
	}

	#[instrument(skip(self, identifiers), fields(count = identifiers.len()))]
	async fn delete_sent_messages(&self, identifiers: &[i64]) -> Result<()> {
		if identifiers.is_empty() {
			return Ok(());
		}

		let mut tx = self.pool.begin().await?;
		for chunk in identifiers.chunks(DELETE_CHUNK) {
			let mut builder: QueryBuilder<Sqlite> =
				QueryBuilder::new("DELETE FROM capture_pending_messages WHERE sequence_number IN (");
			let mut separated = builder.separated(", ");
			for identifier in chunk {
				separated.push_bind(*identifier);
			}
			separated.push_unseparated(")");
			builder.build().execute(&mut *tx).await?;
		}
		tx.commit().await?;
		Ok(())
	}

	#[instrument(skip(self), fields(env_id = %env_id, user_id = %user_id))]
	async fn set_has_sent_initial_user(
		&self,
		env_id: &EnvironmentId,
		user_id: &UserId,
	) -> Result<()> {
		sqlx::query("UPDATE capture_users SET has_sent_user = 1 WHERE env_id = ? AND user_id = ?")
			.bind(env_id.as_str())
			.bind(user_id.to_string())
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	#[instrument(skip(self), fields(env_id = %env_id, user_id = %user_id))]
	async fn set_has_sent_identity(&self, env_id: &EnvironmentId, user_id: &UserId) -> Result<()> {
		sqlx::query(
			r#"
			UPDATE capture_users
			SET has_sent_identity = 1
			WHERE env_id = ? AND user_id = ? AND identity IS NOT NULL
			"#,
		)
		.bind(env_id.as_str())
		.bind(user_id.to_string())
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	#[instrument(skip(self, value), fields(env_id = %env_id, user_id = %user_id))]
	async fn set_has_sent_user_property(
		&self,
		env_id: &EnvironmentId,
		user_id: &UserId,
		name: &str,
		value: &str,
	) -> Result<()> {
		sqlx::query(
			r#"
			UPDATE capture_user_properties
			SET has_been_sent = 1
			WHERE env_id = ? AND user_id = ? AND name = ? AND value = ?
			"#,
		)
		.bind(env_id.as_str())
		.bind(user_id.to_string())
		.bind(name)
		.bind(value)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	#[instrument(skip(self), fields(env_id = %env_id, user_id = %user_id, session_id = %session_id))]
	async fn delete_session(
		&self,
		env_id: &EnvironmentId,
		user_id: &UserId,
		session_id: &SessionId,
	) -> Result<()> {
		sqlx::query("DELETE FROM capture_sessions WHERE env_id = ? AND user_id = ? AND session_id = ?")
			.bind(env_id.as_str())
			.bind(user_id.to_string())
			.bind(session_id.to_string())
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	#[instrument(skip(self), fields(env_id = %env_id, user_id = %user_id))]
	async fn delete_user(&self, env_id: &EnvironmentId, user_id: &UserId) -> Result<()> {
		sqlx::query("DELETE FROM capture_users WHERE env_id = ? AND user_id = ?")
			.bind(env_id.as_str())
			.bind(user_id.to_string())
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	#[instrument(skip(self, request), fields(env_id = %request.active_env_id, user_id = %request.active_user_id))]
	async fn prune_old_data(&self, request: &PruneRequest) -> Result<()> {
		let env_id = request.active_env_id.as_str();
		let user_id = request.active_user_id.to_string();
		let session_id = request.active_session_id.to_string();

		let mut tx = self.pool.begin().await?;

		let sessions = sqlx::query(
			r#"
			DELETE FROM capture_sessions
			WHERE NOT (env_id = ? AND user_id = ? AND session_id = ?)
				AND (
					last_event_date < ?
					OR NOT EXISTS (
						SELECT 1 FROM capture_pending_messages m
						WHERE m.env_id = capture_sessions.env_id
							AND m.user_id = capture_sessions.user_id
							AND m.session_id = capture_sessions.session_id
					)
				)
			"#,
		)
		.bind(env_id)
		.bind(&user_id)
		.bind(&session_id)
		.bind(format_time(request.min_last_message_date))
		.execute(&mut *tx)
		.await?
		.rows_affected();

		let users = sqlx::query(
			r#"
			DELETE FROM capture_users
			WHERE NOT (env_id = ? AND user_id = ?)
				AND creation_date < ?
				AND NOT EXISTS (
					SELECT 1 FROM capture_sessions s
					WHERE s.env_id = capture_users.env_id AND s.user_id = capture_users.user_id
				)
				AND NOT (identity IS NOT NULL AND has_sent_identity = 0)
				AND NOT EXISTS (
					SELECT 1 FROM capture_user_properties p
					WHERE p.env_id = capture_users.env_id
						AND p.user_id = capture_users.user_id
						AND p.has_been_sent = 0
				)
			"#,
		)
		.bind(env_id)
		.bind(&user_id)
		.bind(format_time(request.min_user_creation_date))
		.execute(&mut *tx)
		.await?
		.rows_affected();

		tx.commit().await?;

		debug!(sessions, users, "pruned old capture data");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_migrate_is_idempotent() {
		let store = SqliteEventQueueStore::in_memory().await.unwrap();
		store.migrate().await.unwrap();
	}

	#[tokio::test]
	async fn test_on_disk_store_survives_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("queue.db");
		let env_id = EnvironmentId::new("env1");
		let user_id = UserId::new();

		{
			let store = SqliteEventQueueStore::open(&path).await.unwrap();
			store
				.create_new_user_if_needed(&env_id, &user_id, Some("alice"), Utc::now())
				.await
				.unwrap();
			store.pool().close().await;
		}

		let store = SqliteEventQueueStore::open(&path).await.unwrap();
		let users = store.users_to_upload().await.unwrap();
		assert_eq!(users.len(), 1);
		assert_eq!(users[0].user_id, user_id);
		assert_eq!(users[0].identity.as_deref(), Some("alice"));
	}

	#[test]
	fn test_formatted_times_sort_as_text() {
		let earlier = Utc::now();
		let later = earlier + chrono::Duration::milliseconds(1);
		assert!(format_time(earlier) < format_time(later));
		assert_eq!(format_time(earlier).len(), format_time(later).len());
	}

	#[test]
	fn test_parse_time_rejects_garbage() {
		assert!(matches!(parse_time("yesterday"), Err(StoreError::InvalidData(_))));
	}
}
