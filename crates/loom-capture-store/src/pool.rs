// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use sqlx::sqlite::{
	SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::str::FromStr;

use crate::error::{Result, StoreError};

/// Create a SqlitePool for the queue database at `path` with WAL mode and
/// foreign key enforcement.
///
/// # Errors
/// Returns `StoreError::Database` if the database cannot be opened.
#[tracing::instrument(skip(path), fields(path = %path.as_ref().display()))]
pub async fn create_pool(path: impl AsRef<Path>) -> Result<SqlitePool> {
	let options = SqliteConnectOptions::new()
		.filename(path.as_ref())
		.journal_mode(SqliteJournalMode::Wal)
		.synchronous(SqliteSynchronous::Normal)
		.foreign_keys(true)
		.create_if_missing(true);

	let pool = SqlitePool::connect_with(options).await?;

	tracing::debug!("queue database pool created");
	Ok(pool)
}

/// Create a single-connection in-memory SqlitePool.
///
/// Each in-memory connection is its own database, so the pool is capped at one
/// connection that is never recycled.
pub async fn create_memory_pool() -> Result<SqlitePool> {
	let options = SqliteConnectOptions::from_str("sqlite::memory:")
		.map_err(|e| StoreError::InvalidData(format!("invalid database URL: {e}")))?
		.foreign_keys(true);

	let pool = SqlitePoolOptions::new()
		.max_connections(1)
		.min_connections(1)
		.idle_timeout(None)
		.max_lifetime(None)
		.connect_with(options)
		.await?;

	Ok(pool)
}
