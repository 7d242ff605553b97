// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for capture storage.

use thiserror::Error;

/// Errors that can occur in capture storage.
#[derive(Debug, Error)]
pub enum StoreError {
	/// Database error
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),

	/// Filesystem error
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	/// JSON serialization error
	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),

	/// Record encoding error
	#[error("record error: {0}")]
	Core(#[from] loom_capture_core::CoreError),

	/// Stored data could not be interpreted
	#[error("invalid stored data: {0}")]
	InvalidData(String),
}

impl StoreError {
	/// True for failures that may succeed when retried, such as a busy database.
	pub fn is_transient(&self) -> bool {
		match self {
			StoreError::Database(e) => is_transient_error(e),
			StoreError::Io(_) => true,
			_ => false,
		}
	}
}

fn is_transient_error(e: &sqlx::Error) -> bool {
	match e {
		sqlx::Error::Io(_) => true,
		sqlx::Error::PoolTimedOut => true,
		sqlx::Error::PoolClosed => true,
		sqlx::Error::Database(db_err) => {
			let msg = db_err.message().to_lowercase();
			msg.contains("busy") || msg.contains("locked") || msg.contains("timeout")
		}
		_ => false,
	}
}

/// Result type for capture storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;
