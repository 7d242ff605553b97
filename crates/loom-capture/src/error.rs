// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the capture SDK.

use loom_capture_core::CoreError;
use loom_capture_store::StoreError;
use thiserror::Error;

/// Errors raised while building a [`CaptureClient`](crate::CaptureClient).
///
/// Recording operations never fail; these only surface from setup.
#[derive(Debug, Error)]
pub enum CaptureError {
	/// Base URL could not be parsed.
	#[error("invalid base URL: {0}")]
	InvalidBaseUrl(String),

	/// Configuration could not be loaded.
	#[error("configuration error: {0}")]
	Config(#[from] CoreError),

	/// The event queue could not be opened.
	#[error("store error: {0}")]
	Store(#[from] StoreError),

	/// The HTTP client could not be built.
	#[error("HTTP client error: {0}")]
	Http(#[from] reqwest::Error),
}

/// Result type alias for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_store_error_converts() {
		let err: CaptureError = StoreError::InvalidData("bad row".to_string()).into();
		assert!(matches!(err, CaptureError::Store(_)));
		assert!(err.to_string().contains("bad row"));
	}

	#[test]
	fn test_invalid_base_url_message() {
		let err = CaptureError::InvalidBaseUrl("not a url".to_string());
		assert_eq!(err.to_string(), "invalid base URL: not a url");
	}
}
