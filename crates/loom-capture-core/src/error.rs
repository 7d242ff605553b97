// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the capture core.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while encoding records or loading configuration.
#[derive(Debug, Error)]
pub enum CoreError {
	/// A message could not be serialized or deserialized.
	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	/// A stored record does not carry a valid length prefix.
	#[error("malformed record: {0}")]
	MalformedRecord(String),

	/// A config file could not be read.
	#[error("failed to read config file {path}: {source}")]
	FileRead {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	/// A config file could not be parsed.
	#[error("failed to parse config file {path}: {source}")]
	TomlParse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	/// An environment variable holds a value of the wrong type.
	#[error("invalid value for {name}: {value}")]
	InvalidEnv { name: String, value: String },

	/// A host-supplied option could not be interpreted.
	#[error("invalid option: {0}")]
	InvalidOption(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
