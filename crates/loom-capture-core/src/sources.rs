// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration sources: defaults, TOML files, host options and environment.

use std::path::PathBuf;

use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::config::CaptureConfigLayer;
use crate::error::{CoreError, Result};

/// Source precedence levels (higher = overrides lower).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
	Defaults = 10,
	ConfigFile = 20,
	HostOptions = 30,
	Environment = 50,
}

/// Trait for configuration sources.
pub trait ConfigSource: Send + Sync {
	fn name(&self) -> &'static str;
	fn precedence(&self) -> Precedence;
	fn load(&self) -> Result<CaptureConfigLayer>;
}

/// Built-in defaults source.
pub struct DefaultsSource;

impl ConfigSource for DefaultsSource {
	fn name(&self) -> &'static str {
		"defaults"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Defaults
	}

	fn load(&self) -> Result<CaptureConfigLayer> {
		Ok(CaptureConfigLayer::default())
	}
}

/// TOML file configuration source. A missing file is skipped.
pub struct TomlSource {
	path: PathBuf,
}

impl TomlSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}
}

impl ConfigSource for TomlSource {
	fn name(&self) -> &'static str {
		"toml-config"
	}

	fn precedence(&self) -> Precedence {
		Precedence::ConfigFile
	}

	fn load(&self) -> Result<CaptureConfigLayer> {
		if !self.path.exists() {
			debug!(path = %self.path.display(), "config file not found, skipping");
			return Ok(CaptureConfigLayer::default());
		}

		debug!(path = %self.path.display(), "loading config file");
		let content = std::fs::read_to_string(&self.path).map_err(|e| CoreError::FileRead {
			path: self.path.clone(),
			source: e,
		})?;

		let layer: CaptureConfigLayer = toml::from_str(&content).map_err(|e| CoreError::TomlParse {
			path: self.path.clone(),
			source: e,
		})?;

		trace!("parsed capture config layer from TOML");
		Ok(layer)
	}
}

/// Options handed over by the host as an opaque key/value map.
///
/// Keys match the [`CaptureConfigLayer`] field names; unknown keys are ignored.
pub struct KeyValueSource {
	options: Map<String, Value>,
}

impl KeyValueSource {
	pub fn new(options: Map<String, Value>) -> Self {
		Self { options }
	}
}

impl ConfigSource for KeyValueSource {
	fn name(&self) -> &'static str {
		"host-options"
	}

	fn precedence(&self) -> Precedence {
		Precedence::HostOptions
	}

	fn load(&self) -> Result<CaptureConfigLayer> {
		serde_json::from_value(Value::Object(self.options.clone()))
			.map_err(|e| CoreError::InvalidOption(e.to_string()))
	}
}

/// Environment variable source.
///
/// Convention: LOOM_CAPTURE_<FIELD>
pub struct EnvSource;

impl ConfigSource for EnvSource {
	fn name(&self) -> &'static str {
		"environment"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Environment
	}

	fn load(&self) -> Result<CaptureConfigLayer> {
		Ok(CaptureConfigLayer {
			upload_interval_secs: env_u64("LOOM_CAPTURE_UPLOAD_INTERVAL_SECS")?,
			base_url: env_var("LOOM_CAPTURE_BASE_URL"),
			message_batch_byte_limit: env_usize("LOOM_CAPTURE_MESSAGE_BATCH_BYTE_LIMIT")?,
			message_batch_message_limit: env_usize("LOOM_CAPTURE_MESSAGE_BATCH_MESSAGE_LIMIT")?,
			session_timeout_secs: env_u64("LOOM_CAPTURE_SESSION_TIMEOUT_SECS")?,
			extended_session_ceiling_secs: env_u64("LOOM_CAPTURE_EXTENDED_SESSION_CEILING_SECS")?,
			disable_pageview_title_capture: env_bool("LOOM_CAPTURE_DISABLE_PAGEVIEW_TITLE_CAPTURE"),
			message_byte_limit: env_usize("LOOM_CAPTURE_MESSAGE_BYTE_LIMIT")?,
			prune_age_secs: env_u64("LOOM_CAPTURE_PRUNE_AGE_SECS")?,
			request_timeout_secs: env_u64("LOOM_CAPTURE_REQUEST_TIMEOUT_SECS")?,
		})
	}
}

fn env_var(name: &str) -> Option<String> {
	std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_bool(name: &str) -> Option<bool> {
	env_var(name).map(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

fn env_u64(name: &str) -> Result<Option<u64>> {
	match env_var(name) {
		Some(v) => v.parse().map(Some).map_err(|_| CoreError::InvalidEnv {
			name: name.to_string(),
			value: v,
		}),
		None => Ok(None),
	}
}

fn env_usize(name: &str) -> Result<Option<usize>> {
	match env_var(name) {
		Some(v) => v.parse().map(Some).map_err(|_| CoreError::InvalidEnv {
			name: name.to_string(),
			value: v,
		}),
		None => Ok(None),
	}
}
