// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Library, application and device metadata attached to uploads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// SDK name for identification.
pub const SDK_NAME: &str = "loom-capture-rust";
/// SDK version for identification.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The library that produced a message.
///
/// Integrations tracking through the SDK supply their own `LibraryInfo` as the
/// source library of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryInfo {
	pub name: String,
	pub version: String,
	pub platform: String,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub properties: BTreeMap<String, String>,
}

impl LibraryInfo {
	pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			version: version.into(),
			platform: platform(),
			properties: BTreeMap::new(),
		}
	}

	/// Metadata for this SDK.
	pub fn current() -> Self {
		Self::new(SDK_NAME, SDK_VERSION)
	}
}

/// The host application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub identifier: Option<String>,
	/// Compared across launches to detect upgrades.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub version: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub build: Option<String>,
}

/// The device the host runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
	pub os: String,
	pub arch: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub model: Option<String>,
}

impl DeviceInfo {
	pub fn current() -> Self {
		Self {
			os: std::env::consts::OS.to_string(),
			arch: std::env::consts::ARCH.to_string(),
			model: None,
		}
	}
}

/// Metadata sent with a user's initial upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdkInfo {
	pub library: LibraryInfo,
	pub app: AppInfo,
	pub device: DeviceInfo,
}

impl SdkInfo {
	pub fn current(app: AppInfo) -> Self {
		Self {
			library: LibraryInfo::current(),
			app,
			device: DeviceInfo::current(),
		}
	}
}

fn platform() -> String {
	format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}
