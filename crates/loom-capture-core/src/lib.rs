// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for the Loom client capture SDK.
//!
//! This crate has no I/O. It defines the identifiers, persisted environment
//! state, message envelopes and their length-prefixed record encoding, property
//! sanitization, and the layered capture configuration shared by
//! `loom-capture-store` and `loom-capture`.

pub mod codec;
pub mod config;
pub mod environment;
pub mod error;
pub mod ids;
pub mod message;
pub mod pageview;
pub mod properties;
pub mod sdk;
pub mod sources;

pub use config::{load_config, load_layer, CaptureConfig, CaptureConfigLayer};
pub use environment::EnvironmentState;
pub use error::{CoreError, Result};
pub use ids::{EnvironmentId, MessageId, PageviewId, SessionId, UserId};
pub use message::{
	AppVisibility, EventKind, IdentifyPayload, Message, MessageKind, UserPropertiesPayload,
};
pub use pageview::{PageviewInfo, SessionInfo};
pub use properties::{utf16_len, Properties, MAX_KEY_UTF16, MAX_VALUE_UTF16};
pub use sdk::{AppInfo, DeviceInfo, LibraryInfo, SdkInfo};
pub use sources::{ConfigSource, DefaultsSource, EnvSource, KeyValueSource, Precedence, TomlSource};
