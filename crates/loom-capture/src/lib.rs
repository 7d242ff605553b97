// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Client-side event capture for Loom.
//!
//! The [`CaptureClient`] records sessions, pageviews and custom events for an
//! environment into a durable local queue, and a background
//! [`UploadScheduler`] drains that queue to the ingestion endpoint.
//!
//! # Example
//!
//! ```ignore
//! use loom_capture::{CaptureClient, Properties, TrackOptions};
//!
//! let client = CaptureClient::builder().build().await?;
//! client.start_recording("env_123", Default::default()).await;
//! client.identify("user@example.com").await;
//! client
//!     .track(
//!         "checkout_completed",
//!         Properties::new().insert("total", 42.5),
//!         TrackOptions::default(),
//!     )
//!     .await;
//! ```

pub mod client;
pub mod clock;
pub mod error;
pub mod message_factory;
pub mod pageview;
pub mod pageview_resolver;
pub mod pending_event;
pub mod sources;
pub mod state;
pub mod state_manager;
pub mod uploader;
pub mod visibility;

pub use client::{CaptureClient, CaptureClientBuilder, TrackOptions};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CaptureError, Result};
pub use pageview::{ConcretePageview, Pageview, PageviewProperties};
pub use sources::{Registry, RuntimeBridge, Snapshot, Source};
pub use state::{Outcomes, State, VersionChange};
pub use state_manager::{StateManager, StateUpdate};
pub use uploader::{
	ActiveSession, ActiveSessionProvider, HttpTransport, UploadError, UploadOutcome,
	UploadScheduler, UploadScope, UploadTransport, Uploader,
};
pub use visibility::{AppVisibilityProvider, TrackedVisibility};

pub use loom_capture_core::{
	AppInfo, AppVisibility, CaptureConfig, CaptureConfigLayer, EnvironmentId, LibraryInfo,
	PageviewInfo, Properties, SessionId, UserId,
};
pub use loom_capture_store::{
	EventQueueStore, FileStateStore, InMemoryEventQueueStore, InMemoryStateStore,
	SqliteEventQueueStore, StateStore,
};
