// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Integrations that observe recording and supply pageview attribution.
//!
//! A [`Source`] is an in-process integration (for example a UI framework
//! adapter) registered by name. A [`RuntimeBridge`] connects an embedded
//! runtime and is registered by identity. The [`Registry`] hands out
//! [`Snapshot`]s so callbacks never run while its lock is held.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use loom_capture_core::{CaptureConfig, SessionId};

use crate::pageview::Pageview;

#[async_trait]
pub trait Source: Send + Sync {
	fn name(&self) -> &str;

	async fn did_start_recording(&self, _options: &CaptureConfig) {}

	async fn did_stop_recording(&self) {}

	async fn session_did_start(
		&self,
		_session_id: SessionId,
		_timestamp: DateTime<Utc>,
		_foregrounded: bool,
	) {
	}

	async fn application_did_enter_foreground(&self, _timestamp: DateTime<Utc>) {}

	async fn application_did_enter_background(&self, _timestamp: DateTime<Utc>) {}

	/// The pageview currently on screen for this source, if any.
	async fn active_pageview(
		&self,
		_session_id: SessionId,
		_timestamp: DateTime<Utc>,
	) -> Option<Pageview> {
		None
	}

	/// Re-tracks `pageview`, which belongs to an older session, in the current
	/// session.
	async fn reissue_pageview(
		&self,
		_pageview: &Pageview,
		_session_id: SessionId,
		_timestamp: DateTime<Utc>,
	) -> Option<Pageview> {
		None
	}
}

#[async_trait]
pub trait RuntimeBridge: Send + Sync {
	async fn did_start_recording(&self, _options: &CaptureConfig) {}

	async fn did_stop_recording(&self) {}

	async fn session_did_start(
		&self,
		_session_id: SessionId,
		_timestamp: DateTime<Utc>,
		_foregrounded: bool,
	) {
	}

	async fn application_did_enter_foreground(&self, _timestamp: DateTime<Utc>) {}

	async fn application_did_enter_background(&self, _timestamp: DateTime<Utc>) {}

	async fn reissue_pageview(
		&self,
		_pageview: &Pageview,
		_session_id: SessionId,
		_timestamp: DateTime<Utc>,
	) -> Option<Pageview> {
		None
	}
}

/// Point-in-time copy of the registered integrations.
#[derive(Clone, Default)]
pub struct Snapshot {
	pub sources: HashMap<String, Arc<dyn Source>>,
	pub default_source: Option<Arc<dyn Source>>,
	pub bridges: Vec<Arc<dyn RuntimeBridge>>,
}

impl Snapshot {
	pub fn source(&self, name: &str) -> Option<&Arc<dyn Source>> {
		self.sources.get(name)
	}
}

#[derive(Default)]
struct Inner {
	sources: HashMap<String, Arc<dyn Source>>,
	default_source: Option<String>,
	bridges: Vec<Arc<dyn RuntimeBridge>>,
}

#[derive(Default)]
pub struct Registry {
	inner: Mutex<Inner>,
}

impl Registry {
	pub fn new() -> Self {
		Self::default()
	}

	fn lock(&self) -> MutexGuard<'_, Inner> {
		self.inner.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Registers `source`, replacing any source with the same name. Replacing
	/// the default source with `is_default = false` leaves no default.
	pub fn add_source(&self, source: Arc<dyn Source>, is_default: bool) {
		let name = source.name().to_string();
		debug!(source = %name, is_default, "registering capture source");
		let mut inner = self.lock();
		inner.sources.insert(name.clone(), source);
		if is_default {
			inner.default_source = Some(name);
		} else if inner.default_source.as_deref() == Some(name.as_str()) {
			inner.default_source = None;
		}
	}

	pub fn remove_source(&self, name: &str) -> Option<Arc<dyn Source>> {
		let mut inner = self.lock();
		if inner.default_source.as_deref() == Some(name) {
			inner.default_source = None;
		}
		inner.sources.remove(name)
	}

	/// Registers `bridge` unless the same instance is already registered.
	/// Returns whether it was added.
	pub fn add_bridge(&self, bridge: Arc<dyn RuntimeBridge>) -> bool {
		let mut inner = self.lock();
		if inner.bridges.iter().any(|b| Arc::ptr_eq(b, &bridge)) {
			return false;
		}
		inner.bridges.push(bridge);
		true
	}

	pub fn remove_bridge(&self, bridge: &Arc<dyn RuntimeBridge>) {
		self.lock().bridges.retain(|b| !Arc::ptr_eq(b, bridge));
	}

	pub fn snapshot(&self) -> Snapshot {
		let inner = self.lock();
		Snapshot {
			sources: inner.sources.clone(),
			default_source: inner
				.default_source
				.as_ref()
				.and_then(|name| inner.sources.get(name).cloned()),
			bridges: inner.bridges.clone(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct NamedSource(&'static str);

	#[async_trait]
	impl Source for NamedSource {
		fn name(&self) -> &str {
			self.0
		}
	}

	struct NoopBridge;

	#[async_trait]
	impl RuntimeBridge for NoopBridge {}

	#[test]
	fn default_source_follows_registration() {
		let registry = Registry::new();
		registry.add_source(Arc::new(NamedSource("ui")), true);
		assert_eq!(registry.snapshot().default_source.unwrap().name(), "ui");

		registry.add_source(Arc::new(NamedSource("ui")), false);
		let snapshot = registry.snapshot();
		assert!(snapshot.default_source.is_none());
		assert!(snapshot.source("ui").is_some());
	}

	#[test]
	fn removing_default_source_clears_default() {
		let registry = Registry::new();
		registry.add_source(Arc::new(NamedSource("ui")), true);
		registry.add_source(Arc::new(NamedSource("web")), false);
		assert!(registry.remove_source("ui").is_some());

		let snapshot = registry.snapshot();
		assert!(snapshot.default_source.is_none());
		assert_eq!(snapshot.sources.len(), 1);
		assert!(registry.remove_source("missing").is_none());
	}

	#[test]
	fn bridges_are_compared_by_identity() {
		let registry = Registry::new();
		let bridge: Arc<dyn RuntimeBridge> = Arc::new(NoopBridge);
		assert!(registry.add_bridge(bridge.clone()));
		assert!(!registry.add_bridge(bridge.clone()));
		assert!(registry.add_bridge(Arc::new(NoopBridge)));
		assert_eq!(registry.snapshot().bridges.len(), 2);

		registry.remove_bridge(&bridge);
		assert_eq!(registry.snapshot().bridges.len(), 1);
	}

	#[test]
	fn default_hooks_supply_no_pageview() {
		let source = NamedSource("ui");
		let session_id = SessionId::new();
		let now = Utc::now();
		let (active, reissued) = tokio_test::block_on(async {
			(
				source.active_pageview(session_id, now).await,
				source
					.reissue_pageview(&Pageview::None, session_id, now)
					.await,
			)
		});
		assert!(active.is_none());
		assert!(reissued.is_none());
	}

	#[test]
	fn snapshot_is_detached() {
		let registry = Registry::new();
		registry.add_source(Arc::new(NamedSource("ui")), false);
		let snapshot = registry.snapshot();
		registry.remove_source("ui");
		assert!(snapshot.source("ui").is_some());
	}
}
