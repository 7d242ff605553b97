// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Chooses the pageview an event is attributed to.

use chrono::{DateTime, Utc};
use tracing::trace;

use loom_capture_core::PageviewInfo;

use crate::pageview::{ConcretePageview, Pageview};
use crate::sources::{RuntimeBridge, Snapshot};
use crate::state::State;

/// Resolves attribution for one event against a registry snapshot.
///
/// Integrations are asked in turn; an answer is used only when it belongs to
/// the current session, otherwise the next fallback is tried. The chain always
/// ends at the state's last pageview.
pub struct PageviewResolver<'a> {
	snapshot: &'a Snapshot,
	state: &'a State,
	timestamp: DateTime<Utc>,
}

impl<'a> PageviewResolver<'a> {
	pub fn new(snapshot: &'a Snapshot, state: &'a State, timestamp: DateTime<Utc>) -> Self {
		Self {
			snapshot,
			state,
			timestamp,
		}
	}

	/// `requested` is the pageview passed with the event, if any;
	/// `event_source` names the integration that tracked the event.
	pub async fn resolve(
		&self,
		requested: Option<&Pageview>,
		event_source: Option<&str>,
	) -> PageviewInfo {
		let Some(requested) = requested else {
			return self.from_event_source(event_source).await;
		};

		let concrete = match requested {
			Pageview::None => return self.state.unattributed_pageview.clone(),
			Pageview::Concrete(concrete) => concrete,
		};

		if concrete.session_info == self.state.session_info {
			return concrete.pageview_info.clone();
		}

		if let Some(bridge) = concrete.bridge() {
			return self.reissued_by_bridge(requested, bridge.as_ref()).await;
		}

		if concrete.is_from_bridge() {
			trace!("pageview bridge is gone, using the default source");
			return self.from_default_source().await;
		}

		self.reissued_by_source(requested, concrete, event_source).await
	}

	fn accept(&self, answer: Option<Pageview>) -> Option<PageviewInfo> {
		match answer? {
			Pageview::Concrete(p) if p.session_info == self.state.session_info => {
				Some(p.pageview_info.clone())
			}
			_ => None,
		}
	}

	async fn reissued_by_bridge(
		&self,
		requested: &Pageview,
		bridge: &dyn RuntimeBridge,
	) -> PageviewInfo {
		let answer = bridge
			.reissue_pageview(requested, self.state.session_info.id, self.timestamp)
			.await;
		match self.accept(answer) {
			Some(info) => info,
			None => self.from_default_source().await,
		}
	}

	async fn reissued_by_source(
		&self,
		requested: &Pageview,
		concrete: &ConcretePageview,
		event_source: Option<&str>,
	) -> PageviewInfo {
		let source = concrete
			.source_library
			.as_ref()
			.and_then(|library| self.snapshot.source(&library.name));
		if let Some(source) = source {
			let answer = source
				.reissue_pageview(requested, self.state.session_info.id, self.timestamp)
				.await;
			if let Some(info) = self.accept(answer) {
				return info;
			}
		}
		self.from_event_source(event_source).await
	}

	async fn from_event_source(&self, event_source: Option<&str>) -> PageviewInfo {
		if let Some(source) = event_source.and_then(|name| self.snapshot.source(name)) {
			let answer = source
				.active_pageview(self.state.session_info.id, self.timestamp)
				.await;
			if let Some(info) = self.accept(answer) {
				return info;
			}
		}
		self.from_default_source().await
	}

	async fn from_default_source(&self) -> PageviewInfo {
		if let Some(source) = &self.snapshot.default_source {
			let answer = source
				.active_pageview(self.state.session_info.id, self.timestamp)
				.await;
			if let Some(info) = self.accept(answer) {
				return info;
			}
		}
		self.state.last_pageview.clone()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pageview::PageviewProperties;
	use crate::sources::{Registry, Source};
	use crate::state::{start, Outcomes};
	use async_trait::async_trait;
	use loom_capture_core::{
		AppInfo, CaptureConfig, EnvironmentId, EnvironmentState, LibraryInfo, SdkInfo,
		SessionId, SessionInfo,
	};
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::{Arc, Mutex};

	fn state() -> State {
		let mut current = None;
		start(
			&mut current,
			EnvironmentState::new(EnvironmentId::new("env1")),
			CaptureConfig::default(),
			SdkInfo::current(AppInfo::default()),
			Utc::now(),
			&mut Outcomes::default(),
		);
		let mut state = current.unwrap();
		state.last_pageview = PageviewInfo::new_at(Utc::now());
		state
	}

	fn pageview_in(session: &SessionInfo, source: Option<&str>) -> Pageview {
		Pageview::new(
			session.clone(),
			PageviewInfo::new_at(Utc::now()),
			source.map(|name| LibraryInfo::new(name, "1.0")),
			PageviewProperties::default(),
			None,
		)
	}

	/// Answers with a fixed pageview and counts calls.
	struct FixedSource {
		name: &'static str,
		answer: Mutex<Option<Pageview>>,
		active_calls: AtomicUsize,
		reissue_calls: AtomicUsize,
	}

	impl FixedSource {
		fn new(name: &'static str, answer: Option<Pageview>) -> Arc<Self> {
			Arc::new(Self {
				name,
				answer: Mutex::new(answer),
				active_calls: AtomicUsize::new(0),
				reissue_calls: AtomicUsize::new(0),
			})
		}
	}

	#[async_trait]
	impl Source for FixedSource {
		fn name(&self) -> &str {
			self.name
		}

		async fn active_pageview(
			&self,
			_session_id: SessionId,
			_timestamp: DateTime<Utc>,
		) -> Option<Pageview> {
			self.active_calls.fetch_add(1, Ordering::SeqCst);
			self.answer.lock().unwrap().clone()
		}

		async fn reissue_pageview(
			&self,
			_pageview: &Pageview,
			_session_id: SessionId,
			_timestamp: DateTime<Utc>,
		) -> Option<Pageview> {
			self.reissue_calls.fetch_add(1, Ordering::SeqCst);
			self.answer.lock().unwrap().clone()
		}
	}

	struct FixedBridge(Option<Pageview>);

	#[async_trait]
	impl RuntimeBridge for FixedBridge {
		async fn reissue_pageview(
			&self,
			_pageview: &Pageview,
			_session_id: SessionId,
			_timestamp: DateTime<Utc>,
		) -> Option<Pageview> {
			self.0.clone()
		}
	}

	#[tokio::test]
	async fn no_pageview_and_no_sources_uses_last_pageview() {
		let state = state();
		let snapshot = Snapshot::default();
		let info = PageviewResolver::new(&snapshot, &state, Utc::now())
			.resolve(None, None)
			.await;
		assert_eq!(info, state.last_pageview);
	}

	#[tokio::test]
	async fn explicit_none_uses_unattributed_pageview() {
		let state = state();
		let snapshot = Snapshot::default();
		let info = PageviewResolver::new(&snapshot, &state, Utc::now())
			.resolve(Some(&Pageview::None), None)
			.await;
		assert_eq!(info, state.unattributed_pageview);
	}

	#[tokio::test]
	async fn same_session_pageview_is_used_as_is() {
		let state = state();
		let pageview = pageview_in(&state.session_info, Some("ui"));
		let source = FixedSource::new("ui", None);
		let registry = Registry::new();
		registry.add_source(source.clone(), true);
		let snapshot = registry.snapshot();

		let info = PageviewResolver::new(&snapshot, &state, Utc::now())
			.resolve(Some(&pageview), Some("ui"))
			.await;
		assert_eq!(Some(&info), pageview.pageview_info());
		assert_eq!(source.reissue_calls.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn event_source_answer_wins_over_default() {
		let state = state();
		let from_event_source = pageview_in(&state.session_info, Some("web"));
		let registry = Registry::new();
		let default = FixedSource::new("ui", Some(pageview_in(&state.session_info, None)));
		registry.add_source(default.clone(), true);
		registry.add_source(FixedSource::new("web", Some(from_event_source.clone())), false);
		let snapshot = registry.snapshot();

		let info = PageviewResolver::new(&snapshot, &state, Utc::now())
			.resolve(None, Some("web"))
			.await;
		assert_eq!(Some(&info), from_event_source.pageview_info());
		assert_eq!(default.active_calls.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn answers_from_other_sessions_fall_back() {
		let state = state();
		let stale = SessionInfo::new_at(Utc::now());
		let registry = Registry::new();
		registry.add_source(FixedSource::new("ui", Some(pageview_in(&stale, None))), true);
		let snapshot = registry.snapshot();

		let info = PageviewResolver::new(&snapshot, &state, Utc::now())
			.resolve(None, Some("ui"))
			.await;
		assert_eq!(info, state.last_pageview);
	}

	#[tokio::test]
	async fn old_pageview_is_reissued_by_its_source() {
		let state = state();
		let old = pageview_in(&SessionInfo::new_at(Utc::now()), Some("ui"));
		let reissued = pageview_in(&state.session_info, Some("ui"));
		let source = FixedSource::new("ui", Some(reissued.clone()));
		let registry = Registry::new();
		registry.add_source(source.clone(), false);
		let snapshot = registry.snapshot();

		let info = PageviewResolver::new(&snapshot, &state, Utc::now())
			.resolve(Some(&old), None)
			.await;
		assert_eq!(Some(&info), reissued.pageview_info());
		assert_eq!(source.reissue_calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn live_bridge_reissues_and_dead_bridge_uses_default() {
		let state = state();
		let old_session = SessionInfo::new_at(Utc::now());
		let reissued = pageview_in(&state.session_info, None);
		let bridge: Arc<dyn RuntimeBridge> = Arc::new(FixedBridge(Some(reissued.clone())));
		let old = Pageview::new(
			old_session.clone(),
			PageviewInfo::new_at(Utc::now()),
			None,
			PageviewProperties::default(),
			Some(&bridge),
		);

		let from_default = pageview_in(&state.session_info, None);
		let registry = Registry::new();
		registry.add_source(FixedSource::new("ui", Some(from_default.clone())), true);
		let snapshot = registry.snapshot();
		let resolver = PageviewResolver::new(&snapshot, &state, Utc::now());

		let info = resolver.resolve(Some(&old), None).await;
		assert_eq!(Some(&info), reissued.pageview_info());

		drop(bridge);
		let info = resolver.resolve(Some(&old), None).await;
		assert_eq!(Some(&info), from_default.pageview_info());
	}
}
