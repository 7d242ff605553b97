// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Joins asynchronously supplied event parts and commits the message once.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{trace, warn};

use loom_capture_core::{AppVisibility, EventKind, Message, PageviewInfo};
use loom_capture_store::EventQueueStore;

use crate::message_factory::PartialEvent;

#[derive(Debug)]
struct Parts {
	partial: Option<PartialEvent>,
	kind: Option<EventKind>,
	pageview_info: Option<PageviewInfo>,
	app_visibility: Option<AppVisibility>,
}

impl Parts {
	/// Takes the finished message the first time every part is present.
	fn take_ready(&mut self) -> Option<Message> {
		if self.kind.is_none() || self.pageview_info.is_none() || self.app_visibility.is_none() {
			return None;
		}
		let partial = self.partial.take()?;
		Some(partial.complete(
			self.kind.take()?,
			self.pageview_info.take()?,
			self.app_visibility.take()?,
		))
	}
}

/// An event waiting for its kind, pageview attribution and app visibility.
///
/// Each part is accepted once; later values are ignored. Whichever setter
/// supplies the last missing part writes the message to the queue, and it is
/// written at most once.
pub struct PendingEvent {
	parts: Mutex<Parts>,
	store: Arc<dyn EventQueueStore>,
}

impl PendingEvent {
	pub fn new(partial: PartialEvent, store: Arc<dyn EventQueueStore>) -> Self {
		Self {
			parts: Mutex::new(Parts {
				partial: Some(partial),
				kind: None,
				pageview_info: None,
				app_visibility: None,
			}),
			store,
		}
	}

	pub async fn set_kind(&self, kind: EventKind) {
		let ready = self.update(|parts| {
			parts.kind.get_or_insert(kind);
		});
		self.commit(ready).await;
	}

	pub async fn set_pageview_info(&self, pageview_info: PageviewInfo) {
		let ready = self.update(|parts| {
			parts.pageview_info.get_or_insert(pageview_info);
		});
		self.commit(ready).await;
	}

	pub async fn set_app_visibility(&self, app_visibility: AppVisibility) {
		let ready = self.update(|parts| {
			parts.app_visibility.get_or_insert(app_visibility);
		});
		self.commit(ready).await;
	}

	pub fn is_committed(&self) -> bool {
		self
			.parts
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.partial
			.is_none()
	}

	fn update(&self, apply: impl FnOnce(&mut Parts)) -> Option<Message> {
		let mut parts = self.parts.lock().unwrap_or_else(PoisonError::into_inner);
		if parts.partial.is_none() {
			return None;
		}
		apply(&mut parts);
		parts.take_ready()
	}

	async fn commit(&self, message: Option<Message>) {
		let Some(message) = message else {
			return;
		};
		trace!(message_id = %message.id, session_id = %message.session_id, "committing event");
		if let Err(e) = self.store.insert_pending_message(&message).await {
			warn!(message_id = %message.id, error = %e, "failed to queue event");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::message_factory::MessageFactory;
	use crate::state::{start, Outcomes};
	use chrono::Utc;
	use loom_capture_core::{
		codec, AppInfo, CaptureConfig, EnvironmentId, EnvironmentState, MessageKind, SdkInfo,
	};
	use loom_capture_store::InMemoryEventQueueStore;
	use std::collections::BTreeMap;

	async fn setup() -> (Arc<InMemoryEventQueueStore>, crate::state::State) {
		let mut current = None;
		let now = Utc::now();
		start(
			&mut current,
			EnvironmentState::new(EnvironmentId::new("env1")),
			CaptureConfig::default(),
			SdkInfo::current(AppInfo::default()),
			now,
			&mut Outcomes::default(),
		);
		let state = current.unwrap();
		let store = Arc::new(InMemoryEventQueueStore::new());
		store
			.create_new_user_if_needed(&state.env_id, &state.user_id, None, now)
			.await
			.unwrap();
		store
			.create_session_if_needed(&MessageFactory::default().session_message(&state))
			.await
			.unwrap();
		(store, state)
	}

	async fn queued_events(
		store: &InMemoryEventQueueStore,
		state: &crate::state::State,
	) -> Vec<Message> {
		store
			.get_pending_encoded_messages(
				&state.env_id,
				&state.user_id,
				&state.session_info.id,
				usize::MAX,
				usize::MAX,
			)
			.await
			.unwrap()
			.iter()
			.map(|m| codec::decode_record(&m.payload).unwrap())
			.filter(|m| matches!(m.kind, MessageKind::Event(_)))
			.collect()
	}

	fn click() -> EventKind {
		EventKind::Custom {
			name: "click".to_string(),
			properties: BTreeMap::new(),
		}
	}

	#[tokio::test]
	async fn commits_once_all_parts_arrive() {
		let (store, state) = setup().await;
		let partial = MessageFactory::default().partial_event(Utc::now(), None, &state);
		let pending = PendingEvent::new(partial, store.clone());

		pending.set_pageview_info(state.last_pageview.clone()).await;
		pending.set_kind(click()).await;
		assert!(!pending.is_committed());
		assert!(queued_events(&store, &state).await.is_empty());

		pending.set_app_visibility(AppVisibility::Foregrounded).await;
		assert!(pending.is_committed());

		let events = queued_events(&store, &state).await;
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].pageview_info, Some(state.last_pageview.clone()));
	}

	#[tokio::test]
	async fn late_and_duplicate_parts_are_ignored() {
		let (store, state) = setup().await;
		let partial = MessageFactory::default().partial_event(Utc::now(), None, &state);
		let pending = PendingEvent::new(partial, store.clone());

		pending.set_app_visibility(AppVisibility::Backgrounded).await;
		pending.set_app_visibility(AppVisibility::Foregrounded).await;
		pending.set_kind(click()).await;
		pending.set_pageview_info(state.last_pageview.clone()).await;
		pending.set_pageview_info(state.unattributed_pageview.clone()).await;
		pending.set_kind(click()).await;

		let events = queued_events(&store, &state).await;
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].app_visibility, Some(AppVisibility::Backgrounded));
	}

	#[tokio::test]
	async fn concurrent_parts_commit_exactly_once() {
		let (store, state) = setup().await;
		let partial = MessageFactory::default().partial_event(Utc::now(), None, &state);
		let pending = Arc::new(PendingEvent::new(partial, store.clone()));

		let mut tasks = Vec::new();
		for _ in 0..8 {
			let pending = pending.clone();
			let pageview = state.last_pageview.clone();
			tasks.push(tokio::spawn(async move {
				tokio::join!(
					pending.set_kind(click()),
					pending.set_pageview_info(pageview),
					pending.set_app_visibility(AppVisibility::Unknown),
				);
			}));
		}
		for task in tasks {
			task.await.unwrap();
		}

		assert_eq!(queued_events(&store, &state).await.len(), 1);
	}
}
