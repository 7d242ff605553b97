// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Owner of the process-wide recording state.
//!
//! Transitions from [`crate::state`] run under a synchronous lock. The
//! environment is persisted after the lock is released, and only when
//! something other than the session expiration changed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::trace;

use loom_capture_core::{CaptureConfig, EnvironmentId, PageviewInfo, SdkInfo, SessionId};
use loom_capture_store::StateStore;

use crate::state::{self, Outcomes, State};
use crate::uploader::{ActiveSession, ActiveSessionProvider};

/// The result of one state update: the state before and after, and what
/// happened in between.
#[derive(Debug, Clone)]
pub struct StateUpdate {
	pub previous: Option<State>,
	pub current: Option<State>,
	pub outcomes: Outcomes,
}

impl StateUpdate {
	/// True when there was no state to operate on.
	pub fn is_stopped(&self) -> bool {
		self.current.is_none()
	}
}

pub struct StateManager {
	state_store: Arc<dyn StateStore>,
	current: Mutex<Option<State>>,
	version_checked: AtomicBool,
	save_lock: tokio::sync::Mutex<()>,
}

impl StateManager {
	pub fn new(state_store: Arc<dyn StateStore>) -> Self {
		Self {
			state_store,
			current: Mutex::new(None),
			version_checked: AtomicBool::new(false),
			save_lock: tokio::sync::Mutex::new(()),
		}
	}

	fn lock(&self) -> MutexGuard<'_, Option<State>> {
		self.current.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// A copy of the current state, if recording.
	pub fn current(&self) -> Option<State> {
		self.lock().clone()
	}

	/// The current session id, or `None` when stopped or expired.
	pub fn session_id(&self, now: DateTime<Utc>) -> Option<SessionId> {
		self.lock().as_ref()?.active_session_id(now)
	}

	pub async fn start(
		&self,
		env_id: EnvironmentId,
		options: CaptureConfig,
		sdk_info: SdkInfo,
		now: DateTime<Utc>,
	) -> StateUpdate {
		let in_memory = self
			.lock()
			.as_ref()
			.filter(|state| state.env_id == env_id)
			.map(State::environment);
		let loaded = match in_memory {
			Some(environment) => environment,
			None => self.state_store.load(&env_id).await,
		};

		self
			.update(|current, outcomes| {
				state::start(current, loaded, options, sdk_info, now, outcomes);
			})
			.await
			.0
	}

	pub async fn stop(&self) -> StateUpdate {
		self
			.update(|current, outcomes| state::stop(current, outcomes))
			.await
			.0
	}

	pub async fn identify(&self, identity: &str, now: DateTime<Utc>) -> StateUpdate {
		self
			.update_recording(|state, outcomes| state.identify(identity, now, outcomes))
			.await
			.0
	}

	pub async fn reset_identity(&self, now: DateTime<Utc>) -> StateUpdate {
		self
			.update_recording(|state, outcomes| state.reset_identity(now, outcomes))
			.await
			.0
	}

	pub async fn create_session_if_expired(
		&self,
		extend_if_not_expired: bool,
		now: DateTime<Utc>,
	) -> StateUpdate {
		self
			.update_recording(|state, outcomes| {
				state.create_session_if_expired(extend_if_not_expired, now, outcomes)
			})
			.await
			.0
	}

	pub async fn extend_session(
		&self,
		session_id: &SessionId,
		preferred_expiration: DateTime<Utc>,
		now: DateTime<Utc>,
	) -> StateUpdate {
		self
			.update_recording(|state, _| state.extend_session(session_id, preferred_expiration, now))
			.await
			.0
	}

	/// Returns the pageview as stored, or `None` when not recording.
	pub async fn extend_session_and_set_last_pageview(
		&self,
		pageview: PageviewInfo,
		now: DateTime<Utc>,
	) -> (StateUpdate, Option<PageviewInfo>) {
		self
			.update_recording(|state, outcomes| {
				state.extend_session_and_set_last_pageview(pageview, now, outcomes)
			})
			.await
	}

	pub async fn add_event_properties(&self, properties: BTreeMap<String, String>) -> StateUpdate {
		self
			.update_recording(|state, _| state.add_event_properties(properties))
			.await
			.0
	}

	pub async fn remove_event_property(&self, name: &str) -> StateUpdate {
		self
			.update_recording(|state, _| state.remove_event_property(name))
			.await
			.0
	}

	pub async fn clear_event_properties(&self) -> StateUpdate {
		self
			.update_recording(|state, _| state.clear_event_properties())
			.await
			.0
	}

	async fn update_recording<R>(
		&self,
		apply: impl FnOnce(&mut State, &mut Outcomes) -> R,
	) -> (StateUpdate, Option<R>) {
		self
			.update(|current, outcomes| current.as_mut().map(|state| apply(state, outcomes)))
			.await
	}

	async fn update<R>(
		&self,
		apply: impl FnOnce(&mut Option<State>, &mut Outcomes) -> R,
	) -> (StateUpdate, R) {
		let (update, value) = {
			let mut current = self.lock();
			let previous = current.clone();
			let mut outcomes = Outcomes::default();
			let value = apply(&mut current, &mut outcomes);
			if let Some(state) = current.as_mut() {
				if !self.version_checked.swap(true, Ordering::SeqCst) {
					state.observe_version(&mut outcomes);
				}
			}
			let update = StateUpdate {
				previous,
				current: current.clone(),
				outcomes,
			};
			(update, value)
		};

		self.persist(&update).await;
		(update, value)
	}

	async fn persist(&self, update: &StateUpdate) {
		let Some(current) = &update.current else {
			return;
		};
		let changed = match &update.previous {
			Some(previous) => previous
				.environment()
				.differs_beyond_expiration(&current.environment()),
			None => true,
		};
		if !changed {
			return;
		}

		let _guard = self.save_lock.lock().await;
		// Another update may have landed while waiting; write the newest.
		let latest = self
			.lock()
			.as_ref()
			.filter(|state| state.env_id == current.env_id)
			.map(State::environment);
		if let Some(environment) = latest {
			trace!(env_id = %environment.env_id, "saving environment state");
			self.state_store.save(&environment).await;
		}
	}
}

impl ActiveSessionProvider for StateManager {
	fn active_session(&self) -> Option<ActiveSession> {
		self.lock().as_ref().map(|state| ActiveSession {
			env_id: state.env_id.clone(),
			user_id: state.user_id,
			session_id: state.session_info.id,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Duration;
	use loom_capture_core::{AppInfo, CaptureConfigLayer, EnvironmentState};
	use loom_capture_store::InMemoryStateStore;

	fn sdk(version: Option<&str>) -> SdkInfo {
		SdkInfo::current(AppInfo {
			version: version.map(str::to_string),
			..Default::default()
		})
	}

	fn manager() -> (StateManager, Arc<InMemoryStateStore>) {
		let store = Arc::new(InMemoryStateStore::new());
		(StateManager::new(store.clone()), store)
	}

	fn env() -> EnvironmentId {
		EnvironmentId::new("env1")
	}

	#[tokio::test]
	async fn start_creates_user_and_session_and_persists() {
		let (manager, store) = manager();
		let now = Utc::now();
		let update = manager
			.start(env(), CaptureConfig::default(), sdk(None), now)
			.await;

		assert!(update.outcomes.current_started);
		assert!(update.outcomes.user_created);
		assert!(update.outcomes.session_created);
		let state = update.current.unwrap();
		assert_eq!(store.load(&env()).await.user_id, Some(state.user_id));
		assert_eq!(manager.session_id(now), Some(state.session_info.id));
	}

	#[tokio::test]
	async fn starting_twice_with_same_options_is_a_no_op() {
		let (manager, _) = manager();
		let now = Utc::now();
		let first = manager
			.start(env(), CaptureConfig::default(), sdk(None), now)
			.await;
		let second = manager
			.start(
				env(),
				CaptureConfig::default(),
				sdk(None),
				now + Duration::seconds(1),
			)
			.await;

		assert!(second.outcomes.already_recording);
		assert!(!second.outcomes.current_started);
		assert_eq!(first.current, second.current);
	}

	#[tokio::test]
	async fn restart_with_new_options_keeps_user() {
		let (manager, _) = manager();
		let now = Utc::now();
		let first = manager
			.start(env(), CaptureConfig::default(), sdk(None), now)
			.await
			.current
			.unwrap();
		let options = CaptureConfigLayer {
			session_timeout_secs: Some(60),
			..Default::default()
		}
		.finalize();
		let update = manager.start(env(), options, sdk(None), now).await;

		assert!(update.outcomes.previous_stopped);
		assert!(update.outcomes.current_started);
		assert!(!update.outcomes.user_created);
		let second = update.current.unwrap();
		assert_eq!(second.user_id, first.user_id);
		assert_ne!(second.session_info.id, first.session_info.id);
	}

	#[tokio::test]
	async fn new_manager_reloads_persisted_user() {
		let store = Arc::new(InMemoryStateStore::new());
		let now = Utc::now();
		let first = StateManager::new(store.clone());
		first
			.start(env(), CaptureConfig::default(), sdk(None), now)
			.await;
		first.identify("alice", now).await;
		let user_id = first.current().unwrap().user_id;

		let second = StateManager::new(store);
		let update = second
			.start(env(), CaptureConfig::default(), sdk(None), now)
			.await;
		let state = update.current.unwrap();
		assert!(!update.outcomes.user_created);
		assert_eq!(state.user_id, user_id);
		assert_eq!(state.identity.as_deref(), Some("alice"));
	}

	#[tokio::test]
	async fn identify_transitions() {
		let (manager, _) = manager();
		let now = Utc::now();
		manager
			.start(env(), CaptureConfig::default(), sdk(None), now)
			.await;
		let anonymous = manager.current().unwrap().user_id;

		let update = manager.identify("u1", now).await;
		assert!(update.outcomes.identity_set);
		assert!(!update.outcomes.user_created);
		assert_eq!(update.current.unwrap().user_id, anonymous);

		let update = manager.identify("u1", now).await;
		assert!(update.outcomes.was_already_identified);
		assert!(!update.outcomes.identity_set);

		let update = manager.identify("u2", now).await;
		assert!(update.outcomes.user_created);
		assert_ne!(update.current.unwrap().user_id, anonymous);

		let update = manager.reset_identity(now).await;
		assert!(update.outcomes.identity_reset);
		assert!(manager.current().unwrap().identity.is_none());
		assert!(manager.reset_identity(now).await.outcomes.was_already_unidentified);
	}

	#[tokio::test]
	async fn operations_before_start_do_nothing() {
		let (manager, store) = manager();
		let now = Utc::now();
		let update = manager.identify("alice", now).await;
		assert!(update.is_stopped());
		assert_eq!(update.outcomes, Outcomes::default());

		let (_, pageview) = manager
			.extend_session_and_set_last_pageview(PageviewInfo::new_at(now), now)
			.await;
		assert!(pageview.is_none());
		assert!(store.load(&env()).await.user_id.is_none());
		assert!(manager.active_session().is_none());
	}

	#[tokio::test]
	async fn expiration_only_changes_are_not_persisted() {
		let (manager, store) = manager();
		let now = Utc::now();
		manager
			.start(env(), CaptureConfig::default(), sdk(None), now)
			.await;
		let saved = store.load(&env()).await.session_expiration;

		let later = now + Duration::seconds(60);
		let update = manager.create_session_if_expired(true, later).await;
		assert!(!update.outcomes.session_created);
		assert!(update.current.unwrap().session_expiration > saved.unwrap());
		assert_eq!(store.load(&env()).await.session_expiration, saved);

		manager
			.add_event_properties(BTreeMap::from([("plan".to_string(), "pro".to_string())]))
			.await;
		let persisted = store.load(&env()).await;
		assert_eq!(persisted.properties.get("plan").map(String::as_str), Some("pro"));
		assert!(persisted.session_expiration > saved);
	}

	#[tokio::test]
	async fn version_change_is_reported_once() {
		let store = Arc::new(InMemoryStateStore::new());
		let mut persisted = EnvironmentState::new(env());
		persisted.user_id = Some(loom_capture_core::UserId::new());
		persisted.last_observed_version = Some("1.0".to_string());
		store.save(&persisted).await;

		let manager = StateManager::new(store.clone());
		let now = Utc::now();
		let update = manager
			.start(env(), CaptureConfig::default(), sdk(Some("2.0")), now)
			.await;
		let change = update.outcomes.version_change.unwrap();
		assert_eq!(change.previous_version, "1.0");
		assert_eq!(change.current_version, "2.0");
		assert_eq!(
			store.load(&env()).await.last_observed_version.as_deref(),
			Some("2.0")
		);

		manager.stop().await;
		let update = manager
			.start(env(), CaptureConfig::default(), sdk(Some("3.0")), now)
			.await;
		assert!(update.outcomes.version_change.is_none());
	}

	#[tokio::test]
	async fn first_observed_version_is_not_a_change() {
		let (manager, store) = manager();
		let update = manager
			.start(env(), CaptureConfig::default(), sdk(Some("1.0")), Utc::now())
			.await;
		assert!(update.outcomes.version_change.is_none());
		assert_eq!(
			store.load(&env()).await.last_observed_version.as_deref(),
			Some("1.0")
		);
	}

	#[tokio::test]
	async fn stop_clears_active_session() {
		let (manager, _) = manager();
		let now = Utc::now();
		manager
			.start(env(), CaptureConfig::default(), sdk(None), now)
			.await;
		assert!(manager.active_session().is_some());

		let update = manager.stop().await;
		assert!(update.outcomes.previous_stopped);
		assert!(manager.current().is_none());
		assert!(manager.active_session().is_none());
		assert!(!manager.stop().await.outcomes.previous_stopped);
	}

	#[tokio::test]
	async fn extend_session_applies_only_to_current_session() {
		let (manager, _) = manager();
		let now = Utc::now();
		let state = manager
			.start(env(), CaptureConfig::default(), sdk(None), now)
			.await
			.current
			.unwrap();
		let preferred = now + Duration::minutes(20);

		let update = manager
			.extend_session(&SessionId::new(), preferred, now)
			.await;
		assert_eq!(
			update.current.unwrap().session_expiration,
			state.session_expiration
		);

		let update = manager
			.extend_session(&state.session_info.id, preferred, now)
			.await;
		assert_eq!(update.current.unwrap().session_expiration, preferred);
	}
}
