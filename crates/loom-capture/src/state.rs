// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Recording state and its transitions.
//!
//! Every transition is a pure, synchronous mutation of [`State`] that records
//! what happened in [`Outcomes`]. Callers turn outcomes into store writes and
//! notifications after the state lock is released, so each side effect runs
//! exactly once per transition.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use loom_capture_core::{
	CaptureConfig, EnvironmentId, EnvironmentState, PageviewInfo, SdkInfo, SessionId,
	SessionInfo, UserId,
};

/// Which side-effect-triggering transitions occurred during one update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcomes {
	pub previous_stopped: bool,
	pub current_started: bool,
	pub already_recording: bool,
	pub user_created: bool,
	pub session_created: bool,
	pub identity_set: bool,
	pub identity_reset: bool,
	pub was_already_identified: bool,
	pub was_already_unidentified: bool,
	pub version_change: Option<VersionChange>,
}

/// The host app version moved between launches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionChange {
	pub previous_version: String,
	pub current_version: String,
}

/// The live recording state for one environment.
///
/// Exists only while recording. It is replaced wholesale when recording stops
/// or restarts with a different environment or configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {
	pub env_id: EnvironmentId,
	pub user_id: UserId,
	pub identity: Option<String>,
	/// Event properties attached to every event message.
	pub properties: BTreeMap<String, String>,
	pub session_info: SessionInfo,
	/// The session is expired at and after this instant.
	pub session_expiration: DateTime<Utc>,
	/// Attribution for events explicitly tracked without a pageview.
	pub unattributed_pageview: PageviewInfo,
	/// Fallback attribution when no source supplies one.
	pub last_pageview: PageviewInfo,
	pub last_observed_version: Option<String>,
	pub options: CaptureConfig,
	pub sdk_info: SdkInfo,
}

impl State {
	/// Starts recording from a loaded environment, creating a user when the
	/// environment has none. A new session is always created.
	pub fn new(
		loaded: EnvironmentState,
		options: CaptureConfig,
		sdk_info: SdkInfo,
		now: DateTime<Utc>,
		outcomes: &mut Outcomes,
	) -> Self {
		let session_info = SessionInfo::new_at(now);
		let unattributed_pageview = PageviewInfo::new_at(now);
		let mut state = Self {
			env_id: loaded.env_id,
			user_id: loaded.user_id.unwrap_or_default(),
			identity: loaded.identity.filter(|identity| !identity.is_empty()),
			properties: loaded.properties,
			session_info,
			session_expiration: now,
			last_pageview: unattributed_pageview.clone(),
			unattributed_pageview,
			last_observed_version: loaded.last_observed_version,
			options,
			sdk_info,
		};

		if loaded.user_id.is_none() {
			state.create_user_and_session(None, now, outcomes);
		} else {
			state.create_session(now, outcomes);
		}
		state
	}

	/// The durable part of the state.
	pub fn environment(&self) -> EnvironmentState {
		EnvironmentState {
			env_id: self.env_id.clone(),
			user_id: Some(self.user_id),
			identity: self.identity.clone(),
			properties: self.properties.clone(),
			session_info: Some(self.session_info.clone()),
			session_expiration: Some(self.session_expiration),
			unattributed_pageview: Some(self.unattributed_pageview.clone()),
			last_observed_version: self.last_observed_version.clone(),
		}
	}

	pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
		now >= self.session_expiration
	}

	/// The current session id, or `None` once the session has expired.
	pub fn active_session_id(&self, now: DateTime<Utc>) -> Option<SessionId> {
		(!self.is_expired(now)).then_some(self.session_info.id)
	}

	pub fn create_session(&mut self, now: DateTime<Utc>, outcomes: &mut Outcomes) {
		self.session_info = SessionInfo::new_at(now);
		self.unattributed_pageview = PageviewInfo::new_at(now);
		self.last_pageview = self.unattributed_pageview.clone();
		self.session_expiration = offset(now, self.options.session_timeout_delta());
		outcomes.session_created = true;
	}

	pub fn create_session_if_expired(
		&mut self,
		extend_if_not_expired: bool,
		now: DateTime<Utc>,
		outcomes: &mut Outcomes,
	) {
		if self.is_expired(now) {
			self.create_session(now, outcomes);
		} else if extend_if_not_expired {
			self.extend_expiration(now, None);
		}
	}

	/// Pushes the expiration forward; it never moves backwards.
	///
	/// Without a preferred expiration the candidate is `now + timeout`. A
	/// preferred expiration is bounded to `[now + timeout, now + ceiling]` by
	/// taking the median of the three.
	pub fn extend_expiration(&mut self, now: DateTime<Utc>, preferred: Option<DateTime<Utc>>) {
		let floor = offset(now, self.options.session_timeout_delta());
		let candidate = match preferred {
			Some(preferred) => {
				let ceiling = offset(now, self.options.extended_session_ceiling_delta());
				median(floor, preferred, ceiling)
			}
			None => floor,
		};
		self.session_expiration = self.session_expiration.max(candidate);
	}

	/// Extends the named session with an externally supplied expiration. Other
	/// session ids are ignored.
	pub fn extend_session(
		&mut self,
		session_id: &SessionId,
		preferred: DateTime<Utc>,
		now: DateTime<Utc>,
	) {
		if &self.session_info.id == session_id {
			self.extend_expiration(now, Some(preferred));
		}
	}

	/// Extends or recreates the session and records `pageview` as the fallback
	/// attribution. The title is cleared here when title capture is disabled.
	pub fn extend_session_and_set_last_pageview(
		&mut self,
		mut pageview: PageviewInfo,
		now: DateTime<Utc>,
		outcomes: &mut Outcomes,
	) -> PageviewInfo {
		self.create_session_if_expired(true, now, outcomes);
		if !self.options.capture_pageview_title {
			pageview.clear_title();
		}
		self.last_pageview = pageview.clone();
		pageview
	}

	/// Switches to a brand new user. Event properties do not carry over.
	pub fn create_user_and_session(
		&mut self,
		identity: Option<String>,
		now: DateTime<Utc>,
		outcomes: &mut Outcomes,
	) {
		self.user_id = UserId::new();
		if identity.is_some() {
			outcomes.identity_set = true;
		}
		self.identity = identity;
		self.properties.clear();
		outcomes.user_created = true;

		self.create_session(now, outcomes);
	}

	pub fn identify(&mut self, identity: &str, now: DateTime<Utc>, outcomes: &mut Outcomes) {
		if identity.is_empty() {
			return;
		}
		match self.identity.as_deref() {
			Some(current) if current == identity => {
				outcomes.was_already_identified = true;
			}
			Some(_) => {
				self.create_user_and_session(Some(identity.to_string()), now, outcomes);
			}
			None => {
				self.identity = Some(identity.to_string());
				outcomes.identity_set = true;
				self.create_session_if_expired(true, now, outcomes);
			}
		}
	}

	pub fn reset_identity(&mut self, now: DateTime<Utc>, outcomes: &mut Outcomes) {
		if self.identity.is_none() {
			outcomes.was_already_unidentified = true;
			return;
		}
		outcomes.identity_reset = true;
		self.create_user_and_session(None, now, outcomes);
	}

	pub fn add_event_properties(&mut self, properties: BTreeMap<String, String>) {
		self.properties.extend(properties);
	}

	pub fn remove_event_property(&mut self, name: &str) {
		if !name.is_empty() {
			self.properties.remove(name);
		}
	}

	pub fn clear_event_properties(&mut self) {
		self.properties.clear();
	}

	/// Compares the running app version with the one seen on the previous
	/// launch. A change is reported only when a previous version was recorded.
	pub fn observe_version(&mut self, outcomes: &mut Outcomes) {
		let Some(current) = self.sdk_info.app.version.clone() else {
			return;
		};
		if let Some(previous) = self.last_observed_version.as_deref() {
			if previous != current {
				outcomes.version_change = Some(VersionChange {
					previous_version: previous.to_string(),
					current_version: current.clone(),
				});
			}
		}
		self.last_observed_version = Some(current);
	}
}

/// Starts recording, or does nothing when already recording the same
/// environment with equal configuration.
pub fn start(
	current: &mut Option<State>,
	loaded: EnvironmentState,
	options: CaptureConfig,
	sdk_info: SdkInfo,
	now: DateTime<Utc>,
	outcomes: &mut Outcomes,
) {
	if let Some(state) = current.as_ref() {
		if state.env_id == loaded.env_id && state.options == options {
			outcomes.already_recording = true;
			return;
		}
		outcomes.previous_stopped = true;
	}

	*current = Some(State::new(loaded, options, sdk_info, now, outcomes));
	outcomes.current_started = true;
}

pub fn stop(current: &mut Option<State>, outcomes: &mut Outcomes) {
	if current.take().is_some() {
		outcomes.previous_stopped = true;
	}
}

fn offset(now: DateTime<Utc>, delta: Duration) -> DateTime<Utc> {
	now.checked_add_signed(delta)
		.unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn median(a: DateTime<Utc>, b: DateTime<Utc>, c: DateTime<Utc>) -> DateTime<Utc> {
	let mut values = [a, b, c];
	values.sort();
	values[1]
}

#[cfg(test)]
mod tests {
	use super::*;
	use loom_capture_core::{AppInfo, CaptureConfigLayer};
	use proptest::prelude::*;

	fn t0() -> DateTime<Utc> {
		DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
			.unwrap()
			.with_timezone(&Utc)
	}

	fn sdk(version: Option<&str>) -> SdkInfo {
		SdkInfo::current(AppInfo {
			version: version.map(str::to_string),
			..Default::default()
		})
	}

	fn started(now: DateTime<Utc>) -> State {
		let mut current = None;
		let mut outcomes = Outcomes::default();
		start(
			&mut current,
			EnvironmentState::new(EnvironmentId::new("env1")),
			CaptureConfig::default(),
			sdk(None),
			now,
			&mut outcomes,
		);
		current.unwrap()
	}

	#[test]
	fn first_start_creates_user_and_session() {
		let mut current = None;
		let mut outcomes = Outcomes::default();
		start(
			&mut current,
			EnvironmentState::new(EnvironmentId::new("env1")),
			CaptureConfig::default(),
			sdk(None),
			t0(),
			&mut outcomes,
		);

		assert!(outcomes.current_started);
		assert!(outcomes.user_created);
		assert!(outcomes.session_created);
		assert!(!outcomes.previous_stopped);
		let state = current.unwrap();
		assert_eq!(state.session_expiration, t0() + Duration::minutes(5));
		assert_eq!(state.last_pageview, state.unattributed_pageview);
	}

	#[test]
	fn start_with_existing_user_keeps_it() {
		let mut loaded = EnvironmentState::new(EnvironmentId::new("env1"));
		let user_id = UserId::new();
		loaded.user_id = Some(user_id);
		loaded.identity = Some("alice".to_string());

		let mut outcomes = Outcomes::default();
		let state = State::new(loaded, CaptureConfig::default(), sdk(None), t0(), &mut outcomes);

		assert_eq!(state.user_id, user_id);
		assert_eq!(state.identity.as_deref(), Some("alice"));
		assert!(!outcomes.user_created);
		assert!(outcomes.session_created);
	}

	#[test]
	fn repeated_start_is_already_recording() {
		let mut current = Some(started(t0()));
		let before = current.clone();
		let mut outcomes = Outcomes::default();
		start(
			&mut current,
			EnvironmentState::new(EnvironmentId::new("env1")),
			CaptureConfig::default(),
			sdk(None),
			t0() + Duration::seconds(1),
			&mut outcomes,
		);

		assert_eq!(
			outcomes,
			Outcomes {
				already_recording: true,
				..Default::default()
			}
		);
		assert_eq!(current, before);
	}

	#[test]
	fn start_with_different_options_restarts() {
		let mut current = Some(started(t0()));
		let old_session = current.as_ref().unwrap().session_info.id;
		let options = CaptureConfigLayer {
			upload_interval_secs: Some(60),
			..Default::default()
		}
		.finalize();

		let loaded = current.as_ref().unwrap().environment();
		let mut outcomes = Outcomes::default();
		start(&mut current, loaded, options, sdk(None), t0(), &mut outcomes);

		assert!(outcomes.previous_stopped);
		assert!(outcomes.current_started);
		assert!(!outcomes.user_created);
		assert_ne!(current.unwrap().session_info.id, old_session);
	}

	#[test]
	fn stop_only_reports_when_running() {
		let mut current = Some(started(t0()));
		let mut outcomes = Outcomes::default();
		stop(&mut current, &mut outcomes);
		assert!(outcomes.previous_stopped);
		assert!(current.is_none());

		let mut outcomes = Outcomes::default();
		stop(&mut current, &mut outcomes);
		assert!(!outcomes.previous_stopped);
	}

	#[test]
	fn session_expires_at_the_expiration_instant() {
		let mut state = started(t0());
		let session = state.session_info.id;
		let expiration = state.session_expiration;

		let mut outcomes = Outcomes::default();
		state.create_session_if_expired(true, expiration - Duration::seconds(1), &mut outcomes);
		assert!(!outcomes.session_created);
		assert_eq!(state.session_info.id, session);

		let expiration = state.session_expiration;
		let mut outcomes = Outcomes::default();
		state.create_session_if_expired(true, expiration, &mut outcomes);
		assert!(outcomes.session_created);
		assert_ne!(state.session_info.id, session);
	}

	#[test]
	fn new_session_resets_pageviews() {
		let mut state = started(t0());
		let mut outcomes = Outcomes::default();
		let mut pageview = PageviewInfo::new_at(t0());
		pageview.title = Some("Home".to_string());
		state.extend_session_and_set_last_pageview(pageview.clone(), t0(), &mut outcomes);
		assert_eq!(state.last_pageview, pageview);

		let later = state.session_expiration + Duration::seconds(1);
		state.create_session_if_expired(false, later, &mut outcomes);
		assert_eq!(state.last_pageview, state.unattributed_pageview);
		assert_eq!(state.unattributed_pageview.time, later);
	}

	#[test]
	fn extension_without_extend_flag_keeps_expiration() {
		let mut state = started(t0());
		let expiration = state.session_expiration;
		let mut outcomes = Outcomes::default();
		state.create_session_if_expired(false, t0() + Duration::seconds(30), &mut outcomes);
		assert_eq!(state.session_expiration, expiration);
	}

	#[test]
	fn preferred_expiration_is_bounded_by_median() {
		let mut state = started(t0());
		let now = t0() + Duration::seconds(10);

		// Beyond the ceiling.
		state.extend_expiration(now, Some(now + Duration::hours(5)));
		assert_eq!(state.session_expiration, now + Duration::minutes(30));

		// Below the floor never shrinks the expiration.
		let mut state = started(t0());
		state.extend_expiration(now, Some(now - Duration::hours(1)));
		assert_eq!(state.session_expiration, now + Duration::minutes(5));

		// In range is taken as-is.
		let mut state = started(t0());
		state.extend_expiration(now, Some(now + Duration::minutes(12)));
		assert_eq!(state.session_expiration, now + Duration::minutes(12));
	}

	#[test]
	fn extend_session_ignores_other_sessions() {
		let mut state = started(t0());
		let expiration = state.session_expiration;
		state.extend_session(&SessionId::new(), t0() + Duration::minutes(20), t0());
		assert_eq!(state.session_expiration, expiration);

		let session = state.session_info.id;
		state.extend_session(&session, t0() + Duration::minutes(20), t0());
		assert_eq!(state.session_expiration, t0() + Duration::minutes(20));
	}

	#[test]
	fn title_is_cleared_on_consumption_when_disabled() {
		let mut current = None;
		let mut outcomes = Outcomes::default();
		let options = CaptureConfigLayer {
			disable_pageview_title_capture: Some(true),
			..Default::default()
		}
		.finalize();
		start(
			&mut current,
			EnvironmentState::new(EnvironmentId::new("env1")),
			options,
			sdk(None),
			t0(),
			&mut outcomes,
		);
		let mut state = current.unwrap();

		let mut pageview = PageviewInfo::new_at(t0());
		pageview.title = Some("Secret".to_string());
		let stored = state.extend_session_and_set_last_pageview(pageview, t0(), &mut outcomes);
		assert!(stored.title.is_none());
		assert!(state.last_pageview.title.is_none());
	}

	#[test]
	fn identify_same_identity_is_noop() {
		let mut state = started(t0());
		let mut outcomes = Outcomes::default();
		state.identify("u1", t0(), &mut outcomes);
		assert!(outcomes.identity_set);
		assert!(!outcomes.user_created);
		let user = state.user_id;

		let mut outcomes = Outcomes::default();
		state.identify("u1", t0(), &mut outcomes);
		assert!(outcomes.was_already_identified);
		assert!(!outcomes.identity_set);
		assert_eq!(state.user_id, user);
	}

	#[test]
	fn identify_different_identity_creates_user() {
		let mut state = started(t0());
		let mut outcomes = Outcomes::default();
		state.identify("u1", t0(), &mut outcomes);
		state.add_event_properties(BTreeMap::from([("k".to_string(), "v".to_string())]));
		let (user, session) = (state.user_id, state.session_info.id);

		let mut outcomes = Outcomes::default();
		state.identify("u2", t0(), &mut outcomes);
		assert!(outcomes.user_created);
		assert!(outcomes.identity_set);
		assert!(outcomes.session_created);
		assert_ne!(state.user_id, user);
		assert_ne!(state.session_info.id, session);
		assert_eq!(state.identity.as_deref(), Some("u2"));
		assert!(state.properties.is_empty());
	}

	#[test]
	fn identify_empty_is_ignored() {
		let mut state = started(t0());
		let before = state.clone();
		let mut outcomes = Outcomes::default();
		state.identify("", t0(), &mut outcomes);
		assert_eq!(outcomes, Outcomes::default());
		assert_eq!(state, before);
	}

	#[test]
	fn reset_identity_requires_identity() {
		let mut state = started(t0());
		let mut outcomes = Outcomes::default();
		state.reset_identity(t0(), &mut outcomes);
		assert!(outcomes.was_already_unidentified);
		assert!(!outcomes.user_created);

		state.identify("u1", t0(), &mut Outcomes::default());
		let user = state.user_id;
		let mut outcomes = Outcomes::default();
		state.reset_identity(t0(), &mut outcomes);
		assert!(outcomes.identity_reset);
		assert!(outcomes.user_created);
		assert!(!outcomes.identity_set);
		assert!(state.identity.is_none());
		assert_ne!(state.user_id, user);
	}

	#[test]
	fn event_properties_edit() {
		let mut state = started(t0());
		state.add_event_properties(BTreeMap::from([
			("a".to_string(), "1".to_string()),
			("b".to_string(), "2".to_string()),
		]));
		state.remove_event_property("a");
		state.remove_event_property("");
		assert_eq!(state.properties.len(), 1);
		state.clear_event_properties();
		assert!(state.properties.is_empty());
	}

	#[test]
	fn version_change_needs_a_previous_version() {
		let mut state = started(t0());
		state.sdk_info = sdk(Some("2.0"));

		let mut outcomes = Outcomes::default();
		state.observe_version(&mut outcomes);
		assert!(outcomes.version_change.is_none());
		assert_eq!(state.last_observed_version.as_deref(), Some("2.0"));

		state.last_observed_version = Some("1.0".to_string());
		let mut outcomes = Outcomes::default();
		state.observe_version(&mut outcomes);
		assert_eq!(
			outcomes.version_change,
			Some(VersionChange {
				previous_version: "1.0".to_string(),
				current_version: "2.0".to_string(),
			})
		);

		let mut outcomes = Outcomes::default();
		state.observe_version(&mut outcomes);
		assert!(outcomes.version_change.is_none());
	}

	#[test]
	fn environment_round_trips_through_new_state() {
		let state = started(t0());
		let environment = state.environment();
		assert_eq!(environment.user_id, Some(state.user_id));
		assert_eq!(environment.session_expiration, Some(state.session_expiration));
	}

	proptest! {
		#[test]
		fn expiration_never_decreases_while_session_lives(
			steps in proptest::collection::vec((0i64..400, proptest::option::of(-4000i64..4000)), 1..40)
		) {
			let mut state = started(t0());
			let mut now = t0();
			for (advance, preferred) in steps {
				now += Duration::seconds(advance);
				let session = state.session_info.id;
				let before = state.session_expiration;
				let mut outcomes = Outcomes::default();
				if state.is_expired(now) {
					state.create_session_if_expired(true, now, &mut outcomes);
					prop_assert!(outcomes.session_created);
					prop_assert_ne!(state.session_info.id, session);
				} else {
					match preferred {
						Some(secs) => state.extend_session(&session, now + Duration::seconds(secs), now),
						None => state.create_session_if_expired(true, now, &mut outcomes),
					}
					prop_assert!(!outcomes.session_created);
					prop_assert_eq!(state.session_info.id, session);
					prop_assert!(state.session_expiration >= before);
					prop_assert!(state.session_expiration >= now + Duration::minutes(5));
				}
			}
		}
	}
}
