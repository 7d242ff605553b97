// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The capture client: the host-facing entry point that turns state
//! transitions into queued messages, integration callbacks and uploads.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{join, join_all};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use loom_capture_core::properties::truncate_utf16;
use loom_capture_core::{
	load_layer, utf16_len, AppInfo, AppVisibility, CaptureConfig, CaptureConfigLayer,
	ConfigSource, DefaultsSource, EnvironmentId, EventKind, KeyValueSource, LibraryInfo,
	PageviewId, PageviewInfo, Properties, SdkInfo, SessionId, UserId, MAX_KEY_UTF16,
	MAX_VALUE_UTF16,
};
use loom_capture_store::{
	EventQueueStore, FileStateStore, PruneRequest, SqliteEventQueueStore, StateStore,
};

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::message_factory::MessageFactory;
use crate::pageview::{Pageview, PageviewProperties};
use crate::pageview_resolver::PageviewResolver;
use crate::pending_event::PendingEvent;
use crate::sources::{Registry, RuntimeBridge, Snapshot, Source};
use crate::state::State;
use crate::state_manager::{StateManager, StateUpdate};
use crate::uploader::{HttpTransport, UploadOutcome, UploadScheduler, UploadTransport, Uploader};
use crate::visibility::{AppVisibilityProvider, TrackedVisibility};

/// File name of the default on-disk event queue.
const QUEUE_FILE_NAME: &str = "capture-queue.sqlite";

/// Optional details of a tracked event.
#[derive(Debug, Clone, Default)]
pub struct TrackOptions {
	/// When the event happened. Defaults to now.
	pub timestamp: Option<DateTime<Utc>>,
	/// The integration tracking the event. Its name selects the source asked
	/// for pageview attribution.
	pub source: Option<LibraryInfo>,
	/// The pageview to attribute the event to. `None` lets the integrations
	/// decide; `Some(Pageview::None)` requests the unattributed pageview.
	pub pageview: Option<Pageview>,
}

/// Builder for constructing a [`CaptureClient`].
pub struct CaptureClientBuilder {
	config_sources: Vec<Box<dyn ConfigSource>>,
	app: AppInfo,
	data_directory: Option<PathBuf>,
	event_store: Option<Arc<dyn EventQueueStore>>,
	state_store: Option<Arc<dyn StateStore>>,
	transport: Option<Arc<dyn UploadTransport>>,
	clock: Option<Arc<dyn Clock>>,
	visibility: Option<Arc<dyn AppVisibilityProvider>>,
}

impl Default for CaptureClientBuilder {
	fn default() -> Self {
		Self::new()
	}
}

impl CaptureClientBuilder {
	pub fn new() -> Self {
		Self {
			config_sources: vec![Box::new(DefaultsSource)],
			app: AppInfo::default(),
			data_directory: None,
			event_store: None,
			state_store: None,
			transport: None,
			clock: None,
			visibility: None,
		}
	}

	/// Adds a configuration source. Sources are merged by precedence; options
	/// passed to [`CaptureClient::start_recording`] are layered on top.
	pub fn config_source(mut self, source: Box<dyn ConfigSource>) -> Self {
		self.config_sources.push(source);
		self
	}

	/// Describes the host application. Its version drives version-change
	/// events.
	pub fn app_info(mut self, app: AppInfo) -> Self {
		self.app = app;
		self
	}

	/// Directory for the event queue database and environment state files.
	///
	/// Defaults to the platform's local data directory.
	pub fn data_directory(mut self, directory: impl Into<PathBuf>) -> Self {
		self.data_directory = Some(directory.into());
		self
	}

	pub fn event_store(mut self, store: Arc<dyn EventQueueStore>) -> Self {
		self.event_store = Some(store);
		self
	}

	pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
		self.state_store = Some(store);
		self
	}

	/// Replaces the HTTP transport.
	pub fn transport(mut self, transport: Arc<dyn UploadTransport>) -> Self {
		self.transport = Some(transport);
		self
	}

	pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = Some(clock);
		self
	}

	/// Replaces the visibility provider. By default visibility follows the
	/// client's foreground and background notifications.
	pub fn visibility_provider(mut self, provider: Arc<dyn AppVisibilityProvider>) -> Self {
		self.visibility = Some(provider);
		self
	}

	pub async fn build(self) -> Result<CaptureClient> {
		let base_layer = load_layer(self.config_sources)?;
		let config = base_layer.clone().finalize();
		let sdk_info = SdkInfo::current(self.app);
		let directory = self
			.data_directory
			.unwrap_or_else(FileStateStore::default_directory);

		let store: Arc<dyn EventQueueStore> = match self.event_store {
			Some(store) => store,
			None => {
				tokio::fs::create_dir_all(&directory)
					.await
					.map_err(loom_capture_store::StoreError::from)?;
				let store = SqliteEventQueueStore::open(directory.join(QUEUE_FILE_NAME))
					.await?
					.with_message_byte_limit(config.message_byte_limit);
				Arc::new(store)
			}
		};
		let state_store: Arc<dyn StateStore> = match self.state_store {
			Some(store) => store,
			None => Arc::new(FileStateStore::new(directory)),
		};
		let custom_transport = self.transport;
		let transport: Arc<dyn UploadTransport> = match &custom_transport {
			Some(transport) => transport.clone(),
			None => Arc::new(HttpTransport::new(&config, sdk_info.library.clone())?),
		};
		let clock: Arc<dyn Clock> = match self.clock {
			Some(clock) => clock,
			None => Arc::new(SystemClock),
		};
		let tracked_visibility = Arc::new(TrackedVisibility::default());
		let visibility: Arc<dyn AppVisibilityProvider> = match self.visibility {
			Some(provider) => provider,
			None => tracked_visibility.clone(),
		};

		let state = Arc::new(StateManager::new(state_store));
		let uploader = Arc::new(Uploader::new(
			store.clone(),
			transport,
			state.clone(),
			clock.clone(),
			sdk_info.clone(),
			&config,
		));
		let scheduler = UploadScheduler::new(uploader, config.upload_interval);

		info!(base_url = %config.base_url, "Capture client initialized");

		Ok(CaptureClient {
			inner: Arc::new(CaptureClientInner {
				base_layer,
				sdk_info: sdk_info.clone(),
				factory: MessageFactory::new(sdk_info.library),
				clock,
				state,
				store,
				registry: Registry::new(),
				visibility,
				tracked_visibility,
				custom_transport,
				scheduler,
			}),
		})
	}
}

struct CaptureClientInner {
	base_layer: CaptureConfigLayer,
	sdk_info: SdkInfo,
	factory: MessageFactory,
	clock: Arc<dyn Clock>,
	state: Arc<StateManager>,
	store: Arc<dyn EventQueueStore>,
	registry: Registry,
	visibility: Arc<dyn AppVisibilityProvider>,
	tracked_visibility: Arc<TrackedVisibility>,
	/// Transport supplied to the builder. Used for every recording instead of
	/// an HTTP transport built from the recording's options.
	custom_transport: Option<Arc<dyn UploadTransport>>,
	scheduler: UploadScheduler,
}

/// Records events into a durable queue and uploads them in the background.
///
/// Cloning is cheap; clones share the same state. No operation returns an
/// error: invalid input and storage failures are logged and skipped.
#[derive(Clone)]
pub struct CaptureClient {
	inner: Arc<CaptureClientInner>,
}

impl CaptureClient {
	pub fn builder() -> CaptureClientBuilder {
		CaptureClientBuilder::new()
	}

	fn now(&self) -> DateTime<Utc> {
		self.inner.clock.now()
	}

	/// Starts (or restarts) recording into `env_id`. `options` holds
	/// configuration overrides keyed by [`CaptureConfigLayer`] field name.
	///
	/// Starting again with the same environment and equivalent options does
	/// nothing.
	pub async fn start_recording(&self, env_id: impl Into<EnvironmentId>, options: Map<String, Value>) {
		let env_id = env_id.into();
		if env_id.is_empty() {
			warn!("start_recording called with an empty environment id, ignoring");
			return;
		}

		let options = self.resolve_options(options);
		let now = self.now();
		let update = self
			.inner
			.state
			.start(env_id, options, self.inner.sdk_info.clone(), now)
			.await;
		if update.outcomes.already_recording {
			debug!("already recording with equivalent options");
		}
		self.handle_changes(&update, now).await;
	}

	fn resolve_options(&self, options: Map<String, Value>) -> CaptureConfig {
		let mut layer = self.inner.base_layer.clone();
		match KeyValueSource::new(options).load() {
			Ok(overrides) => layer.merge(overrides),
			Err(e) => warn!(error = %e, "ignoring invalid recording options"),
		}
		layer.finalize()
	}

	/// Stops recording. An upload already in progress is not interrupted.
	pub async fn stop_recording(&self) {
		let update = self.inner.state.stop().await;
		if !update.outcomes.previous_stopped {
			debug!("stop_recording called while not recording");
		}
		self.handle_changes(&update, self.now()).await;
	}

	/// Tracks a custom event. Dropped when not recording or when `name` is
	/// blank or longer than 512 UTF-16 code units.
	pub async fn track(&self, name: &str, properties: Properties, options: TrackOptions) {
		if name.trim().is_empty() {
			warn!("track called with a blank event name, ignoring");
			return;
		}
		if utf16_len(name) > MAX_KEY_UTF16 {
			warn!(
				event = %name,
				"dropped event whose name exceeds {MAX_KEY_UTF16} UTF-16 code units"
			);
			return;
		}

		let properties = properties.sanitized("track");
		let timestamp = options.timestamp.unwrap_or_else(|| self.now());
		let update = self
			.inner
			.state
			.create_session_if_expired(true, timestamp)
			.await;
		self.handle_changes(&update, timestamp).await;
		let Some(state) = update.current else {
			debug!(event = %name, "track called before start_recording");
			return;
		};

		let partial = self
			.inner
			.factory
			.partial_event(timestamp, options.source.clone(), &state);
		let pending = PendingEvent::new(partial, self.inner.store.clone());
		pending
			.set_kind(EventKind::Custom {
				name: name.to_string(),
				properties,
			})
			.await;

		let snapshot = self.inner.registry.snapshot();
		let resolver = PageviewResolver::new(&snapshot, &state, timestamp);
		let event_source = options.source.as_ref().map(|library| library.name.as_str());
		join(
			async {
				let info = resolver.resolve(options.pageview.as_ref(), event_source).await;
				pending.set_pageview_info(info).await;
			},
			async {
				let visibility = self.inner.visibility.current().await;
				pending.set_app_visibility(visibility).await;
			},
		)
		.await;
	}

	/// Tracks a pageview and returns a handle for attributing later events to
	/// it. Returns [`Pageview::None`] when not recording.
	pub async fn track_pageview(
		&self,
		properties: PageviewProperties,
		source: Option<LibraryInfo>,
		bridge: Option<&Arc<dyn RuntimeBridge>>,
	) -> Pageview {
		let now = self.now();
		let title = properties.title.as_deref().map(|title| {
			truncate_utf16(title, MAX_VALUE_UTF16)
				.unwrap_or(title)
				.to_string()
		});
		let info = PageviewInfo {
			id: PageviewId::new(),
			time: now,
			title,
			component: properties.component.clone(),
			url: properties.url.clone(),
			source_properties: properties.source_properties.sanitized("track_pageview"),
		};

		let (update, stored) = self
			.inner
			.state
			.extend_session_and_set_last_pageview(info, now)
			.await;
		self.handle_changes(&update, now).await;
		let (Some(state), Some(stored)) = (update.current, stored) else {
			debug!("track_pageview called before start_recording");
			return Pageview::None;
		};

		let message = self
			.inner
			.factory
			.pageview_message(&stored, source.clone(), &state);
		log_failure(
			self.inner.store.insert_pending_message(&message).await,
			"insert pageview",
		);

		Pageview::new(state.session_info, stored, source, properties, bridge)
	}

	/// Associates the current user with `identity`. Identifying as a different
	/// identity switches to a new user.
	pub async fn identify(&self, identity: &str) {
		let now = self.now();
		let update = self.inner.state.identify(identity, now).await;
		if update.outcomes.was_already_identified {
			debug!("already identified with this identity");
		}
		self.handle_changes(&update, now).await;
	}

	/// Switches to a new anonymous user if the current user is identified.
	pub async fn reset_identity(&self) {
		let now = self.now();
		let update = self.inner.state.reset_identity(now).await;
		if update.outcomes.was_already_unidentified {
			debug!("reset_identity called while unidentified");
		}
		self.handle_changes(&update, now).await;
	}

	/// Queues properties describing the current user for upload.
	pub async fn add_user_properties(&self, properties: Properties) {
		let Some(state) = self.inner.state.current() else {
			debug!("add_user_properties called before start_recording");
			return;
		};
		for (name, value) in properties.sanitized("add_user_properties") {
			log_failure(
				self
					.inner
					.store
					.insert_or_update_user_property(&state.env_id, &state.user_id, &name, &value)
					.await,
				"insert user property",
			);
		}
	}

	/// Adds properties attached to every subsequent event.
	pub async fn add_event_properties(&self, properties: Properties) {
		let properties = properties.sanitized("add_event_properties");
		if properties.is_empty() {
			return;
		}
		self.inner.state.add_event_properties(properties).await;
	}

	pub async fn remove_event_property(&self, name: &str) {
		self.inner.state.remove_event_property(name).await;
	}

	pub async fn clear_event_properties(&self) {
		self.inner.state.clear_event_properties().await;
	}

	/// The current session id without touching the session. `None` when not
	/// recording or when the session has expired.
	pub fn session_id(&self) -> Option<SessionId> {
		self.inner.state.session_id(self.now())
	}

	/// The current session id, starting a new session if the current one has
	/// expired. Does not extend an unexpired session.
	pub async fn fetch_session_id(&self) -> Option<SessionId> {
		let now = self.now();
		let update = self.inner.state.create_session_if_expired(false, now).await;
		self.handle_changes(&update, now).await;
		update.current.map(|state| state.session_info.id)
	}

	/// Extends `session_id` towards `preferred_expiration`, bounded by the
	/// session timeout and the extended session ceiling. Ignored unless
	/// `session_id` is the current session.
	pub async fn extend_session(&self, session_id: &SessionId, preferred_expiration: DateTime<Utc>) {
		self
			.inner
			.state
			.extend_session(session_id, preferred_expiration, self.now())
			.await;
	}

	pub async fn application_did_enter_foreground(&self) {
		self
			.inner
			.tracked_visibility
			.set(AppVisibility::Foregrounded);
		self.application_did_change_visibility(Lifecycle::Foreground).await;
	}

	pub async fn application_did_enter_background(&self) {
		self
			.inner
			.tracked_visibility
			.set(AppVisibility::Backgrounded);
		self.application_did_change_visibility(Lifecycle::Background).await;
	}

	async fn application_did_change_visibility(
		&self,
		event: fn(DateTime<Utc>) -> Lifecycle<'static>,
	) {
		let now = self.now();
		let update = self.inner.state.create_session_if_expired(true, now).await;
		self.handle_changes(&update, now).await;
		if update.current.is_some() {
			broadcast(&self.inner.registry.snapshot(), event(now)).await;
		}
	}

	/// Runs an upload pass now unless one is already running.
	pub async fn upload_now(&self) -> Option<UploadOutcome> {
		self.inner.scheduler.uploader().perform_pass_if_idle().await
	}

	pub fn environment_id(&self) -> Option<EnvironmentId> {
		self.inner.state.current().map(|state| state.env_id)
	}

	pub fn user_id(&self) -> Option<UserId> {
		self.inner.state.current().map(|state| state.user_id)
	}

	pub fn identity(&self) -> Option<String> {
		self.inner.state.current().and_then(|state| state.identity)
	}

	pub fn is_recording(&self) -> bool {
		self.inner.state.current().is_some()
	}

	/// Registers an integration. A source added while recording is told about
	/// the recording and current session straight away.
	pub async fn add_source(&self, source: Arc<dyn Source>, is_default: bool) {
		self.inner.registry.add_source(source.clone(), is_default);
		if let Some(state) = self.inner.state.current() {
			let foregrounded = self.is_foregrounded().await;
			Lifecycle::Started(&state.options)
				.deliver_to_source(source.as_ref())
				.await;
			session_started(&state, foregrounded)
				.deliver_to_source(source.as_ref())
				.await;
		}
	}

	pub fn remove_source(&self, name: &str) -> Option<Arc<dyn Source>> {
		self.inner.registry.remove_source(name)
	}

	/// Registers a runtime bridge, once per instance.
	pub async fn add_bridge(&self, bridge: Arc<dyn RuntimeBridge>) {
		if !self.inner.registry.add_bridge(bridge.clone()) {
			return;
		}
		if let Some(state) = self.inner.state.current() {
			let foregrounded = self.is_foregrounded().await;
			Lifecycle::Started(&state.options)
				.deliver_to_bridge(bridge.as_ref())
				.await;
			session_started(&state, foregrounded)
				.deliver_to_bridge(bridge.as_ref())
				.await;
		}
	}

	pub fn remove_bridge(&self, bridge: &Arc<dyn RuntimeBridge>) {
		self.inner.registry.remove_bridge(bridge);
	}

	async fn is_foregrounded(&self) -> bool {
		self.inner.visibility.current().await == AppVisibility::Foregrounded
	}

	/// Realizes the side effects of one state update, in order: store writes,
	/// pruning, integration callbacks, then scheduling.
	async fn handle_changes(&self, update: &StateUpdate, now: DateTime<Utc>) {
		let outcomes = &update.outcomes;
		let snapshot = self.inner.registry.snapshot();

		if outcomes.previous_stopped {
			if let Some(previous) = &update.previous {
				info!(env_id = %previous.env_id, "Capture recording stopped");
			}
			broadcast(&snapshot, Lifecycle::Stopped).await;
			if !outcomes.current_started {
				self.inner.scheduler.stop();
				return;
			}
		}

		let Some(state) = &update.current else {
			return;
		};
		let store = &self.inner.store;

		if outcomes.current_started || outcomes.user_created {
			log_failure(
				store
					.create_new_user_if_needed(
						&state.env_id,
						&state.user_id,
						state.identity.as_deref(),
						now,
					)
					.await,
				"create user",
			);
		} else if outcomes.identity_set {
			if let Some(identity) = &state.identity {
				log_failure(
					store
						.set_identity_if_null(&state.env_id, &state.user_id, identity)
						.await,
					"set identity",
				);
			}
		}

		if outcomes.session_created {
			let factory = &self.inner.factory;
			log_failure(
				store
					.create_session_if_needed(&factory.session_message(state))
					.await,
				"create session",
			);
			log_failure(
				store
					.insert_pending_message(&factory.pageview_message(
						&state.unattributed_pageview,
						None,
						state,
					))
					.await,
				"insert unattributed pageview",
			);
		}

		if let Some(change) = &outcomes.version_change {
			info!(
				previous_version = %change.previous_version,
				current_version = %change.current_version,
				"Host app version changed"
			);
			let message = self.inner.factory.version_change_message(change, now, state);
			log_failure(
				store.insert_pending_message(&message).await,
				"insert version change",
			);
		}

		let foregrounded = if outcomes.current_started || outcomes.session_created {
			self.is_foregrounded().await
		} else {
			false
		};
		if outcomes.current_started {
			info!(env_id = %state.env_id, user_id = %state.user_id, "Capture recording started");
			let cutoff = now
				.checked_sub_signed(state.options.prune_age_delta())
				.unwrap_or(DateTime::<Utc>::MIN_UTC);
			let request = PruneRequest {
				active_env_id: state.env_id.clone(),
				active_user_id: state.user_id,
				active_session_id: state.session_info.id,
				min_last_message_date: cutoff,
				min_user_creation_date: cutoff,
			};
			log_failure(store.prune_old_data(&request).await, "prune");

			broadcast(&snapshot, Lifecycle::Started(&state.options)).await;
			if foregrounded {
				broadcast(&snapshot, Lifecycle::Foreground(now)).await;
			}
			self.restart_uploads(&state.options);
		}

		if outcomes.session_created {
			broadcast(&snapshot, session_started(state, foregrounded)).await;
		}
	}

	/// Points the uploader at the endpoint and limits of a new recording and
	/// restarts the timer, which uploads straight away.
	fn restart_uploads(&self, options: &CaptureConfig) {
		let inner = &self.inner;
		let transport: Option<Arc<dyn UploadTransport>> = match &inner.custom_transport {
			Some(transport) => Some(transport.clone()),
			None => match HttpTransport::new(options, inner.sdk_info.library.clone()) {
				Ok(transport) => {
					let transport: Arc<dyn UploadTransport> = Arc::new(transport);
					Some(transport)
				}
				Err(e) => {
					warn!(
						base_url = %options.base_url,
						error = %e,
						"invalid upload options, keeping the previous endpoint"
					);
					None
				}
			},
		};
		if let Some(transport) = transport {
			inner.scheduler.uploader().configure(transport, options);
		}
		inner.scheduler.restart(options.upload_interval);
	}
}

fn log_failure(result: loom_capture_store::Result<()>, operation: &'static str) {
	if let Err(e) = result {
		warn!(operation, error = %e, "capture store write failed");
	}
}

fn session_started(state: &State, foregrounded: bool) -> Lifecycle<'static> {
	Lifecycle::SessionStarted {
		session_id: state.session_info.id,
		timestamp: state.session_info.time,
		foregrounded,
	}
}

/// A lifecycle callback delivered to sources and bridges.
#[derive(Clone, Copy)]
enum Lifecycle<'a> {
	Started(&'a CaptureConfig),
	Stopped,
	SessionStarted {
		session_id: SessionId,
		timestamp: DateTime<Utc>,
		foregrounded: bool,
	},
	Foreground(DateTime<Utc>),
	Background(DateTime<Utc>),
}

impl Lifecycle<'_> {
	async fn deliver_to_source(self, source: &dyn Source) {
		match self {
			Lifecycle::Started(options) => source.did_start_recording(options).await,
			Lifecycle::Stopped => source.did_stop_recording().await,
			Lifecycle::SessionStarted {
				session_id,
				timestamp,
				foregrounded,
			} => {
				source
					.session_did_start(session_id, timestamp, foregrounded)
					.await
			}
			Lifecycle::Foreground(ts) => source.application_did_enter_foreground(ts).await,
			Lifecycle::Background(ts) => source.application_did_enter_background(ts).await,
		}
	}

	async fn deliver_to_bridge(self, bridge: &dyn RuntimeBridge) {
		match self {
			Lifecycle::Started(options) => bridge.did_start_recording(options).await,
			Lifecycle::Stopped => bridge.did_stop_recording().await,
			Lifecycle::SessionStarted {
				session_id,
				timestamp,
				foregrounded,
			} => {
				bridge
					.session_did_start(session_id, timestamp, foregrounded)
					.await
			}
			Lifecycle::Foreground(ts) => bridge.application_did_enter_foreground(ts).await,
			Lifecycle::Background(ts) => bridge.application_did_enter_background(ts).await,
		}
	}
}

async fn broadcast(snapshot: &Snapshot, event: Lifecycle<'_>) {
	let sources = join_all(
		snapshot
			.sources
			.values()
			.map(|source| event.deliver_to_source(source.as_ref())),
	);
	let bridges = join_all(
		snapshot
			.bridges
			.iter()
			.map(|bridge| event.deliver_to_bridge(bridge.as_ref())),
	);
	join(sources, bridges).await;
}
