// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Drains the event queue to the ingestion endpoint.
//!
//! A pass walks every user the store reports, active user first:
//!
//! 1. the initial user record, bundled with SDK/app/device metadata,
//! 2. the identity, when one is pending,
//! 3. all pending user properties in one request,
//! 4. each session's queue in byte- and count-limited batches, active session
//!    first.
//!
//! A request the server processed (2xx) or refused as malformed (4xx) is
//! settled and marked done. Any other failure ends the pass; everything not
//! yet settled is retried on the next pass.

pub mod scheduler;
pub mod transport;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error, instrument, warn};

use loom_capture_core::{
	codec, CaptureConfig, EnvironmentId, IdentifyPayload, SdkInfo, SessionId, UserId,
	UserPropertiesPayload,
};
use loom_capture_store::{EventQueueStore, UserToUpload};

use crate::clock::Clock;

pub use scheduler::UploadScheduler;
pub use transport::{HttpTransport, UploadError, UploadScope, UploadTransport, ENV_ID_HEADER};

/// The session currently being recorded into.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActiveSession {
	pub env_id: EnvironmentId,
	pub user_id: UserId,
	pub session_id: SessionId,
}

impl ActiveSession {
	pub fn is_user(&self, env_id: &EnvironmentId, user_id: &UserId) -> bool {
		&self.env_id == env_id && &self.user_id == user_id
	}

	pub fn is_session(
		&self,
		env_id: &EnvironmentId,
		user_id: &UserId,
		session_id: &SessionId,
	) -> bool {
		self.is_user(env_id, user_id) && &self.session_id == session_id
	}
}

/// Reports which session must not be deleted by an upload pass.
pub trait ActiveSessionProvider: Send + Sync {
	fn active_session(&self) -> Option<ActiveSession>;
}

/// The single terminal result of an upload pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
	/// Everything reachable was uploaded or dropped as a bad request.
	Success,
	/// The pass stopped at a retryable failure.
	Failed(UploadError),
}

impl UploadOutcome {
	pub fn is_success(&self) -> bool {
		matches!(self, UploadOutcome::Success)
	}
}

type SessionKey = (EnvironmentId, UserId, SessionId);

/// Endpoint and batch limits used by a pass. Captured when the pass begins,
/// so reconfiguring only affects later passes.
#[derive(Clone)]
struct UploadSettings {
	transport: Arc<dyn UploadTransport>,
	message_limit: usize,
	byte_limit: usize,
}

impl UploadSettings {
	fn new(transport: Arc<dyn UploadTransport>, config: &CaptureConfig) -> Self {
		Self {
			transport,
			message_limit: config.message_batch_message_limit.max(1),
			byte_limit: config.message_batch_byte_limit,
		}
	}
}

pub struct Uploader {
	store: Arc<dyn EventQueueStore>,
	active: Arc<dyn ActiveSessionProvider>,
	clock: Arc<dyn Clock>,
	sdk_info: SdkInfo,
	settings: Mutex<UploadSettings>,
	rejected_sessions: Mutex<HashSet<SessionKey>>,
	in_flight: AtomicBool,
	rerun_requested: AtomicBool,
}

/// Clears the in-flight flag when a pass ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
	fn drop(&mut self) {
		self.0.store(false, Ordering::SeqCst);
	}
}

impl Uploader {
	pub fn new(
		store: Arc<dyn EventQueueStore>,
		transport: Arc<dyn UploadTransport>,
		active: Arc<dyn ActiveSessionProvider>,
		clock: Arc<dyn Clock>,
		sdk_info: SdkInfo,
		config: &CaptureConfig,
	) -> Self {
		Self {
			store,
			active,
			clock,
			sdk_info,
			settings: Mutex::new(UploadSettings::new(transport, config)),
			rejected_sessions: Mutex::new(HashSet::new()),
			in_flight: AtomicBool::new(false),
			rerun_requested: AtomicBool::new(false),
		}
	}

	/// Switches the transport and batch limits for subsequent passes.
	pub fn configure(&self, transport: Arc<dyn UploadTransport>, config: &CaptureConfig) {
		*self.settings.lock().unwrap_or_else(PoisonError::into_inner) =
			UploadSettings::new(transport, config);
	}

	fn settings(&self) -> UploadSettings {
		self
			.settings
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.clone()
	}

	/// Runs a pass unless one is already running. When one is, `None` is
	/// returned without touching the store and the running pass is asked to
	/// go around once more after it finishes, so that work queued meanwhile
	/// is not left waiting for the next tick.
	///
	/// A follow-up pass is not run after a failed pass.
	pub async fn perform_pass_if_idle(&self) -> Option<UploadOutcome> {
		self.rerun_requested.store(true, Ordering::SeqCst);
		let mut outcome = None;
		while self.rerun_requested.load(Ordering::SeqCst) {
			if self
				.in_flight
				.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
				.is_err()
			{
				debug!("capture upload already in flight, requested a follow-up pass");
				break;
			}
			let _guard = InFlight(&self.in_flight);
			self.rerun_requested.store(false, Ordering::SeqCst);
			let result = self.perform_pass().await;
			let failed = !result.is_success();
			outcome = Some(result);
			if failed {
				break;
			}
		}
		outcome
	}

	pub fn is_in_flight(&self) -> bool {
		self.in_flight.load(Ordering::SeqCst)
	}

	#[instrument(skip(self))]
	pub async fn perform_pass(&self) -> UploadOutcome {
		match self.drain().await {
			Ok(()) => UploadOutcome::Success,
			Err(e) => {
				error!(error = %e, "capture upload pass failed");
				UploadOutcome::Failed(e)
			}
		}
	}

	async fn drain(&self) -> Result<(), UploadError> {
		let active = self.active.active_session();
		let mut users = self.store.users_to_upload().await?;
		users.sort_by_key(|u| {
			!active
				.as_ref()
				.is_some_and(|a| a.is_user(&u.env_id, &u.user_id))
		});

		let settings = self.settings();
		debug!(users = users.len(), "starting capture upload pass");
		for user in &users {
			self.upload_user(&settings, user, active.as_ref()).await?;
		}
		Ok(())
	}

	async fn upload_user(
		&self,
		settings: &UploadSettings,
		user: &UserToUpload,
		active: Option<&ActiveSession>,
	) -> Result<(), UploadError> {
		let scope = UploadScope {
			env_id: user.env_id.clone(),
			user_id: user.user_id,
			identity: user.identity.clone(),
		};

		if user.needs_initial_upload {
			let payload = UserPropertiesPayload {
				env_id: user.env_id.clone(),
				user_id: user.user_id,
				library: self.sdk_info.library.clone(),
				properties: BTreeMap::new(),
				initial: Some(self.sdk_info.clone()),
			};
			let result = settings.transport.add_user_properties(&scope, &payload).await;
			settle(result, "initial user", user)?;
			self
				.store
				.set_has_sent_initial_user(&user.env_id, &user.user_id)
				.await?;
		}

		if user.needs_identity_upload {
			if let Some(identity) = &user.identity {
				let payload = IdentifyPayload {
					env_id: user.env_id.clone(),
					user_id: user.user_id,
					identity: identity.clone(),
					library: self.sdk_info.library.clone(),
					time: self.clock.now(),
				};
				let result = settings.transport.identify(&scope, &payload).await;
				settle(result, "identity", user)?;
				self
					.store
					.set_has_sent_identity(&user.env_id, &user.user_id)
					.await?;
			}
		}

		if !user.pending_user_properties.is_empty() {
			let payload = UserPropertiesPayload {
				env_id: user.env_id.clone(),
				user_id: user.user_id,
				library: self.sdk_info.library.clone(),
				properties: user.pending_user_properties.clone(),
				initial: None,
			};
			let result = settings.transport.add_user_properties(&scope, &payload).await;
			settle(result, "user properties", user)?;
			for (name, value) in &user.pending_user_properties {
				self
					.store
					.set_has_sent_user_property(&user.env_id, &user.user_id, name, value)
					.await?;
			}
		}

		let mut sessions = user.session_ids.clone();
		sessions.sort_by_key(|session_id| {
			!active.is_some_and(|a| a.is_session(&user.env_id, &user.user_id, session_id))
		});
		for session_id in sessions {
			let key = (user.env_id.clone(), user.user_id, session_id);
			if self.is_rejected(&key) {
				continue;
			}
			let is_active =
				active.is_some_and(|a| a.is_session(&user.env_id, &user.user_id, &session_id));
			self.upload_session(settings, &scope, key, is_active).await?;
		}
		Ok(())
	}

	async fn upload_session(
		&self,
		settings: &UploadSettings,
		scope: &UploadScope,
		key: SessionKey,
		is_active: bool,
	) -> Result<(), UploadError> {
		let (env_id, user_id, session_id) = &key;
		loop {
			let batch = self
				.store
				.get_pending_encoded_messages(
					env_id,
					user_id,
					session_id,
					settings.message_limit,
					settings.byte_limit,
				)
				.await?;

			if batch.is_empty() {
				if !is_active {
					self.store.delete_session(env_id, user_id, session_id).await?;
					debug!(session_id = %session_id, "removed drained session");
				}
				return Ok(());
			}

			let identifiers: Vec<i64> = batch.iter().map(|m| m.identifier).collect();
			let result = match codec::frame_batch(batch.iter().map(|m| m.payload.as_slice())) {
				Ok(body) => settings.transport.track(scope, body).await,
				Err(e) => {
					warn!(session_id = %session_id, error = %e, "queued records are unreadable");
					Err(UploadError::BadRequest { status: 0 })
				}
			};

			match result {
				Ok(()) => {
					self.store.delete_sent_messages(&identifiers).await?;
					debug!(
						session_id = %session_id,
						count = identifiers.len(),
						"uploaded capture batch"
					);
				}
				Err(e) if e.is_retryable() => return Err(e),
				Err(e) if is_active => {
					warn!(
						session_id = %session_id,
						error = %e,
						"active session rejected, skipping it for this process"
					);
					self
						.rejected_sessions
						.lock()
						.unwrap_or_else(PoisonError::into_inner)
						.insert(key);
					return Ok(());
				}
				Err(e) => {
					warn!(session_id = %session_id, error = %e, "session rejected, dropping it");
					self.store.delete_session(env_id, user_id, session_id).await?;
					return Ok(());
				}
			}
		}
	}

	fn is_rejected(&self, key: &SessionKey) -> bool {
		self
			.rejected_sessions
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.contains(key)
	}
}

/// Turns a user-record response into "mark it sent" or "abort the pass".
fn settle(
	result: Result<(), UploadError>,
	what: &'static str,
	user: &UserToUpload,
) -> Result<(), UploadError> {
	match result {
		Ok(()) => Ok(()),
		Err(e) if e.is_retryable() => Err(e),
		Err(e) => {
			warn!(user_id = %user.user_id, error = %e, "dropping rejected {what}");
			Ok(())
		}
	}
}
