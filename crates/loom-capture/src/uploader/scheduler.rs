// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Background timer driving upload passes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{UploadOutcome, Uploader};

/// Backoff multiplier applied to the interval after a failed pass.
pub const FAILURE_BACKOFF_FACTOR: u32 = 4;

/// Runs an upload pass immediately when started, then every `interval`, or
/// every `interval * 4` after a pass that ended in a retryable failure.
///
/// Passes never overlap: a tick that lands while a pass (including one
/// started through [`Uploader::perform_pass_if_idle`]) is in flight is
/// skipped.
pub struct UploadScheduler {
	uploader: Arc<Uploader>,
	interval: Mutex<Duration>,
	task: Mutex<Option<Running>>,
}

struct Running {
	shutdown: Arc<Shutdown>,
	handle: JoinHandle<()>,
}

#[derive(Default)]
struct Shutdown {
	requested: AtomicBool,
	notify: Notify,
}

impl UploadScheduler {
	pub fn new(uploader: Arc<Uploader>, interval: Duration) -> Self {
		Self {
			uploader,
			interval: Mutex::new(interval),
			task: Mutex::new(None),
		}
	}

	pub fn uploader(&self) -> &Arc<Uploader> {
		&self.uploader
	}

	pub fn is_running(&self) -> bool {
		self
			.task
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.as_ref()
			.is_some_and(|running| !running.handle.is_finished())
	}

	/// Starts the timer task if it is not running. Must be called within a
	/// tokio runtime.
	pub fn start(&self) {
		let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
		if task.as_ref().is_some_and(|running| !running.handle.is_finished()) {
			debug!("capture upload scheduler already running");
			return;
		}

		let interval = *self.interval.lock().unwrap_or_else(PoisonError::into_inner);
		let shutdown = Arc::new(Shutdown::default());
		let handle = tokio::spawn(run(self.uploader.clone(), interval, shutdown.clone()));
		*task = Some(Running { shutdown, handle });
	}

	/// Replaces any running timer with one ticking at `interval`, beginning
	/// with an immediate pass. If a pass is in flight, that pass runs once
	/// more when it finishes instead.
	pub fn restart(&self, interval: Duration) {
		*self.interval.lock().unwrap_or_else(PoisonError::into_inner) = interval;
		self.stop();
		self.start();
	}

	/// Stops scheduling further passes. A pass already in flight runs to
	/// completion.
	pub fn stop(&self) {
		let running = self
			.task
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take();
		if let Some(running) = running {
			running.shutdown.requested.store(true, Ordering::SeqCst);
			running.shutdown.notify.notify_one();
		}
	}
}

impl Drop for UploadScheduler {
	fn drop(&mut self) {
		self.stop();
	}
}

async fn run(uploader: Arc<Uploader>, interval: Duration, shutdown: Arc<Shutdown>) {
	info!(
		upload_interval_secs = interval.as_secs(),
		"Starting capture upload scheduler"
	);

	let backoff = interval.saturating_mul(FAILURE_BACKOFF_FACTOR);
	loop {
		if shutdown.requested.load(Ordering::SeqCst) {
			break;
		}

		let delay = match uploader.perform_pass_if_idle().await {
			Some(UploadOutcome::Failed(_)) => backoff,
			Some(UploadOutcome::Success) | None => interval,
		};

		tokio::select! {
			_ = tokio::time::sleep(delay) => {}
			_ = shutdown.notify.notified() => {}
		}
	}

	info!("Capture upload scheduler stopped");
}
