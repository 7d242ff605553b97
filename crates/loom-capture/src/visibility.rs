// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Host application visibility, read when an event is committed.

use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;

use loom_capture_core::AppVisibility;

#[async_trait]
pub trait AppVisibilityProvider: Send + Sync {
	async fn current(&self) -> AppVisibility;
}

/// Reports visibility as told by the host through the client's foreground and
/// background notifications. Starts out foregrounded.
#[derive(Debug)]
pub struct TrackedVisibility {
	value: AtomicU8,
}

impl Default for TrackedVisibility {
	fn default() -> Self {
		Self::new(AppVisibility::Foregrounded)
	}
}

impl TrackedVisibility {
	pub fn new(initial: AppVisibility) -> Self {
		Self {
			value: AtomicU8::new(encode(initial)),
		}
	}

	pub fn set(&self, visibility: AppVisibility) {
		self.value.store(encode(visibility), Ordering::SeqCst);
	}

	pub fn get(&self) -> AppVisibility {
		match self.value.load(Ordering::SeqCst) {
			0 => AppVisibility::Foregrounded,
			1 => AppVisibility::Backgrounded,
			_ => AppVisibility::Unknown,
		}
	}
}

fn encode(visibility: AppVisibility) -> u8 {
	match visibility {
		AppVisibility::Foregrounded => 0,
		AppVisibility::Backgrounded => 1,
		AppVisibility::Unknown => 2,
	}
}

#[async_trait]
impl AppVisibilityProvider for TrackedVisibility {
	async fn current(&self) -> AppVisibility {
		self.get()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn defaults_to_foregrounded() {
		assert_eq!(
			TrackedVisibility::default().current().await,
			AppVisibility::Foregrounded
		);
	}

	#[tokio::test]
	async fn follows_updates() {
		let visibility = TrackedVisibility::default();
		visibility.set(AppVisibility::Backgrounded);
		assert_eq!(visibility.current().await, AppVisibility::Backgrounded);
		visibility.set(AppVisibility::Unknown);
		assert_eq!(visibility.get(), AppVisibility::Unknown);
	}
}
