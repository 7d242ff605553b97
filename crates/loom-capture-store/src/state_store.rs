// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Persistence of per-environment state across launches.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, warn};

use loom_capture_core::{EnvironmentId, EnvironmentState};

use crate::error::Result;

/// Loads and saves [`EnvironmentState`].
///
/// Loading never fails: anything unreadable yields a fresh state. Save and
/// delete failures are logged and swallowed; the in-memory state stays
/// authoritative until the next successful save.
#[async_trait]
pub trait StateStore: Send + Sync {
	async fn load(&self, env_id: &EnvironmentId) -> EnvironmentState;
	async fn save(&self, state: &EnvironmentState);
	async fn delete(&self, env_id: &EnvironmentId);
}

/// Stores each environment as `environment-{env_id}.json` in a directory.
#[derive(Debug, Clone)]
pub struct FileStateStore {
	directory: PathBuf,
}

impl FileStateStore {
	pub fn new(directory: impl Into<PathBuf>) -> Self {
		Self {
			directory: directory.into(),
		}
	}

	/// `<local data dir>/loom-capture`, falling back to the temp directory.
	pub fn default_directory() -> PathBuf {
		dirs::data_local_dir()
			.unwrap_or_else(std::env::temp_dir)
			.join("loom-capture")
	}

	pub fn directory(&self) -> &Path {
		&self.directory
	}

	fn path_for(&self, env_id: &EnvironmentId) -> PathBuf {
		self
			.directory
			.join(format!("environment-{}.json", file_component(env_id.as_str())))
	}

	async fn read(&self, env_id: &EnvironmentId) -> Result<Option<EnvironmentState>> {
		let path = self.path_for(env_id);
		let bytes = match tokio::fs::read(&path).await {
			Ok(bytes) => bytes,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(e.into()),
		};
		Ok(Some(serde_json::from_slice(&bytes)?))
	}

	async fn write(&self, state: &EnvironmentState) -> Result<()> {
		tokio::fs::create_dir_all(&self.directory).await?;
		let path = self.path_for(&state.env_id);
		let tmp = path.with_extension("json.tmp");
		tokio::fs::write(&tmp, serde_json::to_vec(state)?).await?;
		tokio::fs::rename(&tmp, &path).await?;
		Ok(())
	}
}

/// Escapes an environment id for use in a file name. ASCII letters, digits
/// and `-` are kept; every other byte becomes `_` plus two hex digits, so
/// distinct ids never share a file.
fn file_component(s: &str) -> String {
	let mut out = String::with_capacity(s.len());
	for c in s.chars() {
		if c.is_ascii_alphanumeric() || c == '-' {
			out.push(c);
			continue;
		}
		let mut buf = [0u8; 4];
		for byte in c.encode_utf8(&mut buf).bytes() {
			out.push('_');
			out.push_str(&hex::encode_upper([byte]));
		}
	}
	out
}

#[async_trait]
impl StateStore for FileStateStore {
	async fn load(&self, env_id: &EnvironmentId) -> EnvironmentState {
		match self.read(env_id).await {
			Ok(Some(state)) if &state.env_id != env_id => {
				warn!(env_id = %env_id, found = %state.env_id, "environment state belongs to another environment, starting fresh");
				EnvironmentState::new(env_id.clone())
			}
			Ok(Some(state)) if state.user_id.is_none() => {
				debug!(env_id = %env_id, "environment state has no user, starting fresh");
				EnvironmentState::new(env_id.clone())
			}
			Ok(Some(state)) => state,
			Ok(None) => EnvironmentState::new(env_id.clone()),
			Err(e) => {
				warn!(env_id = %env_id, error = %e, "failed to load environment state, starting fresh");
				EnvironmentState::new(env_id.clone())
			}
		}
	}

	async fn save(&self, state: &EnvironmentState) {
		if let Err(e) = self.write(state).await {
			warn!(env_id = %state.env_id, error = %e, "failed to save environment state");
		}
	}

	async fn delete(&self, env_id: &EnvironmentId) {
		match tokio::fs::remove_file(self.path_for(env_id)).await {
			Ok(()) => {}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
			Err(e) => warn!(env_id = %env_id, error = %e, "failed to delete environment state"),
		}
	}
}

/// A [`StateStore`] that forgets everything when dropped.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
	states: Mutex<HashMap<EnvironmentId, EnvironmentState>>,
}

impl InMemoryStateStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl StateStore for InMemoryStateStore {
	async fn load(&self, env_id: &EnvironmentId) -> EnvironmentState {
		self
			.states
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.get(env_id)
			.cloned()
			.unwrap_or_else(|| EnvironmentState::new(env_id.clone()))
	}

	async fn save(&self, state: &EnvironmentState) {
		self
			.states
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.insert(state.env_id.clone(), state.clone());
	}

	async fn delete(&self, env_id: &EnvironmentId) {
		self
			.states
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(env_id);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use loom_capture_core::UserId;

	fn identified_state(env: &str) -> EnvironmentState {
		let mut state = EnvironmentState::new(EnvironmentId::new(env));
		state.user_id = Some(UserId::new());
		state.identity = Some("alice".to_string());
		state
			.properties
			.insert("plan".to_string(), "pro".to_string());
		state
	}

	#[tokio::test]
	async fn test_missing_file_loads_fresh_state() {
		let dir = tempfile::tempdir().unwrap();
		let store = FileStateStore::new(dir.path());
		let env_id = EnvironmentId::new("env1");
		assert_eq!(store.load(&env_id).await, EnvironmentState::new(env_id));
	}

	#[tokio::test]
	async fn test_save_then_load() {
		let dir = tempfile::tempdir().unwrap();
		let store = FileStateStore::new(dir.path().join("nested"));
		let state = identified_state("env1");

		store.save(&state).await;
		assert_eq!(store.load(&state.env_id).await, state);
		assert!(dir.path().join("nested/environment-env1.json").exists());
	}

	#[tokio::test]
	async fn test_corrupt_file_loads_fresh_state() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("environment-env1.json"), b"{not json").unwrap();

		let store = FileStateStore::new(dir.path());
		let env_id = EnvironmentId::new("env1");
		assert_eq!(store.load(&env_id).await, EnvironmentState::new(env_id));
	}

	#[tokio::test]
	async fn test_mismatched_environment_loads_fresh_state() {
		let dir = tempfile::tempdir().unwrap();
		let other = identified_state("env2");
		std::fs::write(
			dir.path().join("environment-env1.json"),
			serde_json::to_vec(&other).unwrap(),
		)
		.unwrap();

		let store = FileStateStore::new(dir.path());
		let env_id = EnvironmentId::new("env1");
		assert_eq!(store.load(&env_id).await, EnvironmentState::new(env_id));
	}

	#[tokio::test]
	async fn test_state_without_user_loads_fresh_state() {
		let dir = tempfile::tempdir().unwrap();
		let store = FileStateStore::new(dir.path());
		let mut state = identified_state("env1");
		state.user_id = None;
		store.save(&state).await;

		assert_eq!(
			store.load(&state.env_id).await,
			EnvironmentState::new(state.env_id.clone())
		);
	}

	#[tokio::test]
	async fn test_delete_removes_state() {
		let dir = tempfile::tempdir().unwrap();
		let store = FileStateStore::new(dir.path());
		let state = identified_state("env1");
		store.save(&state).await;
		store.delete(&state.env_id).await;
		store.delete(&state.env_id).await;

		assert_eq!(
			store.load(&state.env_id).await,
			EnvironmentState::new(state.env_id.clone())
		);
	}

	#[tokio::test]
	async fn test_env_ids_are_safe_file_names() {
		let dir = tempfile::tempdir().unwrap();
		let store = FileStateStore::new(dir.path());
		let state = identified_state("../escape");
		store.save(&state).await;

		assert!(dir.path().join("environment-_2E_2E_2Fescape.json").exists());
		assert_eq!(store.load(&state.env_id).await, state);
	}

	#[tokio::test]
	async fn test_similar_env_ids_do_not_share_a_file() {
		let dir = tempfile::tempdir().unwrap();
		let store = FileStateStore::new(dir.path());
		let slash = identified_state("a/b");
		let mut underscore = identified_state("a_b");
		underscore.identity = Some("bob".to_string());
		store.save(&slash).await;
		store.save(&underscore).await;

		assert_eq!(store.load(&slash.env_id).await, slash);
		assert_eq!(store.load(&underscore.env_id).await, underscore);
		assert_ne!(file_component("a/b"), file_component("a_b"));
		assert_eq!(file_component("env-1"), "env-1");
		assert_eq!(file_component("é"), "_C3_A9");
	}

	#[tokio::test]
	async fn test_in_memory_store_round_trip() {
		let store = InMemoryStateStore::new();
		let state = identified_state("env1");
		store.save(&state).await;
		assert_eq!(store.load(&state.env_id).await, state);
		store.delete(&state.env_id).await;
		assert!(store.load(&state.env_id).await.user_id.is_none());
	}
}
