// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Durable storage for the Loom capture SDK.
//!
//! - [`EventQueueStore`]: the per-(environment, user, session) queue of
//!   messages awaiting upload, with upload-completion bookkeeping. Implemented
//!   by [`SqliteEventQueueStore`] and [`InMemoryEventQueueStore`].
//! - [`StateStore`]: the persisted [`EnvironmentState`] of each environment,
//!   implemented by [`FileStateStore`] and [`InMemoryStateStore`].
//!
//! [`EnvironmentState`]: loom_capture_core::EnvironmentState

pub mod error;
pub mod memory;
pub mod pool;
pub mod queue;
pub mod sqlite;
pub mod state_store;

pub use error::{Result, StoreError};
pub use memory::InMemoryEventQueueStore;
pub use pool::{create_memory_pool, create_pool};
pub use queue::{EventQueueStore, PendingMessage, PruneRequest, UserToUpload};
pub use sqlite::SqliteEventQueueStore;
pub use state_store::{FileStateStore, InMemoryStateStore, StateStore};
