//! Storage trait implemented by every checkpoint backend
//!
//! The engine only ever talks to `Arc<dyn CheckpointStore>`; which backend sits behind it
//! is decided once at startup by [`select_store`](crate::select_store).
//!
//! # Contract
//!
//! - [`save`](CheckpointStore::save) returns the version it assigned. A second save for the
//!   same session returns a strictly larger version.
//! - A save replaces the previous record atomically. A reader never observes a partially
//!   written record, and a failed save leaves the previous version readable.
//! - [`load`](CheckpointStore::load) returns the latest version or
//!   [`CheckpointError::NotFound`](crate::CheckpointError::NotFound).
//!
//! # Implementing a backend
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use flowgraph_checkpoint::{Checkpoint, CheckpointStore, Result};
//! use serde_json::Value;
//!
//! struct SqlStore { /* pool */ }
//!
//! #[async_trait]
//! impl CheckpointStore for SqlStore {
//!     async fn save(&self, session_id: &str, state: &Value) -> Result<u64> {
//!         // BEGIN; SELECT max(version) ... FOR UPDATE; INSERT ...; COMMIT
//!         todo!()
//!     }
//!
//!     async fn load(&self, session_id: &str) -> Result<Checkpoint> {
//!         todo!()
//!     }
//!
//!     async fn delete(&self, session_id: &str) -> Result<()> {
//!         todo!()
//!     }
//!
//!     fn backend(&self) -> &'static str {
//!         "sql"
//!     }
//! }
//! ```

use crate::checkpoint::Checkpoint;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Pluggable persistence for session snapshots
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist `state` as the newest snapshot of `session_id` and return its version
    async fn save(&self, session_id: &str, state: &Value) -> Result<u64>;

    /// Load the newest snapshot of `session_id`
    async fn load(&self, session_id: &str) -> Result<Checkpoint>;

    /// Remove every snapshot of `session_id`. Deleting an unknown session is not an error.
    async fn delete(&self, session_id: &str) -> Result<()>;

    /// Check that the backend is usable. Used by backend selection.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Short backend name for logs
    fn backend(&self) -> &'static str;

    /// Load the newest snapshot, mapping "not found" to `None`
    async fn load_optional(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        match self.load(session_id).await {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
