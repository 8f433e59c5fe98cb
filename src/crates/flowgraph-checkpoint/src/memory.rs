//! In-memory checkpoint storage
//!
//! [`InMemoryCheckpointStore`] is the last tier of the fallback chain: always available,
//! never durable. It keeps the latest and the previous snapshot of each session.
//!
//! ```text
//! Arc<RwLock<HashMap>>
//!   "session-1" -> [v2, v3]   (previous, latest)
//!   "session-2" -> [v1]
//! ```

use crate::checkpoint::Checkpoint;
use crate::error::{CheckpointError, Result};
use crate::traits::CheckpointStore;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

const RETAINED_VERSIONS: usize = 2;

/// Non-durable store backed by a shared map
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    storage: Arc<RwLock<HashMap<String, Vec<Checkpoint>>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions with at least one snapshot
    pub async fn session_count(&self) -> usize {
        self.storage.read().await.len()
    }

    /// Snapshots currently retained for a session (at most two)
    pub async fn retained(&self, session_id: &str) -> Vec<Checkpoint> {
        self.storage
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop everything
    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, session_id: &str, state: &Value) -> Result<u64> {
        // Version assignment and insertion happen under one write guard.
        let mut storage = self.storage.write().await;
        let entries = storage.entry(session_id.to_string()).or_default();

        let version = entries.last().map(Checkpoint::next_version).unwrap_or(1);
        entries.push(Checkpoint::new(session_id, version, state.clone()));

        if entries.len() > RETAINED_VERSIONS {
            let excess = entries.len() - RETAINED_VERSIONS;
            entries.drain(..excess);
        }

        Ok(version)
    }

    async fn load(&self, session_id: &str) -> Result<Checkpoint> {
        self.storage
            .read()
            .await
            .get(session_id)
            .and_then(|entries| entries.last().cloned())
            .ok_or_else(|| CheckpointError::NotFound(session_id.to_string()))
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        self.storage.write().await.remove(session_id);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
