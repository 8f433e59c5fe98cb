//! Backend selection with graceful degradation
//!
//! Tiers are tried in order: networked (Redis) → embedded file → in-memory. A tier that is
//! not configured, not compiled in, fails to connect or fails its ping is skipped with a
//! warning. The memory tier cannot fail, so selection always yields a store.

use crate::error::Result;
use crate::file::FileCheckpointStore;
use crate::memory::InMemoryCheckpointStore;
use crate::traits::CheckpointStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Where checkpoints should go, in order of preference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointBackendConfig {
    /// Redis connection URL for the networked tier
    pub redis_url: Option<String>,

    /// Key prefix for the networked tier
    pub namespace: String,

    /// Optional expiry for networked records
    pub ttl_seconds: Option<u64>,

    /// Directory for the file tier
    pub file_dir: Option<PathBuf>,

    /// Upper bound on connecting to and pinging one tier
    pub connect_timeout_ms: u64,
}

impl Default for CheckpointBackendConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            namespace: "flowgraph".to_string(),
            ttl_seconds: None,
            file_dir: None,
            connect_timeout_ms: 2_000,
        }
    }
}

/// Which tier ended up serving checkpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreTier {
    Networked,
    File,
    Memory,
}

impl fmt::Display for StoreTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreTier::Networked => write!(f, "networked"),
            StoreTier::File => write!(f, "file"),
            StoreTier::Memory => write!(f, "memory"),
        }
    }
}

/// Result of backend selection
#[derive(Clone)]
pub struct SelectedStore {
    pub store: Arc<dyn CheckpointStore>,
    pub tier: StoreTier,
}

impl fmt::Debug for SelectedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectedStore")
            .field("backend", &self.store.backend())
            .field("tier", &self.tier)
            .finish()
    }
}

/// Pick the most preferred usable backend for `config`
pub async fn select_store(config: &CheckpointBackendConfig) -> SelectedStore {
    let timeout = Duration::from_millis(config.connect_timeout_ms);
    let mut candidates: Vec<(StoreTier, Arc<dyn CheckpointStore>)> = Vec::new();

    if let Some(url) = &config.redis_url {
        match tokio::time::timeout(timeout, connect_networked(url, config)).await {
            Ok(Ok(store)) => candidates.push((StoreTier::Networked, store)),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Networked checkpoint tier unavailable, falling back")
            }
            Err(_) => tracing::warn!(
                timeout_ms = config.connect_timeout_ms,
                "Networked checkpoint tier timed out, falling back"
            ),
        }
    }

    if let Some(dir) = &config.file_dir {
        candidates.push((StoreTier::File, Arc::new(FileCheckpointStore::new(dir.clone()))));
    }

    first_available(candidates, timeout).await
}

/// Return the first candidate whose ping succeeds within `timeout`, or an in-memory store
pub async fn first_available(
    candidates: Vec<(StoreTier, Arc<dyn CheckpointStore>)>,
    timeout: Duration,
) -> SelectedStore {
    for (tier, store) in candidates {
        match tokio::time::timeout(timeout, store.ping()).await {
            Ok(Ok(())) => {
                tracing::info!(tier = %tier, backend = store.backend(), "Checkpoint store selected");
                return SelectedStore { store, tier };
            }
            Ok(Err(e)) => tracing::warn!(
                tier = %tier,
                backend = store.backend(),
                error = %e,
                "Checkpoint tier failed health check, falling back"
            ),
            Err(_) => tracing::warn!(
                tier = %tier,
                backend = store.backend(),
                "Checkpoint tier health check timed out, falling back"
            ),
        }
    }

    tracing::info!("Using non-durable in-memory checkpoint store");
    SelectedStore {
        store: Arc::new(InMemoryCheckpointStore::new()),
        tier: StoreTier::Memory,
    }
}

#[cfg(feature = "redis")]
async fn connect_networked(
    url: &str,
    config: &CheckpointBackendConfig,
) -> Result<Arc<dyn CheckpointStore>> {
    let store = crate::redis_store::RedisCheckpointStore::connect_with_ttl(
        url,
        config.namespace.clone(),
        config.ttl_seconds,
    )
    .await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn connect_networked(
    _url: &str,
    _config: &CheckpointBackendConfig,
) -> Result<Arc<dyn CheckpointStore>> {
    Err(crate::error::CheckpointError::Unavailable(
        "built without the `redis` feature".to_string(),
    ))
}
