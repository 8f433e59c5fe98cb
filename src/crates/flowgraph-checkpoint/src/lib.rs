//! # flowgraph-checkpoint
//!
//! Session checkpoints for the flowgraph execution engine.
//!
//! The engine persists a full snapshot of a session's state right after every barrier
//! node completes. This crate defines the record, the storage trait and three backends,
//! plus the selection logic that degrades from the preferred backend to the next one when
//! a tier is unavailable.
//!
//! ## Backends
//!
//! | Tier | Type | Durable | Notes |
//! |------|------|---------|-------|
//! | networked | [`RedisCheckpointStore`] | yes | cargo feature `redis` |
//! | file | [`FileCheckpointStore`] | yes | temp file + rename |
//! | memory | [`InMemoryCheckpointStore`] | no | always available |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flowgraph_checkpoint::{select_store, CheckpointBackendConfig};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CheckpointBackendConfig {
//!     file_dir: Some("./checkpoints".into()),
//!     ..Default::default()
//! };
//! let selected = select_store(&config).await;
//!
//! let version = selected.store.save("thread-1", &json!({"final_report": "..."})).await?;
//! let latest = selected.store.load("thread-1").await?;
//! assert_eq!(latest.version, version);
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod error;
pub mod file;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod select;
pub mod traits;

pub use checkpoint::{Checkpoint, SessionId};
pub use error::{CheckpointError, Result};
pub use file::FileCheckpointStore;
pub use memory::InMemoryCheckpointStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisCheckpointStore;
pub use select::{first_available, select_store, CheckpointBackendConfig, SelectedStore, StoreTier};
pub use traits::CheckpointStore;
