//! Checkpoint record
//!
//! A [`Checkpoint`] is a full snapshot of one session's state taken after a barrier node.
//! Versions are assigned by the store and grow strictly per session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Session identifier used as the checkpoint key
pub type SessionId = String;

/// Persisted snapshot of a session's state
///
/// Serialized as `{session_id, version, state, created_at}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Session the snapshot belongs to
    pub session_id: SessionId,

    /// Monotonic per-session version, starting at 1
    pub version: u64,

    /// Full state snapshot
    pub state: Value,

    /// Time the snapshot was written
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Create a record stamped with the current time
    pub fn new(session_id: impl Into<SessionId>, version: u64, state: Value) -> Self {
        Self {
            session_id: session_id.into(),
            version,
            state,
            created_at: Utc::now(),
        }
    }

    /// Version that the next save for this session must receive
    pub fn next_version(&self) -> u64 {
        self.version + 1
    }
}
