//! Engine lifecycle events
//!
//! The engine reports what it is doing through an optional [`EventSink`]. Nothing in the
//! engine depends on anyone listening: a closed receiver only means events are dropped.

use crate::state::StateDelta;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Default bound of the event channel
pub const DEFAULT_EVENT_BUFFER: usize = 100;

/// How an execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// A terminal node completed
    Completed,
    /// Work ran out before any terminal node completed (every path failed or was pruned)
    Incomplete,
    /// Cancelled before completion
    Cancelled,
}

/// Lifecycle event emitted by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ExecutionEvent {
    NodeStarted {
        node: String,
    },
    NodeFinished {
        node: String,
        delta: StateDelta,
    },
    NodeFailed {
        node: String,
        error: String,
    },
    /// Node will not run in this execution (pruned branch or all predecessors failed)
    NodeSkipped {
        node: String,
    },
    /// Incremental output streamed by a running handler
    Token {
        node: String,
        text: String,
    },
    LoopIteration {
        node: String,
        iteration: u32,
    },
    LoopBudgetExhausted {
        node: String,
        budget: u32,
    },
    CheckpointSaved {
        version: u64,
    },
    CheckpointFailed {
        error: String,
    },
    ExecutionFinished {
        status: ExecutionStatus,
    },
}

impl ExecutionEvent {
    /// Node the event concerns, if any
    pub fn node(&self) -> Option<&str> {
        match self {
            ExecutionEvent::NodeStarted { node }
            | ExecutionEvent::NodeFinished { node, .. }
            | ExecutionEvent::NodeFailed { node, .. }
            | ExecutionEvent::NodeSkipped { node }
            | ExecutionEvent::Token { node, .. }
            | ExecutionEvent::LoopIteration { node, .. }
            | ExecutionEvent::LoopBudgetExhausted { node, .. } => Some(node),
            _ => None,
        }
    }
}

/// Sending half of the engine's event channel
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<ExecutionEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<ExecutionEvent>) -> Self {
        Self { tx }
    }

    /// Bounded channel with a sink on one end
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Send an event, waiting for buffer space. Returns false once the receiver is gone.
    pub async fn emit(&self, event: ExecutionEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
