//! Error types for graph construction and execution
//!
//! Errors fall into two groups. [`CompileError`] and the fail-fast variants of
//! [`GraphError`] stop a request before or during execution. Everything else degrades:
//! a [`NodeError`] isolates one branch, checkpoint and cache failures are logged, and a
//! broken event stream triggers the bridge's blocking fallback.
//!
//! # Error Hierarchy
//!
//! ```text
//! GraphError
//! ├── Compile            - bad graph definition (fatal, before execution)
//! ├── UnmappedLabel      - resolver returned an undeclared label (fatal, fail fast)
//! ├── State              - delta rejected by the state schema
//! ├── StepLimit          - more node invocations than `max_steps`
//! ├── SessionBusy        - session already executing and policy is Reject
//! ├── Cancelled          - execution cancelled before it could start
//! ├── StreamInterrupted  - event stream closed or failed mid-execution
//! ├── Checkpoint         - checkpoint read failure surfaced to a caller
//! ├── Serialization      - JSON errors
//! ├── Configuration      - invalid configuration
//! └── Internal           - worker task panicked or was aborted
//!
//! CacheError   - embedding failures, always degraded to a cache miss
//! ConfigError  - unreadable file, bad TOML, bad environment value
//! ```
//!
//! # Matching on severity
//!
//! ```rust
//! use flowgraph_core::error::GraphError;
//!
//! fn report(err: &GraphError) {
//!     if err.is_fatal() {
//!         eprintln!("request rejected: {}", err);
//!     } else {
//!         eprintln!("degraded: {}", err);
//!     }
//! }
//! ```

use crate::state::StateError;
use flowgraph_checkpoint::CheckpointError;
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors raised while compiling a graph definition into an execution plan
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("Graph has no nodes")]
    EmptyGraph,

    #[error("No entry node set")]
    MissingEntry,

    #[error("Entry node '{0}' is not defined")]
    UnknownEntry(String),

    #[error("More than one entry node: {0:?}")]
    MultipleEntries(Vec<String>),

    #[error("Node '{0}' is defined more than once")]
    DuplicateNode(String),

    #[error("Edge {from} -> {to} references undefined node '{missing}'")]
    UnknownNode {
        from: String,
        to: String,
        missing: String,
    },

    #[error("Resolver on '{node}' declares labels with no destination: {labels:?}")]
    UnmappedLabels { node: String, labels: Vec<String> },

    #[error("Node '{0}' has both direct edges and a conditional resolver")]
    MixedEdges(String),

    #[error("Node '{0}' has more than one conditional resolver")]
    DuplicateResolver(String),

    #[error("Gate '{0}' has no conditional resolver")]
    GateWithoutResolver(String),

    #[error("Nodes unreachable from entry: {0:?}")]
    UnreachableNodes(Vec<String>),

    #[error("No path from entry reaches a terminal node")]
    NoTerminal,

    #[error("Cycle through '{0}' has no iteration budget")]
    UnboundedCycle(String),

    #[error("Invalid loop on '{node}': {reason}")]
    InvalidLoop { node: String, reason: String },
}

/// Failure returned by a node handler
///
/// A `NodeError` aborts only the branch that produced it.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("{0}")]
    Failed(String),

    #[error("handler exceeded {0} ms")]
    Timeout(u64),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl NodeError {
    /// Build a plain failure message
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Engine-level errors
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Graph compilation failed: {0}")]
    Compile(#[from] CompileError),

    #[error("Resolver on '{node}' returned label '{label}' with no mapped destination (declared: {declared:?})")]
    UnmappedLabel {
        node: String,
        label: String,
        declared: Vec<String>,
    },

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Execution exceeded {0} node invocations")]
    StepLimit(usize),

    #[error("Session '{0}' already has an execution in flight")]
    SessionBusy(String),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Event stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure inside the approximate cache
///
/// Never returned by [`ApproximateCache`](crate::cache::ApproximateCache) lookups: the cache
/// logs it and reports a miss. Embedders return it so fallbacks can react.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("remote embedding service error: {0}")]
    Remote(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        CacheError::Remote(err.to_string())
    }
}

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {var}: {value}")]
    Env { var: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for GraphError {
    fn from(err: ConfigError) -> Self {
        GraphError::Configuration(err.to_string())
    }
}

impl GraphError {
    /// Errors that must reach the caller instead of being degraded around
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GraphError::Compile(_) | GraphError::UnmappedLabel { .. } | GraphError::Configuration(_)
        )
    }

    pub fn unmapped_label(
        node: impl Into<String>,
        label: impl Into<String>,
        declared: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        GraphError::UnmappedLabel {
            node: node.into(),
            label: label.into(),
            declared: declared.into_iter().map(Into::into).collect(),
        }
    }
}
