//! # flowgraph-core - Workflow Orchestration for Analysis Pipelines
//!
//! Executes a directed graph of named async steps over one shared, JSON-shaped state.
//!
//! ## Overview
//!
//! - **State container** - ordered JSON fields with declared merge policies
//!   ([`MergePolicy::Overwrite`], [`MergePolicy::Append`], [`MergePolicy::Merge`])
//! - **Graph compiler** - [`GraphBuilder`] validates a definition into an immutable
//!   [`ExecutionPlan`]: one entry, reachable nodes, a terminal, declared labels mapped
//! - **Execution engine** - parallel fan-out with join barriers, gates that prune branches,
//!   a budgeted self-loop, per-branch failure isolation, retries and timeouts
//! - **Checkpoints** - full state snapshots after barrier nodes through
//!   [`flowgraph_checkpoint`]; failures are logged, never fatal
//! - **Streaming bridge** - progress, status lines and deduplicated text fragments for one
//!   consumer, with a one-shot blocking fallback
//! - **Approximate cache** - embedding-keyed memoization with a similarity threshold
//!
//! ## Quick Start
//!
//! ```rust
//! use flowgraph_core::{
//!     Branches, Engine, ExecutionRequest, GraphBuilder, MergePolicy, Resolver, StateDelta,
//!     StateSchema, END,
//! };
//! use serde_json::json;
//!
//! # async fn example() -> flowgraph_core::Result<()> {
//! let mut graph = GraphBuilder::new();
//! graph
//!     .add_gate("mode")
//!     .add_node("security", |state, _ctx| async move {
//!         let code = state.get_str("code").unwrap_or_default();
//!         let hits: Vec<&str> = ["eval(", "exec("].into_iter().filter(|p| code.contains(p)).collect();
//!         Ok(StateDelta::new().with("findings", json!(hits)))
//!     })
//!     .add_node("style", |state, _ctx| async move {
//!         let long = state.get_str("code").unwrap_or_default().lines().filter(|l| l.len() > 100).count();
//!         Ok(StateDelta::new().with("findings", json!([format!("{} long lines", long)])))
//!     })
//!     .add_node("collector", |state, _ctx| async move {
//!         Ok(StateDelta::new().with("failed", state.branch_failures().len()))
//!     })
//!     .set_entry("mode")
//!     .add_conditional_edges(
//!         "mode",
//!         Resolver::with_labels(["review"], |_| "review".to_string()),
//!         Branches::new().route("review", ["security", "style"]),
//!     )
//!     .add_edge("security", "collector")
//!     .add_edge("style", "collector")
//!     .add_edge("collector", END);
//!
//! let schema = StateSchema::new().with_field("findings", MergePolicy::Append { max_len: None });
//! let engine = Engine::new(graph.compile()?, schema);
//!
//! let outcome = engine
//!     .invoke(ExecutionRequest::new("thread-1", StateDelta::new().with("code", "eval(x)")))
//!     .await?;
//! assert!(outcome.is_complete());
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`state`] - state, deltas, schema and typed keys
//! - [`graph`] / [`builder`] - graph vocabulary and the compiler
//! - [`engine`] - execution, sessions, cancellation
//! - [`events`] - lifecycle events emitted while executing
//! - [`bridge`] - caller-facing stream
//! - [`cache`] - approximate cache and embedders
//! - [`config`] - layered configuration
//! - [`error`] - error taxonomy

pub mod bridge;
pub mod builder;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod node;
pub mod retry;
pub mod state;

pub use bridge::{BridgeConfig, BridgeStream, StreamEvent, StreamingBridge, ThreadMemory};
pub use builder::GraphBuilder;
pub use cache::{ApproximateCache, CacheConfig, CacheHit};
pub use config::FlowConfig;
pub use engine::{Engine, EngineConfig, ExecutionOutcome, ExecutionRequest, SessionPolicy};
pub use error::{CacheError, CompileError, ConfigError, GraphError, NodeError, Result};
pub use events::{EventSink, ExecutionEvent, ExecutionStatus};
pub use graph::{
    Branches, ExecutionPlan, LoopSpec, NodeId, NodeKind, NodePresentation, Resolver, END, START,
};
pub use node::{NodeContext, NodeHandler, NodeResult};
pub use retry::RetryPolicy;
pub use state::{BranchFailure, MergePolicy, State, StateDelta, StateError, StateKey, StateSchema};

pub use flowgraph_checkpoint as checkpoint;
