//! Execution engine
//!
//! [`Engine`] runs a compiled [`ExecutionPlan`] for one session at a time. It resolves the
//! initial state (optionally resuming from the session's latest checkpoint), hands the run
//! to the scheduler and reports an [`ExecutionOutcome`].
//!
//! ```rust
//! use flowgraph_core::{Engine, ExecutionRequest, GraphBuilder, StateDelta, StateSchema, END};
//!
//! # async fn example() -> flowgraph_core::Result<()> {
//! let mut graph = GraphBuilder::new();
//! graph
//!     .add_node("measure", |state, _ctx| async move {
//!         let code = state.get_str("code").unwrap_or_default().to_string();
//!         Ok(StateDelta::new().with("lines", code.lines().count()))
//!     })
//!     .set_entry("measure")
//!     .add_edge("measure", END);
//!
//! let engine = Engine::new(graph.compile()?, StateSchema::new());
//! let outcome = engine
//!     .invoke(ExecutionRequest::new("s1", StateDelta::new().with("code", "a\nb")))
//!     .await?;
//! assert_eq!(outcome.state.get_raw("lines"), Some(&serde_json::json!(2)));
//! # Ok(())
//! # }
//! ```

mod scheduler;
mod session;

pub use session::SessionPolicy;

use crate::cache::ApproximateCache;
use crate::error::{GraphError, Result};
use crate::events::{EventSink, ExecutionEvent, ExecutionStatus, DEFAULT_EVENT_BUFFER};
use crate::graph::ExecutionPlan;
use crate::state::{BranchFailure, State, StateDelta, StateSchema};
use flowgraph_checkpoint::CheckpointStore;
use scheduler::Scheduler;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use session::SessionLocks;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Engine tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on node invocations per execution
    pub max_steps: usize,

    /// Per-attempt handler timeout; none when unset
    pub node_timeout_ms: Option<u64>,

    pub session_policy: SessionPolicy,

    /// Capacity of the event channel created by streaming callers
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: 64,
            node_timeout_ms: None,
            session_policy: SessionPolicy::Queue,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl EngineConfig {
    pub fn node_timeout(&self) -> Option<Duration> {
        self.node_timeout_ms.map(Duration::from_millis)
    }
}

/// One submission to the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub session_id: String,

    /// Fields merged into the starting state
    pub input: StateDelta,

    /// Start from the session's latest checkpoint when one exists
    #[serde(default)]
    pub resume: bool,
}

impl ExecutionRequest {
    pub fn new(session_id: impl Into<String>, input: StateDelta) -> Self {
        Self {
            session_id: session_id.into(),
            input,
            resume: false,
        }
    }

    pub fn resume(mut self) -> Self {
        self.resume = true;
        self
    }
}

/// Result of a finished execution
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub state: State,
    pub status: ExecutionStatus,
    /// Branches that failed, in failure order
    pub failures: Vec<BranchFailure>,
    /// Version written by the last successful checkpoint
    pub checkpoint_version: Option<u64>,
    pub checkpoint_writes: usize,
    /// Node invocations, gates included
    pub steps: usize,
}

impl ExecutionOutcome {
    pub fn is_complete(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    pub fn output(&self, field: &str) -> Option<&Value> {
        self.state.get_raw(field)
    }
}

/// Runs a compiled plan
#[derive(Clone)]
pub struct Engine {
    plan: Arc<ExecutionPlan>,
    schema: Arc<StateSchema>,
    store: Option<Arc<dyn CheckpointStore>>,
    cache: Option<Arc<ApproximateCache>>,
    config: EngineConfig,
    sessions: Arc<SessionLocks>,
}

impl Engine {
    pub fn new(plan: ExecutionPlan, schema: StateSchema) -> Self {
        Self {
            plan: Arc::new(plan),
            schema: Arc::new(schema),
            store: None,
            cache: None,
            config: EngineConfig::default(),
            sessions: Arc::new(SessionLocks::new()),
        }
    }

    /// Persist state after every barrier node
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Cache handed to handlers through [`NodeContext::cache`](crate::node::NodeContext::cache)
    pub fn with_cache(mut self, cache: Arc<ApproximateCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn checkpoint_store(&self) -> Option<&Arc<dyn CheckpointStore>> {
        self.store.as_ref()
    }

    /// Run to completion without streaming
    pub async fn invoke(&self, request: ExecutionRequest) -> Result<ExecutionOutcome> {
        self.execute(request, None, CancellationToken::new()).await
    }

    /// Run, reporting lifecycle events to `events`
    ///
    /// Waits (or fails with [`GraphError::SessionBusy`], per [`SessionPolicy`]) while another
    /// execution holds the same session. Cancelling `cancel` stops new nodes from starting;
    /// handlers already running finish and their results are merged.
    #[tracing::instrument(skip_all, fields(session_id = %request.session_id, resume = request.resume))]
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        events: Option<EventSink>,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome> {
        if cancel.is_cancelled() {
            return Err(GraphError::Cancelled);
        }

        let _guard = tokio::select! {
            guard = self.sessions.acquire(&request.session_id, self.config.session_policy) => guard?,
            _ = cancel.cancelled() => return Err(GraphError::Cancelled),
        };

        let mut state = self.initial_state(&request).await;
        self.schema.apply(&mut state, &request.input)?;

        let summary = Scheduler::new(
            Arc::clone(&self.plan),
            Arc::clone(&self.schema),
            self.config.clone(),
            self.store.clone(),
            self.cache.clone(),
            events.clone(),
            cancel,
            &request.session_id,
            state,
        )
        .run()
        .await?;

        info!(
            status = ?summary.status,
            steps = summary.steps,
            failures = summary.failures.len(),
            checkpoints = summary.checkpoint_writes,
            "Execution finished"
        );
        if let Some(events) = &events {
            events
                .emit(ExecutionEvent::ExecutionFinished {
                    status: summary.status,
                })
                .await;
        }

        Ok(ExecutionOutcome {
            state: summary.state,
            status: summary.status,
            failures: summary.failures,
            checkpoint_version: summary.checkpoint_version,
            checkpoint_writes: summary.checkpoint_writes,
            steps: summary.steps,
        })
    }

    /// Checkpointed state when resuming, else empty. Read failures start fresh.
    async fn initial_state(&self, request: &ExecutionRequest) -> State {
        let Some(store) = self.store.as_ref().filter(|_| request.resume) else {
            return State::new();
        };

        let checkpoint = match store.load_optional(&request.session_id).await {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => return State::new(),
            Err(err) => {
                warn!(error = %err, backend = store.backend(), "Checkpoint load failed, starting fresh");
                return State::new();
            }
        };

        match State::from_value(checkpoint.state) {
            Ok(mut state) => {
                state.clear_engine_fields();
                info!(version = checkpoint.version, "Resuming from checkpoint");
                state
            }
            Err(err) => {
                warn!(error = %err, "Checkpoint state unreadable, starting fresh");
                State::new()
            }
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("entry", &self.plan.entry())
            .field("nodes", &self.plan.node_ids().len())
            .field("checkpoints", &self.store.as_ref().map(|s| s.backend()))
            .field("cache", &self.cache.is_some())
            .field("config", &self.config)
            .finish()
    }
}
