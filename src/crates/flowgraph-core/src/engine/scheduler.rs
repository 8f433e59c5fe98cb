//! Single-execution scheduler
//!
//! The scheduler owns the [`State`] for one execution. Handlers run as tokio tasks in a
//! [`JoinSet`] against a snapshot and hand back a delta; only the scheduler merges.
//!
//! Join bookkeeping: every node with forward predecessors keeps the set still unresolved.
//! A predecessor resolves as *arrived* (it completed and routed here) or *never arrives*
//! (pruned by a resolver, failed, or skipped itself). A node becomes ready once nothing is
//! unresolved and at least one predecessor arrived; if none arrived it is skipped and its
//! own successors learn they will never be reached from it.

use super::EngineConfig;
use crate::cache::ApproximateCache;
use crate::error::{GraphError, NodeError, Result};
use crate::events::{EventSink, ExecutionEvent, ExecutionStatus};
use crate::graph::{ExecutionPlan, NodeId, NodeKind, END};
use crate::node::{NodeContext, NodeHandler, NodeResult};
use crate::retry::RetryPolicy;
use crate::state::{
    BranchFailure, State, StateDelta, StateSchema, BRANCH_FAILURES, LOOP_ITERATIONS, PRUNED_NODES,
};
use flowgraph_checkpoint::CheckpointStore;
use futures::FutureExt;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeStatus {
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

#[derive(Debug)]
struct JoinTracker {
    remaining: BTreeSet<NodeId>,
    arrived: bool,
}

impl JoinTracker {
    fn new(predecessors: &BTreeSet<NodeId>) -> Self {
        Self {
            remaining: predecessors.clone(),
            arrived: false,
        }
    }
}

/// (from, to, arrived)
type Resolution = (NodeId, NodeId, bool);

pub(crate) struct Summary {
    pub state: State,
    pub status: ExecutionStatus,
    pub failures: Vec<BranchFailure>,
    pub checkpoint_version: Option<u64>,
    pub checkpoint_writes: usize,
    pub steps: usize,
}

pub(crate) struct Scheduler {
    plan: Arc<ExecutionPlan>,
    schema: Arc<StateSchema>,
    config: EngineConfig,
    store: Option<Arc<dyn CheckpointStore>>,
    cache: Option<Arc<ApproximateCache>>,
    events: Option<EventSink>,
    cancel: CancellationToken,
    session_id: Arc<str>,

    state: State,
    status: HashMap<NodeId, NodeStatus>,
    trackers: HashMap<NodeId, JoinTracker>,
    deferred: HashMap<NodeId, Vec<NodeId>>,
    ready: VecDeque<NodeId>,
    running: JoinSet<(NodeId, NodeResult)>,

    steps: usize,
    failures: Vec<BranchFailure>,
    checkpoint_version: Option<u64>,
    checkpoint_writes: usize,
    checkpointed_revision: Option<u64>,
    terminal_reached: bool,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        plan: Arc<ExecutionPlan>,
        schema: Arc<StateSchema>,
        config: EngineConfig,
        store: Option<Arc<dyn CheckpointStore>>,
        cache: Option<Arc<ApproximateCache>>,
        events: Option<EventSink>,
        cancel: CancellationToken,
        session_id: &str,
        state: State,
    ) -> Self {
        let status = plan
            .node_ids()
            .iter()
            .map(|id| (id.clone(), NodeStatus::Pending))
            .collect();
        let trackers = plan
            .node_ids()
            .iter()
            .filter_map(|id| {
                plan.predecessors(id)
                    .map(|preds| (id.clone(), JoinTracker::new(preds)))
            })
            .collect();

        Self {
            plan,
            schema,
            config,
            store,
            cache,
            events,
            cancel,
            session_id: Arc::from(session_id),
            state,
            status,
            trackers,
            deferred: HashMap::new(),
            ready: VecDeque::new(),
            running: JoinSet::new(),
            steps: 0,
            failures: Vec::new(),
            checkpoint_version: None,
            checkpoint_writes: 0,
            checkpointed_revision: None,
            terminal_reached: false,
        }
    }

    pub(crate) async fn run(mut self) -> Result<Summary> {
        self.ready.push_back(self.plan.entry().to_string());

        loop {
            while let Some(node) = self.ready.pop_front() {
                if self.cancel.is_cancelled() || self.terminal_reached {
                    self.ready.clear();
                    break;
                }
                self.start(node).await?;
            }

            let Some(joined) = self.running.join_next().await else {
                break;
            };
            match joined {
                Ok((node, result)) => self.complete(node, result).await?,
                Err(err) => {
                    return Err(GraphError::Internal(format!("worker task failed: {}", err)));
                }
            }
        }

        let status = if self.cancel.is_cancelled() && !self.terminal_reached {
            ExecutionStatus::Cancelled
        } else if self.terminal_reached {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Incomplete
        };

        if status == ExecutionStatus::Cancelled
            && self.plan.has_barriers()
            && self.checkpointed_revision != Some(self.state.revision())
        {
            info!(session_id = %self.session_id, "Execution cancelled, saving final checkpoint");
            self.checkpoint().await;
        }

        Ok(Summary {
            state: self.state,
            status,
            failures: self.failures,
            checkpoint_version: self.checkpoint_version,
            checkpoint_writes: self.checkpoint_writes,
            steps: self.steps,
        })
    }

    async fn emit(&self, event: ExecutionEvent) {
        if let Some(events) = &self.events {
            events.emit(event).await;
        }
    }

    async fn start(&mut self, node: NodeId) -> Result<()> {
        if self.status.get(&node) != Some(&NodeStatus::Pending) {
            return Ok(());
        }
        let plan = Arc::clone(&self.plan);
        let spec = plan
            .node(&node)
            .ok_or_else(|| GraphError::Internal(format!("node '{}' missing from plan", node)))?;

        self.steps += 1;
        if self.steps > self.config.max_steps {
            warn!(session_id = %self.session_id, max_steps = self.config.max_steps, "Step limit exceeded");
            return Err(GraphError::StepLimit(self.config.max_steps));
        }

        self.status.insert(node.clone(), NodeStatus::Running);
        debug!(node = %node, kind = %spec.kind, "Node started");
        self.emit(ExecutionEvent::NodeStarted { node: node.clone() }).await;

        if spec.kind == NodeKind::Gate {
            self.status.insert(node.clone(), NodeStatus::Done);
            self.emit(ExecutionEvent::NodeFinished {
                node: node.clone(),
                delta: StateDelta::new(),
            })
            .await;
            return self.route(&node).await;
        }

        let ctx = NodeContext::new(
            Arc::clone(&self.session_id),
            Arc::from(node.as_str()),
            self.events.clone(),
            self.cache.clone(),
            self.cancel.clone(),
        );
        let task = run_node(
            spec.handler.clone(),
            self.state.clone(),
            ctx,
            spec.retry.clone(),
            self.config.node_timeout(),
        );
        self.running.spawn(async move { (node, task.await) });
        Ok(())
    }

    async fn complete(&mut self, node: NodeId, result: NodeResult) -> Result<()> {
        let merged = match result {
            Ok(delta) => self
                .schema
                .apply(&mut self.state, &delta)
                .map(|()| delta)
                .map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };

        let delta = match merged {
            Ok(delta) => delta,
            Err(error) => return self.fail(&node, error).await,
        };

        self.status.insert(node.clone(), NodeStatus::Done);
        debug!(node = %node, fields = delta.fields().count(), "Node finished");
        self.emit(ExecutionEvent::NodeFinished {
            node: node.clone(),
            delta,
        })
        .await;

        if self.plan.node(&node).map(|spec| spec.kind) == Some(NodeKind::Barrier) {
            self.checkpoint().await;
        }
        self.route(&node).await
    }

    async fn fail(&mut self, node: &str, error: String) -> Result<()> {
        warn!(session_id = %self.session_id, node, error = %error, "Node failed, branch aborted");
        self.status.insert(node.to_string(), NodeStatus::Failed);

        let failure = BranchFailure {
            node: node.to_string(),
            error: error.clone(),
        };
        let mut delta = StateDelta::new();
        delta.put(&BRANCH_FAILURES, &vec![failure.clone()])?;
        self.schema.apply_unchecked(&mut self.state, &delta)?;
        self.failures.push(failure);

        self.emit(ExecutionEvent::NodeFailed {
            node: node.to_string(),
            error,
        })
        .await;

        let queue = self
            .plan
            .successors(node)
            .into_iter()
            .map(|to| (node.to_string(), to, false))
            .collect();
        self.propagate(queue).await
    }

    /// Evaluate outgoing edges of a finished node
    async fn route(&mut self, node: &str) -> Result<()> {
        let plan = Arc::clone(&self.plan);
        let successors = plan.successors(node);

        let (activated, pruned) = match plan.conditional(node) {
            None => (successors.clone(), Vec::new()),
            Some(edge) => {
                let mut label = edge.resolver.resolve(&self.state);
                if edge.branches.targets(&label).is_none() {
                    return Err(GraphError::unmapped_label(
                        node,
                        label,
                        edge.branches.labels().cloned(),
                    ));
                }

                let loop_info = plan.loop_info(node);
                if let Some(info) = loop_info {
                    let budget = info.spec.max_iterations;
                    if label == info.spec.loop_label && self.state.loop_iterations(node) >= budget {
                        info!(node, budget, "Loop budget exhausted, forcing exit branch");
                        self.emit(ExecutionEvent::LoopBudgetExhausted {
                            node: node.to_string(),
                            budget,
                        })
                        .await;
                        label = info.spec.exit_label.clone();
                    }
                }
                debug!(node, label = %label, "Resolver selected branch");

                let activated = edge
                    .branches
                    .targets(&label)
                    .map(<[NodeId]>::to_vec)
                    .unwrap_or_default();

                let mut pruned = Vec::new();
                let mut deferred = Vec::new();
                for target in edge.branches.all_targets() {
                    if activated.contains(&target) {
                        continue;
                    }
                    match loop_info {
                        Some(info) if target == node || info.body.contains(&target) => {}
                        Some(info) if label == info.spec.loop_label => deferred.push(target),
                        _ => pruned.push(target),
                    }
                }
                if !deferred.is_empty() {
                    self.deferred.insert(node.to_string(), deferred);
                }
                (activated, pruned)
            }
        };

        if successors.is_empty() || activated.iter().any(|target| target == END) {
            info!(session_id = %self.session_id, node, "Terminal node completed");
            self.terminal_reached = true;
        }

        let queue = activated
            .into_iter()
            .map(|to| (node.to_string(), to, true))
            .chain(pruned.into_iter().map(|to| (node.to_string(), to, false)))
            .collect();
        self.propagate(queue).await
    }

    async fn propagate(&mut self, mut queue: VecDeque<Resolution>) -> Result<()> {
        let plan = Arc::clone(&self.plan);
        let mut skipped = Vec::new();

        while let Some((from, to, arrived)) = queue.pop_front() {
            if to == END {
                continue;
            }

            if plan.is_back_edge(&from, &to) {
                if arrived {
                    self.loop_back(&to).await?;
                } else if let Some(targets) = self.deferred.remove(&to) {
                    queue.extend(targets.into_iter().map(|target| (to.clone(), target, false)));
                }
                continue;
            }

            let Some(tracker) = self.trackers.get_mut(&to) else {
                continue;
            };
            if !tracker.remaining.remove(&from) {
                continue;
            }
            tracker.arrived |= arrived;
            if !tracker.remaining.is_empty() {
                continue;
            }

            if tracker.arrived {
                self.ready.push_back(to);
            } else if self.status.get(&to) == Some(&NodeStatus::Pending) {
                self.status.insert(to.clone(), NodeStatus::Skipped);
                debug!(node = %to, "Node skipped");
                self.emit(ExecutionEvent::NodeSkipped { node: to.clone() }).await;
                queue.extend(
                    plan.successors(&to)
                        .into_iter()
                        .map(|next| (to.clone(), next, false)),
                );
                skipped.push(to);
            }
        }

        if !skipped.is_empty() {
            let mut delta = StateDelta::new();
            delta.put(&PRUNED_NODES, &skipped)?;
            self.schema.apply_unchecked(&mut self.state, &delta)?;
        }
        Ok(())
    }

    /// Body routed back into `head`: count the iteration and rearm the loop
    async fn loop_back(&mut self, head: &str) -> Result<()> {
        let plan = Arc::clone(&self.plan);
        let Some(info) = plan.loop_info(head) else {
            return Ok(());
        };

        let iteration = self.state.loop_iterations(head) + 1;
        let mut delta = StateDelta::new();
        delta.put(
            &LOOP_ITERATIONS,
            &BTreeMap::from([(head.to_string(), iteration)]),
        )?;
        self.schema.apply_unchecked(&mut self.state, &delta)?;

        debug!(node = head, iteration, budget = info.spec.max_iterations, "Loop iteration");
        self.emit(ExecutionEvent::LoopIteration {
            node: head.to_string(),
            iteration,
        })
        .await;

        self.deferred.remove(head);
        for node in &info.body {
            self.status.insert(node.clone(), NodeStatus::Pending);
            if let Some(preds) = plan.predecessors(node) {
                self.trackers.insert(node.clone(), JoinTracker::new(preds));
            }
        }
        self.status.insert(head.to_string(), NodeStatus::Pending);
        self.ready.push_back(head.to_string());
        Ok(())
    }

    /// Best-effort save; failures are logged and reported as events only
    async fn checkpoint(&mut self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let session_id = self.session_id.to_string();
        let snapshot = self.state.to_value();
        let revision = self.state.revision();

        // Own task: dropping the execution does not abort a write already in progress.
        let write = tokio::spawn(async move { store.save(&session_id, &snapshot).await });

        let error = match write.await {
            Ok(Ok(version)) => {
                info!(session_id = %self.session_id, version, "Checkpoint saved");
                self.checkpoint_version = Some(version);
                self.checkpoint_writes += 1;
                self.checkpointed_revision = Some(revision);
                self.emit(ExecutionEvent::CheckpointSaved { version }).await;
                return;
            }
            Ok(Err(err)) => err.to_string(),
            Err(err) => format!("checkpoint task failed: {}", err),
        };

        warn!(session_id = %self.session_id, error = %error, "Checkpoint write failed, continuing");
        self.emit(ExecutionEvent::CheckpointFailed { error }).await;
    }
}

/// Invoke a handler under its retry policy and timeout, turning panics into failures
async fn run_node(
    handler: Option<NodeHandler>,
    state: State,
    ctx: NodeContext,
    retry: Option<RetryPolicy>,
    timeout: Option<Duration>,
) -> NodeResult {
    let Some(handler) = handler else {
        return Ok(StateDelta::new());
    };
    let policy = retry.unwrap_or_else(|| RetryPolicy::new(1));
    let mut attempt = 1;

    loop {
        let call = AssertUnwindSafe(async {
            handler(state.clone(), ctx.clone().with_attempt(attempt)).await
        })
        .catch_unwind();
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => Ok(Err(NodeError::Timeout(limit.as_millis() as u64))),
            },
            None => call.await,
        };
        let result = outcome.unwrap_or_else(|panic| {
            Err(NodeError::failed(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            )))
        });

        match result {
            Ok(delta) => {
                if attempt > 1 {
                    info!(node = ctx.node(), attempt, "Node succeeded after retry");
                }
                return Ok(delta);
            }
            Err(err) if policy.allows_retry(attempt) && !ctx.is_cancelled() => {
                let delay = policy.delay_after(attempt);
                warn!(
                    node = ctx.node(),
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Node failed, retrying after delay"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
