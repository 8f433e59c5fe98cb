//! Graph vocabulary and the compiled execution plan
//!
//! A graph is declared with [`GraphBuilder`](crate::builder::GraphBuilder) and compiled
//! into an [`ExecutionPlan`]: an immutable description of nodes, routes and the
//! reverse-dependency index the engine uses to decide when a join node may run.
//!
//! # Node kinds
//!
//! - [`NodeKind::Step`] runs a handler and merges its delta.
//! - [`NodeKind::Gate`] runs no handler; it only evaluates its resolver and activates
//!   the matching branch. Sibling branches are pruned for the rest of the execution.
//! - [`NodeKind::Barrier`] runs a handler (or none) and then checkpoints the state.
//!
//! # Routing
//!
//! A node has either direct edges (every target is activated) or one conditional
//! resolver whose label selects a set of targets from [`Branches`]. [`END`] marks
//! completion; a node without outgoing edges is terminal as well.

use crate::node::NodeHandler;
use crate::retry::RetryPolicy;
use crate::state::State;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::{self, Write as _};
use std::sync::Arc;

/// Node identifier
pub type NodeId = String;

/// Virtual source node; an edge from START sets the entry node
pub const START: &str = "__start__";

/// Virtual sink node; an edge to END marks its source as terminal
pub const END: &str = "__end__";

/// Role of a node in the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Step,
    Gate,
    Barrier,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Step => write!(f, "step"),
            NodeKind::Gate => write!(f, "gate"),
            NodeKind::Barrier => write!(f, "barrier"),
        }
    }
}

/// Declared node
#[derive(Clone)]
pub struct NodeSpec {
    pub id: NodeId,
    pub kind: NodeKind,
    pub handler: Option<NodeHandler>,
    pub retry: Option<RetryPolicy>,
}

impl fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSpec")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("handler", &self.handler.as_ref().map(|_| "<function>"))
            .field("retry", &self.retry)
            .finish()
    }
}

/// Pure routing function `State -> label`
#[derive(Clone)]
pub struct Resolver {
    func: Arc<dyn Fn(&State) -> String + Send + Sync>,
    labels: Option<Vec<String>>,
}

impl Resolver {
    /// Resolver whose labels are only checked when it runs
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&State) -> String + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
            labels: None,
        }
    }

    /// Resolver declaring every label it can return; checked at compile time
    pub fn with_labels<F, I, S>(labels: I, func: F) -> Self
    where
        F: Fn(&State) -> String + Send + Sync + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            func: Arc::new(func),
            labels: Some(labels.into_iter().map(Into::into).collect()),
        }
    }

    pub fn resolve(&self, state: &State) -> String {
        (self.func)(state)
    }

    pub fn declared_labels(&self) -> Option<&[String]> {
        self.labels.as_deref()
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("func", &"<function>")
            .field("labels", &self.labels)
            .finish()
    }
}

/// Label → destinations mapping of a conditional edge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Branches {
    routes: BTreeMap<String, Vec<NodeId>>,
}

impl Branches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `label` to one or more destinations (several destinations fan out)
    pub fn route<I, S>(mut self, label: impl Into<String>, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routes
            .insert(label.into(), targets.into_iter().map(Into::into).collect());
        self
    }

    pub fn targets(&self, label: &str) -> Option<&[NodeId]> {
        self.routes.get(label).map(Vec::as_slice)
    }

    pub fn labels(&self) -> impl Iterator<Item = &String> {
        self.routes.keys()
    }

    /// Every destination of every label, deduplicated, in label order
    pub fn all_targets(&self) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        self.routes
            .values()
            .flatten()
            .filter(|target| seen.insert(target.as_str()))
            .cloned()
            .collect()
    }
}

/// Resolver plus its branch table
#[derive(Debug, Clone)]
pub struct ConditionalEdge {
    pub resolver: Resolver,
    pub branches: Branches,
}

/// Bounded self-loop declaration
///
/// `head` must have a resolver with both labels. Each time the loop body routes back into
/// `head` the per-execution counter grows; once it reaches `max_iterations`, a
/// `loop_label` decision at `head` is replaced by `exit_label`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopSpec {
    pub head: NodeId,
    pub loop_label: String,
    pub exit_label: String,
    pub max_iterations: u32,
}

impl LoopSpec {
    pub fn new(
        head: impl Into<NodeId>,
        loop_label: impl Into<String>,
        exit_label: impl Into<String>,
        max_iterations: u32,
    ) -> Self {
        Self {
            head: head.into(),
            loop_label: loop_label.into(),
            exit_label: exit_label.into(),
            max_iterations,
        }
    }
}

/// Compiled loop: declaration plus the nodes inside it
#[derive(Debug, Clone)]
pub struct LoopInfo {
    pub spec: LoopSpec,
    pub body: BTreeSet<NodeId>,
}

/// How the streaming layer presents a node's completion
///
/// `status` may reference `{node}` and any top-level scalar field of the node's delta,
/// e.g. `"Context: {disk_files} files"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePresentation {
    pub progress: Option<u8>,
    pub status: Option<String>,
}

impl NodePresentation {
    pub fn new(progress: u8, status: impl Into<String>) -> Self {
        Self {
            progress: Some(progress.min(100)),
            status: Some(status.into()),
        }
    }

    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress.min(100)),
            status: None,
        }
    }

    pub fn status(status: impl Into<String>) -> Self {
        Self {
            progress: None,
            status: Some(status.into()),
        }
    }
}

/// Immutable, validated execution plan
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub(crate) nodes: HashMap<NodeId, NodeSpec>,
    pub(crate) order: Vec<NodeId>,
    pub(crate) entry: NodeId,
    pub(crate) direct: HashMap<NodeId, Vec<NodeId>>,
    pub(crate) conditional: HashMap<NodeId, ConditionalEdge>,
    pub(crate) predecessors: HashMap<NodeId, BTreeSet<NodeId>>,
    pub(crate) back_edges: HashSet<(NodeId, NodeId)>,
    pub(crate) loops: HashMap<NodeId, LoopInfo>,
    pub(crate) terminals: BTreeSet<NodeId>,
    pub(crate) presentation: HashMap<NodeId, NodePresentation>,
}

impl ExecutionPlan {
    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.get(id)
    }

    /// Node ids in declaration order
    pub fn node_ids(&self) -> &[NodeId] {
        &self.order
    }

    /// Every possible successor of `id` (direct targets or all branch targets), END included
    pub fn successors(&self, id: &str) -> Vec<NodeId> {
        if let Some(conditional) = self.conditional.get(id) {
            conditional.branches.all_targets()
        } else {
            self.direct.get(id).cloned().unwrap_or_default()
        }
    }

    pub fn conditional(&self, id: &str) -> Option<&ConditionalEdge> {
        self.conditional.get(id)
    }

    /// Forward predecessors a join waits for (loop back edges excluded)
    pub fn predecessors(&self, id: &str) -> Option<&BTreeSet<NodeId>> {
        self.predecessors.get(id)
    }

    pub fn is_back_edge(&self, from: &str, to: &str) -> bool {
        self.back_edges.contains(&(from.to_string(), to.to_string()))
    }

    /// Loop headed by `head`, if any
    pub fn loop_info(&self, head: &str) -> Option<&LoopInfo> {
        self.loops.get(head)
    }

    pub fn terminals(&self) -> &BTreeSet<NodeId> {
        &self.terminals
    }

    pub fn is_terminal(&self, id: &str) -> bool {
        self.terminals.contains(id)
    }

    /// Whether any node checkpoints on completion
    pub fn has_barriers(&self) -> bool {
        self.nodes.values().any(|spec| spec.kind == NodeKind::Barrier)
    }

    pub fn presentation(&self, id: &str) -> Option<&NodePresentation> {
        self.presentation.get(id)
    }

    /// Plain-text summary of the plan
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "entry: {}", self.entry);
        for id in &self.order {
            let Some(spec) = self.nodes.get(id) else {
                continue;
            };
            let _ = write!(out, "{} [{}]", id, spec.kind);
            if let Some(preds) = self.predecessors.get(id).filter(|p| p.len() > 1) {
                let joined: Vec<&str> = preds.iter().map(String::as_str).collect();
                let _ = write!(out, " join({})", joined.join(", "));
            }
            if let Some(conditional) = self.conditional.get(id) {
                let routes: Vec<String> = conditional
                    .branches
                    .routes
                    .iter()
                    .map(|(label, targets)| format!("{} -> {}", label, targets.join(" + ")))
                    .collect();
                let _ = write!(out, " {{{}}}", routes.join("; "));
            } else if let Some(targets) = self.direct.get(id) {
                let _ = write!(out, " -> {}", targets.join(", "));
            }
            if let Some(info) = self.loops.get(id) {
                let _ = write!(
                    out,
                    " loop({} <= {}, exit {})",
                    info.spec.loop_label, info.spec.max_iterations, info.spec.exit_label
                );
            }
            let _ = writeln!(out);
        }
        out
    }
}
