//! Graph builder and compiler
//!
//! [`GraphBuilder`] collects node, edge and routing declarations and
//! [`compile`](GraphBuilder::compile)s them into an immutable [`ExecutionPlan`]. The
//! compiler runs no handler; it validates structure and builds the indexes the engine
//! needs.
//!
//! # Quick Start
//!
//! ```rust
//! use flowgraph_core::builder::GraphBuilder;
//! use flowgraph_core::graph::{Branches, Resolver, END};
//! use flowgraph_core::StateDelta;
//!
//! let mut graph = GraphBuilder::new();
//! graph
//!     .add_gate("mode")
//!     .add_node("analyze_a", |_state, _ctx| async { Ok(StateDelta::new().with("a", 1)) })
//!     .add_node("analyze_b", |_state, _ctx| async { Ok(StateDelta::new().with("b", 2)) })
//!     .add_node("collector", |_state, _ctx| async { Ok(StateDelta::new()) })
//!     .add_conditional_edges(
//!         "mode",
//!         Resolver::with_labels(["review"], |_| "review".to_string()),
//!         Branches::new().route("review", ["analyze_a", "analyze_b"]),
//!     )
//!     .add_edge("analyze_a", "collector")
//!     .add_edge("analyze_b", "collector")
//!     .add_edge("collector", END)
//!     .set_entry("mode");
//!
//! let plan = graph.compile().unwrap();
//! assert_eq!(plan.predecessors("collector").unwrap().len(), 2);
//! ```
//!
//! # Validation
//!
//! `compile` rejects, in order:
//!
//! 1. an empty graph or a duplicate node id
//! 2. a missing, unknown or ambiguous entry
//! 3. edges or branch targets naming undefined nodes
//! 4. a node with two resolvers, or with both direct edges and a resolver
//! 5. declared resolver labels that have no destination
//! 6. a gate without a resolver
//! 7. malformed loop declarations
//! 8. nodes unreachable from the entry
//! 9. graphs where no terminal node exists
//! 10. cycles other than declared loops

use crate::error::{CompileError, Result};
use crate::graph::{
    Branches, ConditionalEdge, ExecutionPlan, LoopInfo, LoopSpec, NodeId, NodeKind,
    NodePresentation, NodeSpec, Resolver, END, START,
};
use crate::node::{handler, NodeContext, NodeHandler, NodeResult};
use crate::retry::RetryPolicy;
use crate::state::State;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::future::Future;

/// Mutable graph declaration
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<NodeSpec>,
    edges: Vec<(NodeId, NodeId)>,
    conditionals: Vec<(NodeId, ConditionalEdge)>,
    loops: Vec<LoopSpec>,
    entry: Option<NodeId>,
    presentation: Vec<(NodeId, NodePresentation)>,
    retries: Vec<(NodeId, RetryPolicy)>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a step node
    pub fn add_node<F, Fut>(&mut self, id: impl Into<NodeId>, f: F) -> &mut Self
    where
        F: Fn(State, NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = NodeResult> + Send + 'static,
    {
        self.push_node(id.into(), NodeKind::Step, Some(handler(f)))
    }

    /// Add a step node from an already boxed handler
    pub fn add_node_handler(&mut self, id: impl Into<NodeId>, handler: NodeHandler) -> &mut Self {
        self.push_node(id.into(), NodeKind::Step, Some(handler))
    }

    /// Add a routing-only node; it needs a resolver via [`add_conditional_edges`](Self::add_conditional_edges)
    pub fn add_gate(&mut self, id: impl Into<NodeId>) -> &mut Self {
        self.push_node(id.into(), NodeKind::Gate, None)
    }

    /// Add a node after which the engine checkpoints the state
    pub fn add_barrier<F, Fut>(&mut self, id: impl Into<NodeId>, f: F) -> &mut Self
    where
        F: Fn(State, NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = NodeResult> + Send + 'static,
    {
        self.push_node(id.into(), NodeKind::Barrier, Some(handler(f)))
    }

    fn push_node(&mut self, id: NodeId, kind: NodeKind, handler: Option<NodeHandler>) -> &mut Self {
        self.nodes.push(NodeSpec {
            id,
            kind,
            handler,
            retry: None,
        });
        self
    }

    /// Unconditional edge; `from == START` sets the entry, `to == END` marks `from` terminal
    pub fn add_edge(&mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> &mut Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    pub fn add_conditional_edges(
        &mut self,
        from: impl Into<NodeId>,
        resolver: Resolver,
        branches: Branches,
    ) -> &mut Self {
        self.conditionals
            .push((from.into(), ConditionalEdge { resolver, branches }));
        self
    }

    /// Declare a bounded loop headed by a node with a resolver
    pub fn add_loop(&mut self, spec: LoopSpec) -> &mut Self {
        self.loops.push(spec);
        self
    }

    pub fn set_entry(&mut self, node: impl Into<NodeId>) -> &mut Self {
        self.entry = Some(node.into());
        self
    }

    /// Progress and status shown by the streaming bridge when `node` finishes
    pub fn describe(&mut self, node: impl Into<NodeId>, presentation: NodePresentation) -> &mut Self {
        self.presentation.push((node.into(), presentation));
        self
    }

    pub fn set_retry(&mut self, node: impl Into<NodeId>, policy: RetryPolicy) -> &mut Self {
        self.retries.push((node.into(), policy));
        self
    }

    /// Validate the declaration and build an [`ExecutionPlan`]
    pub fn compile(&self) -> Result<ExecutionPlan> {
        Ok(Compiler::new(self).run()?)
    }
}

struct Compiler<'a> {
    builder: &'a GraphBuilder,
    nodes: HashMap<NodeId, NodeSpec>,
    order: Vec<NodeId>,
    direct: HashMap<NodeId, Vec<NodeId>>,
    conditional: HashMap<NodeId, ConditionalEdge>,
}

impl<'a> Compiler<'a> {
    fn new(builder: &'a GraphBuilder) -> Self {
        Self {
            builder,
            nodes: HashMap::new(),
            order: Vec::new(),
            direct: HashMap::new(),
            conditional: HashMap::new(),
        }
    }

    fn run(mut self) -> std::result::Result<ExecutionPlan, CompileError> {
        self.collect_nodes()?;
        let entry = self.resolve_entry()?;
        self.collect_edges()?;
        self.collect_conditionals()?;
        self.attach_metadata()?;

        for spec in self.nodes.values() {
            if spec.kind == NodeKind::Gate && !self.conditional.contains_key(&spec.id) {
                return Err(CompileError::GateWithoutResolver(spec.id.clone()));
            }
        }

        let (loops, back_edges) = self.compile_loops()?;
        self.check_reachable(&entry)?;

        let terminals: BTreeSet<NodeId> = self
            .order
            .iter()
            .filter(|id| {
                let successors = self.successors(id);
                successors.is_empty() || successors.iter().any(|s| s == END)
            })
            .cloned()
            .collect();
        if terminals.is_empty() {
            return Err(CompileError::NoTerminal);
        }

        self.check_acyclic(&back_edges)?;

        let mut predecessors: HashMap<NodeId, BTreeSet<NodeId>> = HashMap::new();
        for id in &self.order {
            for successor in self.successors(id) {
                if successor == END || back_edges.contains(&(id.clone(), successor.clone())) {
                    continue;
                }
                predecessors.entry(successor).or_default().insert(id.clone());
            }
        }

        let presentation = self.builder.presentation.iter().cloned().collect();

        Ok(ExecutionPlan {
            nodes: self.nodes,
            order: self.order,
            entry,
            direct: self.direct,
            conditional: self.conditional,
            predecessors,
            back_edges,
            loops,
            terminals,
            presentation,
        })
    }

    fn collect_nodes(&mut self) -> std::result::Result<(), CompileError> {
        if self.builder.nodes.is_empty() {
            return Err(CompileError::EmptyGraph);
        }
        for spec in &self.builder.nodes {
            if spec.id == START || spec.id == END || self.nodes.contains_key(&spec.id) {
                return Err(CompileError::DuplicateNode(spec.id.clone()));
            }
            self.order.push(spec.id.clone());
            self.nodes.insert(spec.id.clone(), spec.clone());
        }
        Ok(())
    }

    fn resolve_entry(&self) -> std::result::Result<NodeId, CompileError> {
        let mut candidates: Vec<NodeId> = Vec::new();
        if let Some(entry) = &self.builder.entry {
            candidates.push(entry.clone());
        }
        for (from, to) in &self.builder.edges {
            if from == START && !candidates.contains(to) {
                candidates.push(to.clone());
            }
        }

        match candidates.len() {
            0 => Err(CompileError::MissingEntry),
            1 => {
                let entry = candidates.remove(0);
                if self.nodes.contains_key(&entry) {
                    Ok(entry)
                } else {
                    Err(CompileError::UnknownEntry(entry))
                }
            }
            _ => Err(CompileError::MultipleEntries(candidates)),
        }
    }

    fn check_target(&self, from: &str, to: &str) -> std::result::Result<(), CompileError> {
        if to == END || self.nodes.contains_key(to) {
            Ok(())
        } else {
            Err(CompileError::UnknownNode {
                from: from.to_string(),
                to: to.to_string(),
                missing: to.to_string(),
            })
        }
    }

    fn collect_edges(&mut self) -> std::result::Result<(), CompileError> {
        for (from, to) in &self.builder.edges {
            if from == START {
                continue;
            }
            if !self.nodes.contains_key(from) {
                return Err(CompileError::UnknownNode {
                    from: from.clone(),
                    to: to.clone(),
                    missing: from.clone(),
                });
            }
            self.check_target(from, to)?;

            let targets = self.direct.entry(from.clone()).or_default();
            if !targets.contains(to) {
                targets.push(to.clone());
            }
        }
        Ok(())
    }

    fn collect_conditionals(&mut self) -> std::result::Result<(), CompileError> {
        for (from, edge) in &self.builder.conditionals {
            if !self.nodes.contains_key(from) {
                return Err(CompileError::UnknownNode {
                    from: from.clone(),
                    to: "<conditional>".to_string(),
                    missing: from.clone(),
                });
            }
            if self.conditional.contains_key(from) {
                return Err(CompileError::DuplicateResolver(from.clone()));
            }
            if self.direct.contains_key(from) {
                return Err(CompileError::MixedEdges(from.clone()));
            }
            for target in edge.branches.all_targets() {
                self.check_target(from, &target)?;
            }

            if let Some(declared) = edge.resolver.declared_labels() {
                let unmapped: Vec<String> = declared
                    .iter()
                    .filter(|label| edge.branches.targets(label).is_none())
                    .cloned()
                    .collect();
                if !unmapped.is_empty() {
                    return Err(CompileError::UnmappedLabels {
                        node: from.clone(),
                        labels: unmapped,
                    });
                }
            }

            self.conditional.insert(from.clone(), edge.clone());
        }
        Ok(())
    }

    fn attach_metadata(&mut self) -> std::result::Result<(), CompileError> {
        for (node, policy) in &self.builder.retries {
            let spec = self
                .nodes
                .get_mut(node)
                .ok_or_else(|| unknown_reference(node))?;
            spec.retry = Some(policy.clone());
        }
        for (node, _) in &self.builder.presentation {
            if !self.nodes.contains_key(node) {
                return Err(unknown_reference(node));
            }
        }
        Ok(())
    }

    fn successors(&self, id: &str) -> Vec<NodeId> {
        if let Some(edge) = self.conditional.get(id) {
            edge.branches.all_targets()
        } else {
            self.direct.get(id).cloned().unwrap_or_default()
        }
    }

    #[allow(clippy::type_complexity)]
    fn compile_loops(
        &self,
    ) -> std::result::Result<(HashMap<NodeId, LoopInfo>, HashSet<(NodeId, NodeId)>), CompileError>
    {
        let mut loops = HashMap::new();
        let mut back_edges = HashSet::new();

        for spec in &self.builder.loops {
            let invalid = |reason: &str| CompileError::InvalidLoop {
                node: spec.head.clone(),
                reason: reason.to_string(),
            };

            if !self.nodes.contains_key(&spec.head) {
                return Err(invalid("head is not a defined node"));
            }
            if loops.contains_key(&spec.head) {
                return Err(invalid("loop declared twice"));
            }
            let edge = self
                .conditional
                .get(&spec.head)
                .ok_or_else(|| invalid("head has no conditional resolver"))?;
            let loop_targets = edge
                .branches
                .targets(&spec.loop_label)
                .ok_or_else(|| invalid("loop label has no destination"))?;
            let exit_targets = edge
                .branches
                .targets(&spec.exit_label)
                .ok_or_else(|| invalid("exit label has no destination"))?;

            // Body: everything reachable from the loop destinations without crossing the head.
            let mut body = BTreeSet::new();
            let mut queue: VecDeque<NodeId> = loop_targets
                .iter()
                .filter(|t| *t != &spec.head && *t != END)
                .cloned()
                .collect();
            while let Some(node) = queue.pop_front() {
                if !body.insert(node.clone()) {
                    continue;
                }
                for next in self.successors(&node) {
                    if next != spec.head && next != END && !body.contains(&next) {
                        queue.push_back(next);
                    }
                }
            }

            let mut returns = Vec::new();
            if loop_targets.iter().any(|t| t == &spec.head) {
                returns.push((spec.head.clone(), spec.head.clone()));
            }
            for node in &body {
                if self.successors(node).iter().any(|s| s == &spec.head) {
                    returns.push((node.clone(), spec.head.clone()));
                }
            }
            if returns.is_empty() {
                return Err(invalid("loop body never returns to the head"));
            }
            if let Some(target) = exit_targets.iter().find(|t| body.contains(*t)) {
                return Err(invalid(&format!("exit destination '{}' is inside the loop body", target)));
            }

            back_edges.extend(returns);
            loops.insert(
                spec.head.clone(),
                LoopInfo {
                    spec: spec.clone(),
                    body,
                },
            );
        }

        Ok((loops, back_edges))
    }

    fn check_reachable(&self, entry: &str) -> std::result::Result<(), CompileError> {
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut queue = VecDeque::from([entry.to_string()]);
        while let Some(node) = queue.pop_front() {
            if node == END || !seen.insert(node.clone()) {
                continue;
            }
            queue.extend(self.successors(&node));
        }

        let unreachable: Vec<NodeId> = self
            .order
            .iter()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        if unreachable.is_empty() {
            Ok(())
        } else {
            Err(CompileError::UnreachableNodes(unreachable))
        }
    }

    fn check_acyclic(&self, back_edges: &HashSet<(NodeId, NodeId)>) -> std::result::Result<(), CompileError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();
        for root in &self.order {
            if marks.contains_key(root.as_str()) {
                continue;
            }
            // Iterative DFS: (node, successors, next index)
            let mut stack: Vec<(&str, Vec<NodeId>, usize)> =
                vec![(root.as_str(), self.successors(root), 0)];
            marks.insert(root.as_str(), Mark::Visiting);

            while let Some((node, successors, index)) = stack.last_mut() {
                let node = *node;
                if *index >= successors.len() {
                    marks.insert(node, Mark::Done);
                    stack.pop();
                    continue;
                }
                let next = successors[*index].clone();
                *index += 1;

                if next == END || back_edges.contains(&(node.to_string(), next.clone())) {
                    continue;
                }
                let Some((key, _)) = self.nodes.get_key_value(&next) else {
                    continue;
                };
                match marks.get(key.as_str()) {
                    Some(Mark::Visiting) => return Err(CompileError::UnboundedCycle(next)),
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(key.as_str(), Mark::Visiting);
                        stack.push((key.as_str(), self.successors(key), 0));
                    }
                }
            }
        }
        Ok(())
    }
}

fn unknown_reference(node: &str) -> CompileError {
    CompileError::UnknownNode {
        from: node.to_string(),
        to: node.to_string(),
        missing: node.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphError;
    use crate::state::StateDelta;

    fn noop(graph: &mut GraphBuilder, id: &str) {
        graph.add_node(id, |_state, _ctx| async { Ok(StateDelta::new()) });
    }

    fn compile_err(graph: &GraphBuilder) -> CompileError {
        match graph.compile() {
            Err(GraphError::Compile(err)) => err,
            other => panic!("expected compile error, got {:?}", other.map(|p| p.describe())),
        }
    }

    fn review_graph() -> GraphBuilder {
        let mut graph = GraphBuilder::new();
        noop(&mut graph, "entry");
        graph.add_gate("gate");
        for id in ["analyze_a", "analyze_b", "collector", "synthesize"] {
            noop(&mut graph, id);
        }
        graph.add_barrier("barrier", |_state, _ctx| async { Ok(StateDelta::new()) });
        graph
            .add_edge(START, "entry")
            .add_edge("entry", "gate")
            .add_conditional_edges(
                "gate",
                Resolver::with_labels(["review"], |_| "review".to_string()),
                Branches::new().route("review", ["analyze_a", "analyze_b"]),
            )
            .add_edge("analyze_a", "collector")
            .add_edge("analyze_b", "collector")
            .add_edge("collector", "synthesize")
            .add_edge("synthesize", "barrier")
            .add_edge("barrier", END);
        graph
    }

    #[test]
    fn test_compile_review_graph() {
        let plan = review_graph().compile().unwrap();

        assert_eq!(plan.entry(), "entry");
        assert_eq!(plan.node("barrier").unwrap().kind, NodeKind::Barrier);
        assert!(plan.is_terminal("barrier"));
        assert_eq!(plan.terminals().len(), 1);

        let joins: Vec<&str> = plan
            .predecessors("collector")
            .unwrap()
            .iter()
            .map(String::as_str)
            .collect();
        assert_eq!(joins, vec!["analyze_a", "analyze_b"]);
        assert!(plan.predecessors("entry").is_none());
    }

    #[test]
    fn test_describe_lists_nodes_and_joins() {
        let text = review_graph().compile().unwrap().describe();
        assert!(text.starts_with("entry: entry\n"));
        assert!(text.contains("gate [gate] {review -> analyze_a + analyze_b}"));
        assert!(text.contains("collector [step] join(analyze_a, analyze_b) -> synthesize"));
        assert!(text.contains("barrier [barrier] -> __end__"));
    }

    #[test]
    fn test_empty_graph() {
        assert_eq!(compile_err(&GraphBuilder::new()), CompileError::EmptyGraph);
    }

    #[test]
    fn test_duplicate_node() {
        let mut graph = GraphBuilder::new();
        noop(&mut graph, "a");
        noop(&mut graph, "a");
        graph.set_entry("a");
        assert_eq!(compile_err(&graph), CompileError::DuplicateNode("a".into()));
    }

    #[test]
    fn test_entry_errors() {
        let mut graph = GraphBuilder::new();
        noop(&mut graph, "a");
        noop(&mut graph, "b");
        graph.add_edge("a", END).add_edge("b", END);
        assert_eq!(compile_err(&graph), CompileError::MissingEntry);

        graph.set_entry("ghost");
        assert_eq!(compile_err(&graph), CompileError::UnknownEntry("ghost".into()));

        graph.set_entry("a").add_edge(START, "b");
        assert!(matches!(compile_err(&graph), CompileError::MultipleEntries(ids) if ids.len() == 2));
    }

    #[test]
    fn test_edge_to_undefined_node() {
        let mut graph = GraphBuilder::new();
        noop(&mut graph, "a");
        graph.set_entry("a").add_edge("a", "missing");
        assert_eq!(
            compile_err(&graph),
            CompileError::UnknownNode {
                from: "a".into(),
                to: "missing".into(),
                missing: "missing".into()
            }
        );
    }

    #[test]
    fn test_declared_labels_must_be_mapped() {
        let mut graph = GraphBuilder::new();
        graph.add_gate("gate");
        noop(&mut graph, "chat");
        graph
            .set_entry("gate")
            .add_conditional_edges(
                "gate",
                Resolver::with_labels(["chat", "review"], |_| "chat".to_string()),
                Branches::new().route("chat", ["chat"]),
            )
            .add_edge("chat", END);

        assert_eq!(
            compile_err(&graph),
            CompileError::UnmappedLabels {
                node: "gate".into(),
                labels: vec!["review".into()]
            }
        );
    }

    #[test]
    fn test_gate_needs_resolver() {
        let mut graph = GraphBuilder::new();
        graph.add_gate("gate").set_entry("gate").add_edge("gate", END);
        assert_eq!(compile_err(&graph), CompileError::GateWithoutResolver("gate".into()));
    }

    #[test]
    fn test_mixed_edges_rejected() {
        let mut graph = GraphBuilder::new();
        noop(&mut graph, "a");
        graph
            .set_entry("a")
            .add_edge("a", END)
            .add_conditional_edges("a", Resolver::new(|_| "x".into()), Branches::new().route("x", [END]));
        assert_eq!(compile_err(&graph), CompileError::MixedEdges("a".into()));
    }

    #[test]
    fn test_unreachable_nodes() {
        let mut graph = GraphBuilder::new();
        noop(&mut graph, "a");
        noop(&mut graph, "orphan");
        graph.set_entry("a").add_edge("a", END).add_edge("orphan", END);
        assert_eq!(
            compile_err(&graph),
            CompileError::UnreachableNodes(vec!["orphan".into()])
        );
    }

    #[test]
    fn test_no_terminal() {
        let mut graph = GraphBuilder::new();
        noop(&mut graph, "a");
        noop(&mut graph, "b");
        graph.set_entry("a").add_edge("a", "b").add_edge("b", "a");
        assert_eq!(compile_err(&graph), CompileError::NoTerminal);
    }

    #[test]
    fn test_undeclared_cycle_rejected() {
        let mut graph = GraphBuilder::new();
        noop(&mut graph, "a");
        noop(&mut graph, "b");
        graph.set_entry("a").add_edge("a", "b").add_conditional_edges(
            "b",
            Resolver::new(|_| "again".into()),
            Branches::new().route("again", ["a"]).route("done", [END]),
        );
        assert!(matches!(compile_err(&graph), CompileError::UnboundedCycle(_)));
    }

    fn loop_graph(max_iterations: u32) -> GraphBuilder {
        let mut graph = GraphBuilder::new();
        for id in ["model", "tools", "finalize"] {
            noop(&mut graph, id);
        }
        graph
            .set_entry("model")
            .add_conditional_edges(
                "model",
                Resolver::with_labels(["tools", "final"], |_| "tools".to_string()),
                Branches::new().route("tools", ["tools"]).route("final", ["finalize"]),
            )
            .add_edge("tools", "model")
            .add_edge("finalize", END)
            .add_loop(LoopSpec::new("model", "tools", "final", max_iterations));
        graph
    }

    #[test]
    fn test_declared_loop_compiles() {
        let plan = loop_graph(2).compile().unwrap();

        assert!(plan.is_back_edge("tools", "model"));
        assert!(!plan.is_back_edge("model", "tools"));
        let info = plan.loop_info("model").unwrap();
        assert_eq!(info.spec.max_iterations, 2);
        assert_eq!(info.body.iter().collect::<Vec<_>>(), vec!["tools"]);
        assert!(plan.predecessors("model").is_none());
        assert!(plan.describe().contains("loop(tools <= 2, exit final)"));
    }

    #[test]
    fn test_loop_requires_both_labels() {
        let mut graph = loop_graph(2);
        graph.add_loop(LoopSpec::new("finalize", "x", "y", 1));
        assert!(matches!(
            compile_err(&graph),
            CompileError::InvalidLoop { node, .. } if node == "finalize"
        ));

        let mut graph = loop_graph(2);
        graph.loops[0].exit_label = "missing".into();
        assert!(matches!(compile_err(&graph), CompileError::InvalidLoop { .. }));
    }

    #[test]
    fn test_retry_and_presentation_attach() {
        let mut graph = review_graph();
        graph
            .set_retry("analyze_a", RetryPolicy::new(2))
            .describe("collector", NodePresentation::new(40, "Merging {node}"));
        let plan = graph.compile().unwrap();
        assert_eq!(plan.node("analyze_a").unwrap().retry.as_ref().unwrap().max_attempts, 2);
        assert_eq!(plan.presentation("collector").unwrap().progress, Some(40));

        graph.describe("ghost", NodePresentation::progress(1));
        assert!(matches!(compile_err(&graph), CompileError::UnknownNode { .. }));
    }
}
