//! End-to-end scenarios: review fan-out, partial failure, repeated chat answer, unmapped label

use flowgraph_core::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use flowgraph_core::{
    BridgeConfig, Branches, Engine, ExecutionRequest, ExecutionStatus, GraphBuilder, GraphError,
    LoopSpec, MergePolicy, NodeError, Resolver, StateDelta, StateSchema, StreamEvent,
    StreamingBridge, END,
};
use futures::StreamExt;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Calls {
    analyze_a: AtomicUsize,
    analyze_b: AtomicUsize,
    collector: AtomicUsize,
}

fn review_schema() -> StateSchema {
    StateSchema::new().with_field("findings", MergePolicy::Append { max_len: None })
}

/// `ingest -> mode -> {analyze_a, analyze_b} -> collector -> synthesize -> persist -> END`
fn review_graph(calls: Arc<Calls>, fail_a: bool) -> GraphBuilder {
    let (a_calls, b_calls, c_calls) = (calls.clone(), calls.clone(), calls);

    let mut graph = GraphBuilder::new();
    graph
        .add_node("ingest", |state, _ctx| async move {
            let code = state.get_str("code").unwrap_or_default().to_string();
            Ok(StateDelta::new().with("line_count", code.lines().count()))
        })
        .add_gate("mode")
        .add_node("analyze_a", move |state, _ctx| {
            let calls = a_calls.clone();
            async move {
                calls.analyze_a.fetch_add(1, Ordering::SeqCst);
                if fail_a {
                    return Err(NodeError::failed("security analyzer crashed"));
                }
                let code = state.get_str("code").unwrap_or_default();
                let findings: Vec<Value> = ["eval(", "exec("]
                    .iter()
                    .filter(|pattern| code.contains(*pattern))
                    .map(|pattern| json!({"analyzer": "analyze_a", "issue": format!("dangerous call {}", pattern)}))
                    .collect();
                Ok(StateDelta::new().with("findings", findings))
            }
        })
        .add_node("analyze_b", move |state, _ctx| {
            let calls = b_calls.clone();
            async move {
                calls.analyze_b.fetch_add(1, Ordering::SeqCst);
                let lines = state.get_raw("line_count").cloned().unwrap_or(json!(0));
                Ok(StateDelta::new().with(
                    "findings",
                    json!([{"analyzer": "analyze_b", "issue": format!("{} line(s) reviewed", lines)}]),
                ))
            }
        })
        .add_node("collector", move |state, _ctx| {
            let calls = c_calls.clone();
            async move {
                calls.collector.fetch_add(1, Ordering::SeqCst);
                let failed: Vec<String> = state.branch_failures().into_iter().map(|f| f.node).collect();
                Ok(StateDelta::new().with(
                    "collected",
                    json!({
                        "findings": state.get_raw("findings").cloned().unwrap_or(json!([])),
                        "failed": failed,
                    }),
                ))
            }
        })
        .add_node("synthesize", |state, _ctx| async move {
            let collected = state.get_raw("collected").cloned().unwrap_or(json!({}));
            let mut report = Vec::new();
            for finding in collected["findings"].as_array().into_iter().flatten() {
                report.push(format!("- {}", finding["issue"].as_str().unwrap_or_default()));
            }
            for failed in collected["failed"].as_array().into_iter().flatten() {
                report.push(format!("- {} failed; results are partial", failed.as_str().unwrap_or_default()));
            }
            Ok(StateDelta::new().with("final_report", report.join("\n")))
        })
        .add_barrier("persist", |_state, _ctx| async { Ok(StateDelta::new().with("persisted", true)) })
        .set_entry("ingest")
        .add_edge("ingest", "mode")
        .add_conditional_edges(
            "mode",
            Resolver::with_labels(["review", "quick"], |state| {
                state.get_str("mode").unwrap_or("review").to_string()
            }),
            Branches::new()
                .route("review", ["analyze_a", "analyze_b"])
                .route("quick", ["synthesize"]),
        )
        .add_edge("analyze_a", "collector")
        .add_edge("analyze_b", "collector")
        .add_edge("collector", "synthesize")
        .add_edge("synthesize", "persist")
        .add_edge("persist", END);
    graph
}

#[tokio::test]
async fn scenario_a_fan_out_join_and_single_checkpoint() {
    let calls = Arc::new(Calls::default());
    let store = Arc::new(InMemoryCheckpointStore::new());
    let engine = Engine::new(review_graph(calls.clone(), false).compile().unwrap(), review_schema())
        .with_checkpoint_store(store.clone());

    let outcome = engine
        .invoke(ExecutionRequest::new("thread-a", StateDelta::new().with("code", "eval(x)")))
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert!(outcome.failures.is_empty());

    let collected = outcome.output("collected").unwrap();
    let analyzers: Vec<&str> = collected["findings"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["analyzer"].as_str().unwrap())
        .collect();
    assert!(analyzers.contains(&"analyze_a"));
    assert!(analyzers.contains(&"analyze_b"));
    assert_eq!(collected["failed"], json!([]));

    assert_eq!(calls.collector.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.checkpoint_writes, 1);
    assert_eq!(outcome.checkpoint_version, Some(1));

    let saved = store.load("thread-a").await.unwrap();
    assert_eq!(saved.version, 1);
    assert_eq!(saved.state["persisted"], json!(true));
    assert!(saved.state["final_report"].as_str().unwrap().contains("dangerous call eval("));
}

#[tokio::test]
async fn scenario_a_gate_prunes_unselected_branch() {
    let calls = Arc::new(Calls::default());
    let engine = Engine::new(review_graph(calls.clone(), false).compile().unwrap(), review_schema());

    let outcome = engine
        .invoke(ExecutionRequest::new(
            "thread-quick",
            StateDelta::new().with("code", "eval(x)").with("mode", "quick"),
        ))
        .await
        .unwrap();

    assert!(outcome.is_complete());
    assert_eq!(calls.analyze_a.load(Ordering::SeqCst), 0);
    assert_eq!(calls.analyze_b.load(Ordering::SeqCst), 0);
    assert_eq!(calls.collector.load(Ordering::SeqCst), 0);
    assert_eq!(outcome.output("final_report"), Some(&json!("")));

    let mut pruned = outcome.state.pruned_nodes();
    pruned.sort();
    assert_eq!(pruned, vec!["analyze_a", "analyze_b", "collector"]);
}

#[tokio::test]
async fn scenario_b_failed_branch_is_recorded_and_siblings_survive() {
    let calls = Arc::new(Calls::default());
    let store = Arc::new(InMemoryCheckpointStore::new());
    let engine = Engine::new(review_graph(calls.clone(), true).compile().unwrap(), review_schema())
        .with_checkpoint_store(store.clone());

    let outcome = engine
        .invoke(ExecutionRequest::new("thread-b", StateDelta::new().with("code", "eval(x)")))
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].node, "analyze_a");
    assert!(outcome.failures[0].error.contains("security analyzer crashed"));

    let collected = outcome.output("collected").unwrap();
    assert_eq!(collected["failed"], json!(["analyze_a"]));
    assert_eq!(collected["findings"][0]["analyzer"], json!("analyze_b"));

    let report = outcome.output("final_report").and_then(Value::as_str).unwrap();
    assert!(report.contains("1 line(s) reviewed"));
    assert!(report.contains("analyze_a failed"));

    assert_eq!(calls.collector.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.checkpoint_writes, 1);
}

fn chat_engine(store: Arc<InMemoryCheckpointStore>, reply: &'static str) -> Engine {
    let mut graph = GraphBuilder::new();
    graph
        .add_gate("mode")
        .add_node("synthesis", |_state, _ctx| async {
            Ok(StateDelta::new().with("final_report", "Review complete.\n\nNo issues found."))
        })
        .add_node("chat_reply", move |_state, _ctx| async move {
            Ok(StateDelta::new().with("final_report", reply))
        })
        .add_barrier("persist", |_state, _ctx| async { Ok(StateDelta::new()) })
        .set_entry("mode")
        .add_conditional_edges(
            "mode",
            Resolver::with_labels(["review", "chat"], |state| {
                state.get_str("mode").unwrap_or("review").to_string()
            }),
            Branches::new().route("review", ["synthesis"]).route("chat", ["chat_reply"]),
        )
        .add_edge("synthesis", "persist")
        .add_edge("chat_reply", "persist")
        .add_edge("persist", END);

    Engine::new(graph.compile().unwrap(), StateSchema::new()).with_checkpoint_store(store)
}

fn chat_bridge_config() -> BridgeConfig {
    BridgeConfig {
        output_nodes: vec!["synthesis".into(), "chat_reply".into()],
        ..BridgeConfig::default()
    }
}

fn fragments(events: &[StreamEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Fragment(text) => Some(text.clone()),
            _ => None,
        })
        .collect()
}

fn assert_terminated(events: &[StreamEvent]) {
    let n = events.len();
    assert!(n >= 2);
    assert_eq!(events[n - 2], StreamEvent::Progress(100));
    assert_eq!(events[n - 1], StreamEvent::Done);
}

#[tokio::test]
async fn scenario_c_repeated_answer_becomes_placeholder() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let config = chat_bridge_config();
    let placeholder = config.placeholder.clone();
    let bridge = StreamingBridge::new(chat_engine(store, "No issues found."), config);

    let chat = || StateDelta::new().with("mode", "chat").with("chat_query", "anything else?");

    let first: Vec<StreamEvent> = bridge
        .stream(ExecutionRequest::new("thread-c", chat()))
        .collect()
        .await;
    assert_eq!(fragments(&first), vec!["No issues found."]);
    assert_terminated(&first);

    let second: Vec<StreamEvent> = bridge
        .stream(ExecutionRequest::new("thread-c", chat()).resume())
        .collect()
        .await;
    assert_eq!(fragments(&second), vec![placeholder]);
    assert_terminated(&second);
}

#[tokio::test]
async fn scenario_c_chat_repeating_final_review_fragment() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let config = chat_bridge_config();
    let placeholder = config.placeholder.clone();
    let bridge = StreamingBridge::new(chat_engine(store, "No issues found."), config);

    let review: Vec<StreamEvent> = bridge
        .stream(ExecutionRequest::new("thread-c4", StateDelta::new().with("mode", "review")))
        .collect()
        .await;
    assert_eq!(fragments(&review), vec!["Review complete.", "No issues found."]);

    // The answer is the review's last fragment, not its whole text
    let chat: Vec<StreamEvent> = bridge
        .stream(ExecutionRequest::new("thread-c4", StateDelta::new().with("mode", "chat")).resume())
        .collect()
        .await;
    assert_eq!(fragments(&chat), vec![placeholder]);
    assert_terminated(&chat);
}

#[tokio::test]
async fn scenario_c_final_fragment_restored_from_checkpoint() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let config = chat_bridge_config();
    let placeholder = config.placeholder.clone();

    let engine = chat_engine(store.clone(), "No issues found.");
    engine
        .invoke(ExecutionRequest::new("thread-c5", StateDelta::new().with("mode", "review")))
        .await
        .unwrap();

    let bridge = StreamingBridge::new(chat_engine(store, "No issues found."), config);
    let chat: Vec<StreamEvent> = bridge
        .stream(ExecutionRequest::new("thread-c5", StateDelta::new().with("mode", "chat")).resume())
        .collect()
        .await;
    assert_eq!(fragments(&chat), vec![placeholder]);
}

#[tokio::test]
async fn scenario_c_previous_answer_restored_from_checkpoint() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let config = chat_bridge_config();
    let placeholder = config.placeholder.clone();

    let earlier = StreamingBridge::new(chat_engine(store.clone(), "No issues found."), config.clone());
    let _: Vec<StreamEvent> = earlier
        .stream(ExecutionRequest::new("thread-c2", StateDelta::new().with("mode", "chat")))
        .collect()
        .await;

    // Fresh bridge: nothing in memory, previous answer only in the checkpoint
    let later = StreamingBridge::new(chat_engine(store, "No issues found."), config);
    let events: Vec<StreamEvent> = later
        .stream(ExecutionRequest::new("thread-c2", StateDelta::new().with("mode", "chat")).resume())
        .collect()
        .await;
    assert_eq!(fragments(&events), vec![placeholder]);
}

#[tokio::test]
async fn scenario_c_new_answer_is_streamed() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let bridge = StreamingBridge::new(chat_engine(store.clone(), "No issues found."), chat_bridge_config());
    let _: Vec<StreamEvent> = bridge
        .stream(ExecutionRequest::new("thread-c3", StateDelta::new().with("mode", "chat")))
        .collect()
        .await;

    let other = StreamingBridge::new(
        chat_engine(store, "Line 1 calls eval on user input; replace it with a parser."),
        chat_bridge_config(),
    )
    .with_memory(bridge.memory().clone());
    let events: Vec<StreamEvent> = other
        .stream(ExecutionRequest::new("thread-c3", StateDelta::new().with("mode", "chat")).resume())
        .collect()
        .await;
    assert_eq!(
        fragments(&events),
        vec!["Line 1 calls eval on user input; replace it with a parser."]
    );
}

#[tokio::test]
async fn scenario_d_unmapped_label_fails_fast() {
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = ran.clone();

    let mut graph = GraphBuilder::new();
    graph
        .add_node("classify", |_state, _ctx| async { Ok(StateDelta::new().with("route", "maybe")) })
        .add_node("review", move |_state, _ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(StateDelta::new())
            }
        })
        .add_node("chat", |_state, _ctx| async { Ok(StateDelta::new()) })
        .set_entry("classify")
        .add_conditional_edges(
            "classify",
            Resolver::new(|state| state.get_str("route").unwrap_or_default().to_string()),
            Branches::new().route("review", ["review"]).route("chat", ["chat"]),
        )
        .add_edge("review", END)
        .add_edge("chat", END);

    let engine = Engine::new(graph.compile().unwrap(), StateSchema::new());
    let err = engine
        .invoke(ExecutionRequest::new("thread-d", StateDelta::new()))
        .await
        .unwrap_err();

    assert!(err.is_fatal());
    match &err {
        GraphError::UnmappedLabel { node, label, declared } => {
            assert_eq!(node, "classify");
            assert_eq!(label, "maybe");
            assert_eq!(declared, &vec!["chat".to_string(), "review".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("'maybe'"));
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    // Through the bridge: reported once, no fallback run, stream still terminates
    let bridge = StreamingBridge::new(engine, BridgeConfig::default());
    let events: Vec<StreamEvent> = bridge
        .stream(ExecutionRequest::new("thread-d", StateDelta::new()))
        .collect()
        .await;
    let failures: Vec<&StreamEvent> = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::Status(s) if s.starts_with("Execution failed")))
        .collect();
    assert_eq!(failures.len(), 1);
    assert!(fragments(&events).is_empty());
    assert!(!events.contains(&StreamEvent::Status(BridgeConfig::default().completion_status)));
    assert_terminated(&events);
}

fn run_loop(budget: u32) -> (usize, usize, usize, u32) {
    let model = Arc::new(AtomicUsize::new(0));
    let tools = Arc::new(AtomicUsize::new(0));
    let finals = Arc::new(AtomicUsize::new(0));
    let (m, t, f) = (model.clone(), tools.clone(), finals.clone());

    let mut graph = GraphBuilder::new();
    graph
        .add_node("model", move |_state, _ctx| {
            let m = m.clone();
            async move {
                m.fetch_add(1, Ordering::SeqCst);
                Ok(StateDelta::new())
            }
        })
        .add_node("tools", move |_state, _ctx| {
            let t = t.clone();
            async move {
                t.fetch_add(1, Ordering::SeqCst);
                Ok(StateDelta::new())
            }
        })
        .add_node("finalize", move |_state, _ctx| {
            let f = f.clone();
            async move {
                f.fetch_add(1, Ordering::SeqCst);
                Ok(StateDelta::new())
            }
        })
        .set_entry("model")
        .add_conditional_edges(
            "model",
            // Always asks for another tool call; only the budget stops it.
            Resolver::with_labels(["tools", "finalize"], |_| "tools".to_string()),
            Branches::new().route("tools", ["tools"]).route("finalize", ["finalize"]),
        )
        .add_edge("tools", "model")
        .add_edge("finalize", END)
        .add_loop(LoopSpec::new("model", "tools", "finalize", budget));

    let engine = Engine::new(graph.compile().unwrap(), StateSchema::new());
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let outcome = runtime
        .block_on(engine.invoke(ExecutionRequest::new("loop", StateDelta::new())))
        .unwrap();
    assert!(outcome.is_complete());

    (
        model.load(Ordering::SeqCst),
        tools.load(Ordering::SeqCst),
        finals.load(Ordering::SeqCst),
        outcome.state.loop_iterations("model"),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_loop_budget_forces_finalize(budget in 0u32..8) {
        let (model, tools, finals, iterations) = run_loop(budget);
        prop_assert_eq!(tools, budget as usize);
        prop_assert_eq!(model, budget as usize + 1);
        prop_assert_eq!(finals, 1);
        prop_assert_eq!(iterations, budget);
    }
}
