//! Bundled code-review pipeline
//!
//! ```text
//! router -> mode -+- review -> static_analysis ----+-> collector -> experts_model <-> experts_tools
//!                 |          -> security_analysis -+                     |
//!                 |                                                  synthesis -> persist -> END
//!                 +- chat ----> chat_reply ------------------------------------> persist
//! ```
//!
//! Every analyzer is a local heuristic, so the pipeline runs without external services.
//! `synthesis` memoizes its report in the `synthesis` cache namespace.

use chrono::Utc;
use flowgraph_core::cache::{build_query_string, ANALYSIS_MIN_SCORE, MAX_QUERY_LEN};
use flowgraph_core::{
    Branches, ExecutionPlan, GraphBuilder, LoopSpec, MergePolicy, NodeContext,
    NodePresentation, NodeResult, Resolver, State, StateDelta, StateSchema, END,
};
use regex::Regex;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::LazyLock;
use tracing::debug;

/// Nodes whose output the caller sees as text
pub const OUTPUT_NODES: [&str; 2] = ["synthesis", "chat_reply"];

/// Cache namespace for finished reports
pub const SYNTHESIS_NAMESPACE: &str = "synthesis";

/// Bound on expert tool rounds per review
pub const EXPERT_BUDGET: u32 = 2;

/// Conversation turns kept in state
pub const HISTORY_LIMIT: usize = 20;

static SECURITY_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"\beval\s*\(", "eval_usage"),
        (r"\bexec\s*\(", "exec_usage"),
        (r"subprocess\.(Popen|run)\(.*shell\s*=\s*True", "shell_true"),
        (r"\bos\.system\s*\(", "os_system"),
        (r"pickle\.load\s*\(", "insecure_pickle_load"),
        (r"yaml\.load\s*\(", "yaml_load_without_safeloader"),
        (r"requests\.(get|post)\(.*verify\s*=\s*False", "insecure_tls"),
        (r"AKIA[0-9A-Z]{16}", "aws_access_key_leak"),
    ]
    .into_iter()
    .map(|(pattern, kind)| (Regex::new(pattern).unwrap(), kind))
    .collect()
});

static BUG_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"except\s+Exception\s*:\s*pass", "swallowed_exception"),
        (r"def\s+\w+\(.*=\s*(\[\]|\{\})", "mutable_default_arg"),
        (r"if\s+\w+\s+is\s+\d+", "is_vs_equals"),
        (r"range\(len\(\w+\)\)", "index_iteration_over_list"),
    ]
    .into_iter()
    .map(|(pattern, kind)| (Regex::new(pattern).unwrap(), kind))
    .collect()
});

const HIGH_SEVERITY: [&str; 3] = ["eval_usage", "exec_usage", "shell_true"];

const LONG_LINE: usize = 120;
const LONG_FILE: usize = 2000;
const DEEP_NESTING: usize = 5;

/// Merge policies of the pipeline's state fields
pub fn schema() -> StateSchema {
    StateSchema::new()
        .with_field("tool_logs", MergePolicy::Append { max_len: None })
        .with_field("expert_notes", MergePolicy::Append { max_len: None })
        .with_field("history", MergePolicy::Append { max_len: Some(HISTORY_LIMIT) })
}

/// Input for a fresh review of `code`
pub fn review_input(path: Option<&str>, code: &str) -> StateDelta {
    let mut delta = StateDelta::new().with("mode", "review").with("code", code);
    if let Some(path) = path {
        delta.insert("path", path);
    }
    delta
}

/// Input for a follow-up question on an existing review
pub fn chat_input(question: &str) -> StateDelta {
    StateDelta::new()
        .with("mode", "chat")
        .with("chat_query", question.trim())
}

/// Compile the review graph
pub fn build_plan() -> flowgraph_core::Result<ExecutionPlan> {
    let mut graph = GraphBuilder::new();
    graph
        .add_node("router", |state, _ctx| async move { Ok(route(&state)) })
        .add_gate("mode")
        .add_node("static_analysis", |state, _ctx| async move { Ok(static_analysis(&state)) })
        .add_node("security_analysis", |state, _ctx| async move { Ok(security_analysis(&state)) })
        .add_node("collector", |state, _ctx| async move { Ok(collect(&state)) })
        .add_node("experts_model", |state, _ctx| async move { Ok(plan_lookups(&state)) })
        .add_node("experts_tools", |state, _ctx| async move { Ok(run_lookup(&state)) })
        .add_node("synthesis", synthesize)
        .add_node("chat_reply", |state, _ctx| async move { Ok(chat_reply(&state)) })
        .add_barrier("persist", |_state, _ctx| async move {
            Ok(StateDelta::new().with("persisted_at", Utc::now().to_rfc3339()))
        })
        .set_entry("router")
        .add_edge("router", "mode")
        .add_conditional_edges(
            "mode",
            Resolver::with_labels(["review", "chat"], |state| {
                let label = match state.get_str("mode") {
                    Some("chat") => "chat",
                    _ => "review",
                };
                label.to_string()
            }),
            Branches::new()
                .route("review", ["static_analysis", "security_analysis"])
                .route("chat", ["chat_reply"]),
        )
        .add_edge("static_analysis", "collector")
        .add_edge("security_analysis", "collector")
        .add_edge("collector", "experts_model")
        .add_conditional_edges(
            "experts_model",
            Resolver::with_labels(["tools", "synthesis"], |state| {
                if pending_lookups(state).is_empty() {
                    "synthesis".to_string()
                } else {
                    "tools".to_string()
                }
            }),
            Branches::new()
                .route("tools", ["experts_tools"])
                .route("synthesis", ["synthesis"]),
        )
        .add_edge("experts_tools", "experts_model")
        .add_loop(LoopSpec::new("experts_model", "tools", "synthesis", EXPERT_BUDGET))
        .add_edge("synthesis", "persist")
        .add_edge("chat_reply", "persist")
        .add_edge("persist", END)
        .describe("router", NodePresentation::new(10, "Router: detected language = {language}"))
        .describe("static_analysis", NodePresentation::new(40, "Static analysis: {static_issues} issues"))
        .describe("security_analysis", NodePresentation::new(40, "Security analysis: {security_issues} regex findings"))
        .describe("collector", NodePresentation::new(60, "Collected {finding_count} findings"))
        .describe("experts_tools", NodePresentation::new(70, "Expert lookup: {lookup}"))
        .describe("synthesis", NodePresentation::progress(90))
        .describe("chat_reply", NodePresentation::progress(90));

    graph.compile()
}

fn code_of(state: &State) -> &str {
    state.get_str("code").unwrap_or_default()
}

fn tool_log(id: &str, message: String) -> Value {
    json!([{ "id": id, "message": message, "status": "completed" }])
}

fn detect_language(path: Option<&str>, code: &str) -> &'static str {
    let extension = path.and_then(|p| p.rsplit_once('.')).map(|(_, ext)| ext);
    match extension {
        Some("rs") => return "rust",
        Some("js" | "jsx" | "ts" | "tsx") => return "javascript",
        Some("java") => return "java",
        Some("py") => return "python",
        _ => {}
    }

    if code.contains("class ") && code.contains("public static void main") {
        "java"
    } else if code.contains("import React") || (code.contains("function(") && code.contains("export default")) {
        "javascript"
    } else if code.contains("fn main") || code.contains("impl ") {
        "rust"
    } else {
        "python"
    }
}

fn route(state: &State) -> StateDelta {
    let language = detect_language(state.get_str("path"), code_of(state));
    StateDelta::new()
        .with("language", language)
        .with("tool_logs", tool_log("router", format!("Router: detected language = {}", language)))
}

fn snippet(line: &str) -> String {
    line.trim().chars().take(160).collect()
}

fn security_analysis(state: &State) -> StateDelta {
    let mut vulnerabilities = Vec::new();
    for (index, line) in code_of(state).lines().enumerate() {
        for (pattern, kind) in SECURITY_PATTERNS.iter() {
            if pattern.is_match(line) {
                let severity = if HIGH_SEVERITY.contains(kind) { "high" } else { "medium" };
                vulnerabilities.push(json!({
                    "line": index + 1,
                    "type": kind,
                    "severity": severity,
                    "snippet": snippet(line),
                }));
            }
        }
    }

    let count = vulnerabilities.len();
    StateDelta::new()
        .with("security_report", json!({ "vulnerabilities": vulnerabilities }))
        .with("security_issues", count)
        .with(
            "tool_logs",
            tool_log("security-regex", format!("Security analysis: {} regex findings.", count)),
        )
}

fn nesting_depth(line: &str) -> usize {
    let indent = line.len() - line.trim_start().len();
    indent / 4
}

fn static_analysis(state: &State) -> StateDelta {
    let code = code_of(state);
    let mut issues = Vec::new();
    let mut bugs = Vec::new();

    for (index, line) in code.lines().enumerate() {
        let lineno = index + 1;
        if line.chars().count() > LONG_LINE {
            issues.push(json!({
                "line": lineno,
                "metric": "line_length",
                "score": line.chars().count(),
                "suggestion": "Wrap long lines to keep the code readable.",
            }));
        }
        let depth = nesting_depth(line);
        if depth >= DEEP_NESTING && !line.trim().is_empty() {
            issues.push(json!({
                "line": lineno,
                "metric": "nesting_depth",
                "score": depth,
                "suggestion": "Flatten deeply nested branches with early returns or helpers.",
            }));
        }
        for (pattern, kind) in BUG_PATTERNS.iter() {
            if pattern.is_match(line) {
                bugs.push(json!({
                    "line": lineno,
                    "type": kind,
                    "confidence": 0.6,
                    "snippet": snippet(line),
                }));
            }
        }
    }
    if code.len() > LONG_FILE {
        issues.push(json!({
            "line": Value::Null,
            "metric": "file_length",
            "score": code.len(),
            "suggestion": "Large file detected; consider extracting modules for cohesion.",
        }));
    }

    let count = issues.len() + bugs.len();
    StateDelta::new()
        .with("quality_report", json!({ "issues": issues }))
        .with("bug_report", json!({ "bugs": bugs }))
        .with("static_issues", count)
        .with(
            "tool_logs",
            tool_log("static", "Static analysis: quality metrics and bug heuristics complete.".to_string()),
        )
}

fn report_items<'a>(state: &'a State, report: &str, list: &str) -> &'a [Value] {
    state
        .get_raw(report)
        .and_then(|r| r.get(list))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn collect(state: &State) -> StateDelta {
    let count = report_items(state, "security_report", "vulnerabilities").len()
        + report_items(state, "quality_report", "issues").len()
        + report_items(state, "bug_report", "bugs").len();
    let failed: Vec<String> = state.branch_failures().into_iter().map(|f| f.node).collect();

    StateDelta::new()
        .with("finding_count", count)
        .with("failed_analyzers", json!(failed))
}

/// Finding kinds that have no expert note yet, in first-seen order
fn pending_lookups(state: &State) -> Vec<String> {
    let noted: BTreeSet<&str> = state
        .get_raw("expert_notes")
        .and_then(Value::as_array)
        .map(|notes| notes.iter().filter_map(|n| n.get("type")?.as_str()).collect())
        .unwrap_or_default();

    let mut pending: Vec<String> = Vec::new();
    let kinds = report_items(state, "security_report", "vulnerabilities")
        .iter()
        .chain(report_items(state, "bug_report", "bugs"))
        .filter_map(|item| item.get("type")?.as_str());
    for kind in kinds {
        if !noted.contains(kind) && !pending.iter().any(|p| p == kind) {
            pending.push(kind.to_string());
        }
    }
    pending
}

fn plan_lookups(state: &State) -> StateDelta {
    StateDelta::new().with("pending_lookups", json!(pending_lookups(state)))
}

fn advice(kind: &str) -> &'static str {
    match kind {
        "eval_usage" | "exec_usage" => {
            "User-controlled input could lead to code execution. Parse the input instead of evaluating it."
        }
        "shell_true" | "os_system" => {
            "Command strings built from input allow injection. Pass an argument list without a shell."
        }
        "insecure_pickle_load" => "Unpickling untrusted data can execute code. Use a data-only format.",
        "yaml_load_without_safeloader" => "Use yaml.safe_load for untrusted documents.",
        "insecure_tls" => "Disabling certificate checks allows interception. Keep verification on.",
        "aws_access_key_leak" => "Rotate the key and load credentials from the environment.",
        "swallowed_exception" => "Log or re-raise the exception so failures stay visible.",
        "mutable_default_arg" => "Default to None and create the collection inside the function.",
        "is_vs_equals" => "Compare values with == rather than identity.",
        "index_iteration_over_list" => "Iterate over the items directly, or use enumerate.",
        _ => "Add a unit test hitting this branch and assert the expected behavior.",
    }
}

fn run_lookup(state: &State) -> StateDelta {
    let Some(kind) = pending_lookups(state).into_iter().next() else {
        return StateDelta::new();
    };
    StateDelta::new()
        .with("lookup", kind.as_str())
        .with("expert_notes", json!([{ "type": kind, "advice": advice(&kind) }]))
}

fn render_report(state: &State) -> String {
    let mut report = String::from("# Code Review");

    report.push_str("\n\n## Security");
    let vulnerabilities = report_items(state, "security_report", "vulnerabilities");
    if vulnerabilities.is_empty() {
        report.push_str("\nNo security findings.");
    }
    for v in vulnerabilities.iter().take(10) {
        let _ = write!(report, "\n- Line {}: {} [{}]", v["line"], text(&v["type"]), text(&v["severity"]));
    }

    report.push_str("\n\n## Quality");
    let issues = report_items(state, "quality_report", "issues");
    if issues.is_empty() {
        report.push_str("\nNo quality issues.");
    }
    for i in issues.iter().take(10) {
        let _ = write!(
            report,
            "\n- Line {}: {}={} → {}",
            i["line"],
            text(&i["metric"]),
            i["score"],
            text(&i["suggestion"])
        );
    }

    report.push_str("\n\n## Bugs");
    let bugs = report_items(state, "bug_report", "bugs");
    if bugs.is_empty() {
        report.push_str("\nNo likely bugs.");
    }
    for b in bugs.iter().take(10) {
        let _ = write!(report, "\n- Line {}: {} (conf {})", b["line"], text(&b["type"]), b["confidence"]);
    }

    if let Some(notes) = state.get_raw("expert_notes").and_then(Value::as_array) {
        if !notes.is_empty() {
            report.push_str("\n\n## Recommendations");
            for note in notes {
                let _ = write!(report, "\n- {}: {}", text(&note["type"]), text(&note["advice"]));
            }
        }
    }

    let failed = state.branch_failures();
    if !failed.is_empty() {
        report.push_str("\n\n## Incomplete");
        for failure in failed {
            let _ = write!(report, "\n- {} failed: {}", failure.node, failure.error);
        }
    }
    report
}

fn text(value: &Value) -> &str {
    value.as_str().unwrap_or("?")
}

async fn synthesize(state: State, ctx: NodeContext) -> NodeResult {
    let query = build_query_string(
        &[
            "review",
            state.get_str("language").unwrap_or_default(),
            code_of(&state),
        ],
        MAX_QUERY_LEN,
    );

    let cached = match ctx.cache() {
        Some(cache) => cache
            .get(&query, SYNTHESIS_NAMESPACE, ANALYSIS_MIN_SCORE)
            .await
            .and_then(|hit| hit.value.as_str().map(str::to_string)),
        None => None,
    };

    let report = match cached {
        Some(report) => {
            debug!(session_id = ctx.session_id(), "Reusing cached review");
            report
        }
        None => {
            let report = render_report(&state);
            if let Some(cache) = ctx.cache() {
                cache.set(&query, json!(report), SYNTHESIS_NAMESPACE).await;
            }
            report
        }
    };

    Ok(StateDelta::new()
        .with("final_report", report.as_str())
        .with("history", json!([{ "role": "assistant", "content": report }])))
}

fn words(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

fn chat_reply(state: &State) -> StateDelta {
    let question = state.get_str("chat_query").unwrap_or_default().trim();
    if question.is_empty() {
        return StateDelta::new().with("final_report", "Please include a question.");
    }
    if !state.contains("security_report") && !state.contains("quality_report") {
        return StateDelta::new()
            .with("final_report", "No stored analysis yet. Run a review on this session first.")
            .with("history", json!([{ "role": "user", "content": question }]));
    }

    let asked = words(question);
    let relevant = |item: &Value| {
        let kind = text(&item["type"]).replace('_', " ");
        asked.is_empty() || !words(&kind).is_disjoint(&asked)
    };

    let mut answer = String::new();
    let vulnerabilities = report_items(state, "security_report", "vulnerabilities");
    let mut focused: Vec<&Value> = vulnerabilities.iter().filter(|v| relevant(*v)).collect();
    if focused.is_empty() {
        focused = vulnerabilities.iter().collect();
    }
    if !focused.is_empty() {
        answer.push_str("Security highlights:");
        for v in focused.into_iter().take(3) {
            let _ = write!(answer, "\n- Line {}: {} [{}]", v["line"], text(&v["type"]), text(&v["severity"]));
        }
    }

    let bugs = report_items(state, "bug_report", "bugs");
    if !bugs.is_empty() {
        if !answer.is_empty() {
            answer.push_str("\n\n");
        }
        answer.push_str("Potential bugs:");
        for b in bugs.iter().take(2) {
            let _ = write!(answer, "\n- Line {}: {} (conf {})", b["line"], text(&b["type"]), b["confidence"]);
        }
    }

    let notes: Vec<&Value> = state
        .get_raw("expert_notes")
        .and_then(Value::as_array)
        .map(|notes| notes.iter().filter(|n| relevant(*n)).collect())
        .unwrap_or_default();
    if !notes.is_empty() {
        if !answer.is_empty() {
            answer.push_str("\n\n");
        }
        answer.push_str("Suggested fixes:");
        for note in notes {
            let _ = write!(answer, "\n- {}", text(&note["advice"]));
        }
    }

    if answer.is_empty() {
        answer.push_str("The stored review has no findings related to that question.");
    }

    StateDelta::new().with("final_report", answer.as_str()).with(
        "history",
        json!([
            { "role": "user", "content": question },
            { "role": "assistant", "content": answer },
        ]),
    )
}
