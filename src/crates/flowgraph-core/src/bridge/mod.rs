//! Streaming bridge
//!
//! Turns engine lifecycle events into the ordered, caller-facing sequence a chat UI
//! consumes:
//!
//! ```text
//! progress 5 → (status | progress | fragment)* → status "Chat ready…" → progress 100 → done
//! ```
//!
//! Progress values come from the plan's [`NodePresentation`](crate::graph::NodePresentation)
//! table and never decrease. Fragments come from the configured output nodes: streamed
//! tokens pass straight through, otherwise the node's output text is split into paragraphs
//! and filtered against what this execution and earlier turns of the same session already
//! sent. A response identical to the previous turn is replaced by a short placeholder.
//!
//! The primary strategy streams. If it fails, or completes without producing any text, the
//! bridge runs the blocking strategy exactly once and sends its result as a single fragment.
//! Fatal errors skip that fallback and are reported as a status line.
//!
//! # Example
//!
//! ```rust,no_run
//! use flowgraph_core::bridge::{BridgeConfig, StreamEvent, StreamingBridge};
//! use flowgraph_core::{Engine, ExecutionRequest, StateDelta};
//! use futures::StreamExt;
//!
//! # async fn example(engine: Engine) {
//! let bridge = StreamingBridge::new(engine, BridgeConfig::default());
//! let mut stream = bridge.stream(ExecutionRequest::new("thread-1", StateDelta::new().with("code", "eval(x)")));
//!
//! while let Some(event) = stream.next().await {
//!     if let StreamEvent::Fragment(text) = &event {
//!         println!("{}", text);
//!     }
//! }
//! # }
//! ```

pub mod dedup;
pub mod strategy;

pub use dedup::{jaccard, ThreadMemory, DEFAULT_DEDUP_THRESHOLD, DEFAULT_MEMORY_LIMIT};
pub use strategy::{BlockingStrategy, ExecutionStrategy, StreamingStrategy};

use crate::engine::{Engine, ExecutionRequest};
use crate::error::{GraphError, Result};
use crate::events::{EventSink, ExecutionEvent};
use crate::state::StateDelta;
use dedup::{token_jaccard, tokenize};
use futures::Stream;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::{Arc, LazyLock};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Caller-facing event
///
/// Serialized as `{"kind": "progress" | "status" | "fragment" | "done", "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum StreamEvent {
    /// Percentage, non-decreasing within one stream
    Progress(u8),
    /// Short human-readable line
    Status(String),
    /// Output text
    Fragment(String),
    /// Always last
    Done,
}

/// Bridge behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Progress sent before anything runs
    pub start_progress: u8,

    /// Optional status sent with the start progress
    pub start_status: Option<String>,

    /// Status sent right before progress 100
    pub completion_status: String,

    /// Nodes whose output is streamed as fragments
    pub output_nodes: Vec<String>,

    /// Delta field holding an output node's text
    pub output_field: String,

    /// Token-set Jaccard similarity at or above which a paragraph is suppressed
    pub dedup_threshold: f64,

    /// Sent instead of a response identical to the previous turn
    pub placeholder: String,

    /// Paragraphs remembered per session
    pub memory_limit: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            start_progress: 5,
            start_status: None,
            completion_status: "Chat ready. Use the sidebar to ask follow-ups.".to_string(),
            output_nodes: vec!["synthesis".to_string()],
            output_field: "final_report".to_string(),
            dedup_threshold: DEFAULT_DEDUP_THRESHOLD,
            placeholder: "No new insights since the previous answer.".to_string(),
            memory_limit: DEFAULT_MEMORY_LIMIT,
        }
    }
}

/// Runs requests and streams their progress and output to one consumer
pub struct StreamingBridge {
    engine: Engine,
    config: Arc<BridgeConfig>,
    memory: ThreadMemory,
    primary: Arc<dyn ExecutionStrategy>,
    fallback: Arc<dyn ExecutionStrategy>,
}

impl StreamingBridge {
    pub fn new(engine: Engine, config: BridgeConfig) -> Self {
        Self {
            memory: ThreadMemory::new(config.memory_limit),
            primary: Arc::new(StreamingStrategy::new(engine.clone())),
            fallback: Arc::new(BlockingStrategy::new(engine.clone())),
            config: Arc::new(config),
            engine,
        }
    }

    /// Share thread memory with other bridges
    pub fn with_memory(mut self, memory: ThreadMemory) -> Self {
        self.memory = memory;
        self
    }

    /// Replace the primary and fallback strategies
    pub fn with_strategies(
        mut self,
        primary: Arc<dyn ExecutionStrategy>,
        fallback: Arc<dyn ExecutionStrategy>,
    ) -> Self {
        self.primary = primary;
        self.fallback = fallback;
        self
    }

    pub fn memory(&self) -> &ThreadMemory {
        &self.memory
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Start `request` and return its event stream
    ///
    /// Must be called within a tokio runtime. Dropping the stream cancels the execution:
    /// nodes not yet started never run, checkpoint writes already in progress complete.
    pub fn stream(&self, request: ExecutionRequest) -> BridgeStream {
        let (tx, rx) = mpsc::channel(self.engine.config().event_buffer.max(1));
        let cancel = CancellationToken::new();

        let turn = Turn {
            engine: self.engine.clone(),
            config: Arc::clone(&self.config),
            memory: self.memory.clone(),
            session_id: request.session_id.clone(),
            out: tx,
            cancel: cancel.clone(),
            progress: 0,
            sent: HashSet::new(),
            paragraphs: Vec::new(),
            tokens: String::new(),
            response: None,
            failed: false,
        };
        let primary = Arc::clone(&self.primary);
        let fallback = Arc::clone(&self.fallback);
        tokio::spawn(turn.drive(request, primary, fallback));

        BridgeStream {
            inner: ReceiverStream::new(rx),
            cancel,
        }
    }
}

impl std::fmt::Debug for StreamingBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingBridge")
            .field("config", &self.config)
            .field("primary", &self.primary.name())
            .field("fallback", &self.fallback.name())
            .field("sessions", &self.memory.len())
            .finish()
    }
}

/// Ordered events of one execution
///
/// Ends after [`StreamEvent::Done`], or early once cancelled.
pub struct BridgeStream {
    inner: ReceiverStream<StreamEvent>,
    cancel: CancellationToken,
}

impl BridgeStream {
    /// Stop forwarding and cancel the execution
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Stream for BridgeStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for BridgeStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// State of one bridged execution
struct Turn {
    engine: Engine,
    config: Arc<BridgeConfig>,
    memory: ThreadMemory,
    session_id: String,
    out: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    progress: u8,
    /// Exact fragments sent in this execution
    sent: HashSet<String>,
    /// Paragraph fragments sent in this execution, with their tokens
    paragraphs: Vec<(String, HashSet<String>)>,
    tokens: String,
    response: Option<String>,
    /// Set when the execution failed without a usable result
    failed: bool,
}

impl Turn {
    async fn drive(
        mut self,
        request: ExecutionRequest,
        primary: Arc<dyn ExecutionStrategy>,
        fallback: Arc<dyn ExecutionStrategy>,
    ) {
        self.restore_memory(&request).await;

        self.progress(self.config.start_progress).await;
        if let Some(status) = self.config.start_status.clone() {
            self.send(StreamEvent::Status(status)).await;
        }

        match self.run_primary(primary.as_ref(), request.clone()).await {
            Ok(_) if self.has_output() => {}
            Ok(_) => {
                info!(session_id = %self.session_id, "No output from streamed execution, running blocking fallback");
                self.run_fallback(fallback.as_ref(), request).await;
            }
            Err(GraphError::Cancelled) => {}
            Err(err) if err.is_fatal() => {
                error!(session_id = %self.session_id, error = %err, "Execution failed");
                self.failed = true;
                self.send(StreamEvent::Status(format!("Execution failed: {}", err))).await;
            }
            Err(err) => {
                error!(
                    session_id = %self.session_id,
                    strategy = primary.name(),
                    error = %err,
                    "Streaming failed, falling back to {}",
                    fallback.name()
                );
                self.run_fallback(fallback.as_ref(), request).await;
            }
        }

        if self.cancel.is_cancelled() {
            debug!(session_id = %self.session_id, "Stream cancelled");
            return;
        }

        self.remember();
        if !self.failed {
            let completion = self.config.completion_status.clone();
            self.send(StreamEvent::Status(completion)).await;
        }
        self.progress(100).await;
        self.send(StreamEvent::Done).await;
    }

    /// Seed the previous response from the session's checkpoint on a resumed turn
    async fn restore_memory(&self, request: &ExecutionRequest) {
        if !request.resume || self.memory.contains(&self.session_id) {
            return;
        }
        let Some(store) = self.engine.checkpoint_store() else {
            return;
        };
        match store.load_optional(&self.session_id).await {
            Ok(Some(checkpoint)) => {
                if let Some(text) = checkpoint
                    .state
                    .get(&self.config.output_field)
                    .and_then(Value::as_str)
                {
                    self.memory.seed(&self.session_id, text);
                }
            }
            Ok(None) => {}
            Err(err) => debug!(error = %err, "Could not restore previous response"),
        }
    }

    async fn run_primary(
        &mut self,
        strategy: &dyn ExecutionStrategy,
        request: ExecutionRequest,
    ) -> Result<()> {
        let (sink, mut events) = EventSink::channel(self.engine.config().event_buffer);
        let run = strategy.run(request, sink, self.cancel.clone());
        tokio::pin!(run);

        // Drain events while the run progresses; the sink closes when the run returns.
        let result = loop {
            tokio::select! {
                biased;
                Some(event) = events.recv() => self.on_event(event).await,
                result = &mut run => break result,
            }
        };
        while let Ok(event) = events.try_recv() {
            self.on_event(event).await;
        }
        result.map(|_| ())
    }

    async fn run_fallback(&mut self, strategy: &dyn ExecutionStrategy, request: ExecutionRequest) {
        let (sink, _events) = EventSink::channel(1);
        match strategy.run(request, sink, self.cancel.clone()).await {
            Ok(outcome) => {
                let text = outcome
                    .output(&self.config.output_field)
                    .and_then(Value::as_str)
                    .map(str::to_string);
                match text {
                    Some(text) if !text.trim().is_empty() => self.single_fragment(&text).await,
                    _ => {
                        warn!(session_id = %self.session_id, "Fallback execution produced no output");
                        self.send(StreamEvent::Status("No output was produced.".to_string())).await;
                    }
                }
            }
            Err(GraphError::Cancelled) => {}
            Err(err) => {
                error!(session_id = %self.session_id, error = %err, "Fallback execution failed");
                self.failed = true;
                self.send(StreamEvent::Status(format!("Execution failed: {}", err))).await;
            }
        }
    }

    async fn on_event(&mut self, event: ExecutionEvent) {
        match event {
            ExecutionEvent::NodeFinished { node, delta } => {
                self.present(&node, &delta).await;
                if self.is_output_node(&node) {
                    let text = delta
                        .get(&self.config.output_field)
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    if let Some(text) = text {
                        if self.tokens.is_empty() {
                            self.paragraphs_of(&text).await;
                        } else {
                            self.response = Some(text.trim().to_string());
                        }
                    }
                }
            }
            ExecutionEvent::Token { node, text } => {
                if self.is_output_node(&node) && !text.is_empty() {
                    self.tokens.push_str(&text);
                    self.send(StreamEvent::Fragment(text)).await;
                }
            }
            ExecutionEvent::NodeFailed { node, error } => {
                self.send(StreamEvent::Status(format!("{} failed: {}", node, error)))
                    .await;
            }
            ExecutionEvent::LoopBudgetExhausted { node, budget } => {
                debug!(node = %node, budget, "Loop budget exhausted");
            }
            _ => {}
        }
    }

    /// Progress and status configured for a finished node
    async fn present(&mut self, node: &str, delta: &StateDelta) {
        let Some(presentation) = self.engine.plan().presentation(node).cloned() else {
            return;
        };
        if let Some(progress) = presentation.progress {
            self.progress(progress).await;
        }
        if let Some(template) = presentation.status {
            self.send(StreamEvent::Status(render_status(&template, node, delta)))
                .await;
        }
    }

    /// Paragraph fragments of a complete response
    async fn paragraphs_of(&mut self, text: &str) {
        let response = text.trim();
        if response.is_empty() {
            return;
        }
        self.response = Some(response.to_string());

        if self.memory.repeats_previous(&self.session_id, response) {
            info!(session_id = %self.session_id, "Response repeats the previous turn");
            self.placeholder().await;
            return;
        }

        let mut sent_any = false;
        for paragraph in split_paragraphs(response) {
            sent_any |= self.fragment(paragraph).await;
        }
        if !sent_any {
            info!(session_id = %self.session_id, "Every paragraph was already sent");
            self.placeholder().await;
        }
    }

    /// The fallback's whole response as one fragment
    async fn single_fragment(&mut self, text: &str) {
        let response = text.trim();
        self.response = Some(response.to_string());

        if self.memory.repeats_previous(&self.session_id, response)
            || !self.fragment(response.to_string()).await
        {
            self.placeholder().await;
        }
    }

    async fn placeholder(&mut self) {
        let placeholder = self.config.placeholder.clone();
        self.send(StreamEvent::Fragment(placeholder)).await;
    }

    /// Send a text fragment unless it repeats something already sent; true when sent
    async fn fragment(&mut self, text: String) -> bool {
        if !self.sent.insert(text.clone()) {
            debug!(session_id = %self.session_id, "Dropping exact duplicate fragment");
            return false;
        }

        let threshold = self.config.dedup_threshold;
        let tokens = tokenize(&text);
        let repeated_here = self
            .paragraphs
            .iter()
            .any(|(_, seen)| token_jaccard(&tokens, seen) >= threshold);
        if repeated_here || self.memory.is_near_duplicate(&self.session_id, &text, threshold) {
            debug!(session_id = %self.session_id, "Dropping near-duplicate fragment");
            return false;
        }

        self.paragraphs.push((text.clone(), tokens));
        self.send(StreamEvent::Fragment(text)).await;
        true
    }

    async fn progress(&mut self, value: u8) {
        let value = value.min(100);
        if value > self.progress {
            self.progress = value;
            self.send(StreamEvent::Progress(value)).await;
        }
    }

    /// Forward to the consumer; a closed consumer cancels the execution
    async fn send(&self, event: StreamEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        if self.out.send(event).await.is_err() {
            debug!(session_id = %self.session_id, "Consumer went away, cancelling");
            self.cancel.cancel();
        }
    }

    fn is_output_node(&self, node: &str) -> bool {
        self.config.output_nodes.iter().any(|n| n == node)
    }

    fn has_output(&self) -> bool {
        self.response.is_some() || !self.tokens.is_empty()
    }

    fn remember(&mut self) {
        let response = self
            .response
            .take()
            .or_else(|| (!self.tokens.is_empty()).then(|| self.tokens.clone()));
        let paragraphs = std::mem::take(&mut self.paragraphs)
            .into_iter()
            .map(|(text, _)| text);
        self.memory
            .remember(&self.session_id, paragraphs, response.as_deref());
    }
}

static PLACEHOLDER_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{(\w+)\}").unwrap());

/// Substitute `{node}` and top-level scalar fields of `delta` into `template`
///
/// Unknown placeholders are left as written.
pub fn render_status(template: &str, node: &str, delta: &StateDelta) -> String {
    PLACEHOLDER_REGEX
        .replace_all(template, |caps: &Captures| {
            let name = &caps[1];
            if name == "node" {
                return node.to_string();
            }
            match delta.get(name) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                Some(Value::Bool(b)) => b.to_string(),
                _ => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Non-empty, trimmed blocks separated by blank lines
pub fn split_paragraphs(text: &str) -> Vec<String> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stream_event_wire_shape() {
        assert_eq!(
            serde_json::to_value(StreamEvent::Progress(40)).unwrap(),
            json!({"kind": "progress", "payload": 40})
        );
        assert_eq!(
            serde_json::to_value(StreamEvent::Fragment("hi".into())).unwrap(),
            json!({"kind": "fragment", "payload": "hi"})
        );
        assert_eq!(
            serde_json::to_value(StreamEvent::Done).unwrap(),
            json!({"kind": "done"})
        );
    }

    #[test]
    fn test_render_status() {
        let delta = StateDelta::new()
            .with("disk_files", 3)
            .with("language", "python")
            .with("nested", json!({"a": 1}));

        assert_eq!(
            render_status("{node}: {disk_files} files ({language})", "build_context", &delta),
            "build_context: 3 files (python)"
        );
        assert_eq!(render_status("{nested} {missing}", "n", &delta), "{nested} {missing}");
        assert_eq!(render_status("Router done.", "router", &delta), "Router done.");
    }

    #[test]
    fn test_split_paragraphs() {
        assert_eq!(
            split_paragraphs("  First.\n\n\n\nSecond\nline.\n\n   \n\nThird. "),
            vec!["First.", "Second\nline.", "Third."]
        );
        assert!(split_paragraphs(" \n\n ").is_empty());
    }

    #[test]
    fn test_config_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.start_progress, 5);
        assert_eq!(config.dedup_threshold, 0.85);
        assert_eq!(config.output_field, "final_report");

        let parsed: BridgeConfig = serde_json::from_value(json!({"output_nodes": ["chat_reply"]})).unwrap();
        assert_eq!(parsed.output_nodes, vec!["chat_reply"]);
        assert_eq!(parsed.completion_status, config.completion_status);
    }
}
