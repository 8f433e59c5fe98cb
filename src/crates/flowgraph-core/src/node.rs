//! Node handlers and the context they run with
//!
//! A handler is an async function `(State, NodeContext) -> Result<StateDelta, NodeError>`.
//! It receives a snapshot of the state taken when the node became runnable and returns
//! only the fields it wants to change.

use crate::cache::ApproximateCache;
use crate::error::NodeError;
use crate::events::{EventSink, ExecutionEvent};
use crate::state::{State, StateDelta};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Result of one handler invocation
pub type NodeResult = Result<StateDelta, NodeError>;

/// Type-erased node handler
pub type NodeHandler = Arc<dyn Fn(State, NodeContext) -> BoxFuture<'static, NodeResult> + Send + Sync>;

/// Box an async closure into a [`NodeHandler`]
///
/// ```rust
/// use flowgraph_core::node::handler;
/// use flowgraph_core::StateDelta;
///
/// let h = handler(|state, _ctx| async move {
///     let code = state.get_str("code").unwrap_or_default().to_string();
///     Ok(StateDelta::new().with("length", code.len()))
/// });
/// ```
pub fn handler<F, Fut>(f: F) -> NodeHandler
where
    F: Fn(State, NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = NodeResult> + Send + 'static,
{
    Arc::new(move |state, ctx| Box::pin(f(state, ctx)))
}

/// Per-invocation context handed to a handler
#[derive(Clone)]
pub struct NodeContext {
    session_id: Arc<str>,
    node: Arc<str>,
    attempt: usize,
    events: Option<EventSink>,
    cache: Option<Arc<ApproximateCache>>,
    cancel: CancellationToken,
}

impl NodeContext {
    pub(crate) fn new(
        session_id: Arc<str>,
        node: Arc<str>,
        events: Option<EventSink>,
        cache: Option<Arc<ApproximateCache>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            node,
            attempt: 1,
            events,
            cache,
            cancel,
        }
    }

    /// Context for calling a handler outside the engine, e.g. in unit tests
    pub fn detached(session_id: &str, node: &str) -> Self {
        Self::new(
            Arc::from(session_id),
            Arc::from(node),
            None,
            None,
            CancellationToken::new(),
        )
    }

    pub(crate) fn with_attempt(mut self, attempt: usize) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// 1-based attempt number under the node's retry policy
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Shared approximate cache, when the engine was given one
    pub fn cache(&self) -> Option<&ApproximateCache> {
        self.cache.as_deref()
    }

    /// True once the execution was cancelled. Long handlers may stop early.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stream a piece of incremental output (e.g. a model token)
    pub async fn emit_token(&self, text: impl Into<String>) {
        if let Some(events) = &self.events {
            events
                .emit(ExecutionEvent::Token {
                    node: self.node.to_string(),
                    text: text.into(),
                })
                .await;
        }
    }

    /// Whether anyone receives streamed tokens
    pub fn is_streaming(&self) -> bool {
        self.events.as_ref().is_some_and(|events| !events.is_closed())
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("session_id", &self.session_id)
            .field("node", &self.node)
            .field("attempt", &self.attempt)
            .field("streaming", &self.events.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_handler_boxing() {
        let h = handler(|state, ctx| async move {
            let code = state.get_str("code").unwrap_or_default().to_string();
            Ok(StateDelta::new()
                .with("seen_by", ctx.node())
                .with("length", code.len()))
        });

        let state = State::from_value(json!({"code": "eval(x)"})).unwrap();
        let delta = h(state, NodeContext::detached("s", "measure")).await.unwrap();
        assert_eq!(delta.get("length"), Some(&json!(7)));
        assert_eq!(delta.get("seen_by"), Some(&json!("measure")));
    }

    #[tokio::test]
    async fn test_emit_token_reaches_sink() {
        let (sink, mut rx) = EventSink::channel(4);
        let ctx = NodeContext::new(
            Arc::from("s"),
            Arc::from("synthesis"),
            Some(sink),
            None,
            CancellationToken::new(),
        );

        assert!(ctx.is_streaming());
        ctx.emit_token("Hello").await;
        assert_eq!(
            rx.recv().await,
            Some(ExecutionEvent::Token {
                node: "synthesis".into(),
                text: "Hello".into()
            })
        );
    }

    #[tokio::test]
    async fn test_detached_context_drops_tokens() {
        let ctx = NodeContext::detached("s", "n");
        assert!(!ctx.is_streaming());
        assert!(ctx.cache().is_none());
        ctx.emit_token("ignored").await;
    }
}
