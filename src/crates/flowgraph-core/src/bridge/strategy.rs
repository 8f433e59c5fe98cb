//! How the bridge obtains an execution
//!
//! The bridge drives a primary [`ExecutionStrategy`] and, when it fails or finishes without
//! output, one fallback. Both see the same request; only the streaming one reports events.

use crate::engine::{Engine, ExecutionOutcome, ExecutionRequest};
use crate::error::Result;
use crate::events::EventSink;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// One way of running a request to completion
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    /// Run `request`. Strategies that stream report through `events`; others drop it.
    async fn run(
        &self,
        request: ExecutionRequest,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome>;

    fn name(&self) -> &'static str;
}

/// Event-driven execution: lifecycle events flow to the bridge while nodes run
#[derive(Debug, Clone)]
pub struct StreamingStrategy {
    engine: Engine,
}

impl StreamingStrategy {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl ExecutionStrategy for StreamingStrategy {
    async fn run(
        &self,
        request: ExecutionRequest,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome> {
        self.engine.execute(request, Some(events), cancel).await
    }

    fn name(&self) -> &'static str {
        "streaming"
    }
}

/// One-shot execution; only the final state is used
#[derive(Debug, Clone)]
pub struct BlockingStrategy {
    engine: Engine,
}

impl BlockingStrategy {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl ExecutionStrategy for BlockingStrategy {
    async fn run(
        &self,
        request: ExecutionRequest,
        _events: EventSink,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome> {
        self.engine.execute(request, None, cancel).await
    }

    fn name(&self) -> &'static str {
        "blocking"
    }
}
