//! # flowgraph-cli
//!
//! Wiring between [`FlowConfig`], the bundled review [`pipeline`] and a terminal.

pub mod output;
pub mod pipeline;

use flowgraph_checkpoint::{select_store, StoreTier};
use flowgraph_core::{ApproximateCache, Engine, FlowConfig, StreamingBridge};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Checkpoint directory used when nothing durable is configured
pub const DEFAULT_CHECKPOINT_DIR: &str = ".flowgraph/checkpoints";

/// Fill in what the CLI needs on top of the loaded configuration
///
/// Sessions must survive between invocations, so a file tier is configured when neither
/// Redis nor a directory was given. The pipeline's output nodes are always streamed.
pub fn apply_cli_defaults(config: &mut FlowConfig, checkpoint_dir: Option<PathBuf>) {
    if let Some(dir) = checkpoint_dir {
        config.checkpoint.file_dir = Some(dir);
    } else if config.checkpoint.redis_url.is_none() && config.checkpoint.file_dir.is_none() {
        config.checkpoint.file_dir = Some(PathBuf::from(DEFAULT_CHECKPOINT_DIR));
    }

    for node in pipeline::OUTPUT_NODES {
        if !config.bridge.output_nodes.iter().any(|n| n == node) {
            config.bridge.output_nodes.push(node.to_string());
        }
    }
}

/// Engine over the review pipeline with the selected checkpoint tier and a cache
pub async fn build_engine(config: &FlowConfig) -> flowgraph_core::Result<(Engine, StoreTier)> {
    let selected = select_store(&config.checkpoint).await;
    let cache = ApproximateCache::from_config(config.cache.clone());
    info!(
        tier = %selected.tier,
        embedder = cache.embedder_name(),
        "Pipeline ready"
    );

    let engine = Engine::new(pipeline::build_plan()?, pipeline::schema())
        .with_checkpoint_store(selected.store)
        .with_cache(Arc::new(cache))
        .with_config(config.engine.clone());
    Ok((engine, selected.tier))
}

/// Bridge over [`build_engine`]
pub async fn build_bridge(config: &FlowConfig) -> flowgraph_core::Result<StreamingBridge> {
    let (engine, _) = build_engine(config).await?;
    Ok(StreamingBridge::new(engine, config.bridge.clone()))
}
