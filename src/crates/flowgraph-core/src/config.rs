//! Layered configuration
//!
//! Built-in defaults, then an optional TOML file, then `FLOWGRAPH_*` environment variables.
//!
//! ```toml
//! [engine]
//! max_steps = 64
//! session_policy = "queue"
//!
//! [bridge]
//! output_nodes = ["synthesis", "chat_reply"]
//!
//! [cache]
//! capacity = 512
//!
//! [checkpoint]
//! file_dir = "./checkpoints"
//! ```
//!
//! | variable | field |
//! |----------|-------|
//! | `FLOWGRAPH_MAX_STEPS` | `engine.max_steps` |
//! | `FLOWGRAPH_NODE_TIMEOUT_MS` | `engine.node_timeout_ms` |
//! | `FLOWGRAPH_SESSION_POLICY` | `engine.session_policy` (`queue` or `reject`) |
//! | `FLOWGRAPH_DEDUP_THRESHOLD` | `bridge.dedup_threshold` |
//! | `FLOWGRAPH_CACHE_CAPACITY` | `cache.capacity` |
//! | `FLOWGRAPH_CACHE_MIN_SCORE` | `cache.min_score` |
//! | `FLOWGRAPH_EMBEDDING_URL` | `cache.embedding_url` |
//! | `FLOWGRAPH_EMBEDDING_API_KEY` | `cache.embedding_api_key` |
//! | `FLOWGRAPH_EMBEDDING_MODEL` | `cache.embedding_model` |
//! | `FLOWGRAPH_REDIS_URL` | `checkpoint.redis_url` |
//! | `FLOWGRAPH_CHECKPOINT_DIR` | `checkpoint.file_dir` |

use crate::bridge::BridgeConfig;
use crate::cache::CacheConfig;
use crate::engine::{EngineConfig, SessionPolicy};
use crate::error::ConfigError;
use flowgraph_checkpoint::CheckpointBackendConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

type Result<T> = std::result::Result<T, ConfigError>;

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "FLOWGRAPH_";

/// Complete runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub engine: EngineConfig,
    pub bridge: BridgeConfig,
    pub cache: CacheConfig,
    pub checkpoint: CheckpointBackendConfig,
}

impl FlowConfig {
    /// Parse TOML; missing sections and fields keep their defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Defaults, the file at `path` if given, then the process environment; validated
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `FLOWGRAPH_*` variables from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides read through `lookup`, which receives full variable names
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| {
            let name = format!("{}{}", ENV_PREFIX, suffix);
            lookup(&name).map(|value| (name, value))
        };

        if let Some((name, value)) = var("MAX_STEPS") {
            self.engine.max_steps = parse(&name, &value)?;
        }
        if let Some((name, value)) = var("NODE_TIMEOUT_MS") {
            self.engine.node_timeout_ms = Some(parse(&name, &value)?);
        }
        if let Some((name, value)) = var("SESSION_POLICY") {
            self.engine.session_policy = match value.to_ascii_lowercase().as_str() {
                "queue" => SessionPolicy::Queue,
                "reject" => SessionPolicy::Reject,
                _ => return Err(ConfigError::Env { var: name, value }),
            };
        }
        if let Some((name, value)) = var("DEDUP_THRESHOLD") {
            self.bridge.dedup_threshold = parse(&name, &value)?;
        }
        if let Some((name, value)) = var("CACHE_CAPACITY") {
            self.cache.capacity = parse(&name, &value)?;
        }
        if let Some((name, value)) = var("CACHE_MIN_SCORE") {
            self.cache.min_score = parse(&name, &value)?;
        }
        if let Some((_, value)) = var("EMBEDDING_URL") {
            self.cache.embedding_url = non_empty(value);
        }
        if let Some((_, value)) = var("EMBEDDING_API_KEY") {
            self.cache.embedding_api_key = non_empty(value);
        }
        if let Some((_, value)) = var("EMBEDDING_MODEL") {
            self.cache.embedding_model = value;
        }
        if let Some((_, value)) = var("REDIS_URL") {
            self.checkpoint.redis_url = non_empty(value);
        }
        if let Some((_, value)) = var("CHECKPOINT_DIR") {
            self.checkpoint.file_dir = non_empty(value).map(PathBuf::from);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.max_steps == 0 {
            return Err(ConfigError::Invalid("engine.max_steps must be greater than 0".into()));
        }
        if self.engine.event_buffer == 0 {
            return Err(ConfigError::Invalid("engine.event_buffer must be greater than 0".into()));
        }

        let threshold = self.bridge.dedup_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "bridge.dedup_threshold must be in (0, 1], got {}",
                threshold
            )));
        }
        if self.bridge.start_progress > 100 {
            return Err(ConfigError::Invalid(format!(
                "bridge.start_progress must be at most 100, got {}",
                self.bridge.start_progress
            )));
        }
        if self.bridge.output_field.is_empty() {
            return Err(ConfigError::Invalid("bridge.output_field cannot be empty".into()));
        }

        if self.cache.capacity == 0 {
            return Err(ConfigError::Invalid("cache.capacity must be greater than 0".into()));
        }
        if self.cache.eviction_batch == 0 || self.cache.eviction_batch > self.cache.capacity {
            return Err(ConfigError::Invalid(format!(
                "cache.eviction_batch must be between 1 and capacity ({}), got {}",
                self.cache.capacity, self.cache.eviction_batch
            )));
        }
        if !(0.0..=1.0).contains(&self.cache.min_score) {
            return Err(ConfigError::Invalid(format!(
                "cache.min_score must be in [0, 1], got {}",
                self.cache.min_score
            )));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        var: name.to_string(),
        value: value.to_string(),
    })
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
