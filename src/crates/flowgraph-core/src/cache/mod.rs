//! Approximate-match cache for expensive handler work
//!
//! Handlers memoize results (model answers, analysis reports) under a query string. The
//! query is embedded, and a lookup returns the closest stored value in the same namespace
//! when its cosine similarity clears `min_score`.
//!
//! The cache is strictly an optimization: every failure is logged at `debug` and reported
//! as a miss, so callers always fall through to the real computation.
//!
//! # Eviction
//!
//! Each namespace holds at most `capacity` entries. Inserting past capacity removes the
//! `eviction_batch` oldest entries at once.
//!
//! ```rust
//! use flowgraph_core::cache::{ApproximateCache, CacheConfig};
//! use serde_json::json;
//!
//! # async fn example() {
//! let cache = ApproximateCache::local(CacheConfig::default());
//! cache.set("review|fn main() {}", json!({"issues": 0}), "synthesis").await;
//!
//! let hit = cache.get("review|fn main() {}", "synthesis", 0.93).await;
//! assert_eq!(hit.map(|h| h.value), Some(json!({"issues": 0})));
//! # }
//! ```

mod embedder;

pub use embedder::{
    cosine_similarity, Embedder, FallbackEmbedder, HashedShingleEmbedder, RemoteEmbedder,
    RemoteEmbedderConfig, DEFAULT_DIMENSIONS,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Default similarity threshold
pub const DEFAULT_MIN_SCORE: f32 = 0.92;

/// Stricter threshold for analysis-result namespaces
pub const ANALYSIS_MIN_SCORE: f32 = 0.93;

/// Default upper bound on a canonical query string
pub const MAX_QUERY_LEN: usize = 4000;

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum entries per namespace
    pub capacity: usize,

    /// Entries removed at once when a namespace overflows
    pub eviction_batch: usize,

    /// Threshold used by [`ApproximateCache::lookup`]
    pub min_score: f32,

    /// OpenAI-compatible embedding endpoint; local embedding when unset
    pub embedding_url: Option<String>,

    pub embedding_api_key: Option<String>,

    pub embedding_model: String,

    pub embedding_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 512,
            eviction_batch: 64,
            min_score: DEFAULT_MIN_SCORE,
            embedding_url: None,
            embedding_api_key: None,
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_timeout_ms: 10_000,
        }
    }
}

/// Stored record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub namespace: String,
    pub embedding: Vec<f32>,
    pub value: Value,
    pub created_at: DateTime<Utc>,
}

/// Successful lookup
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub value: Value,
    pub score: f32,
}

/// Cache metrics
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub hits: usize,
    pub misses: usize,
    pub evictions: usize,
    pub entries: usize,
}

impl CacheMetrics {
    /// Calculate hit ratio
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Namespace-scoped approximate cache
pub struct ApproximateCache {
    embedder: Arc<dyn Embedder>,
    storage: Arc<RwLock<HashMap<String, Vec<CacheEntry>>>>,
    config: CacheConfig,
    metrics: Arc<RwLock<CacheMetrics>>,
}

impl ApproximateCache {
    pub fn new(embedder: Arc<dyn Embedder>, config: CacheConfig) -> Self {
        Self {
            embedder,
            storage: Arc::new(RwLock::new(HashMap::new())),
            config,
            metrics: Arc::new(RwLock::new(CacheMetrics::default())),
        }
    }

    /// Cache backed by the local shingle embedder
    pub fn local(config: CacheConfig) -> Self {
        Self::new(Arc::new(HashedShingleEmbedder::default()), config)
    }

    /// Cache with the embedder selected by configuration
    pub fn from_config(config: CacheConfig) -> Self {
        Self::new(build_embedder(&config), config)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn embedder_name(&self) -> &'static str {
        self.embedder.name()
    }

    /// Best match in `namespace` scoring at least `min_score`
    pub async fn get(&self, query: &str, namespace: &str, min_score: f32) -> Option<CacheHit> {
        let hit = match self.embedder.embed(query).await {
            Ok(query_vector) => {
                let storage = self.storage.read().await;
                storage
                    .get(namespace)
                    .and_then(|entries| best_match(entries, &query_vector))
                    .filter(|hit| hit.score >= min_score)
            }
            Err(err) => {
                debug!(namespace, error = %err, "Cache lookup failed, treating as miss");
                None
            }
        };

        let mut metrics = self.metrics.write().await;
        if hit.is_some() {
            metrics.hits += 1;
        } else {
            metrics.misses += 1;
        }
        hit
    }

    /// [`get`](Self::get) with the configured default threshold
    pub async fn lookup(&self, query: &str, namespace: &str) -> Option<CacheHit> {
        self.get(query, namespace, self.config.min_score).await
    }

    /// Store `value` under `query`. Failures are logged and dropped.
    pub async fn set(&self, query: &str, value: Value, namespace: &str) {
        let embedding = match self.embedder.embed(query).await {
            Ok(embedding) => embedding,
            Err(err) => {
                debug!(namespace, error = %err, "Cache store failed, entry dropped");
                return;
            }
        };

        let entry = CacheEntry {
            namespace: namespace.to_string(),
            embedding,
            value,
            created_at: Utc::now(),
        };

        let mut storage = self.storage.write().await;
        let entries = storage.entry(namespace.to_string()).or_default();
        entries.push(entry);

        let mut evicted = 0;
        if entries.len() > self.config.capacity {
            // Entries are appended in time order, so the front holds the oldest.
            let batch = self.config.eviction_batch.clamp(1, entries.len());
            entries.drain(..batch);
            evicted = batch;
            debug!(namespace, evicted, "Evicted oldest cache entries");
        }
        let total = storage.values().map(Vec::len).sum();
        drop(storage);

        let mut metrics = self.metrics.write().await;
        metrics.evictions += evicted;
        metrics.entries = total;
    }

    /// Number of entries in `namespace`
    pub async fn len(&self, namespace: &str) -> usize {
        self.storage
            .read()
            .await
            .get(namespace)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub async fn is_empty(&self) -> bool {
        self.storage.read().await.values().all(Vec::is_empty)
    }

    pub async fn clear(&self) {
        self.storage.write().await.clear();
        self.metrics.write().await.entries = 0;
    }

    pub async fn metrics(&self) -> CacheMetrics {
        self.metrics.read().await.clone()
    }
}

impl std::fmt::Debug for ApproximateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApproximateCache")
            .field("embedder", &self.embedder.name())
            .field("config", &self.config)
            .finish()
    }
}

fn best_match(entries: &[CacheEntry], query: &[f32]) -> Option<CacheHit> {
    let mut best: Option<(&CacheEntry, f32)> = None;
    for entry in entries {
        let score = cosine_similarity(query, &entry.embedding);
        if best.map_or(score > 0.0, |(_, best_score)| score > best_score) {
            best = Some((entry, score));
        }
    }
    best.map(|(entry, score)| CacheHit {
        value: entry.value.clone(),
        score,
    })
}

/// Local embedder, or remote-with-local-fallback when an endpoint is configured
pub fn build_embedder(config: &CacheConfig) -> Arc<dyn Embedder> {
    let local = HashedShingleEmbedder::default();
    let Some(url) = &config.embedding_url else {
        return Arc::new(local);
    };

    let remote_config = RemoteEmbedderConfig {
        base_url: url.clone(),
        api_key: config.embedding_api_key.clone(),
        model: config.embedding_model.clone(),
        timeout_ms: config.embedding_timeout_ms,
    };
    match RemoteEmbedder::new(remote_config) {
        Ok(remote) => Arc::new(FallbackEmbedder::new(Arc::new(remote), local)),
        Err(err) => {
            warn!(error = %err, "Remote embedder unavailable, using local embedder");
            Arc::new(local)
        }
    }
}

/// Canonical query: non-empty parts joined with `|`, cut to `max_len` bytes on a char boundary
pub fn build_query_string<S: AsRef<str>>(parts: &[S], max_len: usize) -> String {
    let mut query = parts
        .iter()
        .map(AsRef::as_ref)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("|");

    if query.len() > max_len {
        let mut cut = max_len;
        while !query.is_char_boundary(cut) {
            cut -= 1;
        }
        query.truncate(cut);
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use async_trait::async_trait;
    use serde_json::json;

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, CacheError> {
            Err(CacheError::Embedding("model offline".into()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn small_config(capacity: usize, eviction_batch: usize) -> CacheConfig {
        CacheConfig {
            capacity,
            eviction_batch,
            ..CacheConfig::default()
        }
    }

    #[tokio::test]
    async fn test_exact_query_hits() {
        let cache = ApproximateCache::local(CacheConfig::default());
        cache.set("python|eval(x)", json!("report"), "synthesis").await;

        let hit = cache.get("python|eval(x)", "synthesis", ANALYSIS_MIN_SCORE).await.unwrap();
        assert_eq!(hit.value, json!("report"));
        assert!(hit.score > 0.99);
    }

    #[tokio::test]
    async fn test_near_query_hits_and_distant_misses() {
        let cache = ApproximateCache::local(CacheConfig::default());
        cache
            .set("explain the sql injection in the login handler", json!(1), "chat")
            .await;

        assert!(cache
            .lookup("explain the sql injection in the login handler?", "chat")
            .await
            .is_some());
        assert!(cache.lookup("summarize the weather report", "chat").await.is_none());
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let cache = ApproximateCache::local(CacheConfig::default());
        cache.set("same query", json!("a"), "ns_a").await;

        assert!(cache.lookup("same query", "ns_b").await.is_none());
        assert_eq!(cache.len("ns_a").await, 1);
        assert_eq!(cache.len("ns_b").await, 0);
    }

    #[tokio::test]
    async fn test_best_match_wins() {
        let cache = ApproximateCache::local(CacheConfig::default());
        cache.set("review handler for injection bugs", json!("close"), "ns").await;
        cache.set("review handler for injection bugs now", json!("closer"), "ns").await;

        let hit = cache
            .get("review handler for injection bugs now!", "ns", 0.5)
            .await
            .unwrap();
        assert_eq!(hit.value, json!("closer"));
    }

    #[tokio::test]
    async fn test_bulk_eviction_of_oldest() {
        let cache = ApproximateCache::local(small_config(8, 3));
        for i in 0..9 {
            cache.set(&format!("query number {i} with padding"), json!(i), "ns").await;
        }

        // 9 > 8 triggers one batch of 3: entries 0..3 are gone.
        assert_eq!(cache.len("ns").await, 6);
        assert!(cache.get("query number 0 with padding", "ns", 0.999).await.is_none());
        let hit = cache.get("query number 8 with padding", "ns", 0.999).await.unwrap();
        assert_eq!(hit.value, json!(8));

        let metrics = cache.metrics().await;
        assert_eq!(metrics.evictions, 3);
        assert_eq!(metrics.entries, 6);
    }

    #[tokio::test]
    async fn test_embedder_failure_is_miss() {
        let cache = ApproximateCache::new(Arc::new(FailingEmbedder), CacheConfig::default());
        cache.set("anything", json!(1), "ns").await;

        assert!(cache.lookup("anything", "ns").await.is_none());
        assert!(cache.is_empty().await);
        assert_eq!(cache.metrics().await.misses, 1);
    }

    #[tokio::test]
    async fn test_hit_ratio() {
        let cache = ApproximateCache::local(CacheConfig::default());
        cache.set("cached question text", json!(true), "ns").await;
        cache.lookup("cached question text", "ns").await;
        cache.lookup("a completely different prompt", "ns").await;

        let metrics = cache.metrics().await;
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
        assert!((metrics.hit_ratio() - 0.5).abs() < f64::EPSILON);
        assert_eq!(CacheMetrics::default().hit_ratio(), 0.0);
    }

    #[test]
    fn test_build_query_string() {
        assert_eq!(build_query_string(&["python", "", "eval(x)"], MAX_QUERY_LEN), "python|eval(x)");
        assert_eq!(build_query_string(&["abcdef"], 3), "abc");
        // 'é' is two bytes; the cut backs off to a char boundary.
        assert_eq!(build_query_string(&["aé"], 2), "a");
        assert_eq!(build_query_string::<&str>(&[], 10), "");
    }

    #[test]
    fn test_local_embedder_without_url() {
        assert_eq!(build_embedder(&CacheConfig::default()).name(), "hashed-shingle");

        let config = CacheConfig {
            embedding_url: Some("http://localhost:1".into()),
            ..CacheConfig::default()
        };
        assert_eq!(build_embedder(&config).name(), "fallback");
    }
}
