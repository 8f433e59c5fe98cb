//! Query embedders
//!
//! [`HashedShingleEmbedder`] is local and deterministic: lowercased character 3-grams are
//! hashed into a fixed number of buckets and the vector is L2-normalised. It is not a
//! semantic model, but near-identical queries land close together. [`RemoteEmbedder`]
//! calls an OpenAI-compatible `/embeddings` endpoint; [`FallbackEmbedder`] wraps it so any
//! remote failure falls back to the local embedder.

use crate::error::CacheError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Dimensions of the local embedder
pub const DEFAULT_DIMENSIONS: usize = 256;

/// Text → fixed-dimension vector
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CacheError>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Hashed character-trigram embedder
#[derive(Debug, Clone)]
pub struct HashedShingleEmbedder {
    dimensions: usize,
}

impl HashedShingleEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Synchronous embedding; inputs shorter than three characters map to the zero vector
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let chars: Vec<char> = text.to_lowercase().chars().collect();
        if chars.len() < 3 {
            return vector;
        }

        for shingle in chars.windows(3) {
            let mut hasher = DefaultHasher::new();
            shingle.hash(&mut hasher);
            let bucket = (hasher.finish() % self.dimensions as u64) as usize;
            vector[bucket] += 1.0;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Default for HashedShingleEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSIONS)
    }
}

#[async_trait]
impl Embedder for HashedShingleEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CacheError> {
        Ok(self.embed_text(text))
    }

    fn name(&self) -> &'static str {
        "hashed-shingle"
    }
}

/// Connection settings for a remote embedding service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEmbedderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_ms: u64,
}

impl RemoteEmbedderConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            model: "text-embedding-3-small".to_string(),
            timeout_ms: 10_000,
        }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// OpenAI-compatible embedding client
#[derive(Debug, Clone)]
pub struct RemoteEmbedder {
    config: RemoteEmbedderConfig,
    client: reqwest::Client,
}

impl RemoteEmbedder {
    pub fn new(config: RemoteEmbedderConfig) -> Result<Self, CacheError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!("{}/embeddings", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CacheError> {
        let mut request = self.client.post(self.endpoint()).json(&EmbeddingRequest {
            model: &self.config.model,
            input: text,
        });
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CacheError::Remote(format!("{}: {}", status, body)));
        }

        let parsed: EmbeddingResponse = response.json().await?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|data| data.embedding)
            .filter(|embedding| !embedding.is_empty())
            .ok_or_else(|| CacheError::Embedding("response carried no embedding".to_string()))
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

/// Primary embedder with the local embedder as the unconditional fallback
pub struct FallbackEmbedder {
    primary: Arc<dyn Embedder>,
    fallback: HashedShingleEmbedder,
}

impl FallbackEmbedder {
    pub fn new(primary: Arc<dyn Embedder>, fallback: HashedShingleEmbedder) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl Embedder for FallbackEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CacheError> {
        match self.primary.embed(text).await {
            Ok(vector) => Ok(vector),
            Err(err) => {
                debug!(
                    embedder = self.primary.name(),
                    error = %err,
                    "Embedding failed, using local embedder"
                );
                Ok(self.fallback.embed_text(text))
            }
        }
    }

    fn name(&self) -> &'static str {
        "fallback"
    }
}

/// Cosine similarity; 0 for empty, zero or length-mismatched vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}
