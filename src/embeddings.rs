//! Vector Embeddings for Semantic De-duplication
//!
//! Provides semantic similarity between playbook entries and new insights.
//! Uses local embeddings via Ollama when configured, with a deterministic
//! lexical embedder that needs no external service.
//!
//! Includes LRU caching for embeddings to reduce latency: playbook entries
//! are re-embedded on every curation pass, so the cache hit rate is high.
//!
//! A failed Ollama request marks the service down. Calls fail fast until
//! `retry_after` has passed, then the next call checks `/api/tags` again.

use async_trait::async_trait;
use moka::future::Cache;
use parking_lot::Mutex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Embedding errors
#[derive(Error, Debug, Clone)]
pub enum EmbeddingError {
    #[error("Embedding service unavailable")]
    Unavailable,
    #[error("Embedding request failed: {0}")]
    Request(String),
    #[error("Empty text cannot be embedded")]
    EmptyText,
}

/// Turns text into a vector for similarity comparison
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Ollama embedder configuration
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Ollama API URL
    pub ollama_url: String,
    /// Embedding model name
    pub model: String,
    /// Request timeout
    pub timeout: Duration,
    /// Cache capacity (entries)
    pub cache_capacity: u64,
    /// Cache TTL
    pub cache_ttl: Duration,
    /// How long to fail fast after a failed request before probing again
    pub retry_after: Duration,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            ollama_url: std::env::var("OLLAMA_URL")
                .unwrap_or_else(|_| "http://localhost:11434".to_string()),
            model: std::env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| "nomic-embed-text".to_string()),
            timeout: Duration::from_secs(30),
            cache_capacity: 1000,
            cache_ttl: Duration::from_secs(3600),
            retry_after: Duration::from_secs(30),
        }
    }
}

/// Ollama embedding response
#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

/// Embedder backed by Ollama `/api/embeddings`
pub struct OllamaEmbedder {
    config: EmbeddingConfig,
    client: reqwest::Client,
    available: AtomicBool,
    /// When the service was last seen failing
    down_since: Mutex<Option<Instant>>,
    /// LRU cache for embeddings
    cache: Cache<String, Vec<f32>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl OllamaEmbedder {
    /// Create a new Ollama embedder
    pub fn new(config: EmbeddingConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let cache = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(config.cache_ttl)
            .build();

        Self {
            config,
            client,
            available: AtomicBool::new(true),
            down_since: Mutex::new(None),
            cache,
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(EmbeddingConfig::default())
    }

    /// Get cache statistics (hits, misses)
    pub fn cache_stats(&self) -> (u64, u64) {
        (
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed),
        )
    }

    /// Check if Ollama is available and remember the answer
    pub async fn check_availability(&self) -> bool {
        let available = match self.client
            .get(format!("{}/api/tags", self.config.ollama_url))
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        };
        if available {
            *self.down_since.lock() = None;
            self.available.store(true, Ordering::Relaxed);
        } else {
            self.mark_unavailable();
        }
        available
    }

    /// Check cached availability (fast, non-blocking)
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    fn mark_unavailable(&self) {
        self.available.store(false, Ordering::Relaxed);
        *self.down_since.lock() = Some(Instant::now());
    }

    /// Available now, or down long enough that a fresh check succeeds
    async fn ready(&self) -> bool {
        if self.is_available() {
            return true;
        }

        {
            let mut down_since = self.down_since.lock();
            if let Some(since) = *down_since {
                if since.elapsed() < self.config.retry_after {
                    return false;
                }
            }
            // Restart the window so concurrent callers do not all re-check
            *down_since = Some(Instant::now());
        }

        debug!("Re-checking embedding service at {}", self.config.ollama_url);
        self.check_availability().await
    }

    async fn embed_uncached(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let url = format!("{}/api/embeddings", self.config.ollama_url);

        let response = self.client
            .post(&url)
            .json(&serde_json::json!({
                "model": self.config.model,
                "prompt": text
            }))
            .send()
            .await
            .map_err(|e| {
                self.mark_unavailable();
                EmbeddingError::Request(e.to_string())
            })?;

        if !response.status().is_success() {
            let status = response.status();
            self.mark_unavailable();
            warn!("Embedding request failed with status {}", status);
            return Err(EmbeddingError::Request(format!("status {}", status)));
        }

        let result: OllamaEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Request(e.to_string()))?;

        Ok(result.embedding)
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let cache_key = text.trim().to_string();
        if cache_key.is_empty() {
            return Err(EmbeddingError::EmptyText);
        }

        if let Some(cached) = self.cache.get(&cache_key).await {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached);
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        if !self.ready().await {
            return Err(EmbeddingError::Unavailable);
        }

        let embedding = self.embed_uncached(&cache_key).await?;
        self.cache.insert(cache_key, embedding.clone()).await;

        Ok(embedding)
    }
}

/// Words that carry no meaning for strategy comparison
const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "if", "then", "of", "to", "in", "on", "for", "with",
    "at", "by", "from", "as", "is", "are", "was", "were", "be", "been", "it", "its", "this",
    "that", "these", "those", "you", "your", "we", "our", "should", "when", "into", "than",
];

/// Deterministic feature-hashed bag-of-words embedder
///
/// No external service, same output for the same text on every machine.
/// Good at catching rephrasings that share vocabulary, blind to synonyms.
#[derive(Debug, Clone)]
pub struct LexicalEmbedder {
    dimension: usize,
}

impl LexicalEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(16),
        }
    }

    /// Lowercase alphanumeric tokens, stop words removed, plurals folded
    pub fn tokenize(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty() && !STOP_WORDS.contains(w))
            .map(stem)
            .collect()
    }

    fn bucket(&self, token: &str) -> (usize, f32) {
        let digest = Sha256::digest(token.as_bytes());
        let mut idx = [0u8; 8];
        idx.copy_from_slice(&digest[..8]);
        let index = (u64::from_le_bytes(idx) % self.dimension as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        (index, sign)
    }

    /// Embed synchronously
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in Self::tokenize(text) {
            let (index, sign) = self.bucket(&token);
            vector[index] += sign;
        }
        vector
    }
}

impl Default for LexicalEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

fn stem(word: &str) -> String {
    if word.len() > 4 && word.ends_with("ies") {
        format!("{}y", &word[..word.len() - 3])
    } else if word.len() > 3 && word.ends_with('s') && !word.ends_with("ss") {
        word[..word.len() - 1].to_string()
    } else {
        word.to_string()
    }
}

#[async_trait]
impl Embedder for LexicalEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyText);
        }
        let vector = self.embed_sync(text);
        if vector.iter().all(|v| *v == 0.0) {
            // Only stop words: still comparable, just never similar
            debug!("Lexical embedding is all zeros for '{}'", text);
        }
        Ok(vector)
    }
}

/// Build the embedder for a process: Ollama when reachable, lexical otherwise
pub async fn default_embedder(config: EmbeddingConfig) -> std::sync::Arc<dyn Embedder> {
    let ollama = OllamaEmbedder::new(config);
    if ollama.check_availability().await {
        std::sync::Arc::new(ollama)
    } else {
        warn!("Embedding service unavailable - using lexical similarity");
        std::sync::Arc::new(LexicalEmbedder::default())
    }
}
