//! Shared stubs for integration tests
#![allow(dead_code)]

use agent_playbook::backend::{BackendError, BackingStore, InMemoryBackend, VersionedBlob};
use agent_playbook::embeddings::{Embedder, EmbeddingError, LexicalEmbedder};
use agent_playbook::model::{ModelClient, ModelError};
use agent_playbook::playbook::{
    Curator, Extractor, LearningPipeline, PlaybookMiddleware, PlaybookStore, ReflectionQueue,
    Reflector, ReflectorConfig,
};
use agent_playbook::AgentConfigs;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Replies `<LABEL>: <last user message>` after `delay`
pub struct EchoModel {
    pub label: &'static str,
    pub delay: Duration,
}

impl EchoModel {
    pub fn helpful() -> Arc<Self> {
        Arc::new(Self {
            label: "HELPFUL",
            delay: Duration::ZERO,
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            label: "HELPFUL",
            delay,
        })
    }
}

#[async_trait]
impl ModelClient for EchoModel {
    fn name(&self) -> &str {
        "echo"
    }

    async fn call(&self, prompt: &str, _timeout: Duration) -> Result<String, ModelError> {
        tokio::time::sleep(self.delay).await;
        let lesson = prompt
            .lines()
            .filter_map(|l| l.trim().strip_prefix("[user] "))
            .last()
            .unwrap_or("");
        if lesson.is_empty() {
            return Ok(String::new());
        }
        Ok(format!("{}: {}", self.label, lesson))
    }
}

/// Fixed vectors for known texts, lexical embedding for the rest
pub struct TableEmbedder {
    table: HashMap<String, Vec<f32>>,
    fallback: LexicalEmbedder,
}

impl TableEmbedder {
    pub fn new(rows: &[(&str, Vec<f32>)]) -> Arc<Self> {
        Arc::new(Self {
            table: rows.iter().map(|(t, v)| (t.to_string(), v.clone())).collect(),
            fallback: LexicalEmbedder::new(256),
        })
    }
}

#[async_trait]
impl Embedder for TableEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if let Some(v) = self.table.get(text.trim()) {
            return Ok(v.clone());
        }
        // Known vectors are 3-dimensional; keep unknown text orthogonal to them
        let mut v = vec![0.0; 3];
        v.extend(self.fallback.embed(text).await?);
        Ok(v)
    }
}

/// In-memory backend whose writes can be made to fail
#[derive(Default)]
pub struct FlakyBackend {
    inner: InMemoryBackend,
    pub fail_puts: AtomicBool,
}

impl FlakyBackend {
    pub fn set_failing(&self, failing: bool) {
        self.fail_puts.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl BackingStore for FlakyBackend {
    async fn get(&self, ns: &str, key: &str) -> Result<Option<VersionedBlob>, BackendError> {
        self.inner.get(ns, key).await
    }

    async fn put(&self, ns: &str, key: &str, version: u64, blob: Vec<u8>) -> Result<(), BackendError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("write refused".to_string()));
        }
        self.inner.put(ns, key, version, blob).await
    }

    async fn get_version(&self, ns: &str, key: &str, version: u64) -> Result<Option<VersionedBlob>, BackendError> {
        self.inner.get_version(ns, key, version).await
    }

    async fn list_versions(&self, ns: &str, key: &str) -> Result<Vec<u64>, BackendError> {
        self.inner.list_versions(ns, key).await
    }
}

/// Full learning loop over the given collaborators
pub fn learning_stack(
    model: Arc<dyn ModelClient>,
    embedder: Arc<dyn Embedder>,
    backend: Arc<dyn BackingStore>,
    configs: AgentConfigs,
) -> PlaybookMiddleware {
    let store = Arc::new(PlaybookStore::new(backend, "playbooks", configs));
    let reflector = Reflector::with_config(
        model,
        Extractor::direct(),
        ReflectorConfig {
            model_timeout: Duration::from_secs(30),
            ..Default::default()
        },
    );
    let pipeline = Arc::new(LearningPipeline::new(
        reflector,
        Curator::new(embedder),
        store.clone(),
    ));
    let queue = Arc::new(ReflectionQueue::new(pipeline, 32));
    PlaybookMiddleware::new(store, queue)
}

/// Learning loop with an in-memory store and lexical embeddings
pub fn default_stack(model: Arc<dyn ModelClient>) -> PlaybookMiddleware {
    learning_stack(
        model,
        Arc::new(LexicalEmbedder::default()),
        Arc::new(InMemoryBackend::new()),
        AgentConfigs::default(),
    )
}
