//! Playbook Learning Loop
//!
//! Self-improving memory for agent steps:
//! - **Schemas**: entries, states, deltas, confidence and prompt rendering
//! - **Extractor**: typed values out of model text, with a deterministic fallback
//! - **Reflector**: insights from one execution trace
//! - **Curator**: insights merged into a delta by semantic de-duplication
//! - **Store**: versioned per-agent playbooks with capacity pruning
//! - **Queue**: per-agent FIFO background learning
//! - **Middleware**: injection before a step, reflection after it
//!
//! ```text
//! caller ──► WrappedStep ──► store.get ──► inject ──► step ──► result
//!                                                      │
//!                                    trace ──► queue ──┘ (background)
//!                                                │
//!                          reflect ──► curate ──► apply_delta
//! ```

pub mod curator;
pub mod extractor;
pub mod middleware;
pub mod queue;
pub mod reflector;
pub mod schemas;
pub mod store;

pub use curator::Curator;
pub use extractor::{
    DirectJson, Extractable, Extracted, ExtractionBackend, ExtractionError, ExtractionMethod,
    ExtractionStrategy, Extractor, InsightBatch, ModelStructuring, SchemaSpec,
};
pub use middleware::{
    step_fn, AgentStep, FnStep, Message, PlaybookMiddleware, StepInput, StepOutput, SubStep,
    WrappedStep,
};
pub use queue::{LearningPipeline, LearningStats, PipelineOutcome, QueueError, ReflectionQueue};
pub use reflector::{ExecutionTrace, Reflector, ReflectorConfig};
pub use schemas::{
    format_for_prompt, laplace_confidence, Capacity, Category, EntryUpdate, PlaybookDelta,
    PlaybookEntry, PlaybookState, PlaybookStats, ReflectionInsight,
};
pub use store::{PlaybookStore, StoreError};

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::backend::SqliteBackend;
use crate::config::Config;
use crate::embeddings::{default_embedder, LexicalEmbedder};
use crate::llama_worker::LlamaWorker;
use crate::model::ModelClient;

/// Open the SQLite-backed store described by `config`
pub fn open_store(config: &Config) -> Result<Arc<PlaybookStore>> {
    let configs = config.agent_configs()?;
    let backend = SqliteBackend::open(&config.db_path)
        .with_context(|| format!("Failed to open playbook database {}", config.db_path.display()))?;

    Ok(Arc::new(PlaybookStore::new(
        Arc::new(backend),
        config.namespace.clone(),
        configs,
    )))
}

/// Assemble the full learning loop: SQLite store, Ollama reflection,
/// embedding-based curation and the background queue
pub async fn middleware_from_config(config: &Config) -> Result<PlaybookMiddleware> {
    let store = open_store(config)?;

    let model: Arc<dyn ModelClient> = Arc::new(LlamaWorker::with_config(config.llama_config()));
    let extractor = Extractor::with_strategy(
        ExtractionStrategy::ModelAssisted,
        model.clone(),
        config.model_timeout,
    );
    let reflector = Reflector::with_config(
        model,
        extractor,
        ReflectorConfig {
            model_timeout: config.model_timeout,
            ..Default::default()
        },
    );

    let embedder = default_embedder(config.embedding_config()).await;
    let pipeline = Arc::new(LearningPipeline::new(
        reflector,
        Curator::with_fallback(embedder, Arc::new(LexicalEmbedder::default())),
        store.clone(),
    ));
    let queue = Arc::new(ReflectionQueue::new(pipeline, config.queue_capacity));

    info!(
        "Playbook learning ready (db: {}, namespace: {})",
        config.db_path.display(),
        config.namespace
    );
    Ok(PlaybookMiddleware::new(store, queue))
}
