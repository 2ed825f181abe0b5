//! Agent Playbook
//!
//! Self-improving memory layer for agent execution steps.
//!
//! # Features
//!
//! - **Prompt Injection**: top learned strategies appended to each step's system prompt
//! - **Background Reflection**: insights from every run, off the caller's path
//! - **Semantic De-duplication**: repeated lessons reinforce instead of piling up
//! - **Laplace Confidence**: `(helpful + 1) / (helpful + harmful + 2)`
//! - **Versioned Storage**: append-only history per agent, SQLite or in-memory
//! - **Capacity Pruning**: weakest entries dropped inside the same delta
//!
//! # Architecture
//!
//! ```text
//! Agent engine ──► WrappedStep ──► AgentStep ──► result
//!                      │
//!                      ├── PlaybookStore (SQLite, versioned)
//!                      └── ReflectionQueue (per-agent FIFO)
//!                               │
//!                               ├── Reflector (Ollama/Llama)
//!                               ├── Extractor (JSON + heuristics)
//!                               └── Curator (embeddings)
//! ```

pub mod backend;
pub mod config;
pub mod embeddings;
pub mod llama_worker;
pub mod model;
pub mod playbook;

pub use backend::{BackendError, BackingStore, InMemoryBackend, SqliteBackend, VersionedBlob};
pub use config::{AgentConfigs, Config, PlaybookConfig};
pub use embeddings::{
    cosine_similarity, Embedder, EmbeddingConfig, EmbeddingError, LexicalEmbedder, OllamaEmbedder,
};
pub use llama_worker::{LlamaWorker, LlamaWorkerConfig};
pub use model::{ModelClient, ModelError};
pub use playbook::{
    step_fn, AgentStep, Category, Curator, ExecutionTrace, Extractor, LearningPipeline,
    PlaybookDelta, PlaybookEntry, PlaybookMiddleware, PlaybookState, PlaybookStore,
    ReflectionInsight, ReflectionQueue, Reflector, StepInput, StepOutput,
};
