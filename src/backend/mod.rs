//! Backing Store
//!
//! A namespaced key → versioned-blob store. The playbook store serializes
//! each `PlaybookState` version into one blob and relies on the backend for:
//! - Append-only history (every version stays retrievable)
//! - Optimistic version checks (`put` only accepts `latest + 1`)
//!
//! Two implementations ship with the crate:
//! - `InMemoryBackend` for tests and ephemeral processes
//! - `SqliteBackend` for durable single-node persistence

mod memory;
mod sqlite;

pub use memory::InMemoryBackend;
pub use sqlite::SqliteBackend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Backend errors
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Version conflict: expected {expected}, got {found}")]
    Conflict { expected: u64, found: u64 },
    #[error("Stored blob for {namespace}/{key} v{version} failed checksum")]
    Corrupt {
        namespace: String,
        key: String,
        version: u64,
    },
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// One stored version of a key
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedBlob {
    pub version: u64,
    pub blob: Vec<u8>,
    pub stored_at: DateTime<Utc>,
}

/// Namespaced, versioned, append-only blob storage
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Latest version of a key, if any
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<VersionedBlob>, BackendError>;

    /// Store `blob` as `version`. Succeeds only if `version == latest + 1`
    /// (latest is 0 for an absent key); otherwise returns `Conflict`.
    async fn put(
        &self,
        namespace: &str,
        key: &str,
        version: u64,
        blob: Vec<u8>,
    ) -> Result<(), BackendError>;

    /// A specific historical version
    async fn get_version(
        &self,
        namespace: &str,
        key: &str,
        version: u64,
    ) -> Result<Option<VersionedBlob>, BackendError>;

    /// All stored versions of a key, ascending
    async fn list_versions(&self, namespace: &str, key: &str) -> Result<Vec<u64>, BackendError>;
}
