//! In-memory backing store

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::{BackendError, BackingStore, VersionedBlob};

/// Append-only version history per (namespace, key), held in memory
#[derive(Default)]
pub struct InMemoryBackend {
    data: RwLock<HashMap<(String, String), Vec<VersionedBlob>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys stored across all namespaces
    pub fn key_count(&self) -> usize {
        self.data.read().len()
    }
}

#[async_trait]
impl BackingStore for InMemoryBackend {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<VersionedBlob>, BackendError> {
        let data = self.data.read();
        Ok(data
            .get(&(namespace.to_string(), key.to_string()))
            .and_then(|versions| versions.last().cloned()))
    }

    async fn put(
        &self,
        namespace: &str,
        key: &str,
        version: u64,
        blob: Vec<u8>,
    ) -> Result<(), BackendError> {
        let mut data = self.data.write();
        let versions = data
            .entry((namespace.to_string(), key.to_string()))
            .or_default();

        let latest = versions.last().map(|v| v.version).unwrap_or(0);
        if version != latest + 1 {
            return Err(BackendError::Conflict {
                expected: latest + 1,
                found: version,
            });
        }

        versions.push(VersionedBlob {
            version,
            blob,
            stored_at: chrono::Utc::now(),
        });
        Ok(())
    }

    async fn get_version(
        &self,
        namespace: &str,
        key: &str,
        version: u64,
    ) -> Result<Option<VersionedBlob>, BackendError> {
        let data = self.data.read();
        Ok(data
            .get(&(namespace.to_string(), key.to_string()))
            .and_then(|versions| versions.iter().find(|v| v.version == version).cloned()))
    }

    async fn list_versions(&self, namespace: &str, key: &str) -> Result<Vec<u64>, BackendError> {
        let data = self.data.read();
        Ok(data
            .get(&(namespace.to_string(), key.to_string()))
            .map(|versions| versions.iter().map(|v| v.version).collect())
            .unwrap_or_default())
    }
}
