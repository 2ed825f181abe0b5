//! Versioned Playbook Store
//!
//! Owns the canonical `PlaybookState` of every agent. `apply_delta` is the
//! only mutator: it reads the latest version, builds the next one, and
//! writes it as a single put, all while holding that agent's lock.
//! Different agents never wait on each other.
//!
//! History is append-only in the backing store, so every earlier version
//! stays retrievable.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use super::schemas::{PlaybookDelta, PlaybookState, PlaybookStats};
use crate::backend::{BackendError, BackingStore, VersionedBlob};
use crate::config::AgentConfigs;

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Backing store error: {0}")]
    Backend(#[from] BackendError),
    #[error("Version {version} of {agent_id} was written concurrently")]
    Conflict { agent_id: String, version: u64 },
    #[error("Playbook serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Versioned, namespaced playbook persistence
pub struct PlaybookStore {
    backend: Arc<dyn BackingStore>,
    namespace: String,
    configs: AgentConfigs,
    /// One writer lock per agent
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PlaybookStore {
    pub fn new(backend: Arc<dyn BackingStore>, namespace: impl Into<String>, configs: AgentConfigs) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
            configs,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn configs(&self) -> &AgentConfigs {
        &self.configs
    }

    fn agent_lock(&self, agent_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(agent_id.to_string())
            .or_default()
            .clone()
    }

    fn decode(stored: VersionedBlob) -> Result<PlaybookState, StoreError> {
        let mut state: PlaybookState = serde_json::from_slice(&stored.blob)?;
        state.version = stored.version;
        state.recompute_confidences();
        Ok(state)
    }

    /// Latest version; version 0 with no entries for an unknown agent
    pub async fn get(&self, agent_id: &str) -> Result<PlaybookState, StoreError> {
        match self.backend.get(&self.namespace, agent_id).await? {
            Some(stored) => Self::decode(stored),
            None => Ok(PlaybookState::empty(agent_id)),
        }
    }

    /// A specific earlier version
    pub async fn get_version(&self, agent_id: &str, version: u64) -> Result<Option<PlaybookState>, StoreError> {
        self.backend
            .get_version(&self.namespace, agent_id, version)
            .await?
            .map(Self::decode)
            .transpose()
    }

    /// All stored versions, oldest first
    pub async fn history(&self, agent_id: &str) -> Result<Vec<u64>, StoreError> {
        Ok(self.backend.list_versions(&self.namespace, agent_id).await?)
    }

    pub async fn stats(&self, agent_id: &str) -> Result<PlaybookStats, StoreError> {
        let state = self.get(agent_id).await?;
        Ok(PlaybookStats::from(&state))
    }

    /// Apply `delta` as the next version and return it.
    ///
    /// On error the previous version stays canonical.
    pub async fn apply_delta(&self, agent_id: &str, delta: &PlaybookDelta) -> Result<PlaybookState, StoreError> {
        let lock = self.agent_lock(agent_id);
        let _guard = lock.lock().await;

        let current = self.get(agent_id).await?;
        let capacity = self.configs.for_agent(agent_id).capacity();
        let next = current.next(delta, &capacity, Utc::now());

        let blob = serde_json::to_vec(&next)?;
        match self.backend.put(&self.namespace, agent_id, next.version, blob).await {
            Ok(()) => {}
            Err(BackendError::Conflict { .. }) => {
                return Err(StoreError::Conflict {
                    agent_id: agent_id.to_string(),
                    version: next.version,
                });
            }
            Err(e) => return Err(e.into()),
        }

        let pruned = (current.len() + delta.add.len()).saturating_sub(next.len() + delta.remove.len());
        if pruned > 0 {
            debug!("Pruned {} entries from {} to fit capacity {}", pruned, agent_id, capacity.max_entries);
        }
        info!(
            "Playbook {} advanced to v{} ({} entries, +{} ~{} -{})",
            agent_id,
            next.version,
            next.len(),
            delta.add.len(),
            delta.update.len(),
            delta.remove.len()
        );

        Ok(next)
    }
}
