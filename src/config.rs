//! Configuration management
//!
//! Process-level settings come from the environment. Per-agent playbook
//! settings come from an optional TOML file with a `[default]` section and
//! `[agents.<id>]` overrides; an override only needs the fields it changes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::embeddings::EmbeddingConfig;
use crate::llama_worker::LlamaWorkerConfig;
use crate::playbook::schemas::Capacity;

/// Process configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path for playbook history
    pub db_path: PathBuf,

    /// Backing-store namespace for playbooks
    pub namespace: String,

    /// Ollama URL for reflection and embeddings (optional)
    pub ollama_url: Option<String>,

    /// Model used for reflection
    pub llama_model: String,

    /// Model used for embeddings
    pub embedding_model: String,

    /// Deadline for every model call
    pub model_timeout: Duration,

    /// Pending traces per agent before new ones are dropped
    pub queue_capacity: usize,

    /// Per-agent playbook settings (TOML)
    pub config_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let db_path = std::env::var("PLAYBOOK_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_local_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("agent-playbook")
                    .join("playbooks.db")
            });

        let namespace = std::env::var("PLAYBOOK_NAMESPACE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "playbooks".to_string());

        let ollama_url = std::env::var("OLLAMA_URL").ok();

        let llama_model = std::env::var("LLAMA_MODEL")
            .unwrap_or_else(|_| "llama3.2:3b".to_string());

        let embedding_model = std::env::var("EMBEDDING_MODEL")
            .unwrap_or_else(|_| "nomic-embed-text".to_string());

        let model_timeout = match std::env::var("PLAYBOOK_MODEL_TIMEOUT_SECS") {
            Ok(v) => Duration::from_secs(
                v.parse()
                    .with_context(|| format!("PLAYBOOK_MODEL_TIMEOUT_SECS is not a number: {}", v))?,
            ),
            Err(_) => Duration::from_secs(5),
        };

        let queue_capacity = std::env::var("PLAYBOOK_QUEUE_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|c: &usize| *c > 0)
            .unwrap_or(64);

        let config_file = std::env::var("PLAYBOOK_CONFIG_FILE").ok().map(PathBuf::from);

        Ok(Self {
            db_path,
            namespace,
            ollama_url,
            llama_model,
            embedding_model,
            model_timeout,
            queue_capacity,
            config_file,
        })
    }

    /// Per-agent settings: the configured file, or built-in defaults
    pub fn agent_configs(&self) -> Result<AgentConfigs> {
        match &self.config_file {
            Some(path) => AgentConfigs::load(path),
            None => Ok(AgentConfigs::default()),
        }
    }

    pub fn llama_config(&self) -> LlamaWorkerConfig {
        let mut config = LlamaWorkerConfig {
            model: self.llama_model.clone(),
            ..Default::default()
        };
        if let Some(url) = &self.ollama_url {
            config.ollama_url = url.clone();
        }
        config
    }

    pub fn embedding_config(&self) -> EmbeddingConfig {
        let mut config = EmbeddingConfig {
            model: self.embedding_model.clone(),
            timeout: self.model_timeout,
            ..Default::default()
        };
        if let Some(url) = &self.ollama_url {
            config.ollama_url = url.clone();
        }
        config
    }
}

/// Playbook behavior for one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybookConfig {
    /// Inject and learn at all
    pub enabled: bool,
    /// Capacity bound on stored entries
    pub max_playbook_entries: usize,
    /// Entries rendered into the system prompt
    pub max_playbook_entries_in_prompt: usize,
    /// Cosine similarity at which an insight matches an entry
    pub similarity_threshold: f64,
    /// Confidence floor below which entries are pruned first
    pub prune_threshold: f64,
}

impl Default for PlaybookConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_playbook_entries: 100,
            max_playbook_entries_in_prompt: 12,
            similarity_threshold: 0.85,
            prune_threshold: 0.3,
        }
    }
}

impl PlaybookConfig {
    /// Copy with floats clamped into [0, 1] and counts at least 1
    pub fn validated(&self) -> Self {
        let defaults = Self::default();
        let unit = |v: f64, fallback: f64| if v.is_nan() { fallback } else { v.clamp(0.0, 1.0) };

        Self {
            enabled: self.enabled,
            max_playbook_entries: self.max_playbook_entries.max(1),
            max_playbook_entries_in_prompt: self.max_playbook_entries_in_prompt.max(1),
            similarity_threshold: unit(self.similarity_threshold, defaults.similarity_threshold),
            prune_threshold: unit(self.prune_threshold, defaults.prune_threshold),
        }
    }

    pub fn capacity(&self) -> Capacity {
        let v = self.validated();
        Capacity {
            max_entries: v.max_playbook_entries,
            prune_threshold: v.prune_threshold,
        }
    }
}

/// Partial settings for one agent; unset fields inherit the default section
#[derive(Debug, Clone, Default, Deserialize)]
struct PlaybookOverride {
    enabled: Option<bool>,
    max_playbook_entries: Option<usize>,
    max_playbook_entries_in_prompt: Option<usize>,
    similarity_threshold: Option<f64>,
    prune_threshold: Option<f64>,
}

impl PlaybookOverride {
    fn apply(&self, base: &PlaybookConfig) -> PlaybookConfig {
        PlaybookConfig {
            enabled: self.enabled.unwrap_or(base.enabled),
            max_playbook_entries: self.max_playbook_entries.unwrap_or(base.max_playbook_entries),
            max_playbook_entries_in_prompt: self
                .max_playbook_entries_in_prompt
                .unwrap_or(base.max_playbook_entries_in_prompt),
            similarity_threshold: self.similarity_threshold.unwrap_or(base.similarity_threshold),
            prune_threshold: self.prune_threshold.unwrap_or(base.prune_threshold),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AgentConfigFile {
    default: PlaybookConfig,
    agents: HashMap<String, PlaybookOverride>,
}

/// Default playbook settings plus per-agent overrides
#[derive(Debug, Clone, Default)]
pub struct AgentConfigs {
    default: PlaybookConfig,
    agents: HashMap<String, PlaybookConfig>,
}

impl AgentConfigs {
    pub fn new(default: PlaybookConfig) -> Self {
        Self {
            default,
            agents: HashMap::new(),
        }
    }

    /// Set the full configuration for one agent
    pub fn with_agent(mut self, agent_id: impl Into<String>, config: PlaybookConfig) -> Self {
        self.agents.insert(agent_id.into(), config);
        self
    }

    /// Validated settings for `agent_id`
    pub fn for_agent(&self, agent_id: &str) -> PlaybookConfig {
        self.agents
            .get(agent_id)
            .unwrap_or(&self.default)
            .validated()
    }

    pub fn default_config(&self) -> &PlaybookConfig {
        &self.default
    }

    /// Agents with their own section
    pub fn configured_agents(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        let file: AgentConfigFile =
            toml::from_str(source).context("Failed to parse playbook config")?;

        let agents = file
            .agents
            .iter()
            .map(|(id, over)| (id.clone(), over.apply(&file.default)))
            .collect();

        Ok(Self {
            default: file.default,
            agents,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read playbook config {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Invalid playbook config {}", path.display()))
    }
}
