//! Llama Worker - Local LLM for reflection
//!
//! Uses Ollama/Llama for:
//! - Reflection reasoning over execution traces
//! - Structuring free-form reasoning into JSON

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::model::{ModelClient, ModelError};

/// Llama Worker configuration
#[derive(Debug, Clone)]
pub struct LlamaWorkerConfig {
    pub ollama_url: String,
    pub model: String,
    /// Upper bound for any single request, on top of the per-call timeout
    pub timeout: Duration,
    pub temperature: f32,
    pub num_predict: u32,
}

impl Default for LlamaWorkerConfig {
    fn default() -> Self {
        Self {
            ollama_url: std::env::var("OLLAMA_URL")
                .unwrap_or_else(|_| "http://localhost:11434".to_string()),
            model: std::env::var("LLAMA_MODEL")
                .unwrap_or_else(|_| "llama3.2:3b".to_string()),
            timeout: Duration::from_secs(60),
            temperature: 0.1, // Low temperature for consistency
            num_predict: 2048,
        }
    }
}

/// Ollama generate response
#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
    #[serde(default)]
    #[allow(dead_code)]
    done: bool,
}

/// Llama Worker for local LLM operations
pub struct LlamaWorker {
    config: LlamaWorkerConfig,
    client: reqwest::Client,
}

impl LlamaWorker {
    /// Create new Llama worker with default config
    pub fn new() -> Self {
        Self::with_config(LlamaWorkerConfig::default())
    }

    /// Create with custom config
    pub fn with_config(config: LlamaWorkerConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self { config, client }
    }

    /// Check if Ollama is available
    pub async fn is_available(&self) -> bool {
        match self.client
            .get(format!("{}/api/tags", self.config.ollama_url))
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Generate text completion using Llama
    pub async fn generate(&self, prompt: &str, timeout: Duration) -> Result<String, ModelError> {
        let url = format!("{}/api/generate", self.config.ollama_url);

        let response = self.client
            .post(&url)
            .json(&serde_json::json!({
                "model": self.config.model,
                "prompt": prompt,
                "stream": false,
                "options": {
                    "temperature": self.config.temperature,
                    "num_predict": self.config.num_predict,
                }
            }))
            .timeout(timeout.min(self.config.timeout))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout(timeout)
                } else if e.is_connect() {
                    ModelError::Unavailable
                } else {
                    ModelError::Transport(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status { status, body });
        }

        let result: OllamaGenerateResponse = response
            .json()
            .await
            .map_err(|e| ModelError::Transport(format!("Failed to parse Ollama response: {}", e)))?;

        debug!("Llama generated {} chars", result.response.len());
        Ok(result.response.trim().to_string())
    }
}

impl Default for LlamaWorker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelClient for LlamaWorker {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn call(&self, prompt: &str, timeout: Duration) -> Result<String, ModelError> {
        self.generate(prompt, timeout).await
    }
}
