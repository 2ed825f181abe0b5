//! Model Call Interface
//!
//! The seam between the learning layer and whatever language model performs
//! the actual reasoning. Reflection and structured extraction only ever talk
//! to a `ModelClient`; the Ollama implementation lives in `llama_worker`.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Model call errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Model call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Model returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Model unavailable")]
    Unavailable,
}

/// A text-in, text-out language model
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Model identifier for logging
    fn name(&self) -> &str;

    /// Run one completion. Implementations must give up after `timeout`.
    async fn call(&self, prompt: &str, timeout: Duration) -> Result<String, ModelError>;
}

/// Run a model call under a hard deadline, whatever the client does internally.
pub async fn call_with_deadline(
    client: &dyn ModelClient,
    prompt: &str,
    timeout: Duration,
) -> Result<String, ModelError> {
    match tokio::time::timeout(timeout, client.call(prompt, timeout)).await {
        Ok(result) => result,
        Err(_) => Err(ModelError::Timeout(timeout)),
    }
}

/// Truncate text to at most `max` bytes on a char boundary
pub fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sleepy;

    #[async_trait]
    impl ModelClient for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }

        async fn call(&self, _prompt: &str, _timeout: Duration) -> Result<String, ModelError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok("late".to_string())
        }
    }

    #[tokio::test]
    async fn test_deadline_enforced() {
        let start = tokio::time::Instant::now();
        let result = call_with_deadline(&Sleepy, "hi", Duration::from_millis(20)).await;
        assert_eq!(result, Err(ModelError::Timeout(Duration::from_millis(20))));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_truncate_char_boundary() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 3), "hel");
        // 'é' is two bytes; cutting inside it backs off
        assert_eq!(truncate("é", 1), "");
    }
}
