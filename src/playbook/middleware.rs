//! Playbook Middleware
//!
//! Wraps any [`AgentStep`] so that:
//! - before it runs, the agent's top playbook entries are appended to its
//!   system prompt
//! - after it runs, successfully or not, the execution trace is handed to the
//!   background queue for reflection
//!
//! The wrapped step's result is returned unchanged and never waits on
//! learning. Any learning-layer failure degrades to "no injection" or
//! "nothing learned".

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use super::queue::ReflectionQueue;
use super::reflector::ExecutionTrace;
use super::schemas::format_for_prompt;
use super::store::PlaybookStore;
use crate::config::PlaybookConfig;

/// One conversation message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Input to one agent step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepInput {
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub metadata: Value,
}

impl StepInput {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    /// Append a block to the system prompt, separated by a blank line
    pub fn append_instructions(&mut self, block: &str) {
        if block.is_empty() {
            return;
        }
        if self.system_prompt.is_empty() {
            self.system_prompt = block.to_string();
        } else {
            self.system_prompt.push_str("\n\n");
            self.system_prompt.push_str(block);
        }
    }
}

/// A tool call or other sub-step inside a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubStep {
    pub name: String,
    pub input: String,
    pub output: String,
    pub success: bool,
}

impl SubStep {
    pub fn ok(name: impl Into<String>, input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input: input.into(),
            output: output.into(),
            success: true,
        }
    }

    pub fn failed(name: impl Into<String>, input: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input: input.into(),
            output: error.into(),
            success: false,
        }
    }
}

/// Output of one agent step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub content: String,
    #[serde(default)]
    pub sub_steps: Vec<SubStep>,
    #[serde(default)]
    pub metadata: Value,
}

impl StepOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_sub_step(mut self, step: SubStep) -> Self {
        self.sub_steps.push(step);
        self
    }
}

/// An opaque agent execution step
#[async_trait]
pub trait AgentStep: Send + Sync {
    async fn run(&self, input: StepInput) -> anyhow::Result<StepOutput>;
}

#[async_trait]
impl<S: AgentStep + ?Sized> AgentStep for Arc<S> {
    async fn run(&self, input: StepInput) -> anyhow::Result<StepOutput> {
        (**self).run(input).await
    }
}

/// Step backed by an async closure
pub struct FnStep<F>(F);

/// Turn an async closure into an [`AgentStep`]
pub fn step_fn<F, Fut>(f: F) -> FnStep<F>
where
    F: Fn(StepInput) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<StepOutput>> + Send + 'static,
{
    FnStep(f)
}

#[async_trait]
impl<F, Fut> AgentStep for FnStep<F>
where
    F: Fn(StepInput) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<StepOutput>> + Send + 'static,
{
    async fn run(&self, input: StepInput) -> anyhow::Result<StepOutput> {
        (self.0)(input).await
    }
}

/// Injects playbooks and schedules reflection around agent steps
#[derive(Clone)]
pub struct PlaybookMiddleware {
    store: Arc<PlaybookStore>,
    queue: Arc<ReflectionQueue>,
}

impl PlaybookMiddleware {
    pub fn new(store: Arc<PlaybookStore>, queue: Arc<ReflectionQueue>) -> Self {
        Self { store, queue }
    }

    pub fn store(&self) -> &Arc<PlaybookStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<ReflectionQueue> {
        &self.queue
    }

    /// Wrap `step` for `agent_id`
    pub fn wrap<S: AgentStep>(&self, step: S, agent_id: impl Into<String>) -> WrappedStep<S> {
        WrappedStep {
            inner: step,
            agent_id: agent_id.into(),
            middleware: self.clone(),
        }
    }

    /// The prompt block for `agent_id`, empty when there is nothing to inject
    /// or the store cannot be read
    pub async fn playbook_block(&self, agent_id: &str, config: &PlaybookConfig) -> String {
        match self.store.get(agent_id).await {
            Ok(state) => format_for_prompt(&state.entries, config.max_playbook_entries_in_prompt),
            Err(e) => {
                warn!("Playbook unavailable for {}, running without it: {}", agent_id, e);
                String::new()
            }
        }
    }

    fn schedule(&self, trace: ExecutionTrace) {
        let agent_id = trace.agent_id.clone();
        match self.queue.submit(trace) {
            Ok(()) => debug!("Queued reflection for {}", agent_id),
            Err(e) => debug!("Reflection not scheduled for {}: {}", agent_id, e),
        }
    }
}

/// An [`AgentStep`] with playbook injection and background reflection
pub struct WrappedStep<S> {
    inner: S,
    agent_id: String,
    middleware: PlaybookMiddleware,
}

impl<S> WrappedStep<S> {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: AgentStep> AgentStep for WrappedStep<S> {
    async fn run(&self, input: StepInput) -> anyhow::Result<StepOutput> {
        let config = self.middleware.store.configs().for_agent(&self.agent_id);
        if !config.enabled {
            return self.inner.run(input).await;
        }

        let block = self.middleware.playbook_block(&self.agent_id, &config).await;
        let mut injected = input.clone();
        injected.append_instructions(&block);

        let started = Instant::now();
        let result = self.inner.run(injected).await;
        let elapsed = started.elapsed();

        // The trace carries the caller's input, not the injected playbook
        let trace = match &result {
            Ok(output) => ExecutionTrace::succeeded(&self.agent_id, input, output.clone(), elapsed),
            Err(e) => ExecutionTrace::failed(&self.agent_id, input, e, elapsed),
        };
        self.middleware.schedule(trace);

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, BackingStore, InMemoryBackend, VersionedBlob};
    use crate::config::AgentConfigs;
    use crate::embeddings::LexicalEmbedder;
    use crate::model::{ModelClient, ModelError};
    use crate::playbook::curator::Curator;
    use crate::playbook::extractor::Extractor;
    use crate::playbook::queue::LearningPipeline;
    use crate::playbook::reflector::{Reflector, ReflectorConfig};
    use crate::playbook::schemas::{Category, PlaybookDelta, PlaybookEntry};
    use parking_lot::Mutex;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct FixedModel {
        reply: String,
        delay: Duration,
    }

    #[async_trait]
    impl ModelClient for FixedModel {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn call(&self, _prompt: &str, _timeout: Duration) -> Result<String, ModelError> {
            tokio::time::sleep(self.delay).await;
            Ok(self.reply.clone())
        }
    }

    struct UnreadableBackend;

    #[async_trait]
    impl BackingStore for UnreadableBackend {
        async fn get(&self, _: &str, _: &str) -> Result<Option<VersionedBlob>, BackendError> {
            Err(BackendError::Unavailable("offline".to_string()))
        }

        async fn put(&self, _: &str, _: &str, _: u64, _: Vec<u8>) -> Result<(), BackendError> {
            Err(BackendError::Unavailable("offline".to_string()))
        }

        async fn get_version(&self, _: &str, _: &str, _: u64) -> Result<Option<VersionedBlob>, BackendError> {
            Err(BackendError::Unavailable("offline".to_string()))
        }

        async fn list_versions(&self, _: &str, _: &str) -> Result<Vec<u64>, BackendError> {
            Err(BackendError::Unavailable("offline".to_string()))
        }
    }

    fn middleware_with(
        backend: Arc<dyn BackingStore>,
        configs: AgentConfigs,
        reply: &str,
        delay: Duration,
    ) -> PlaybookMiddleware {
        let store = Arc::new(PlaybookStore::new(backend, "playbooks", configs));
        let reflector = Reflector::with_config(
            Arc::new(FixedModel {
                reply: reply.to_string(),
                delay,
            }),
            Extractor::direct(),
            ReflectorConfig {
                model_timeout: Duration::from_secs(30),
                ..Default::default()
            },
        );
        let pipeline = Arc::new(LearningPipeline::new(
            reflector,
            Curator::new(Arc::new(LexicalEmbedder::default())),
            store.clone(),
        ));
        let queue = Arc::new(ReflectionQueue::new(pipeline, 8));
        PlaybookMiddleware::new(store, queue)
    }

    fn middleware(reply: &str) -> PlaybookMiddleware {
        middleware_with(
            Arc::new(InMemoryBackend::new()),
            AgentConfigs::default(),
            reply,
            Duration::ZERO,
        )
    }

    /// Records the system prompt it was given
    fn recording_step(seen: Arc<Mutex<Vec<String>>>) -> impl AgentStep {
        step_fn(move |input: StepInput| {
            let seen = seen.clone();
            async move {
                seen.lock().push(input.system_prompt.clone());
                Ok(StepOutput::text("answer"))
            }
        })
    }

    #[test]
    fn test_append_instructions() {
        let mut input = StepInput::new("You are a researcher.");
        input.append_instructions("");
        assert_eq!(input.system_prompt, "You are a researcher.");

        input.append_instructions("## Learned playbook");
        assert_eq!(input.system_prompt, "You are a researcher.\n\n## Learned playbook");

        let mut empty = StepInput::default();
        empty.append_instructions("block");
        assert_eq!(empty.system_prompt, "block");
    }

    #[tokio::test]
    async fn test_injects_playbook() {
        let middleware = middleware("");
        let delta = PlaybookDelta {
            add: vec![
                PlaybookEntry::with_counts("Always cite sources", Category::Helpful, 2, 0),
                PlaybookEntry::new("Guessing URLs", Category::Harmful),
            ],
            ..Default::default()
        };
        middleware.store().apply_delta("researcher", &delta).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let wrapped = middleware.wrap(recording_step(seen.clone()), "researcher");
        let output = wrapped.run(StepInput::new("You are a researcher.")).await.unwrap();
        assert_eq!(output.content, "answer");

        let prompt = seen.lock()[0].clone();
        assert!(prompt.starts_with("You are a researcher.\n\n## Learned playbook\n"));
        assert!(prompt.contains("1. Always cite sources [confidence: 75%]"));
        assert!(prompt.contains("Avoid these patterns:\n1. Guessing URLs [confidence: 33%]"));
    }

    #[tokio::test]
    async fn test_empty_playbook_leaves_prompt_alone() {
        let middleware = middleware("");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let wrapped = middleware.wrap(recording_step(seen.clone()), "researcher");

        wrapped.run(StepInput::new("base")).await.unwrap();
        assert_eq!(seen.lock()[0], "base");
    }

    #[tokio::test]
    async fn test_store_failure_runs_without_injection() {
        let middleware = middleware_with(
            Arc::new(UnreadableBackend),
            AgentConfigs::default(),
            "HELPFUL: something",
            Duration::ZERO,
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let wrapped = middleware.wrap(recording_step(seen.clone()), "researcher");

        let output = wrapped.run(StepInput::new("base")).await.unwrap();
        assert_eq!(output.content, "answer");
        assert_eq!(seen.lock()[0], "base");
        middleware.queue().shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_step_error_propagates_and_is_learned_from() {
        let middleware = middleware("HARMFUL: Calling the search tool without a query");
        let wrapped = middleware.wrap(
            step_fn(|_input: StepInput| async {
                Err::<StepOutput, _>(anyhow::anyhow!("tool call rejected"))
            }),
            "researcher",
        );

        let err = wrapped.run(StepInput::new("base")).await.unwrap_err();
        assert_eq!(err.to_string(), "tool call rejected");

        assert!(middleware.queue().shutdown(Duration::from_secs(5)).await);
        let state = middleware.store().get("researcher").await.unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.entries[0].category, Category::Harmful);
        assert_eq!(state.entries[0].content, "Calling the search tool without a query");
    }

    #[tokio::test]
    async fn test_disabled_agent_is_pass_through() {
        let configs = AgentConfigs::default().with_agent(
            "researcher",
            PlaybookConfig {
                enabled: false,
                ..Default::default()
            },
        );
        let middleware = middleware_with(
            Arc::new(InMemoryBackend::new()),
            configs,
            "HELPFUL: anything",
            Duration::ZERO,
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let wrapped = middleware.wrap(recording_step(seen.clone()), "researcher");

        wrapped.run(StepInput::new("base")).await.unwrap();
        assert_eq!(seen.lock()[0], "base");
        assert_eq!(middleware.queue().active_agents(), 0);
        assert_eq!(
            middleware.queue().pipeline().stats().submitted.load(Ordering::Relaxed),
            0
        );
    }

    #[tokio::test]
    async fn test_wrapper_does_not_wait_for_reflection() {
        let middleware = middleware_with(
            Arc::new(InMemoryBackend::new()),
            AgentConfigs::default(),
            "HELPFUL: slow lesson",
            Duration::from_secs(5),
        );
        let wrapped = middleware.wrap(
            step_fn(|_input: StepInput| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err::<StepOutput, _>(anyhow::anyhow!("step failed"))
            }),
            "researcher",
        );

        let start = std::time::Instant::now();
        assert!(wrapped.run(StepInput::new("base")).await.is_err());
        assert!(start.elapsed() < Duration::from_millis(1000));

        assert!(!middleware.queue().shutdown(Duration::from_millis(10)).await);
    }
}
