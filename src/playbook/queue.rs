//! Background Learning Queue
//!
//! Reflection, curation and the store write run off the caller's path.
//! Each agent gets its own bounded channel and a single worker task, both
//! created on first use, so deltas for one agent land in submission order
//! while different agents proceed independently.
//!
//! Learning is best-effort: a full partition drops the new trace.

use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::curator::Curator;
use super::reflector::{ExecutionTrace, Reflector};
use super::store::PlaybookStore;

/// Queue errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Reflection queue for {agent_id} is full")]
    Full { agent_id: String },
    #[error("Reflection queue is shut down")]
    Closed,
}

/// What one pipeline run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Learning disabled for the agent
    Skipped,
    NoInsights,
    /// Insights were all duplicates of nothing actionable
    NoChanges,
    Applied { version: u64 },
    /// Delta discarded after a store error
    StoreFailed(String),
}

/// Statistics for background learning
#[derive(Debug, Default)]
pub struct LearningStats {
    pub submitted: AtomicU64,
    pub dropped: AtomicU64,
    pub processed: AtomicU64,
    pub skipped: AtomicU64,
    pub no_insights: AtomicU64,
    pub no_changes: AtomicU64,
    pub applied: AtomicU64,
    pub store_failures: AtomicU64,
}

impl LearningStats {
    fn record(&self, outcome: &PipelineOutcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            PipelineOutcome::Skipped => &self.skipped,
            PipelineOutcome::NoInsights => &self.no_insights,
            PipelineOutcome::NoChanges => &self.no_changes,
            PipelineOutcome::Applied { .. } => &self.applied,
            PipelineOutcome::StoreFailed(_) => &self.store_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Reflect, curate, apply
pub struct LearningPipeline {
    reflector: Reflector,
    curator: Curator,
    store: Arc<PlaybookStore>,
    stats: LearningStats,
}

impl LearningPipeline {
    pub fn new(reflector: Reflector, curator: Curator, store: Arc<PlaybookStore>) -> Self {
        Self {
            reflector,
            curator,
            store,
            stats: LearningStats::default(),
        }
    }

    pub fn store(&self) -> &Arc<PlaybookStore> {
        &self.store
    }

    pub fn stats(&self) -> &LearningStats {
        &self.stats
    }

    /// Learn from one trace. Never fails; store errors are logged and the
    /// delta is discarded.
    pub async fn process(&self, trace: &ExecutionTrace) -> PipelineOutcome {
        let outcome = self.run(trace).await;
        self.stats.record(&outcome);
        outcome
    }

    async fn run(&self, trace: &ExecutionTrace) -> PipelineOutcome {
        let agent_id = trace.agent_id.as_str();
        let config = self.store.configs().for_agent(agent_id);
        if !config.enabled {
            return PipelineOutcome::Skipped;
        }

        let insights = self.reflector.analyze(trace).await;
        if insights.is_empty() {
            return PipelineOutcome::NoInsights;
        }

        let current = match self.store.get(agent_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!("Could not load playbook for {}: {}", agent_id, e);
                return PipelineOutcome::StoreFailed(e.to_string());
            }
        };

        let delta = self.curator.curate_with(&current.entries, &insights, &config).await;
        if delta.is_empty() {
            debug!("No playbook changes for {} from trace {}", agent_id, trace.trace_id);
            return PipelineOutcome::NoChanges;
        }

        match self.store.apply_delta(agent_id, &delta).await {
            Ok(state) => PipelineOutcome::Applied {
                version: state.version,
            },
            Err(e) => {
                warn!(
                    "Discarding playbook delta for {} (trace {}): {}",
                    agent_id, trace.trace_id, e
                );
                PipelineOutcome::StoreFailed(e.to_string())
            }
        }
    }
}

/// Per-agent FIFO work queue feeding a `LearningPipeline`
pub struct ReflectionQueue {
    pipeline: Arc<LearningPipeline>,
    capacity: usize,
    partitions: Mutex<HashMap<String, mpsc::Sender<ExecutionTrace>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ReflectionQueue {
    /// `capacity` is the number of pending traces allowed per agent
    pub fn new(pipeline: Arc<LearningPipeline>, capacity: usize) -> Self {
        Self {
            pipeline,
            capacity: capacity.max(1),
            partitions: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn pipeline(&self) -> &Arc<LearningPipeline> {
        &self.pipeline
    }

    /// Agents with a live worker
    pub fn active_agents(&self) -> usize {
        self.partitions.lock().len()
    }

    /// Enqueue a trace without waiting. Must be called within a Tokio runtime.
    pub fn submit(&self, trace: ExecutionTrace) -> Result<(), QueueError> {
        let agent_id = trace.agent_id.clone();
        let sender = self.partition(&agent_id)?;
        let stats = self.pipeline.stats();

        match sender.try_send(trace) {
            Ok(()) => {
                stats.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(trace)) => {
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Reflection queue for {} is full, dropping trace {}",
                    agent_id, trace.trace_id
                );
                Err(QueueError::Full { agent_id })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(QueueError::Closed),
        }
    }

    /// Sender for `agent_id`, spawning its worker on first use.
    ///
    /// `closed` is checked under the partitions lock, which `shutdown` also
    /// holds while closing, so no worker can be spawned after shutdown
    /// collected the handles.
    fn partition(&self, agent_id: &str) -> Result<mpsc::Sender<ExecutionTrace>, QueueError> {
        let mut partitions = self.partitions.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        if let Some(sender) = partitions.get(agent_id) {
            if !sender.is_closed() {
                return Ok(sender.clone());
            }
        }

        let (tx, mut rx) = mpsc::channel::<ExecutionTrace>(self.capacity);
        let pipeline = self.pipeline.clone();
        let worker_agent = agent_id.to_string();

        let handle = tokio::spawn(async move {
            debug!("Reflection worker started for {}", worker_agent);
            while let Some(trace) = rx.recv().await {
                let outcome = pipeline.process(&trace).await;
                debug!("Trace {} for {}: {:?}", trace.trace_id, worker_agent, outcome);
            }
            debug!("Reflection worker for {} drained", worker_agent);
        });

        self.workers.lock().push(handle);
        partitions.insert(agent_id.to_string(), tx.clone());
        Ok(tx)
    }

    #[cfg(test)]
    fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Stop accepting traces and let workers finish what is queued.
    ///
    /// Workers still running after `grace` are aborted. Returns true when
    /// every worker drained in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let handles: Vec<JoinHandle<()>> = {
            let mut partitions = self.partitions.lock();
            self.closed.store(true, Ordering::SeqCst);
            // Dropping the senders ends each worker loop once its queue is empty
            partitions.clear();
            std::mem::take(&mut *self.workers.lock())
        };
        if handles.is_empty() {
            return true;
        }

        let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let count = handles.len();

        match tokio::time::timeout(grace, join_all(handles)).await {
            Ok(_) => {
                info!("Reflection queue drained ({} workers)", count);
                true
            }
            Err(_) => {
                warn!(
                    "Reflection queue did not drain within {:?}, abandoning pending work",
                    grace
                );
                for handle in abort_handles {
                    handle.abort();
                }
                false
            }
        }
    }
}

impl Drop for ReflectionQueue {
    fn drop(&mut self) {
        for handle in self.workers.get_mut().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::config::{AgentConfigs, PlaybookConfig};
    use crate::embeddings::LexicalEmbedder;
    use crate::model::{ModelClient, ModelError};
    use crate::playbook::extractor::Extractor;
    use crate::playbook::middleware::{Message, StepInput, StepOutput};
    use crate::playbook::reflector::ReflectorConfig;
    use async_trait::async_trait;

    /// Echoes the user's message back as a helpful lesson after a delay
    struct EchoModel {
        delay: Duration,
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
                .find_map(|l| l.trim().strip_prefix("[user] "))
                .unwrap_or("nothing");
            Ok(format!("HELPFUL: {}", lesson))
        }
    }

    fn pipeline(delay: Duration, configs: AgentConfigs) -> Arc<LearningPipeline> {
        let reflector = Reflector::with_config(
            Arc::new(EchoModel { delay }),
            Extractor::direct(),
            ReflectorConfig {
                model_timeout: Duration::from_secs(30),
                ..Default::default()
            },
        );
        let store = Arc::new(PlaybookStore::new(
            Arc::new(InMemoryBackend::new()),
            "playbooks",
            configs,
        ));
        Arc::new(LearningPipeline::new(
            reflector,
            Curator::new(Arc::new(LexicalEmbedder::default())),
            store,
        ))
    }

    fn trace(agent_id: &str, message: &str) -> ExecutionTrace {
        ExecutionTrace::succeeded(
            agent_id,
            StepInput {
                messages: vec![Message::user(message)],
                ..Default::default()
            },
            StepOutput::text("done"),
            Duration::from_millis(5),
        )
    }

    #[tokio::test]
    async fn test_process_outcomes() {
        let configs = AgentConfigs::default().with_agent(
            "muted",
            PlaybookConfig {
                enabled: false,
                ..Default::default()
            },
        );
        let pipeline = pipeline(Duration::ZERO, configs);

        assert_eq!(pipeline.process(&trace("muted", "x")).await, PipelineOutcome::Skipped);
        assert_eq!(
            pipeline.process(&trace("researcher", "verify dates")).await,
            PipelineOutcome::Applied { version: 1 }
        );
        assert_eq!(
            pipeline.process(&trace("researcher", "verify dates")).await,
            PipelineOutcome::Applied { version: 2 }
        );

        let state = pipeline.store().get("researcher").await.unwrap();
        assert_eq!(state.len(), 1);
        assert_eq!(state.entries[0].helpful_count, 2);
        assert_eq!(pipeline.stats().applied.load(Ordering::Relaxed), 2);
        assert_eq!(pipeline.stats().skipped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_fifo_per_agent() {
        let pipeline = pipeline(Duration::from_millis(5), AgentConfigs::default());
        let queue = ReflectionQueue::new(pipeline.clone(), 16);

        let lessons = [
            "check publication dates",
            "prefer primary sources",
            "summarize findings briefly",
            "ask clarifying questions",
        ];
        for lesson in lessons {
            queue.submit(trace("researcher", lesson)).unwrap();
            queue.submit(trace("writer", lesson)).unwrap();
        }
        assert_eq!(queue.active_agents(), 2);
        assert!(queue.shutdown(Duration::from_secs(10)).await);

        let store = pipeline.store();
        for agent in ["researcher", "writer"] {
            assert_eq!(store.history(agent).await.unwrap(), vec![1, 2, 3, 4]);
            for (i, lesson) in lessons.iter().enumerate() {
                let version = store.get_version(agent, i as u64 + 1).await.unwrap().unwrap();
                assert_eq!(version.entries.last().unwrap().content, *lesson);
            }
        }
        assert_eq!(pipeline.stats().submitted.load(Ordering::Relaxed), 8);
    }

    #[tokio::test]
    async fn test_full_partition_drops() {
        let pipeline = pipeline(Duration::from_millis(10), AgentConfigs::default());
        let queue = ReflectionQueue::new(pipeline.clone(), 1);

        // The worker has not run yet, so the second trace finds the slot taken
        queue.submit(trace("researcher", "first")).unwrap();
        let err = queue.submit(trace("researcher", "second")).unwrap_err();
        assert_eq!(
            err,
            QueueError::Full {
                agent_id: "researcher".to_string()
            }
        );
        // Other agents have their own partition
        queue.submit(trace("writer", "first")).unwrap();

        assert_eq!(pipeline.stats().dropped.load(Ordering::Relaxed), 1);
        assert!(queue.shutdown(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_after_grace() {
        let pipeline = pipeline(Duration::from_secs(20), AgentConfigs::default());
        let queue = ReflectionQueue::new(pipeline.clone(), 4);
        queue.submit(trace("researcher", "slow lesson")).unwrap();

        let start = tokio::time::Instant::now();
        assert!(!queue.shutdown(Duration::from_millis(100)).await);
        assert!(start.elapsed() < Duration::from_secs(5));

        assert_eq!(queue.submit(trace("researcher", "late")), Err(QueueError::Closed));
        assert_eq!(pipeline.store().get("researcher").await.unwrap().version, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_submit_racing_shutdown_leaves_no_worker_behind() {
        let pipeline = pipeline(Duration::ZERO, AgentConfigs::default());
        let queue = Arc::new(ReflectionQueue::new(pipeline, 1024));

        let submitters: Vec<_> = (0..8)
            .map(|n| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    for i in 0.. {
                        let agent = format!("agent-{}-{}", n, i);
                        if queue.submit(trace(&agent, "lesson")) == Err(QueueError::Closed) {
                            break;
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.shutdown(Duration::from_secs(10)).await);
        for submitter in submitters {
            submitter.await.unwrap();
        }

        assert_eq!(queue.worker_count(), 0);
        assert_eq!(queue.active_agents(), 0);
        assert_eq!(queue.submit(trace("late", "lesson")), Err(QueueError::Closed));
    }
}
