//! Reflection over Execution Traces
//!
//! After every wrapped step, the reflector asks a model what helped or hurt
//! and turns the answer into `ReflectionInsight`s via the extractor.
//! Each insight starts with low confidence since it comes from a single
//! observation; the curator raises real confidence through repetition.
//!
//! `analyze` never fails. A model error or timeout yields an empty list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::extractor::{Extracted, Extractor, InsightBatch};
use super::middleware::{StepInput, StepOutput, SubStep};
use super::schemas::ReflectionInsight;
use crate::model::{call_with_deadline, truncate, ModelClient};

/// Record of one wrapped step invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub agent_id: String,
    pub trace_id: String,
    pub input: StepInput,
    pub sub_steps: Vec<SubStep>,
    pub output: Option<StepOutput>,
    pub error: Option<String>,
    pub success: bool,
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
}

impl ExecutionTrace {
    fn base(agent_id: &str, input: StepInput, duration: Duration) -> Self {
        let started_at = chrono::Duration::from_std(duration)
            .map(|d| Utc::now() - d)
            .unwrap_or_else(|_| Utc::now());

        Self {
            agent_id: agent_id.to_string(),
            trace_id: uuid::Uuid::new_v4().to_string(),
            input,
            sub_steps: Vec::new(),
            output: None,
            error: None,
            success: false,
            duration,
            started_at,
        }
    }

    /// Trace of a step that returned normally
    pub fn succeeded(agent_id: &str, input: StepInput, output: StepOutput, duration: Duration) -> Self {
        let mut trace = Self::base(agent_id, input, duration);
        trace.sub_steps = output.sub_steps.clone();
        trace.output = Some(output);
        trace.success = true;
        trace
    }

    /// Trace of a step that returned an error
    pub fn failed(agent_id: &str, input: StepInput, error: &anyhow::Error, duration: Duration) -> Self {
        let mut trace = Self::base(agent_id, input, duration);
        trace.error = Some(format!("{:#}", error));
        trace
    }

    /// Everything unusual about this run
    pub fn anomalies(&self, slow_threshold: Duration) -> Vec<String> {
        let mut anomalies = Vec::new();

        if let Some(error) = &self.error {
            anomalies.push(format!("step failed: {}", error));
        } else if !self.success {
            anomalies.push("step reported failure".to_string());
        }

        for step in self.sub_steps.iter().filter(|s| !s.success) {
            anomalies.push(format!("sub-step '{}' failed", step.name));
        }

        if self.duration > slow_threshold {
            anomalies.push(format!(
                "slow execution: {:.1}s (threshold {:.1}s)",
                self.duration.as_secs_f64(),
                slow_threshold.as_secs_f64()
            ));
        }

        if self.success && self.output.as_ref().map_or(true, |o| o.content.trim().is_empty()) {
            anomalies.push("empty output".to_string());
        }

        anomalies
    }

    /// Successful, no anomalies
    pub fn is_clean_success(&self, slow_threshold: Duration) -> bool {
        self.success && self.anomalies(slow_threshold).is_empty()
    }

    /// Plain-text rendering for a reasoning prompt, capped at `max_chars` bytes
    pub fn render(&self, slow_threshold: Duration, max_chars: usize) -> String {
        let mut s = format!(
            "Outcome: {} in {:.1}s\n",
            if self.success { "SUCCESS" } else { "FAILURE" },
            self.duration.as_secs_f64()
        );

        if !self.input.system_prompt.is_empty() {
            s.push_str(&format!(
                "\nInstructions: {}\n",
                truncate(&self.input.system_prompt, 500)
            ));
        }

        if !self.input.messages.is_empty() {
            s.push_str("\nConversation:\n");
            for msg in &self.input.messages {
                s.push_str(&format!("  [{}] {}\n", msg.role, truncate(&msg.content, 400)));
            }
        }

        if !self.sub_steps.is_empty() {
            s.push_str("\nSteps:\n");
            for (i, step) in self.sub_steps.iter().enumerate() {
                s.push_str(&format!(
                    "  {}. {} ({}): {} -> {}\n",
                    i + 1,
                    step.name,
                    if step.success { "ok" } else { "failed" },
                    truncate(&step.input, 200),
                    truncate(&step.output, 200)
                ));
            }
        }

        if let Some(output) = &self.output {
            s.push_str(&format!("\nFinal output: {}\n", truncate(&output.content, 800)));
        }

        if let Some(error) = &self.error {
            s.push_str(&format!("\nError: {}\n", truncate(error, 400)));
        }

        let anomalies = self.anomalies(slow_threshold);
        if !anomalies.is_empty() {
            s.push_str("\nAnomalies:\n");
            for a in &anomalies {
                s.push_str(&format!("  - {}\n", a));
            }
        }

        truncate(&s, max_chars).to_string()
    }
}

/// Reflector configuration
#[derive(Debug, Clone)]
pub struct ReflectorConfig {
    /// Deadline for the reasoning call
    pub model_timeout: Duration,
    /// Ceiling on an insight's initial confidence
    pub max_initial_confidence: f64,
    /// Insights kept per trace
    pub max_insights: usize,
    /// Return nothing for successful runs without anomalies
    pub skip_clean_success: bool,
    /// Runs longer than this count as an anomaly
    pub slow_threshold: Duration,
    /// Cap on the rendered trace in the prompt
    pub max_trace_chars: usize,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            model_timeout: Duration::from_secs(5),
            max_initial_confidence: 0.6,
            max_insights: 5,
            skip_clean_success: false,
            slow_threshold: Duration::from_secs(60),
            max_trace_chars: 4000,
        }
    }
}

/// Derives insights from execution traces
pub struct Reflector {
    model: Arc<dyn ModelClient>,
    extractor: Extractor,
    config: ReflectorConfig,
}

impl Reflector {
    pub fn new(model: Arc<dyn ModelClient>, extractor: Extractor) -> Self {
        Self::with_config(model, extractor, ReflectorConfig::default())
    }

    pub fn with_config(model: Arc<dyn ModelClient>, extractor: Extractor, config: ReflectorConfig) -> Self {
        Self {
            model,
            extractor,
            config,
        }
    }

    pub fn config(&self) -> &ReflectorConfig {
        &self.config
    }

    /// Insights for one trace; empty when there is nothing to learn or
    /// reflection failed
    pub async fn analyze(&self, trace: &ExecutionTrace) -> Vec<ReflectionInsight> {
        if self.config.skip_clean_success && trace.is_clean_success(self.config.slow_threshold) {
            debug!("Skipping reflection for clean run {} of {}", trace.trace_id, trace.agent_id);
            return Vec::new();
        }

        let prompt = self.reasoning_prompt(trace);
        let reasoning =
            match call_with_deadline(self.model.as_ref(), &prompt, self.config.model_timeout).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(
                        "Reflection failed for {} (trace {}): {}",
                        trace.agent_id, trace.trace_id, e
                    );
                    return Vec::new();
                }
            };

        if reasoning.trim().is_empty() {
            debug!("Empty reflection for trace {}", trace.trace_id);
            return Vec::new();
        }

        let extracted: Extracted<InsightBatch> = self.extractor.extract(&reasoning).await;
        let insights = self.sanitize(extracted.value.insights);

        debug!(
            "Reflection on {} produced {} insights ({:?})",
            trace.agent_id,
            insights.len(),
            extracted.method
        );

        insights
    }

    fn reasoning_prompt(&self, trace: &ExecutionTrace) -> String {
        format!(
            r#"You are reviewing one run of the "{}" agent to learn lessons for future runs.

{}

What pattern helped or hurt completing this task?
Think it through briefly, then list at most {} lessons, one per line, each starting with
HELPFUL:, HARMFUL: or NEUTRAL: and stated as a general strategy rather than a detail of this run.
If nothing is worth remembering, list nothing."#,
            trace.agent_id,
            trace.render(self.config.slow_threshold, self.config.max_trace_chars),
            self.config.max_insights
        )
    }

    /// Drop empties and case-insensitive duplicates, clamp confidence, cap count
    fn sanitize(&self, insights: Vec<ReflectionInsight>) -> Vec<ReflectionInsight> {
        let mut seen = HashSet::new();
        let ceiling = self.config.max_initial_confidence.clamp(0.0, 1.0);

        insights
            .into_iter()
            .filter_map(|mut insight| {
                let content = insight.content.trim().to_string();
                if content.is_empty() || !seen.insert(content.to_lowercase()) {
                    return None;
                }

                insight.content = content;
                insight.confidence_score = if insight.confidence_score.is_finite() {
                    insight.confidence_score.clamp(0.0, ceiling)
                } else {
                    0.0
                };
                insight.tags.retain(|t| !t.trim().is_empty());
                Some(insight)
            })
            .take(self.config.max_insights)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelError;
    use crate::playbook::middleware::Message;
    use crate::playbook::schemas::Category;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedModel {
        reply: Result<String, ModelError>,
        calls: AtomicUsize,
    }

    impl ScriptedModel {
        fn replying(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(reply.to_string()),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(err: ModelError) -> Arc<Self> {
            Arc::new(Self {
                reply: Err(err),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn call(&self, _prompt: &str, _timeout: Duration) -> Result<String, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone()
        }
    }

    fn input() -> StepInput {
        StepInput {
            system_prompt: "You are a researcher.".to_string(),
            messages: vec![Message::user("Find papers on CRDTs")],
            metadata: serde_json::Value::Null,
        }
    }

    fn clean_trace() -> ExecutionTrace {
        ExecutionTrace::succeeded(
            "researcher",
            input(),
            StepOutput::text("Here are three papers..."),
            Duration::from_millis(120),
        )
    }

    #[test]
    fn test_anomalies() {
        assert!(clean_trace().anomalies(Duration::from_secs(60)).is_empty());
        assert!(clean_trace().is_clean_success(Duration::from_secs(60)));

        let failed = ExecutionTrace::failed(
            "researcher",
            input(),
            &anyhow::anyhow!("search tool unavailable"),
            Duration::from_secs(90),
        );
        let anomalies = failed.anomalies(Duration::from_secs(60));
        assert_eq!(anomalies.len(), 2);
        assert!(anomalies[0].contains("search tool unavailable"));
        assert!(anomalies[1].starts_with("slow execution"));

        let mut with_bad_step = clean_trace();
        with_bad_step.sub_steps.push(SubStep {
            name: "web_search".to_string(),
            input: "crdt".to_string(),
            output: "429".to_string(),
            success: false,
        });
        assert_eq!(
            with_bad_step.anomalies(Duration::from_secs(60)),
            vec!["sub-step 'web_search' failed".to_string()]
        );
    }

    #[test]
    fn test_render_is_capped() {
        let rendered = clean_trace().render(Duration::from_secs(60), 40);
        assert!(rendered.len() <= 40);
        assert!(rendered.starts_with("Outcome: SUCCESS"));
    }

    #[tokio::test]
    async fn test_analyze_extracts_and_sanitizes() {
        let model = ScriptedModel::replying(
            "The run went well.\n\
             HELPFUL: Cite sources for every claim\n\
             HELPFUL: cite sources for every claim\n\
             HARMFUL: Stopping after the first search result\n\
             NEUTRAL:   \n",
        );
        let reflector = Reflector::new(model.clone(), Extractor::direct());

        let insights = reflector.analyze(&clean_trace()).await;
        assert_eq!(insights.len(), 2);
        assert_eq!(insights[0].content, "Cite sources for every claim");
        assert_eq!(insights[0].category, Category::Helpful);
        assert_eq!(insights[1].category, Category::Harmful);
        assert!(insights.iter().all(|i| i.confidence_score <= 0.6));
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_confidence_clamped_and_count_capped() {
        let model = ScriptedModel::replying(
            r#"{"insights": [
                {"content": "a", "category": "helpful", "confidence_score": 0.99},
                {"content": "b", "category": "helpful", "confidence_score": -1.0},
                {"content": "c", "category": "harmful"}
            ]}"#,
        );
        let config = ReflectorConfig {
            max_insights: 2,
            ..Default::default()
        };
        let reflector = Reflector::with_config(model, Extractor::direct(), config);

        let insights = reflector.analyze(&clean_trace()).await;
        assert_eq!(insights.len(), 2);
        assert_eq!(insights[0].confidence_score, 0.6);
        assert_eq!(insights[1].confidence_score, 0.0);
    }

    #[tokio::test]
    async fn test_model_failure_yields_nothing() {
        let reflector = Reflector::new(
            ScriptedModel::failing(ModelError::Timeout(Duration::from_secs(5))),
            Extractor::direct(),
        );
        assert!(reflector.analyze(&clean_trace()).await.is_empty());
    }

    #[tokio::test]
    async fn test_skip_clean_success() {
        let model = ScriptedModel::replying("HELPFUL: something");
        let config = ReflectorConfig {
            skip_clean_success: true,
            ..Default::default()
        };
        let reflector = Reflector::with_config(model.clone(), Extractor::direct(), config);

        assert!(reflector.analyze(&clean_trace()).await.is_empty());
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);

        let failed = ExecutionTrace::failed(
            "researcher",
            input(),
            &anyhow::anyhow!("boom"),
            Duration::from_millis(10),
        );
        assert_eq!(reflector.analyze(&failed).await.len(), 1);
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }
}
