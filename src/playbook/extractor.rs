//! Structured Extraction from Model Output
//!
//! Every place that needs a typed value out of free-form model text goes
//! through [`Extractor`]. Extraction never fails from the caller's point of
//! view: each configured backend is tried in order, the first result that
//! deserializes and validates wins, and otherwise the target type's
//! deterministic fallback parser produces a minimal valid value.
//!
//! Backends:
//! - [`DirectJson`]: JSON already present in the text (bare, fenced, or buried)
//! - [`ModelStructuring`]: asks a model to restate the text as JSON, under a timeout

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::schemas::{Category, ReflectionInsight};
use crate::model::{call_with_deadline, truncate, ModelClient, ModelError};

/// Extraction errors (internal to the backend chain)
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("No JSON found in {0} bytes of output")]
    NoJsonFound(usize),
    #[error("Model structuring failed: {0}")]
    Model(#[from] ModelError),
    #[error("JSON does not match {schema}: {reason}")]
    Schema { schema: &'static str, reason: String },
    #[error("Validation failed: {0}")]
    Validation(String),
}

/// Name and JSON shape of a target type, as shown to a structuring model
#[derive(Debug, Clone, Copy)]
pub struct SchemaSpec {
    pub name: &'static str,
    pub shape: &'static str,
}

/// A type that can be pulled out of model text
pub trait Extractable: DeserializeOwned + Send + Sized + 'static {
    fn schema() -> SchemaSpec;

    /// Semantic checks beyond what deserialization enforces
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }

    /// Deterministic best-effort parse of the raw text. Must not fail.
    fn fallback(raw: &str) -> Self;
}

/// Which path produced an extracted value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMethod {
    /// JSON found directly in the text
    Direct,
    /// JSON produced by a structuring model
    Model,
    /// Deterministic fallback parser
    Heuristic,
}

/// Extracted value plus provenance
#[derive(Debug, Clone)]
pub struct Extracted<T> {
    pub value: T,
    pub method: ExtractionMethod,
}

/// One way of turning raw text into a JSON value
#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn method(&self) -> ExtractionMethod;

    async fn structure(&self, raw: &str, schema: &SchemaSpec) -> Result<Value, ExtractionError>;
}

/// Finds JSON already present in the text
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectJson;

#[async_trait]
impl ExtractionBackend for DirectJson {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Direct
    }

    async fn structure(&self, raw: &str, _schema: &SchemaSpec) -> Result<Value, ExtractionError> {
        find_json(raw).ok_or(ExtractionError::NoJsonFound(raw.len()))
    }
}

/// Cap on the text handed to a structuring model
const MAX_STRUCTURING_INPUT: usize = 6000;

/// Asks a model to restate the text as JSON of the target shape
pub struct ModelStructuring {
    model: Arc<dyn ModelClient>,
    timeout: Duration,
}

impl ModelStructuring {
    pub fn new(model: Arc<dyn ModelClient>, timeout: Duration) -> Self {
        Self { model, timeout }
    }

    fn prompt(raw: &str, schema: &SchemaSpec) -> String {
        format!(
            r#"Convert the text below into JSON for a "{}" object.

The JSON must have this shape:
{}

Respond with the JSON only, no commentary.

TEXT:
{}"#,
            schema.name,
            schema.shape,
            truncate(raw, MAX_STRUCTURING_INPUT)
        )
    }
}

#[async_trait]
impl ExtractionBackend for ModelStructuring {
    fn name(&self) -> &'static str {
        "model"
    }

    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Model
    }

    async fn structure(&self, raw: &str, schema: &SchemaSpec) -> Result<Value, ExtractionError> {
        let prompt = Self::prompt(raw, schema);
        let reply = call_with_deadline(self.model.as_ref(), &prompt, self.timeout).await?;
        find_json(&reply).ok_or(ExtractionError::NoJsonFound(reply.len()))
    }
}

/// Backend chain selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStrategy {
    /// JSON in the text, then the fallback parser
    DirectOnly,
    /// JSON in the text, then a structuring model, then the fallback parser
    ModelAssisted,
}

/// Runs a backend chain with a deterministic fallback
#[derive(Clone)]
pub struct Extractor {
    backends: Vec<Arc<dyn ExtractionBackend>>,
}

impl Extractor {
    /// Direct JSON detection only; never calls a model
    pub fn direct() -> Self {
        Self {
            backends: vec![Arc::new(DirectJson)],
        }
    }

    /// Build the chain for `strategy`
    pub fn with_strategy(
        strategy: ExtractionStrategy,
        model: Arc<dyn ModelClient>,
        timeout: Duration,
    ) -> Self {
        match strategy {
            ExtractionStrategy::DirectOnly => Self::direct(),
            ExtractionStrategy::ModelAssisted => Self {
                backends: vec![
                    Arc::new(DirectJson),
                    Arc::new(ModelStructuring::new(model, timeout)),
                ],
            },
        }
    }

    /// Custom chain, tried in order
    pub fn with_backends(backends: Vec<Arc<dyn ExtractionBackend>>) -> Self {
        Self { backends }
    }

    /// Extract a `T` from `raw`. Always returns a value.
    pub async fn extract<T: Extractable>(&self, raw: &str) -> Extracted<T> {
        let schema = T::schema();

        for backend in &self.backends {
            match self.try_backend::<T>(backend.as_ref(), raw, &schema).await {
                Ok(value) => {
                    debug!("Extracted {} via {} backend", schema.name, backend.name());
                    return Extracted {
                        value,
                        method: backend.method(),
                    };
                }
                Err(e) => {
                    debug!("{} backend could not extract {}: {}", backend.name(), schema.name, e);
                }
            }
        }

        debug!("Falling back to heuristic parse for {}", schema.name);
        Extracted {
            value: T::fallback(raw),
            method: ExtractionMethod::Heuristic,
        }
    }

    async fn try_backend<T: Extractable>(
        &self,
        backend: &dyn ExtractionBackend,
        raw: &str,
        schema: &SchemaSpec,
    ) -> Result<T, ExtractionError> {
        let json = backend.structure(raw, schema).await?;
        let value: T = serde_json::from_value(json).map_err(|e| ExtractionError::Schema {
            schema: schema.name,
            reason: e.to_string(),
        })?;
        value.validate().map_err(ExtractionError::Validation)?;
        Ok(value)
    }
}

impl Default for Extractor {
    fn default() -> Self {
        Self::direct()
    }
}

/// Find a JSON object or array in model text.
///
/// Tries, in order: the whole text, the first fenced code block, then each
/// balanced `{...}`/`[...]` region from left to right.
pub fn find_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() || value.is_array() {
            return Some(value);
        }
    }

    if let Some(block) = fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(block) {
            return Some(value);
        }
    }

    for (start, c) in trimmed.char_indices() {
        if c != '{' && c != '[' {
            continue;
        }
        if let Some(region) = balanced_region(&trimmed[start..]) {
            if let Ok(value) = serde_json::from_str::<Value>(region) {
                return Some(value);
            }
        }
    }

    None
}

static FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\r?\n(.*?)```").unwrap());

fn fenced_block(text: &str) -> Option<&str> {
    FENCE_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
}

/// The balanced region starting at the first char of `s`, string-aware
fn balanced_region(s: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&s[..i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Reflector output: zero or more insights.
///
/// Accepts `{"insights": [...]}`, a bare array, or a single insight object.
/// Items are decoded one at a time: a malformed item is dropped and the rest
/// kept. Decoding fails only when the container has the wrong shape or every
/// item is unusable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BatchShape")]
pub struct InsightBatch {
    pub insights: Vec<ReflectionInsight>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BatchShape {
    Wrapped { insights: Vec<Value> },
    Bare(Vec<Value>),
    Single(Value),
}

fn decode_insight(index: usize, item: Value) -> Option<ReflectionInsight> {
    let insight: ReflectionInsight = match serde_json::from_value(item) {
        Ok(insight) => insight,
        Err(e) => {
            debug!("Dropping insight {}: {}", index, e);
            return None;
        }
    };

    if insight.content.trim().is_empty() {
        debug!("Dropping insight {}: empty content", index);
        return None;
    }
    if !insight.confidence_score.is_finite() {
        debug!("Dropping insight {}: non-finite confidence", index);
        return None;
    }
    Some(insight)
}

impl TryFrom<BatchShape> for InsightBatch {
    type Error = String;

    fn try_from(shape: BatchShape) -> Result<Self, Self::Error> {
        let items = match shape {
            BatchShape::Wrapped { insights } | BatchShape::Bare(insights) => insights,
            BatchShape::Single(item @ Value::Object(_)) => vec![item],
            BatchShape::Single(_) => return Err("expected an object or an array".to_string()),
        };

        let total = items.len();
        let insights: Vec<ReflectionInsight> = items
            .into_iter()
            .enumerate()
            .filter_map(|(i, item)| decode_insight(i, item))
            .collect();

        if total > 0 && insights.is_empty() {
            return Err(format!("none of {} insights were usable", total));
        }
        Ok(Self { insights })
    }
}

/// Confidence given to insights recovered by the line parser
const HEURISTIC_CONFIDENCE: f64 = 0.4;

static LABELED_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:[-*]\s*)?(?:\d+[.)]\s*)?\**(helpful|harmful|neutral)\**\s*[:\-]\s*(.+)$")
        .unwrap()
});

static BRACKETED_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:[-*]\s*)?(?:\d+[.)]\s*)?\[(helpful|harmful|neutral)\]\s*(.+)$").unwrap()
});

static DIRECTIVE_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*[-*]\s*(apply|avoid)\s*:\s*(.+)$").unwrap());

fn parse_insight_line(line: &str) -> Option<ReflectionInsight> {
    let caps = LABELED_LINE_RE
        .captures(line)
        .or_else(|| BRACKETED_LINE_RE.captures(line))
        .or_else(|| DIRECTIVE_LINE_RE.captures(line))?;

    let category = Category::from_label(caps.get(1)?.as_str())?;
    let content = caps.get(2)?.as_str().trim().trim_end_matches('.').trim();
    if content.is_empty() {
        return None;
    }

    Some(ReflectionInsight::new(content, category, HEURISTIC_CONFIDENCE))
}

impl Extractable for InsightBatch {
    fn schema() -> SchemaSpec {
        SchemaSpec {
            name: "InsightBatch",
            shape: r#"{"insights": [{"content": "<pattern stated as a reusable strategy>", "category": "helpful" | "harmful" | "neutral", "confidence_score": <0.0-1.0>, "recommendation": "<optional rewrite>", "tags": ["<short label>"]}]}"#,
        }
    }

    fn validate(&self) -> Result<(), String> {
        for (i, insight) in self.insights.iter().enumerate() {
            if insight.content.trim().is_empty() {
                return Err(format!("insight {} has empty content", i));
            }
            if !insight.confidence_score.is_finite() {
                return Err(format!("insight {} has non-finite confidence", i));
            }
        }
        Ok(())
    }

    fn fallback(raw: &str) -> Self {
        Self {
            insights: raw.lines().filter_map(parse_insight_line).collect(),
        }
    }
}
