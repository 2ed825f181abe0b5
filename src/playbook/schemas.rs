//! Playbook Data Model
//!
//! Pure data definitions for the learning loop plus the helpers every other
//! component shares:
//! - Laplace-smoothed confidence from helpful/harmful tallies
//! - The versioned state transition applied by the store
//! - Pruning order for the capacity bound
//! - Prompt rendering of the top entries
//!
//! Nothing in here performs I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// Whether a learned pattern helped, hurt, or neither
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[serde(alias = "Helpful", alias = "HELPFUL", alias = "positive", alias = "success")]
    Helpful,
    #[serde(alias = "Harmful", alias = "HARMFUL", alias = "negative", alias = "failure")]
    Harmful,
    #[serde(alias = "Neutral", alias = "NEUTRAL", alias = "unknown")]
    Neutral,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Helpful => "helpful",
            Category::Harmful => "harmful",
            Category::Neutral => "neutral",
        }
    }

    /// Lenient label parsing for heuristic extraction
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "helpful" | "positive" | "success" | "apply" | "do" => Some(Category::Helpful),
            "harmful" | "negative" | "failure" | "avoid" | "dont" | "don't" => Some(Category::Harmful),
            "neutral" | "observation" | "note" => Some(Category::Neutral),
            _ => None,
        }
    }

    /// Helpful and harmful contradict each other; neutral has no opposite
    pub fn opposite(&self) -> Option<Self> {
        match self {
            Category::Helpful => Some(Category::Harmful),
            Category::Harmful => Some(Category::Helpful),
            Category::Neutral => None,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Laplace-smoothed confidence: (h + 1) / (h + n + 2)
pub fn laplace_confidence(helpful_count: u32, harmful_count: u32) -> f64 {
    let h = helpful_count as f64;
    let n = harmful_count as f64;
    (h + 1.0) / (h + n + 2.0)
}

/// One learned strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookEntry {
    pub id: String,
    pub content: String,
    pub category: Category,
    /// Always derived from the counts; recomputed on every mutation and load
    pub confidence_score: f64,
    pub helpful_count: u32,
    pub harmful_count: u32,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub last_reinforced_at: DateTime<Utc>,
}

impl PlaybookEntry {
    /// New entry with the initial tallies for its category:
    /// helpful (1,0), harmful (0,1), neutral (0,0)
    pub fn new(content: impl Into<String>, category: Category) -> Self {
        let (h, n) = match category {
            Category::Helpful => (1, 0),
            Category::Harmful => (0, 1),
            Category::Neutral => (0, 0),
        };
        Self::with_counts(content, category, h, n)
    }

    /// New entry with explicit tallies
    pub fn with_counts(
        content: impl Into<String>,
        category: Category,
        helpful_count: u32,
        harmful_count: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            category,
            confidence_score: laplace_confidence(helpful_count, harmful_count),
            helpful_count,
            harmful_count,
            tags: BTreeSet::new(),
            created_at: now,
            last_reinforced_at: now,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Add to the tallies and mark as reinforced at `now`
    pub fn reinforce(&mut self, helpful_delta: u32, harmful_delta: u32, now: DateTime<Utc>) {
        self.helpful_count = self.helpful_count.saturating_add(helpful_delta);
        self.harmful_count = self.harmful_count.saturating_add(harmful_delta);
        self.last_reinforced_at = now;
        self.recompute_confidence();
    }

    pub fn recompute_confidence(&mut self) {
        self.confidence_score = laplace_confidence(self.helpful_count, self.harmful_count);
    }

    /// Prompt ordering key: confidence * (helpful + 1)
    pub fn rank_score(&self) -> f64 {
        self.confidence_score * (self.helpful_count as f64 + 1.0)
    }

    /// Pruning ordering key: confidence * helpful
    pub fn prune_score(&self) -> f64 {
        self.confidence_score * self.helpful_count as f64
    }
}

/// Adjustment of an existing entry's tallies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryUpdate {
    pub id: String,
    pub helpful_delta: u32,
    pub harmful_delta: u32,
}

/// The unit of mutation: applied atomically as one new version
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybookDelta {
    #[serde(default)]
    pub add: Vec<PlaybookEntry>,
    #[serde(default)]
    pub update: Vec<EntryUpdate>,
    #[serde(default)]
    pub remove: Vec<String>,
}

impl PlaybookDelta {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.update.is_empty() && self.remove.is_empty()
    }

    /// Number of operations in the delta
    pub fn len(&self) -> usize {
        self.add.len() + self.update.len() + self.remove.len()
    }
}

/// Output of one reflection pass; consumed by curation, never stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionInsight {
    #[serde(alias = "pattern", alias = "insight")]
    pub content: String,
    #[serde(alias = "kind", alias = "type")]
    pub category: Category,
    /// The reflector's one-off estimate; unrelated to entry confidence
    #[serde(default = "default_insight_confidence", alias = "confidence")]
    pub confidence_score: f64,
    #[serde(default)]
    pub recommendation: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_insight_confidence() -> f64 {
    0.5
}

impl ReflectionInsight {
    pub fn new(content: impl Into<String>, category: Category, confidence_score: f64) -> Self {
        Self {
            content: content.into(),
            category,
            confidence_score,
            recommendation: None,
            tags: Vec::new(),
        }
    }
}

/// Capacity bound enforced on every state transition
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Capacity {
    pub max_entries: usize,
    /// Entries below this confidence are pruned before any other
    pub prune_threshold: f64,
}

/// The full playbook of one agent identity at one version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookState {
    pub agent_id: String,
    pub version: u64,
    pub entries: Vec<PlaybookEntry>,
    pub total_executions: u64,
    pub updated_at: DateTime<Utc>,
}

impl PlaybookState {
    /// Version 0, no entries: the state of a never-seen agent
    pub fn empty(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            version: 0,
            entries: Vec::new(),
            total_executions: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn entry(&self, id: &str) -> Option<&PlaybookEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Re-derive every confidence from its counts (after deserialization)
    pub fn recompute_confidences(&mut self) {
        for entry in &mut self.entries {
            entry.recompute_confidence();
        }
    }

    /// Build the next version from `delta`: add, then update, then remove,
    /// then prune down to `capacity`.
    ///
    /// Adds whose id already exists, and updates for unknown ids, are skipped.
    pub fn next(&self, delta: &PlaybookDelta, capacity: &Capacity, now: DateTime<Utc>) -> Self {
        let mut entries = self.entries.clone();

        for add in &delta.add {
            if entries.iter().any(|e| e.id == add.id) {
                continue;
            }
            let mut entry = add.clone();
            entry.recompute_confidence();
            entries.push(entry);
        }

        for update in &delta.update {
            if let Some(entry) = entries.iter_mut().find(|e| e.id == update.id) {
                entry.reinforce(update.helpful_delta, update.harmful_delta, now);
            }
        }

        if !delta.remove.is_empty() {
            let remove: HashSet<&str> = delta.remove.iter().map(String::as_str).collect();
            entries.retain(|e| !remove.contains(e.id.as_str()));
        }

        if entries.len() > capacity.max_entries {
            let excess = entries.len() - capacity.max_entries;
            let victims: HashSet<String> =
                select_prune_victims(&entries, excess, capacity.prune_threshold)
                    .into_iter()
                    .collect();
            entries.retain(|e| !victims.contains(&e.id));
        }

        Self {
            agent_id: self.agent_id.clone(),
            version: self.version + 1,
            entries,
            total_executions: self.total_executions + 1,
            updated_at: now,
        }
    }
}

/// Pick `excess` entry ids to drop.
///
/// Entries under `prune_threshold` confidence go first; within each group
/// the lowest `prune_score` goes first, then lowest confidence, then the
/// least recently reinforced.
pub fn select_prune_victims(
    entries: &[PlaybookEntry],
    excess: usize,
    prune_threshold: f64,
) -> Vec<String> {
    let mut ranked: Vec<&PlaybookEntry> = entries.iter().collect();
    ranked.sort_by(|a, b| {
        let a_above = a.confidence_score >= prune_threshold;
        let b_above = b.confidence_score >= prune_threshold;
        a_above
            .cmp(&b_above)
            .then_with(|| a.prune_score().total_cmp(&b.prune_score()))
            .then_with(|| a.confidence_score.total_cmp(&b.confidence_score))
            .then_with(|| a.last_reinforced_at.cmp(&b.last_reinforced_at))
    });

    ranked.into_iter().take(excess).map(|e| e.id.clone()).collect()
}

/// Header of the injected block
pub const PROMPT_HEADER: &str = "## Learned playbook";
/// Section label for helpful entries
pub const APPLY_LABEL: &str = "Apply these patterns:";
/// Section label for harmful entries
pub const AVOID_LABEL: &str = "Avoid these patterns:";

/// Render the top `max_entries` helpful/harmful entries for a system prompt.
///
/// Entries are ranked by `confidence * (helpful + 1)`, ties going to the most
/// recently reinforced. Neutral entries never appear. Returns an empty string
/// when there is nothing to inject.
pub fn format_for_prompt(entries: &[PlaybookEntry], max_entries: usize) -> String {
    let mut ranked: Vec<&PlaybookEntry> = entries
        .iter()
        .filter(|e| e.category != Category::Neutral)
        .collect();

    ranked.sort_by(|a, b| {
        b.rank_score()
            .total_cmp(&a.rank_score())
            .then_with(|| b.last_reinforced_at.cmp(&a.last_reinforced_at))
    });
    ranked.truncate(max_entries);

    if ranked.is_empty() {
        return String::new();
    }

    let helpful: Vec<&PlaybookEntry> = ranked
        .iter()
        .copied()
        .filter(|e| e.category == Category::Helpful)
        .collect();
    let harmful: Vec<&PlaybookEntry> = ranked
        .iter()
        .copied()
        .filter(|e| e.category == Category::Harmful)
        .collect();

    let mut out = String::from(PROMPT_HEADER);
    out.push('\n');

    for (label, section) in [(APPLY_LABEL, &helpful), (AVOID_LABEL, &harmful)] {
        if section.is_empty() {
            continue;
        }
        out.push_str(label);
        out.push('\n');
        for (i, entry) in section.iter().enumerate() {
            out.push_str(&format!(
                "{}. {} [confidence: {:.0}%]\n",
                i + 1,
                entry.content.trim(),
                entry.confidence_score * 100.0
            ));
        }
    }

    out.trim_end().to_string()
}

/// Summary numbers for one playbook
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybookStats {
    pub agent_id: String,
    pub version: u64,
    pub total_executions: u64,
    pub total_entries: usize,
    pub helpful_entries: usize,
    pub harmful_entries: usize,
    pub neutral_entries: usize,
    pub mean_confidence: f64,
}

impl From<&PlaybookState> for PlaybookStats {
    fn from(state: &PlaybookState) -> Self {
        let count = |c: Category| state.entries.iter().filter(|e| e.category == c).count();
        let mean_confidence = if state.entries.is_empty() {
            0.0
        } else {
            state.entries.iter().map(|e| e.confidence_score).sum::<f64>()
                / state.entries.len() as f64
        };

        Self {
            agent_id: state.agent_id.clone(),
            version: state.version,
            total_executions: state.total_executions,
            total_entries: state.entries.len(),
            helpful_entries: count(Category::Helpful),
            harmful_entries: count(Category::Harmful),
            neutral_entries: count(Category::Neutral),
            mean_confidence,
        }
    }
}
