//! Curation: merging insights into a playbook delta
//!
//! Each insight is compared by embedding similarity against the current
//! entries and against entries added earlier in the same batch. A close
//! enough match becomes a counter update instead of a new entry, so the
//! playbook grows by distinct ideas and confidence grows by repetition.
//!
//! Matching order for an insight, among candidates at or above the
//! similarity threshold:
//! 1. same category: reinforcement
//! 2. opposite category (helpful vs harmful): contradiction
//! 3. neutral entry: reinforcement of the insight's side
//!
//! A neutral insight that only matches non-neutral entries is dropped.
//! Counters always move on the insight's side: helpful adds to
//! `helpful_count`, harmful to `harmful_count`, neutral to neither.
//!
//! If the projected playbook exceeds its capacity, pruning is folded into
//! the same delta.
//!
//! With a fallback embedder configured, a service failure from the primary
//! embedder switches the whole pass to the fallback, so vectors from two
//! embedders are never compared.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use super::schemas::{
    select_prune_victims, Category, EntryUpdate, PlaybookDelta, PlaybookEntry, ReflectionInsight,
};
use crate::config::PlaybookConfig;
use crate::embeddings::{cosine_similarity, Embedder, EmbeddingError};

/// An entry that an insight may match
struct Candidate {
    id: String,
    category: Category,
    embedding: Vec<f32>,
    last_reinforced_at: DateTime<Utc>,
}

/// Turns insights into deltas using semantic de-duplication
pub struct Curator {
    embedder: Arc<dyn Embedder>,
    fallback: Option<Arc<dyn Embedder>>,
}

impl Curator {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            fallback: None,
        }
    }

    /// Use `fallback` for any pass in which `embedder` fails
    pub fn with_fallback(embedder: Arc<dyn Embedder>, fallback: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            fallback: Some(fallback),
        }
    }

    /// Embed every text with one embedder, switching to the fallback for
    /// all of them on the first service failure
    async fn embed_pass(&self, texts: &[&str]) -> Vec<Result<Vec<f32>, EmbeddingError>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            let result = self.embedder.embed(text).await;
            if let (Err(e), Some(fallback)) = (&result, &self.fallback) {
                if !matches!(e, EmbeddingError::EmptyText) {
                    warn!("Primary embedder failed ({}), using fallback for this pass", e);
                    let mut vectors = Vec::with_capacity(texts.len());
                    for text in texts {
                        vectors.push(fallback.embed(text).await);
                    }
                    return vectors;
                }
            }
            vectors.push(result);
        }
        vectors
    }

    /// Curate with default settings
    pub async fn curate(
        &self,
        entries: &[PlaybookEntry],
        insights: &[ReflectionInsight],
    ) -> PlaybookDelta {
        self.curate_with(entries, insights, &PlaybookConfig::default()).await
    }

    /// Build the delta that merges `insights` into `entries`
    pub async fn curate_with(
        &self,
        entries: &[PlaybookEntry],
        insights: &[ReflectionInsight],
        config: &PlaybookConfig,
    ) -> PlaybookDelta {
        if insights.is_empty() {
            return PlaybookDelta::default();
        }

        let config = config.validated();
        let threshold = config.similarity_threshold as f32;
        let now = Utc::now();

        let texts: Vec<&str> = entries
            .iter()
            .map(|e| e.content.as_str())
            .chain(insights.iter().map(|i| i.content.trim()))
            .collect();
        let mut vectors = self.embed_pass(&texts).await.into_iter();

        let mut candidates = Vec::with_capacity(entries.len() + insights.len());
        for (entry, vector) in entries.iter().zip(vectors.by_ref()) {
            match vector {
                Ok(embedding) => candidates.push(Candidate {
                    id: entry.id.clone(),
                    category: entry.category,
                    embedding,
                    last_reinforced_at: entry.last_reinforced_at,
                }),
                Err(e) => debug!("Entry {} excluded from matching: {}", entry.id, e),
            }
        }

        let mut adds: Vec<PlaybookEntry> = Vec::new();
        let mut updates: Vec<EntryUpdate> = Vec::new();

        for (insight, vector) in insights.iter().zip(vectors) {
            let content = insight.content.trim();
            if content.is_empty() {
                debug!("Dropping insight with empty content");
                continue;
            }

            let embedding = match vector {
                Ok(embedding) => embedding,
                Err(e) => {
                    warn!("Dropping insight '{}': {}", content, e);
                    continue;
                }
            };

            let (helpful_delta, harmful_delta) = match insight.category {
                Category::Helpful => (1, 0),
                Category::Harmful => (0, 1),
                Category::Neutral => (0, 0),
            };

            match best_match(&candidates, &embedding, insight.category, threshold) {
                Match::Entry(idx) => {
                    let target = &mut candidates[idx];
                    target.last_reinforced_at = now;
                    merge_update(&mut updates, &target.id, helpful_delta, harmful_delta);
                    debug!(
                        "Insight '{}' reinforces {} entry {}",
                        content, target.category, target.id
                    );
                }
                Match::Conflicting => {
                    debug!("Neutral insight '{}' matches a non-neutral entry, dropped", content);
                }
                Match::None => {
                    let entry = PlaybookEntry::new(content, insight.category)
                        .with_tags(insight.tags.iter().map(|t| t.trim().to_string()).filter(|t| !t.is_empty()));
                    candidates.push(Candidate {
                        id: entry.id.clone(),
                        category: entry.category,
                        embedding,
                        last_reinforced_at: entry.last_reinforced_at,
                    });
                    adds.push(entry);
                }
            }
        }

        let mut delta = PlaybookDelta {
            add: adds,
            update: updates,
            remove: Vec::new(),
        };
        prune_projected(entries, &mut delta, &config, now);

        if !delta.is_empty() {
            debug!(
                "Curated {} insights into {} adds, {} updates, {} removes",
                insights.len(),
                delta.add.len(),
                delta.update.len(),
                delta.remove.len()
            );
        }
        delta
    }
}

enum Match {
    Entry(usize),
    /// Neutral insight close to a helpful/harmful entry
    Conflicting,
    None,
}

/// Pick the matching candidate, preferring category agreement, then higher
/// similarity, then the most recently reinforced
fn best_match(candidates: &[Candidate], embedding: &[f32], category: Category, threshold: f32) -> Match {
    let scored: Vec<(usize, f32)> = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| (i, cosine_similarity(&c.embedding, embedding)))
        .filter(|(_, sim)| *sim >= threshold)
        .collect();

    if scored.is_empty() {
        return Match::None;
    }

    let tiers: Vec<Option<Category>> = match category {
        Category::Neutral => vec![Some(Category::Neutral)],
        other => vec![Some(other), other.opposite(), Some(Category::Neutral)],
    };

    for tier in tiers.into_iter().flatten() {
        let best = scored
            .iter()
            .filter(|(i, _)| candidates[*i].category == tier)
            .max_by(|(a_idx, a_sim), (b_idx, b_sim)| {
                a_sim.total_cmp(b_sim).then_with(|| {
                    candidates[*a_idx]
                        .last_reinforced_at
                        .cmp(&candidates[*b_idx].last_reinforced_at)
                })
            });

        if let Some((idx, _)) = best {
            return Match::Entry(*idx);
        }
    }

    // Only reachable for neutral insights
    Match::Conflicting
}

fn merge_update(updates: &mut Vec<EntryUpdate>, id: &str, helpful_delta: u32, harmful_delta: u32) {
    match updates.iter_mut().find(|u| u.id == id) {
        Some(existing) => {
            existing.helpful_delta += helpful_delta;
            existing.harmful_delta += harmful_delta;
        }
        None => updates.push(EntryUpdate {
            id: id.to_string(),
            helpful_delta,
            harmful_delta,
        }),
    }
}

/// Fold capacity pruning into `delta` based on the projected entry set
fn prune_projected(
    entries: &[PlaybookEntry],
    delta: &mut PlaybookDelta,
    config: &PlaybookConfig,
    now: DateTime<Utc>,
) {
    let updates: HashMap<&str, &EntryUpdate> =
        delta.update.iter().map(|u| (u.id.as_str(), u)).collect();

    let projected: Vec<PlaybookEntry> = entries
        .iter()
        .chain(delta.add.iter())
        .map(|entry| {
            let mut entry = entry.clone();
            if let Some(update) = updates.get(entry.id.as_str()) {
                entry.reinforce(update.helpful_delta, update.harmful_delta, now);
            }
            entry
        })
        .collect();

    if projected.len() <= config.max_playbook_entries {
        return;
    }

    let excess = projected.len() - config.max_playbook_entries;
    let victims: HashSet<String> = select_prune_victims(&projected, excess, config.prune_threshold)
        .into_iter()
        .collect();

    let pending: HashSet<&str> = delta.add.iter().map(|e| e.id.as_str()).collect();
    let mut remove: Vec<String> = entries
        .iter()
        .filter(|e| victims.contains(&e.id) && !pending.contains(e.id.as_str()))
        .map(|e| e.id.clone())
        .collect();

    delta.add.retain(|e| !victims.contains(&e.id));
    delta.update.retain(|u| !victims.contains(&u.id));
    delta.remove.append(&mut remove);

    debug!("Pruning {} entries to stay within {}", excess, config.max_playbook_entries);
}
