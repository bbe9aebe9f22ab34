//! Related-item reranking.
//!
//! Candidates arrive from a nearest-neighbour lookup over item embeddings with
//! a similarity score already attached. This module filters them against the
//! target item's topics, boosts topic overlap, attaches a short reason and
//! groups the survivors for display.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashSet;

use crate::db::Database;
use crate::models::RelatedItem;
use crate::similarity::{cluster_items, Clusterable, GroupingPolicy, FALLBACK_CLUSTER_LABEL};

pub const DEFAULT_RELATED_LIMIT: usize = 6;
pub const MAX_RELATED_LIMIT: usize = 20;

const NO_OVERLAP_MIN_SIMILARITY: f64 = 0.58;
const OVERLAP_MIN_SIMILARITY: f64 = 0.42;
const FALLBACK_SIMILARITY: [f64; 2] = [0.62, 0.50];
const TOPIC_OVERLAP_BONUS: f64 = 0.06;
const MAX_BONUS_TOPICS: usize = 3;
const MAX_REASON_TOPICS: usize = 3;

/// Clamps a caller-supplied limit: 0 means the default, anything larger than
/// the maximum is capped.
pub fn normalize_limit(limit: usize) -> usize {
    match limit {
        0 => DEFAULT_RELATED_LIMIT,
        n => n.min(MAX_RELATED_LIMIT),
    }
}

fn topic_set(topics: &[String]) -> HashSet<&str> {
    topics
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect()
}

fn overlap_count(target: &HashSet<&str>, topics: &[String]) -> usize {
    topics
        .iter()
        .filter(|t| target.contains(t.trim()))
        .count()
}

struct Scored {
    item: RelatedItem,
    score: f64,
    overlap: usize,
}

/// Filters, boosts and orders related candidates, keeping at most `limit`.
pub fn rerank_related(
    candidates: Vec<RelatedItem>,
    target_topics: &[String],
    limit: usize,
) -> Vec<RelatedItem> {
    if limit == 0 || candidates.is_empty() {
        return Vec::new();
    }
    let target = topic_set(target_topics);

    let mut scored: Vec<Scored> = candidates
        .iter()
        .filter_map(|c| {
            let overlap = overlap_count(&target, &c.topics);
            let floor = if overlap == 0 {
                NO_OVERLAP_MIN_SIMILARITY
            } else {
                OVERLAP_MIN_SIMILARITY
            };
            if c.similarity < floor {
                return None;
            }
            let bonus = overlap.min(MAX_BONUS_TOPICS) as f64 * TOPIC_OVERLAP_BONUS;
            Some(Scored {
                item: c.clone(),
                score: c.similarity + bonus,
                overlap,
            })
        })
        .collect();

    for threshold in FALLBACK_SIMILARITY {
        if !scored.is_empty() {
            break;
        }
        scored = candidates
            .iter()
            .filter(|c| c.similarity >= threshold)
            .map(|c| Scored {
                item: c.clone(),
                score: c.similarity,
                overlap: 0,
            })
            .collect();
    }

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.overlap.cmp(&a.overlap))
            .then_with(|| {
                b.item
                    .similarity
                    .partial_cmp(&a.item.similarity)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| b.item.created_at.cmp(&a.item.created_at))
    });
    scored.truncate(limit);
    scored.into_iter().map(|s| s.item).collect()
}

/// Sets `reason` and `reason_topics` on every item.
pub fn annotate_reasons(items: &mut [RelatedItem], target_topics: &[String]) {
    let target = topic_set(target_topics);
    for item in items.iter_mut() {
        let mut seen = HashSet::new();
        let shared: Vec<String> = item
            .topics
            .iter()
            .map(|t| t.trim())
            .filter(|t| target.contains(t) && seen.insert(*t))
            .take(MAX_REASON_TOPICS)
            .map(str::to_string)
            .collect();

        item.reason = Some(if shared.is_empty() {
            similarity_reason(item.similarity).to_string()
        } else {
            format!("shared topics: {}", shared.join(", "))
        });
        item.reason_topics = shared;
    }
}

fn similarity_reason(similarity: f64) -> &'static str {
    if similarity >= 0.8 {
        "very high semantic similarity"
    } else if similarity >= 0.65 {
        "high semantic similarity"
    } else {
        "semantic similarity match"
    }
}

/// A display group of related items. Singletons are groups too.
#[derive(Debug, Clone, Serialize)]
pub struct RelatedCluster {
    pub id: String,
    pub label: String,
    pub size: usize,
    pub max_similarity: f64,
    pub representative: RelatedItem,
    pub items: Vec<RelatedItem>,
}

impl Clusterable for RelatedItem {
    fn embedding(&self) -> Option<&[f32]> {
        self.embedding.as_deref()
    }
    fn topics(&self) -> &[String] {
        &self.topics
    }
    /// Similarity to the target item.
    fn relevance(&self) -> Option<f64> {
        Some(self.similarity)
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Groups reranked items for display using the related-items policy.
///
/// Items are visited in similarity order so the strongest match seeds the
/// first group. Items without an embedding come back as their own group.
pub fn cluster_related(items: &[RelatedItem]) -> Vec<RelatedCluster> {
    if items.is_empty() {
        return Vec::new();
    }
    let mut ordered: Vec<RelatedItem> = items.to_vec();
    ordered.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });

    let output = cluster_items(&ordered, GroupingPolicy::RelatedItems);
    output
        .clusters
        .into_iter()
        .map(|cluster| {
            let members: Vec<RelatedItem> =
                cluster.members.iter().map(|i| ordered[*i].clone()).collect();
            let representative = ordered[cluster.representative].clone();
            RelatedCluster {
                id: representative.id.clone(),
                label: related_label(&representative),
                size: members.len(),
                max_similarity: cluster.max_similarity,
                representative,
                items: members,
            }
        })
        .collect()
}

fn related_label(item: &RelatedItem) -> String {
    if let Some(topic) = item.topics.iter().map(|t| t.trim()).find(|t| !t.is_empty()) {
        return topic.to_string();
    }
    match item.title.as_deref().map(str::trim) {
        Some(title) if !title.is_empty() => title.to_string(),
        _ => FALLBACK_CLUSTER_LABEL.to_string(),
    }
}

/// Related items for one of a user's items, reranked, annotated and grouped.
#[derive(Debug, Clone, Serialize)]
pub struct RelatedResult {
    pub items: Vec<RelatedItem>,
    pub clusters: Vec<RelatedCluster>,
}

/// Looks up neighbours of `item_id` and runs them through [`rerank_related`],
/// [`annotate_reasons`] and [`cluster_related`].
///
/// An item without an embedding, or one the user does not own, has no related
/// items.
pub async fn find_related(
    db: &Database,
    user_id: &str,
    item_id: &str,
    limit: usize,
) -> Result<RelatedResult, sqlx::Error> {
    let limit = normalize_limit(limit);
    let target_topics = db
        .get_item(item_id)
        .await?
        .map(|item| item.summary_topics)
        .unwrap_or_default();
    let candidates = db.list_related_candidates(item_id, user_id, limit).await?;
    let mut items = rerank_related(candidates, &target_topics, limit);
    annotate_reasons(&mut items, &target_topics);
    let clusters = cluster_related(&items);
    Ok(RelatedResult { items, clusters })
}
