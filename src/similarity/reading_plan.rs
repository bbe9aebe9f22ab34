use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use super::engine::{cluster_items, compare_members, Clusterable, GroupingPolicy};
use crate::models::Item;

/// Label used when an item has neither a topic nor a title.
pub const FALLBACK_CLUSTER_LABEL: &str = "Related";

/// A reading-plan cluster of at least two items.
#[derive(Debug, Clone, Serialize)]
pub struct ItemCluster {
    /// Representative item id, stable across re-runs over the same input.
    pub id: String,
    pub label: String,
    pub size: usize,
    pub max_similarity: f64,
    pub representative: Item,
    pub items: Vec<Item>,
}

struct EmbeddedItem<'a> {
    item: &'a Item,
    embedding: Option<&'a [f32]>,
}

impl Clusterable for EmbeddedItem<'_> {
    fn embedding(&self) -> Option<&[f32]> {
        self.embedding
    }
    fn topics(&self) -> &[String] {
        &self.item.summary_topics
    }
    fn relevance(&self) -> Option<f64> {
        self.item.summary_score
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.item.created_at
    }
}

/// Groups items for the reading plan using their stored embeddings.
///
/// When `selected` is given, clusters without any selected member are dropped
/// and the representative is the best selected member.
pub fn reading_plan_clusters(
    items: &[Item],
    embeddings: &HashMap<String, Vec<f32>>,
    selected: Option<&HashSet<String>>,
) -> Vec<ItemCluster> {
    if items.len() < 2 {
        return Vec::new();
    }
    let embedded: Vec<EmbeddedItem<'_>> = items
        .iter()
        .map(|item| EmbeddedItem {
            item,
            embedding: embeddings
                .get(&item.id)
                .map(|e| e.as_slice())
                .filter(|e| !e.is_empty()),
        })
        .collect();
    if embedded.iter().filter(|e| e.embedding.is_some()).count() < 2 {
        return Vec::new();
    }

    let selected = selected.filter(|s| !s.is_empty());
    let output = cluster_items(&embedded, GroupingPolicy::ReadingPlan);

    let mut clusters = Vec::with_capacity(output.clusters.len());
    for cluster in output.clusters {
        let members: Vec<Item> = cluster
            .members
            .iter()
            .map(|i| items[*i].clone())
            .collect();

        let representative = match selected {
            Some(selected) => {
                let mut selected_members: Vec<&EmbeddedItem<'_>> = cluster
                    .members
                    .iter()
                    .map(|i| &embedded[*i])
                    .filter(|e| selected.contains(&e.item.id))
                    .collect();
                if selected_members.is_empty() {
                    continue;
                }
                selected_members.sort_by(|a, b| compare_members(*a, *b));
                selected_members[0].item.clone()
            }
            None => members[0].clone(),
        };

        clusters.push(ItemCluster {
            id: representative.id.clone(),
            label: cluster_label(&representative),
            size: members.len(),
            max_similarity: cluster.max_similarity,
            representative,
            items: members,
        });
    }

    clusters.sort_by(|a, b| {
        b.size
            .cmp(&a.size)
            .then_with(|| {
                b.max_similarity
                    .partial_cmp(&a.max_similarity)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| b.representative.created_at.cmp(&a.representative.created_at))
    });
    clusters
}

/// First non-empty topic, else the title, else a fixed label.
pub fn cluster_label(item: &Item) -> String {
    if let Some(topic) = item.summary_topics.iter().find(|t| !t.is_empty()) {
        return topic.clone();
    }
    match item.title.as_deref() {
        Some(title) if !title.is_empty() => title.to_string(),
        _ => FALLBACK_CLUSTER_LABEL.to_string(),
    }
}
