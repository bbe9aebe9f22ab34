use chrono::{DateTime, Utc};
use std::cmp::Ordering;

use super::{cosine_similarity, has_topic_overlap};

/// Similarity alone groups two reading-plan items at or above this score.
pub const READING_PLAN_STRONG_SIMILARITY: f64 = 0.84;
/// Reading-plan items between this and the strong threshold need a shared topic.
pub const READING_PLAN_TOPIC_SIMILARITY: f64 = 0.68;
/// Similarity alone groups two related items at or above this score.
pub const RELATED_STRONG_SIMILARITY: f64 = 0.78;
/// Related items between this and the strong threshold need a shared topic.
pub const RELATED_TOPIC_SIMILARITY: f64 = 0.58;

/// Anything the engine can group.
pub trait Clusterable {
    fn embedding(&self) -> Option<&[f32]>;
    fn topics(&self) -> &[String];
    /// Score used to order members inside a cluster. `None` sorts below any score.
    fn relevance(&self) -> Option<f64>;
    fn created_at(&self) -> DateTime<Utc>;
}

/// Threshold policy used by a presentation surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupingPolicy {
    /// Reading plan and digest drafts. Seeds that claim nothing are dropped.
    ReadingPlan,
    /// Related-items view. Every seed is emitted, even alone.
    RelatedItems,
}

impl GroupingPolicy {
    fn thresholds(&self) -> (f64, f64) {
        match self {
            GroupingPolicy::ReadingPlan => {
                (READING_PLAN_STRONG_SIMILARITY, READING_PLAN_TOPIC_SIMILARITY)
            }
            GroupingPolicy::RelatedItems => (RELATED_STRONG_SIMILARITY, RELATED_TOPIC_SIMILARITY),
        }
    }

    /// Grouping predicate between a seed and a candidate.
    pub fn should_group(&self, similarity: f64, seed_topics: &[String], cand_topics: &[String]) -> bool {
        let (strong, topic_floor) = self.thresholds();
        if similarity >= strong {
            return true;
        }
        similarity >= topic_floor && has_topic_overlap(seed_topics, cand_topics)
    }

    pub fn emits_singletons(&self) -> bool {
        matches!(self, GroupingPolicy::RelatedItems)
    }
}

/// A group of input positions. `members[0]` is the representative.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub representative: usize,
    pub members: Vec<usize>,
    pub max_similarity: f64,
}

impl Cluster {
    pub fn size(&self) -> usize {
        self.members.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterOutput {
    pub clusters: Vec<Cluster>,
    /// Positions not placed in any cluster, in input order.
    pub leftovers: Vec<usize>,
}

/// Greedy, order-dependent clustering.
///
/// Items are visited in input order. Each unclaimed item with an embedding
/// becomes a seed and claims every later unclaimed item that satisfies the
/// policy's predicate against the seed. Claim tracking is a flat boolean
/// array indexed by input position.
pub fn cluster_items<T: Clusterable>(items: &[T], policy: GroupingPolicy) -> ClusterOutput {
    let mut claimed = vec![false; items.len()];
    let mut clusters: Vec<Cluster> = Vec::new();

    for i in 0..items.len() {
        if claimed[i] {
            continue;
        }
        let seed = &items[i];
        let seed_embedding = match seed.embedding() {
            Some(e) if !e.is_empty() => e,
            _ => {
                if policy.emits_singletons() {
                    claimed[i] = true;
                    clusters.push(Cluster {
                        representative: i,
                        members: vec![i],
                        max_similarity: 0.0,
                    });
                }
                continue;
            }
        };

        let mut members = vec![i];
        let mut max_similarity = 0.0f64;
        for j in (i + 1)..items.len() {
            if claimed[j] {
                continue;
            }
            let cand = &items[j];
            let cand_embedding = match cand.embedding() {
                Some(e) if !e.is_empty() => e,
                _ => continue,
            };
            let similarity = cosine_similarity(seed_embedding, cand_embedding);
            if policy.should_group(similarity, seed.topics(), cand.topics()) {
                claimed[j] = true;
                members.push(j);
                if similarity > max_similarity {
                    max_similarity = similarity;
                }
            }
        }

        if members.len() < 2 && !policy.emits_singletons() {
            continue;
        }
        claimed[i] = true;

        members.sort_by(|a, b| compare_members(&items[*a], &items[*b]));
        clusters.push(Cluster {
            representative: members[0],
            members,
            max_similarity,
        });
    }

    clusters.sort_by(|a, b| {
        b.size()
            .cmp(&a.size())
            .then_with(|| {
                b.max_similarity
                    .partial_cmp(&a.max_similarity)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| {
                items[b.representative]
                    .created_at()
                    .cmp(&items[a.representative].created_at())
            })
    });

    let mut in_cluster = vec![false; items.len()];
    for cluster in &clusters {
        for m in &cluster.members {
            in_cluster[*m] = true;
        }
    }
    let leftovers = (0..items.len()).filter(|i| !in_cluster[*i]).collect();

    ClusterOutput {
        clusters,
        leftovers,
    }
}

/// Member order: relevance descending (unscored last), then newest first.
pub fn compare_members<T: Clusterable>(a: &T, b: &T) -> Ordering {
    let sa = a.relevance().unwrap_or(-1.0);
    let sb = b.relevance().unwrap_or(-1.0);
    sb.partial_cmp(&sa)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.created_at().cmp(&a.created_at()))
}
