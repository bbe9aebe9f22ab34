//! Embedding similarity and greedy clustering.
//!
//! The engine is pure: it takes items that expose an optional embedding,
//! topic list, relevance score and creation time, and partitions them into
//! clusters plus leftovers. Callers (reading plan, related items, digest
//! drafts) decide how to present the result.

pub mod engine;
pub mod reading_plan;

pub use engine::{cluster_items, Cluster, ClusterOutput, Clusterable, GroupingPolicy};
pub use reading_plan::{reading_plan_clusters, ItemCluster, FALLBACK_CLUSTER_LABEL};

/// Cosine similarity of two vectors.
///
/// Returns 0.0 for empty, mismatched or zero-norm inputs so callers never
/// see an error or a NaN.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    let similarity = dot / (norm_a.sqrt() * norm_b.sqrt());
    if similarity.is_finite() {
        similarity
    } else {
        0.0
    }
}

/// Scales a vector to unit length. Zero vectors are returned unchanged.
pub fn normalize_vector(v: &[f32]) -> Vec<f32> {
    let norm_sq: f64 = v.iter().map(|x| (*x as f64) * (*x as f64)).sum();
    if norm_sq == 0.0 {
        return v.to_vec();
    }
    let norm = norm_sq.sqrt();
    v.iter().map(|x| ((*x as f64) / norm) as f32).collect()
}

/// True when both lists share at least one non-empty topic (exact, case-sensitive).
pub fn has_topic_overlap(a: &[String], b: &[String]) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a.iter()
        .filter(|t| !t.is_empty())
        .any(|t| b.iter().any(|other| other == t))
}
