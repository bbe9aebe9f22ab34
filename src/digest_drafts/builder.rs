use std::collections::{HashMap, HashSet};

use super::MAX_DRAFT_LINES;
use crate::models::{DigestClusterDraft, DigestItemDetail};
use crate::similarity::ItemCluster;

/// Label for drafts whose items carry no topic at all.
pub const UNTAGGED_LABEL: &str = "__untagged__";

const MAX_FACTS_PER_LINE: usize = 2;

/// Builds one draft per embedding cluster, then one per leftover item.
///
/// Every input item lands in exactly one draft, so the sum of `item_count`
/// equals `details.len()` (duplicate ids in `details` are counted once).
/// Ranks are dense and 1-based in output order.
pub fn build_cluster_drafts(
    details: &[DigestItemDetail],
    clusters: &[ItemCluster],
) -> Vec<DigestClusterDraft> {
    if details.is_empty() {
        return Vec::new();
    }

    let by_id: HashMap<&str, &DigestItemDetail> =
        details.iter().map(|d| (d.item.id.as_str(), d)).collect();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut drafts = Vec::with_capacity(details.len());
    let mut rank = 1;

    for cluster in clusters {
        let mut group: Vec<&DigestItemDetail> = Vec::with_capacity(cluster.items.len());
        for member in &cluster.items {
            let Some(detail) = by_id.get(member.id.as_str()) else {
                continue;
            };
            if !seen.insert(detail.item.id.as_str()) {
                continue;
            }
            group.push(*detail);
        }
        if group.is_empty() {
            continue;
        }
        let label = if cluster.label.trim().is_empty() {
            topic_key(&group[0].summary.topics)
        } else {
            cluster.label.clone()
        };
        drafts.push(build_draft(rank, &cluster.id, &label, &group));
        rank += 1;
    }

    for detail in details {
        if !seen.insert(detail.item.id.as_str()) {
            continue;
        }
        let label = topic_key(&detail.summary.topics);
        drafts.push(build_draft(rank, &detail.item.id, &label, &[detail]));
        rank += 1;
    }

    drafts
}

/// First non-empty trimmed topic, or the untagged sentinel.
pub fn topic_key(topics: &[String]) -> String {
    topics
        .iter()
        .map(|t| t.trim())
        .find(|t| !t.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| UNTAGGED_LABEL.to_string())
}

fn build_draft(rank: i64, key: &str, label: &str, group: &[&DigestItemDetail]) -> DigestClusterDraft {
    let max_score = group
        .iter()
        .filter_map(|d| d.summary.score)
        .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |m| m.max(s))));

    let mut lines: Vec<String> = group
        .iter()
        .take(MAX_DRAFT_LINES)
        .map(|d| member_line(d))
        .collect();
    if group.len() > MAX_DRAFT_LINES {
        lines.push(format!(
            "- ...and {} more related items",
            group.len() - MAX_DRAFT_LINES
        ));
    }

    DigestClusterDraft {
        cluster_key: key.to_string(),
        cluster_label: label.to_string(),
        rank,
        item_count: group.len() as i64,
        topics: group[0].summary.topics.clone(),
        max_score,
        draft_summary: lines.join("\n"),
    }
}

fn member_line(detail: &DigestItemDetail) -> String {
    let title = match detail.item.title.as_deref() {
        Some(t) if !t.trim().is_empty() => t.trim(),
        _ => detail.item.url.trim(),
    };
    let summary = detail.summary.summary.trim();
    let facts: Vec<&str> = detail
        .facts
        .iter()
        .map(|f| f.trim())
        .filter(|f| !f.is_empty())
        .take(MAX_FACTS_PER_LINE)
        .collect();
    let fact_line = facts.join(" / ");

    match (summary.is_empty(), fact_line.is_empty()) {
        (false, false) => format!("- {}: {} | facts: {}", title, summary, fact_line),
        (false, true) => format!("- {}: {}", title, summary),
        (true, false) => format!("- {}: {}", title, fact_line),
        (true, true) => format!("- {}", title),
    }
}
