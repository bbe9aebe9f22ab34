use std::collections::BTreeSet;

use crate::models::DigestClusterDraft;

/// Default number of drafts handed to the digest composer.
pub const DEFAULT_DRAFT_TARGET: usize = 20;
/// Drafts at these leading ranks are always kept verbatim when possible.
pub const PROTECTED_LEADING_DRAFTS: usize = 10;
/// Later drafts with at least this many items are kept verbatim too.
pub const DENSE_CLUSTER_ITEMS: i64 = 3;

pub const BROAD_LABEL: &str = "Broad topics (cross-cutting)";
pub const MERGED_TAIL_LABEL: &str = "Other topics";

/// Reduces `drafts` to at most `target` entries without losing items.
///
/// High-signal drafts (the leading ranks and dense clusters) are kept as-is.
/// The rest are merged into synthetic buckets whose `item_count` is the sum
/// of what they absorbed, so the total item count never changes.
pub fn compress_cluster_drafts(
    drafts: Vec<DigestClusterDraft>,
    target: usize,
) -> Vec<DigestClusterDraft> {
    let target = if target == 0 {
        DEFAULT_DRAFT_TARGET
    } else {
        target
    };
    if drafts.len() <= target {
        return drafts;
    }

    let mut keep = Vec::with_capacity(target);
    let mut tail = Vec::new();
    for (i, draft) in drafts.into_iter().enumerate() {
        if i < PROTECTED_LEADING_DRAFTS || draft.item_count >= DENSE_CLUSTER_ITEMS {
            keep.push(draft);
        } else {
            tail.push(draft);
        }
    }

    let mut broad_count = match tail.len() {
        n if n >= 10 => 2,
        n if n >= 4 => 1,
        _ => 0,
    };

    if keep.len() >= target {
        // Whatever does not fit must still land in a bucket.
        if broad_count == 0 {
            broad_count = 1;
        }
        let broad_count = broad_count.min(target);
        let overflow = keep.split_off(target - broad_count);
        let leftover: Vec<DigestClusterDraft> = overflow.into_iter().chain(tail).collect();

        if broad_count == 1 {
            keep.push(merge_drafts(&leftover, "broad-1", BROAD_LABEL));
        } else {
            let mid = (leftover.len() / 2).max(1);
            keep.push(merge_drafts(
                &leftover[..mid],
                "broad-1",
                &format!("{} A", BROAD_LABEL),
            ));
            keep.push(merge_drafts(
                &leftover[mid..],
                "broad-2",
                &format!("{} B", BROAD_LABEL),
            ));
        }
        return rerank(keep);
    }

    let remaining = target - keep.len();
    if tail.is_empty() {
        return rerank(keep);
    }

    let chunk_size = tail.len().div_ceil(remaining).max(2);
    for chunk in tail.chunks(chunk_size) {
        if keep.len() >= target {
            break;
        }
        if chunk.len() == 1 {
            keep.push(chunk[0].clone());
            continue;
        }
        let key = format!("merged-tail-{}", keep.len() + 1);
        keep.push(merge_drafts(chunk, &key, MERGED_TAIL_LABEL));
    }

    rerank(keep)
}

/// Folds several drafts into one synthetic bucket.
///
/// Each member contributes `- [label] first-line`, with the first line's own
/// `- ` bullet dropped so lines are not double-bulleted.
fn merge_drafts(chunk: &[DigestClusterDraft], key: &str, label: &str) -> DigestClusterDraft {
    let mut item_count = 0;
    let mut max_score: Option<f64> = None;
    let mut topics = BTreeSet::new();
    let mut lines = Vec::with_capacity(chunk.len());

    for draft in chunk {
        item_count += draft.item_count;
        if let Some(score) = draft.max_score {
            max_score = Some(max_score.map_or(score, |m| m.max(score)));
        }
        for topic in &draft.topics {
            let topic = topic.trim();
            if !topic.is_empty() {
                topics.insert(topic.to_string());
            }
        }
        let body = draft.draft_summary.trim();
        if let Some(first) = body.lines().next() {
            let first = first.trim().trim_start_matches("- ");
            lines.push(format!("- [{}] {}", draft.cluster_label, first));
        }
    }

    DigestClusterDraft {
        cluster_key: key.to_string(),
        cluster_label: label.to_string(),
        rank: 0,
        item_count,
        topics: topics.into_iter().collect(),
        max_score,
        draft_summary: lines.join("\n"),
    }
}

fn rerank(mut drafts: Vec<DigestClusterDraft>) -> Vec<DigestClusterDraft> {
    for (i, draft) in drafts.iter_mut().enumerate() {
        draft.rank = i as i64 + 1;
    }
    drafts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(rank: i64, count: i64, topics: &[&str], score: Option<f64>) -> DigestClusterDraft {
        DigestClusterDraft {
            cluster_key: format!("k{}", rank),
            cluster_label: format!("L{}", rank),
            rank,
            item_count: count,
            topics: topics.iter().map(|t| t.to_string()).collect(),
            max_score: score,
            draft_summary: format!("- item {}: summary\n- second line", rank),
        }
    }

    fn total(drafts: &[DigestClusterDraft]) -> i64 {
        drafts.iter().map(|d| d.item_count).sum()
    }

    fn assert_dense_ranks(drafts: &[DigestClusterDraft]) {
        for (i, d) in drafts.iter().enumerate() {
            assert_eq!(d.rank, i as i64 + 1);
        }
    }

    #[test]
    fn test_short_list_is_unchanged() {
        let drafts: Vec<_> = (1..=5).map(|r| draft(r, 1, &[], None)).collect();
        assert_eq!(compress_cluster_drafts(drafts.clone(), 20), drafts);
    }

    #[test]
    fn test_twenty_five_drafts_with_small_tail() {
        // 10 leading drafts, then 8 dense drafts interleaved with 7 singletons.
        let mut drafts: Vec<_> = (1..=10).map(|r| draft(r, 1, &["lead"], None)).collect();
        for r in 11..=25 {
            let count = if r % 2 == 1 { 3 } else { 1 };
            drafts.push(draft(r, count, &["tail"], Some(r as f64 / 100.0)));
        }
        let before = total(&drafts);

        let out = compress_cluster_drafts(drafts, 20);
        assert_eq!(out.len(), 20);
        assert_eq!(total(&out), before);
        assert_dense_ranks(&out);
        assert_eq!(out[18].cluster_key, "merged-tail-19");
        assert_eq!(out[18].cluster_label, MERGED_TAIL_LABEL);
        assert_eq!(out[18].item_count, 4);
        assert_eq!(out[19].item_count, 3);
        assert_eq!(out[19].max_score, Some(0.24));
    }

    #[test]
    fn test_dense_overflow_goes_to_broad_bucket() {
        let drafts: Vec<_> = (1..=25).map(|r| draft(r, 5, &["x"], None)).collect();
        let out = compress_cluster_drafts(drafts, 20);
        assert_eq!(out.len(), 20);
        assert_eq!(total(&out), 125);
        assert_eq!(out[19].cluster_key, "broad-1");
        assert_eq!(out[19].item_count, 30);
        assert_dense_ranks(&out);
    }

    #[test]
    fn test_large_tail_splits_into_two_broad_buckets() {
        let mut drafts: Vec<_> = (1..=10).map(|r| draft(r, 1, &[], None)).collect();
        drafts.extend((11..=22).map(|r| draft(r, 4, &[], None)));
        drafts.extend((23..=34).map(|r| draft(r, 1, &["b", "a", " "], Some(0.5))));
        let before = total(&drafts);

        let out = compress_cluster_drafts(drafts, 20);
        assert_eq!(out.len(), 20);
        assert_eq!(total(&out), before);
        assert_eq!(out[18].cluster_key, "broad-1");
        assert_eq!(out[19].cluster_key, "broad-2");
        assert_eq!(out[19].topics, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(out[19].max_score, Some(0.5));
    }

    #[test]
    fn test_tiny_target_still_covers_everything() {
        let drafts: Vec<_> = (1..=6).map(|r| draft(r, 2, &[], None)).collect();
        let out = compress_cluster_drafts(drafts, 1);
        assert_eq!(out.len(), 1);
        assert_eq!(total(&out), 12);
    }

    #[test]
    fn test_merged_body_uses_first_line_per_draft() {
        let merged = merge_drafts(&[draft(1, 1, &[], None), draft(2, 2, &[], None)], "m", "Other");
        assert_eq!(
            merged.draft_summary,
            "- [L1] item 1: summary\n- [L2] item 2: summary"
        );
        assert_eq!(merged.item_count, 3);
    }

    #[test]
    fn test_compression_invariant_over_many_shapes() {
        for n in 0..60i64 {
            for target in [1usize, 2, 5, 12, 20] {
                let drafts: Vec<_> = (1..=n)
                    .map(|r| draft(r, (r * 7 % 5) + 1, &["t"], None))
                    .collect();
                let before = total(&drafts);
                let out = compress_cluster_drafts(drafts, target);
                assert!(out.len() <= target);
                assert_eq!(total(&out), before, "n={} target={}", n, target);
            }
        }
    }
}
