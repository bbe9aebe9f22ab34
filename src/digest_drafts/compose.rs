use serde::{Deserialize, Serialize};

use crate::models::DigestClusterDraft;

/// Drafts at this zero-based position and beyond are sent to the composer
/// with only their first line.
pub const COMPOSE_DETAIL_CUTOFF: usize = 12;

/// One entry of the final compose request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposeDigestItem {
    pub rank: i64,
    pub title: Option<String>,
    #[serde(default)]
    pub url: String,
    pub summary: String,
    pub topics: Vec<String>,
    pub score: Option<f64>,
}

/// Non-empty trimmed lines of a draft body.
pub fn draft_source_lines(draft_summary: &str) -> Vec<String> {
    draft_summary
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Turns compressed drafts into compose input.
///
/// Multi-item drafts get their item count in the title. Past
/// [`COMPOSE_DETAIL_CUTOFF`], bodies shrink to their first line plus a note
/// saying how many lines were left out.
pub fn build_compose_items(drafts: &[DigestClusterDraft]) -> Vec<ComposeDigestItem> {
    drafts
        .iter()
        .enumerate()
        .map(|(i, draft)| {
            let title = if draft.item_count > 1 {
                format!("{} ({} items)", draft.cluster_label, draft.item_count)
            } else {
                draft.cluster_label.clone()
            };

            let summary = if i >= COMPOSE_DETAIL_CUTOFF {
                let lines = draft_source_lines(&draft.draft_summary);
                match lines.split_first() {
                    Some((first, rest)) if !rest.is_empty() => format!(
                        "{}\n- ...{} more lines omitted in compose input",
                        first,
                        rest.len()
                    ),
                    Some((first, _)) => first.clone(),
                    None => String::new(),
                }
            } else {
                draft.draft_summary.clone()
            };

            ComposeDigestItem {
                rank: i as i64 + 1,
                title: Some(title),
                url: String::new(),
                summary,
                topics: draft.topics.clone(),
                score: draft.max_score,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(label: &str, count: i64, body: &str) -> DigestClusterDraft {
        DigestClusterDraft {
            cluster_key: label.to_lowercase(),
            cluster_label: label.to_string(),
            rank: 1,
            item_count: count,
            topics: vec![label.to_string()],
            max_score: Some(0.5),
            draft_summary: body.to_string(),
        }
    }

    #[test]
    fn test_source_lines_drop_blanks() {
        assert_eq!(
            draft_source_lines("  - a \n\n   \n- b"),
            vec!["- a".to_string(), "- b".to_string()]
        );
        assert!(draft_source_lines(" \n ").is_empty());
    }

    #[test]
    fn test_titles_carry_item_count() {
        let items = build_compose_items(&[draft("AI", 3, "- x"), draft("Space", 1, "- y")]);
        assert_eq!(items[0].title.as_deref(), Some("AI (3 items)"));
        assert_eq!(items[1].title.as_deref(), Some("Space"));
        assert_eq!(items[1].rank, 2);
        assert_eq!(items[0].score, Some(0.5));
    }

    #[test]
    fn test_late_drafts_are_shortened() {
        let mut drafts: Vec<_> = (0..14)
            .map(|i| draft(&format!("T{}", i), 2, "- first\n- second\n\n- third"))
            .collect();
        drafts[13].draft_summary = "- lonely".to_string();
        let items = build_compose_items(&drafts);

        assert_eq!(items[11].summary, "- first\n- second\n\n- third");
        assert_eq!(
            items[12].summary,
            "- first\n- ...2 more lines omitted in compose input"
        );
        assert_eq!(items[13].summary, "- lonely");
    }
}
