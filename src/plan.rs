//! Reading plan: a user's best unread summaries and the clusters they sit in.

use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;

use crate::db::Database;
use crate::models::Item;
use crate::similarity::{reading_plan_clusters, ItemCluster};
use crate::TARGET_DB;

pub const DEFAULT_PLAN_SIZE: usize = 15;
pub const MAX_PLAN_SIZE: usize = 100;
const CANDIDATE_POOL: i64 = 2000;

#[derive(Debug, Clone, Serialize)]
pub struct ReadingPlan {
    pub items: Vec<Item>,
    pub source_pool_count: usize,
    pub clusters: Vec<ItemCluster>,
}

/// Zero means the default; anything above the cap is clamped.
pub fn normalize_plan_size(size: usize) -> usize {
    if size == 0 {
        DEFAULT_PLAN_SIZE
    } else {
        size.min(MAX_PLAN_SIZE)
    }
}

/// Picks the plan's items and groups the unread pool around them.
///
/// With `selected` empty the plan is the top `size` unread items. Otherwise
/// it is the selected ids that are still unread, in ranking order. Clusters
/// are built over the whole unread pool and kept only when they contain a
/// plan item.
pub async fn build_reading_plan(
    db: &Database,
    user_id: &str,
    size: usize,
    selected: &[String],
) -> Result<ReadingPlan, sqlx::Error> {
    let size = normalize_plan_size(size);
    let pool = db
        .list_unread_summarized_for_user(user_id, CANDIDATE_POOL)
        .await?;

    let items: Vec<Item> = if selected.is_empty() {
        pool.iter().take(size).cloned().collect()
    } else {
        pool.iter()
            .filter(|item| selected.contains(&item.id))
            .cloned()
            .collect()
    };
    if items.is_empty() {
        return Ok(ReadingPlan {
            items,
            source_pool_count: pool.len(),
            clusters: Vec::new(),
        });
    }

    let plan_ids: HashSet<String> = items.iter().map(|item| item.id.clone()).collect();
    let pool_ids: Vec<String> = pool.iter().map(|item| item.id.clone()).collect();
    let embeddings = db.get_item_embeddings(&pool_ids).await?;
    let clusters = reading_plan_clusters(&pool, &embeddings, Some(&plan_ids));
    debug!(
        target: TARGET_DB,
        "reading plan user_id={} pool={} items={} clusters={}",
        user_id,
        pool.len(),
        items.len(),
        clusters.len()
    );

    Ok(ReadingPlan {
        items,
        source_pool_count: pool.len(),
        clusters,
    })
}
