use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{debug, error, instrument};
use url::Url;
use urlnorm::UrlNormalizer;

use super::core::{
    format_ts, from_json_text, new_id, now_ts, parse_ts, parse_ts_column, to_json_text, Database,
};
use crate::clients::worker::SummarizeResponse;
use crate::models::{EmbeddingCandidate, Item, ItemStatus, RelatedItem, RetryTarget};
use crate::pipeline::truncate_error;
use crate::similarity::cosine_similarity;
use crate::TARGET_DB;

/// Related candidates below this similarity are never considered.
const RELATED_MIN_SIMILARITY: f64 = 0.35;

const ITEM_SELECT: &str = r#"
    SELECT i.id, i.source_id, i.url, i.title, i.thumbnail_url, i.status,
           i.processing_error, i.is_read, i.is_favorite, i.published_at, i.created_at,
           sm.score AS summary_score, sm.topics AS summary_topics
    FROM items i
    LEFT JOIN item_summaries sm ON sm.item_id = i.id
"#;

pub(crate) fn item_from_row(row: &SqliteRow) -> Result<Item, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let published_at: Option<String> = row.try_get("published_at")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(Item {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        thumbnail_url: row.try_get("thumbnail_url")?,
        status: status
            .parse::<ItemStatus>()
            .map_err(|e| sqlx::Error::Decode(e.into()))?,
        summary_score: row.try_get("summary_score")?,
        summary_topics: from_json_text(row.try_get("summary_topics")?)?,
        is_read: row.try_get("is_read")?,
        is_favorite: row.try_get("is_favorite")?,
        processing_error: row.try_get("processing_error")?,
        published_at: published_at.as_deref().and_then(parse_ts),
        created_at: parse_ts_column(&created_at)?,
    })
}

/// Normalized form used to collapse duplicate feed links.
pub fn normalize_item_url(url: &str) -> Result<String, sqlx::Error> {
    let parsed = Url::parse(url.trim()).map_err(|e| {
        error!(target: TARGET_DB, "Invalid item URL ({}): {}", url, e);
        sqlx::Error::Protocol("Invalid URL provided".into())
    })?;
    let normalizer = UrlNormalizer::default();
    Ok(normalizer.compute_normalization_string(&parsed))
}

impl Database {
    /// Inserts a feed entry as a `new` item.
    ///
    /// Returns the new item id, or `None` when the source already has an item
    /// with the same normalized URL.
    #[instrument(target = "db", level = "info", skip(self, title))]
    pub async fn insert_feed_item(
        &self,
        source_id: &str,
        url: &str,
        title: Option<&str>,
        published_at: Option<DateTime<Utc>>,
    ) -> Result<Option<String>, sqlx::Error> {
        if url.trim().is_empty() {
            error!(target: TARGET_DB, "Attempted to insert an item with an empty URL");
            return Err(sqlx::Error::Protocol("Empty URL provided".into()));
        }
        let normalized_url = normalize_item_url(url)?;
        let now = now_ts();

        let inserted: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO items (id, source_id, url, normalized_url, title, status, published_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 'new', ?6, ?7, ?7)
            ON CONFLICT(source_id, normalized_url) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(new_id())
        .bind(source_id)
        .bind(url.trim())
        .bind(&normalized_url)
        .bind(title)
        .bind(published_at.map(format_ts))
        .bind(&now)
        .fetch_optional(self.pool())
        .await?;

        match &inserted {
            Some(id) => debug!(target: TARGET_DB, "Item {} created for {}", id, normalized_url),
            None => debug!(target: TARGET_DB, "Item already exists: {}", normalized_url),
        }
        Ok(inserted)
    }

    pub async fn get_item(&self, item_id: &str) -> Result<Option<Item>, sqlx::Error> {
        let row = sqlx::query(&format!("{} WHERE i.id = ?1", ITEM_SELECT))
            .bind(item_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    /// Items are owned through their source.
    pub async fn item_owner(&self, item_id: &str) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT s.user_id FROM items i JOIN sources s ON s.id = i.source_id WHERE i.id = ?1",
        )
        .bind(item_id)
        .fetch_optional(self.pool())
        .await
    }

    /// Stores the extracted body and moves the item to `fetched`.
    ///
    /// A missing title keeps whatever the feed provided.
    #[instrument(target = "db", level = "info", skip(self, title, thumbnail_url, content))]
    pub async fn update_after_extract(
        &self,
        item_id: &str,
        title: Option<&str>,
        thumbnail_url: Option<&str>,
        content: &str,
        published_at: Option<DateTime<Utc>>,
    ) -> Result<(), sqlx::Error> {
        let now = now_ts();
        sqlx::query(
            r#"
            UPDATE items SET
                status = 'fetched',
                title = COALESCE(?1, title),
                thumbnail_url = COALESCE(?2, thumbnail_url),
                content_text = ?3,
                published_at = COALESCE(?4, published_at),
                processing_error = NULL,
                fetched_at = ?5,
                updated_at = ?5
            WHERE id = ?6
            "#,
        )
        .bind(title.filter(|t| !t.trim().is_empty()))
        .bind(thumbnail_url.filter(|t| !t.trim().is_empty()))
        .bind(content)
        .bind(published_at.map(format_ts))
        .bind(&now)
        .bind(item_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Upserts facts and moves the item to `facts_extracted`.
    #[instrument(target = "db", level = "info", skip(self, facts))]
    pub async fn insert_facts(&self, item_id: &str, facts: &[String]) -> Result<(), sqlx::Error> {
        let now = now_ts();
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            r#"
            INSERT INTO item_facts (item_id, facts, extracted_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(item_id) DO UPDATE SET facts = excluded.facts, extracted_at = excluded.extracted_at
            "#,
        )
        .bind(item_id)
        .bind(to_json_text(facts)?)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE items SET status = 'facts_extracted', updated_at = ?1 WHERE id = ?2")
            .bind(&now)
            .bind(item_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_item_facts(&self, item_id: &str) -> Result<Vec<String>, sqlx::Error> {
        let facts: Option<String> =
            sqlx::query_scalar("SELECT facts FROM item_facts WHERE item_id = ?1")
                .bind(item_id)
                .fetch_optional(self.pool())
                .await?;
        from_json_text(facts)
    }

    /// Upserts the summary and moves the item to `summarized`.
    #[instrument(target = "db", level = "info", skip(self, summary))]
    pub async fn insert_summary(
        &self,
        item_id: &str,
        summary: &SummarizeResponse,
    ) -> Result<(), sqlx::Error> {
        let now = now_ts();
        let breakdown = summary
            .score_breakdown
            .as_ref()
            .map(to_json_text)
            .transpose()?;
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            r#"
            INSERT INTO item_summaries (
                item_id, summary, topics, translated_title, score, score_breakdown, score_reason, summarized_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(item_id) DO UPDATE SET
                summary = excluded.summary,
                topics = excluded.topics,
                translated_title = excluded.translated_title,
                score = excluded.score,
                score_breakdown = excluded.score_breakdown,
                score_reason = excluded.score_reason,
                summarized_at = excluded.summarized_at
            "#,
        )
        .bind(item_id)
        .bind(&summary.summary)
        .bind(to_json_text(&summary.topics)?)
        .bind(&summary.translated_title)
        .bind(summary.score)
        .bind(breakdown)
        .bind(&summary.score_reason)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE items SET status = 'summarized', updated_at = ?1 WHERE id = ?2")
            .bind(&now)
            .bind(item_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(target = "db", level = "info", skip(self, message))]
    pub async fn mark_item_failed(&self, item_id: &str, message: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE items SET status = 'failed', processing_error = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(truncate_error(message))
        .bind(now_ts())
        .bind(item_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Re-enters a failed item at `new`.
    pub async fn reset_item_for_retry(&self, item_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE items SET status = 'new', processing_error = NULL, updated_at = ?1 WHERE id = ?2 AND status = 'failed'",
        )
        .bind(now_ts())
        .bind(item_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_failed_for_retry(&self, limit: i64) -> Result<Vec<RetryTarget>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT i.id, i.source_id, s.user_id, i.url, i.title
            FROM items i
            JOIN sources s ON s.id = i.source_id
            WHERE i.status = 'failed'
            ORDER BY i.updated_at ASC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|r| {
                Ok(RetryTarget {
                    item_id: r.try_get("id")?,
                    source_id: r.try_get("source_id")?,
                    user_id: r.try_get("user_id")?,
                    url: r.try_get("url")?,
                    title: r.try_get("title")?,
                })
            })
            .collect()
    }

    /// Replaces the item's embedding. Re-embedding supersedes, never versions.
    #[instrument(target = "db", level = "info", skip(self, embedding))]
    pub async fn upsert_embedding(
        &self,
        item_id: &str,
        model: &str,
        embedding: &[f32],
    ) -> Result<(), sqlx::Error> {
        let now = now_ts();
        sqlx::query(
            r#"
            INSERT INTO item_embeddings (item_id, model, dimensions, embedding, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            ON CONFLICT(item_id) DO UPDATE SET
                model = excluded.model,
                dimensions = excluded.dimensions,
                embedding = excluded.embedding,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(item_id)
        .bind(model)
        .bind(embedding.len() as i64)
        .bind(to_json_text(embedding)?)
        .bind(&now)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Summarized item with its summary and facts, or `None` if the item is
    /// missing or not yet summarized.
    pub async fn get_embedding_candidate(
        &self,
        item_id: &str,
    ) -> Result<Option<EmbeddingCandidate>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT i.id, i.source_id, s.user_id, i.title,
                   sm.summary, sm.topics, f.facts
            FROM items i
            JOIN sources s ON s.id = i.source_id
            JOIN item_summaries sm ON sm.item_id = i.id
            LEFT JOIN item_facts f ON f.item_id = i.id
            WHERE i.id = ?1 AND i.status = 'summarized'
            "#,
        )
        .bind(item_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(|r| {
            Ok(EmbeddingCandidate {
                item_id: r.try_get("id")?,
                source_id: r.try_get("source_id")?,
                user_id: r.try_get("user_id")?,
                title: r.try_get("title")?,
                summary: r.try_get("summary")?,
                topics: from_json_text(r.try_get("topics")?)?,
                facts: from_json_text(r.try_get("facts")?)?,
            })
        })
        .transpose()
    }

    /// Summarized items that have no embedding yet, oldest first.
    pub async fn list_items_missing_embeddings(&self, limit: i64) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            SELECT i.id
            FROM items i
            LEFT JOIN item_embeddings e ON e.item_id = i.id
            WHERE i.status = 'summarized' AND e.item_id IS NULL
            ORDER BY i.created_at ASC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await
    }

    /// Embeddings for the given items; items without one are absent from the map.
    pub async fn get_item_embeddings(
        &self,
        item_ids: &[String],
    ) -> Result<HashMap<String, Vec<f32>>, sqlx::Error> {
        if item_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            "SELECT item_id, embedding FROM item_embeddings WHERE item_id IN (SELECT value FROM json_each(?1))",
        )
        .bind(to_json_text(item_ids)?)
        .fetch_all(self.pool())
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("item_id")?;
            let embedding: Vec<f32> = from_json_text(row.try_get("embedding")?)?;
            out.insert(id, embedding);
        }
        Ok(out)
    }

    /// Summarized items of a user whose summary landed in `[since, until)`,
    /// best score first (unscored last), then newest.
    pub async fn list_summarized_for_user(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Item>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            r#"{}
            JOIN sources s ON s.id = i.source_id
            WHERE s.user_id = ?1
              AND i.status = 'summarized'
              AND sm.summarized_at >= ?2
              AND sm.summarized_at < ?3
            ORDER BY sm.score IS NULL, sm.score DESC, i.created_at DESC
            "#,
            ITEM_SELECT
        ))
        .bind(user_id)
        .bind(format_ts(since))
        .bind(format_ts(until))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    /// Unread summarized items of a user, best score first (unscored last),
    /// then newest.
    pub async fn list_unread_summarized_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<Item>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            r#"{}
            JOIN sources s ON s.id = i.source_id
            WHERE s.user_id = ?1
              AND i.status = 'summarized'
              AND i.is_read = 0
            ORDER BY sm.score IS NULL, sm.score DESC, i.created_at DESC
            LIMIT ?2
            "#,
            ITEM_SELECT
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    /// Nearest neighbours of an item among the same user's summarized items.
    ///
    /// Items from other sources come first, then by similarity and recency.
    /// The pool is a multiple of `limit` so reranking has room to filter.
    #[instrument(target = "db", level = "info", skip(self))]
    pub async fn list_related_candidates(
        &self,
        item_id: &str,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<RelatedItem>, sqlx::Error> {
        let pool_size = (limit * 5).clamp(30, 120);

        let target = sqlx::query(
            r#"
            SELECT e.embedding, i.source_id
            FROM item_embeddings e
            JOIN items i ON i.id = e.item_id
            JOIN sources s ON s.id = i.source_id
            WHERE e.item_id = ?1 AND s.user_id = ?2
            "#,
        )
        .bind(item_id)
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?;
        let Some(target) = target else {
            return Ok(Vec::new());
        };
        let target_embedding: Vec<f32> = from_json_text(target.try_get("embedding")?)?;
        let target_source: String = target.try_get("source_id")?;

        let rows = sqlx::query(
            r#"
            SELECT i.id, i.source_id, i.url, i.title, i.published_at, i.created_at,
                   sm.summary, sm.topics, sm.score, e.embedding
            FROM item_embeddings e
            JOIN items i ON i.id = e.item_id
            JOIN sources s ON s.id = i.source_id
            LEFT JOIN item_summaries sm ON sm.item_id = i.id
            WHERE s.user_id = ?1
              AND i.id <> ?2
              AND i.status = 'summarized'
              AND e.dimensions = ?3
            "#,
        )
        .bind(user_id)
        .bind(item_id)
        .bind(target_embedding.len() as i64)
        .fetch_all(self.pool())
        .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let embedding: Vec<f32> = from_json_text(row.try_get("embedding")?)?;
            let similarity = cosine_similarity(&target_embedding, &embedding);
            if similarity < RELATED_MIN_SIMILARITY {
                continue;
            }
            let published_at: Option<String> = row.try_get("published_at")?;
            let created_at: String = row.try_get("created_at")?;
            candidates.push(RelatedItem {
                id: row.try_get("id")?,
                source_id: row.try_get("source_id")?,
                url: row.try_get("url")?,
                title: row.try_get("title")?,
                summary: row.try_get("summary")?,
                topics: from_json_text(row.try_get("topics")?)?,
                summary_score: row.try_get("score")?,
                similarity,
                embedding: Some(embedding),
                reason: None,
                reason_topics: Vec::new(),
                published_at: published_at.as_deref().and_then(parse_ts),
                created_at: parse_ts_column(&created_at)?,
            });
        }

        candidates.sort_by(|a, b| {
            let a_same = a.source_id == target_source;
            let b_same = b.source_id == target_source;
            a_same
                .cmp(&b_same)
                .then_with(|| {
                    b.similarity
                        .partial_cmp(&a.similarity)
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| {
                    let a_at = a.published_at.unwrap_or(a.created_at);
                    let b_at = b.published_at.unwrap_or(b.created_at);
                    b_at.cmp(&a_at)
                })
        });
        candidates.truncate(pool_size);
        Ok(candidates)
    }
}
