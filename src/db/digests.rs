use chrono::NaiveDate;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, info, instrument};

use super::core::{from_json_text, new_id, now_ts, to_json_text, Database};
use super::items::item_from_row;
use crate::models::{
    Digest, DigestClusterDraft, DigestDetail, DigestItemDetail, ItemSummary, SendStatus,
};
use crate::pipeline::truncate_error;
use crate::TARGET_DB;

/// Result of creating (or finding) the digest for a user and date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestCreation {
    pub digest_id: String,
    /// The digest had already been sent; nothing was changed.
    pub already_sent: bool,
}

fn digest_from_row(row: &SqliteRow) -> Result<Digest, sqlx::Error> {
    let send_status: Option<String> = row.try_get("send_status")?;
    Ok(Digest {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        digest_date: row.try_get("digest_date")?,
        email_subject: row.try_get("email_subject")?,
        email_body: row.try_get("email_body")?,
        send_status: send_status
            .map(|s| s.parse::<SendStatus>())
            .transpose()
            .map_err(|e| sqlx::Error::Decode(e.into()))?,
        send_error: row.try_get("send_error")?,
        send_tried_at: row.try_get("send_tried_at")?,
        sent_at: row.try_get("sent_at")?,
    })
}

fn draft_from_row(row: &SqliteRow) -> Result<DigestClusterDraft, sqlx::Error> {
    Ok(DigestClusterDraft {
        cluster_key: row.try_get("cluster_key")?,
        cluster_label: row.try_get("cluster_label")?,
        rank: row.try_get("rank")?,
        item_count: row.try_get("item_count")?,
        topics: from_json_text(row.try_get("topics")?)?,
        max_score: row.try_get("max_score")?,
        draft_summary: row.try_get("draft_summary")?,
    })
}

impl Database {
    /// Creates or fetches the digest for `(user_id, digest_date)` and replaces
    /// its item set with `item_ids` (ranked in the given order).
    ///
    /// Runs in one transaction. A digest that was already sent is returned
    /// untouched with `already_sent = true`.
    #[instrument(target = "db", level = "info", skip(self, item_ids), fields(items = item_ids.len()))]
    pub async fn create_digest(
        &self,
        user_id: &str,
        digest_date: NaiveDate,
        item_ids: &[String],
    ) -> Result<DigestCreation, sqlx::Error> {
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO digests (id, user_id, digest_date, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(user_id, digest_date) DO UPDATE SET digest_date = excluded.digest_date
            RETURNING id, sent_at
            "#,
        )
        .bind(new_id())
        .bind(user_id)
        .bind(digest_date.format("%Y-%m-%d").to_string())
        .bind(now_ts())
        .fetch_one(&mut *tx)
        .await?;
        let digest_id: String = row.try_get("id")?;
        let sent_at: Option<String> = row.try_get("sent_at")?;

        if sent_at.is_some() {
            tx.commit().await?;
            info!(target: TARGET_DB, "Digest {} already sent, leaving it untouched", digest_id);
            return Ok(DigestCreation {
                digest_id,
                already_sent: true,
            });
        }

        sqlx::query("DELETE FROM digest_items WHERE digest_id = ?1")
            .bind(&digest_id)
            .execute(&mut *tx)
            .await?;
        for (i, item_id) in item_ids.iter().enumerate() {
            sqlx::query("INSERT INTO digest_items (digest_id, item_id, rank) VALUES (?1, ?2, ?3)")
                .bind(&digest_id)
                .bind(item_id)
                .bind(i as i64 + 1)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        debug!(target: TARGET_DB, "Digest {} stored with {} items", digest_id, item_ids.len());
        Ok(DigestCreation {
            digest_id,
            already_sent: false,
        })
    }

    pub async fn get_digest(&self, digest_id: &str) -> Result<Option<Digest>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM digests WHERE id = ?1")
            .bind(digest_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(digest_from_row).transpose()
    }

    /// Digest with its ranked items, summaries and facts.
    pub async fn get_digest_detail(&self, digest_id: &str) -> Result<Option<DigestDetail>, sqlx::Error> {
        let Some(digest) = self.get_digest(digest_id).await? else {
            return Ok(None);
        };
        let rows = sqlx::query(
            r#"
            SELECT di.rank AS digest_rank,
                   i.id, i.source_id, i.url, i.title, i.thumbnail_url, i.status,
                   i.processing_error, i.is_read, i.is_favorite, i.published_at, i.created_at,
                   sm.score AS summary_score, sm.topics AS summary_topics,
                   sm.summary, sm.translated_title, f.facts
            FROM digest_items di
            JOIN items i ON i.id = di.item_id
            LEFT JOIN item_summaries sm ON sm.item_id = i.id
            LEFT JOIN item_facts f ON f.item_id = i.id
            WHERE di.digest_id = ?1
            ORDER BY di.rank ASC
            "#,
        )
        .bind(digest_id)
        .fetch_all(self.pool())
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let item = item_from_row(row)?;
            let summary: Option<String> = row.try_get("summary")?;
            items.push(DigestItemDetail {
                rank: row.try_get("digest_rank")?,
                summary: ItemSummary {
                    summary: summary.unwrap_or_default(),
                    topics: item.summary_topics.clone(),
                    score: item.summary_score,
                    translated_title: row.try_get("translated_title")?,
                },
                facts: from_json_text(row.try_get("facts")?)?,
                item,
            });
        }
        Ok(Some(DigestDetail { digest, items }))
    }

    /// Sets the send status. Error text is truncated before storing.
    #[instrument(target = "db", level = "info", skip(self, error))]
    pub async fn update_send_status(
        &self,
        digest_id: &str,
        status: SendStatus,
        error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE digests SET send_status = ?1, send_error = ?2, send_tried_at = ?3 WHERE id = ?4",
        )
        .bind(status.as_str())
        .bind(error.map(truncate_error))
        .bind(now_ts())
        .bind(digest_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Stores composed email copy unless the digest was already sent.
    pub async fn update_email_copy(
        &self,
        digest_id: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE digests SET email_subject = ?1, email_body = ?2 WHERE id = ?3 AND sent_at IS NULL",
        )
        .bind(subject)
        .bind(body)
        .bind(digest_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn mark_digest_sent(&self, digest_id: &str) -> Result<(), sqlx::Error> {
        let now = now_ts();
        sqlx::query(
            r#"
            UPDATE digests
            SET sent_at = ?1, send_status = 'sent', send_error = NULL, send_tried_at = ?1
            WHERE id = ?2
            "#,
        )
        .bind(&now)
        .bind(digest_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Deletes and reinserts every draft of a digest in one transaction.
    ///
    /// Returns `false` without touching anything when the digest was already sent.
    #[instrument(target = "db", level = "info", skip(self, drafts), fields(drafts = drafts.len()))]
    pub async fn replace_cluster_drafts(
        &self,
        digest_id: &str,
        drafts: &[DigestClusterDraft],
    ) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool().begin().await?;

        let sent_at: Option<Option<String>> =
            sqlx::query_scalar("SELECT sent_at FROM digests WHERE id = ?1")
                .bind(digest_id)
                .fetch_optional(&mut *tx)
                .await?;
        match sent_at {
            None => return Err(sqlx::Error::RowNotFound),
            Some(Some(_)) => return Ok(false),
            Some(None) => {}
        }

        sqlx::query("DELETE FROM digest_cluster_drafts WHERE digest_id = ?1")
            .bind(digest_id)
            .execute(&mut *tx)
            .await?;
        let now = now_ts();
        for draft in drafts {
            sqlx::query(
                r#"
                INSERT INTO digest_cluster_drafts (
                    id, digest_id, cluster_key, cluster_label, rank, item_count,
                    topics, max_score, draft_summary, created_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
            )
            .bind(new_id())
            .bind(digest_id)
            .bind(&draft.cluster_key)
            .bind(&draft.cluster_label)
            .bind(draft.rank)
            .bind(draft.item_count)
            .bind(to_json_text(&draft.topics)?)
            .bind(draft.max_score)
            .bind(&draft.draft_summary)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    pub async fn list_cluster_drafts(
        &self,
        digest_id: &str,
    ) -> Result<Vec<DigestClusterDraft>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT * FROM digest_cluster_drafts WHERE digest_id = ?1 ORDER BY rank ASC",
        )
        .bind(digest_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(draft_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::worker::SummarizeResponse;
    use crate::db::test_support::seed_user_source;

    async fn summarized_items(db: &Database, source_id: &str, n: usize) -> Vec<String> {
        let mut ids = Vec::new();
        for i in 0..n {
            let id = db
                .insert_feed_item(source_id, &format!("https://example.com/d{}", i), Some("T"), None)
                .await
                .unwrap()
                .unwrap();
            db.insert_facts(&id, &["fact".to_string()]).await.unwrap();
            db.insert_summary(
                &id,
                &SummarizeResponse {
                    summary: format!("summary {}", i),
                    topics: vec!["AI".to_string()],
                    score: 0.5,
                    translated_title: None,
                    score_breakdown: None,
                    score_reason: None,
                    llm: None,
                },
            )
            .await
            .unwrap();
            ids.push(id);
        }
        ids
    }

    fn draft(rank: i64) -> DigestClusterDraft {
        DigestClusterDraft {
            cluster_key: format!("k{}", rank),
            cluster_label: "AI".to_string(),
            rank,
            item_count: 1,
            topics: vec!["AI".to_string()],
            max_score: Some(0.5),
            draft_summary: "- line".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_digest_replaces_items_until_sent() {
        let db = Database::in_memory().await.unwrap();
        let (user_id, source_id) = seed_user_source(&db).await;
        let ids = summarized_items(&db, &source_id, 3).await;
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();

        let first = db.create_digest(&user_id, date, &ids[..2]).await.unwrap();
        assert!(!first.already_sent);
        let second = db.create_digest(&user_id, date, &ids).await.unwrap();
        assert_eq!(first.digest_id, second.digest_id);
        let detail = db.get_digest_detail(&first.digest_id).await.unwrap().unwrap();
        assert_eq!(detail.items.len(), 3);
        assert_eq!(detail.items[2].rank, 3);
        assert_eq!(detail.items[0].facts, vec!["fact".to_string()]);
        assert_eq!(detail.digest.digest_date, "2026-03-01");

        db.mark_digest_sent(&first.digest_id).await.unwrap();
        let third = db.create_digest(&user_id, date, &ids[..1]).await.unwrap();
        assert!(third.already_sent);
        assert_eq!(third.digest_id, first.digest_id);
        let detail = db.get_digest_detail(&first.digest_id).await.unwrap().unwrap();
        assert_eq!(detail.items.len(), 3);
        assert_eq!(detail.digest.send_status, Some(SendStatus::Sent));
    }

    #[tokio::test]
    async fn test_replace_cluster_drafts_is_wholesale() {
        let db = Database::in_memory().await.unwrap();
        let (user_id, _) = seed_user_source(&db).await;
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let digest = db.create_digest(&user_id, date, &[]).await.unwrap();

        assert!(db
            .replace_cluster_drafts(&digest.digest_id, &[draft(1), draft(2), draft(3)])
            .await
            .unwrap());
        assert!(db
            .replace_cluster_drafts(&digest.digest_id, &[draft(1)])
            .await
            .unwrap());
        let stored = db.list_cluster_drafts(&digest.digest_id).await.unwrap();
        assert_eq!(stored, vec![draft(1)]);

        db.mark_digest_sent(&digest.digest_id).await.unwrap();
        assert!(!db
            .replace_cluster_drafts(&digest.digest_id, &[draft(1), draft(2)])
            .await
            .unwrap());
        assert!(db.replace_cluster_drafts("missing", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_send_status_and_copy() {
        let db = Database::in_memory().await.unwrap();
        let (user_id, _) = seed_user_source(&db).await;
        let date = NaiveDate::from_ymd_opt(2026, 3, 3).unwrap();
        let digest = db.create_digest(&user_id, date, &[]).await.unwrap();

        db.update_send_status(&digest.digest_id, SendStatus::ComposeFailed, Some(&"e".repeat(3000)))
            .await
            .unwrap();
        db.update_email_copy(&digest.digest_id, "Subject", "Body").await.unwrap();
        let stored = db.get_digest(&digest.digest_id).await.unwrap().unwrap();
        assert_eq!(stored.send_status, Some(SendStatus::ComposeFailed));
        assert_eq!(stored.send_error.as_deref().map(str::len), Some(2000));
        assert_eq!(stored.email_copy(), Some(("Subject", "Body")));
        assert!(stored.send_tried_at.is_some());
    }
}
