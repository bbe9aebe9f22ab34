use chrono::{Duration, Utc};
use sqlx::Row;
use tracing::{debug, instrument};

use super::core::{format_ts, now_ts, Database};
use crate::pipeline::truncate_error;
use crate::TARGET_DB;

/// A claimed row from the event queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEvent {
    pub id: i64,
    pub name: String,
    pub payload: serde_json::Value,
    /// Attempts including the current claim.
    pub attempts: i64,
}

impl Database {
    #[instrument(target = "db", level = "info", skip(self, payload))]
    pub async fn enqueue_event(
        &self,
        name: &str,
        payload: &serde_json::Value,
    ) -> Result<i64, sqlx::Error> {
        let now = now_ts();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO event_queue (name, payload, attempts, available_at, created_at)
            VALUES (?1, ?2, 0, ?3, ?3)
            RETURNING id
            "#,
        )
        .bind(name)
        .bind(payload.to_string())
        .bind(&now)
        .fetch_one(self.pool())
        .await?;
        debug!(target: TARGET_DB, "Enqueued event {} ({})", id, name);
        Ok(id)
    }

    /// Claims the oldest available event and hides it for `lease`.
    ///
    /// A claimed event that is neither acked nor released becomes available
    /// again once the lease runs out.
    pub async fn claim_next_event(&self, lease: Duration) -> Result<Option<QueuedEvent>, sqlx::Error> {
        let now = Utc::now();
        let mut transaction = self.pool().begin().await?;
        let row = sqlx::query(
            r#"
            SELECT id, name, payload, attempts
            FROM event_queue
            WHERE available_at <= ?1
            ORDER BY available_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(format_ts(now))
        .fetch_optional(&mut *transaction)
        .await?;

        let Some(row) = row else {
            transaction.rollback().await?;
            return Ok(None);
        };

        let id: i64 = row.try_get("id")?;
        let attempts: i64 = row.try_get::<i64, _>("attempts")? + 1;
        sqlx::query("UPDATE event_queue SET attempts = ?1, available_at = ?2 WHERE id = ?3")
            .bind(attempts)
            .bind(format_ts(now + lease))
            .bind(id)
            .execute(&mut *transaction)
            .await?;
        transaction.commit().await?;

        let payload: String = row.try_get("payload")?;
        Ok(Some(QueuedEvent {
            id,
            name: row.try_get("name")?,
            payload: serde_json::from_str(&payload).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            attempts,
        }))
    }

    /// Removes an event after it was handled.
    pub async fn ack_event(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM event_queue WHERE id = ?1")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Makes a failed event available again after `delay`.
    pub async fn release_event(
        &self,
        id: i64,
        delay: Duration,
        error: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE event_queue SET available_at = ?1, last_error = ?2 WHERE id = ?3")
            .bind(format_ts(Utc::now() + delay))
            .bind(truncate_error(error))
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn count_queued_events(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM event_queue")
            .fetch_one(self.pool())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_claim_ack_release() {
        let db = Database::in_memory().await.unwrap();
        let first = db.enqueue_event("item/embed", &json!({"item_id": "a"})).await.unwrap();
        db.enqueue_event("item/embed", &json!({"item_id": "b"})).await.unwrap();

        let claimed = db.claim_next_event(Duration::minutes(5)).await.unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.payload["item_id"], "a");

        // The first event is leased, so the second comes next.
        let second = db.claim_next_event(Duration::minutes(5)).await.unwrap().unwrap();
        assert_eq!(second.payload["item_id"], "b");
        assert!(db.claim_next_event(Duration::minutes(5)).await.unwrap().is_none());

        db.ack_event(second.id).await.unwrap();
        db.release_event(first, Duration::zero(), "worker down").await.unwrap();
        let again = db.claim_next_event(Duration::minutes(5)).await.unwrap().unwrap();
        assert_eq!(again.id, first);
        assert_eq!(again.attempts, 2);
        assert_eq!(db.count_queued_events().await.unwrap(), 1);
    }
}
