use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, instrument};

use super::core::{new_id, now_ts, Database};
use crate::models::Source;
use crate::pipeline::truncate_error;
use crate::TARGET_DB;

fn source_from_row(row: &SqliteRow) -> Result<Source, sqlx::Error> {
    Ok(Source {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        enabled: row.try_get("enabled")?,
        last_fetched_at: row.try_get("last_fetched_at")?,
        last_error: row.try_get("last_error")?,
    })
}

impl Database {
    /// Registers a feed for a user. Adding the same URL twice returns the existing id.
    #[instrument(target = "db", level = "info", skip(self))]
    pub async fn create_source(
        &self,
        user_id: &str,
        url: &str,
        title: Option<&str>,
    ) -> Result<String, sqlx::Error> {
        let id: String = sqlx::query_scalar(
            r#"
            INSERT INTO sources (id, user_id, url, title, enabled, created_at)
            VALUES (?1, ?2, ?3, ?4, 1, ?5)
            ON CONFLICT(user_id, url) DO UPDATE SET title = COALESCE(excluded.title, sources.title)
            RETURNING id
            "#,
        )
        .bind(new_id())
        .bind(user_id)
        .bind(url.trim())
        .bind(title)
        .bind(now_ts())
        .fetch_one(self.pool())
        .await?;
        debug!(target: TARGET_DB, "Source {} registered for user {}", id, user_id);
        Ok(id)
    }

    pub async fn get_source(&self, source_id: &str) -> Result<Option<Source>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM sources WHERE id = ?1")
            .bind(source_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    pub async fn list_enabled_sources(&self) -> Result<Vec<Source>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM sources WHERE enabled = 1 ORDER BY created_at, id")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(source_from_row).collect()
    }

    /// Stamps a fetch attempt. `error` of `None` clears the previous error.
    pub async fn record_source_fetch(
        &self,
        source_id: &str,
        error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE sources SET last_fetched_at = ?1, last_error = ?2 WHERE id = ?3")
            .bind(now_ts())
            .bind(error.map(truncate_error))
            .bind(source_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_source_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let user_id = db.create_user("feeds@example.com").await.unwrap();
        let a = db
            .create_source(&user_id, "https://blog.example/feed.xml", None)
            .await
            .unwrap();
        let b = db
            .create_source(&user_id, "https://blog.example/feed.xml", Some("Blog"))
            .await
            .unwrap();
        assert_eq!(a, b);

        db.record_source_fetch(&a, Some("timeout")).await.unwrap();
        let source = db.get_source(&a).await.unwrap().unwrap();
        assert_eq!(source.title.as_deref(), Some("Blog"));
        assert_eq!(source.last_error.as_deref(), Some("timeout"));
        assert!(source.last_fetched_at.is_some());
        assert_eq!(db.list_enabled_sources().await.unwrap().len(), 1);
    }
}
