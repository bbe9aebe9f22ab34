use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use super::core::{format_ts, new_id, now_ts, Database};
use crate::models::LlmUsageRecord;
use crate::TARGET_DB;

impl Database {
    /// Appends a usage row. Returns `false` when a row with the same
    /// idempotency key already exists.
    #[instrument(target = "db", level = "info", skip(self, record), fields(purpose = %record.purpose))]
    pub async fn insert_usage(&self, record: &LlmUsageRecord) -> Result<bool, sqlx::Error> {
        let usage = &record.usage;
        let result = sqlx::query(
            r#"
            INSERT INTO llm_usage_logs (
                id, idempotency_key, user_id, source_id, item_id, digest_id,
                provider, model, pricing_model_family, pricing_source, purpose,
                input_tokens, output_tokens, cache_creation_input_tokens, cache_read_input_tokens,
                estimated_cost_usd, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            ON CONFLICT(idempotency_key) DO NOTHING
            "#,
        )
        .bind(new_id())
        .bind(&record.idempotency_key)
        .bind(&record.user_id)
        .bind(&record.source_id)
        .bind(&record.item_id)
        .bind(&record.digest_id)
        .bind(&usage.provider)
        .bind(&usage.model)
        .bind(&usage.pricing_model_family)
        .bind(usage.pricing_source.as_deref().unwrap_or("unknown"))
        .bind(&record.purpose)
        .bind(usage.input_tokens)
        .bind(usage.output_tokens)
        .bind(usage.cache_creation_input_tokens)
        .bind(usage.cache_read_input_tokens)
        .bind(usage.estimated_cost_usd)
        .bind(now_ts())
        .execute(self.pool())
        .await?;

        let inserted = result.rows_affected() > 0;
        if !inserted {
            debug!(target: TARGET_DB, "Usage {} already recorded", record.idempotency_key);
        }
        Ok(inserted)
    }

    /// Total estimated cost for a user in `[start, end)`.
    pub async fn sum_usage_cost(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<f64, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(estimated_cost_usd), 0.0)
            FROM llm_usage_logs
            WHERE user_id = ?1 AND created_at >= ?2 AND created_at < ?3
            "#,
        )
        .bind(user_id)
        .bind(format_ts(start))
        .bind(format_ts(end))
        .fetch_one(self.pool())
        .await
    }

    pub async fn count_usage_rows(&self, user_id: &str) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM llm_usage_logs WHERE user_id = ?1")
            .bind(user_id)
            .fetch_one(self.pool())
            .await
    }

    pub async fn budget_alert_exists(
        &self,
        user_id: &str,
        month_jst: &str,
        threshold_pct: i64,
    ) -> Result<bool, sqlx::Error> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM budget_alert_logs WHERE user_id = ?1 AND month_jst = ?2 AND threshold_pct = ?3",
        )
        .bind(user_id)
        .bind(month_jst)
        .bind(threshold_pct)
        .fetch_optional(self.pool())
        .await?;
        Ok(found.is_some())
    }

    /// Records that an alert went out. At most one row per user, month and threshold.
    #[instrument(target = "db", level = "info", skip(self))]
    pub async fn insert_budget_alert_log(
        &self,
        user_id: &str,
        month_jst: &str,
        threshold_pct: i64,
        budget_usd: f64,
        used_cost_usd: f64,
        remaining_ratio: f64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO budget_alert_logs (
                id, user_id, month_jst, threshold_pct, budget_usd, used_cost_usd, remaining_ratio, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(user_id, month_jst, threshold_pct) DO NOTHING
            "#,
        )
        .bind(new_id())
        .bind(user_id)
        .bind(month_jst)
        .bind(threshold_pct)
        .bind(budget_usd)
        .bind(used_cost_usd)
        .bind(remaining_ratio)
        .bind(now_ts())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LlmUsage;
    use chrono::Duration;

    fn record(key: &str, user_id: &str, cost: f64) -> LlmUsageRecord {
        LlmUsageRecord {
            idempotency_key: key.to_string(),
            user_id: Some(user_id.to_string()),
            source_id: None,
            item_id: Some("item-1".to_string()),
            digest_id: None,
            purpose: "summary".to_string(),
            usage: LlmUsage {
                provider: "anthropic".to_string(),
                model: "claude-haiku".to_string(),
                input_tokens: 100,
                output_tokens: 20,
                estimated_cost_usd: cost,
                ..LlmUsage::default()
            },
        }
    }

    #[tokio::test]
    async fn test_usage_insert_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let user_id = db.create_user("usage@example.com").await.unwrap();

        assert!(db.insert_usage(&record("k1", &user_id, 0.25)).await.unwrap());
        assert!(!db.insert_usage(&record("k1", &user_id, 0.25)).await.unwrap());
        assert!(db.insert_usage(&record("k2", &user_id, 0.5)).await.unwrap());
        assert_eq!(db.count_usage_rows(&user_id).await.unwrap(), 2);

        let now = Utc::now();
        let total = db
            .sum_usage_cost(&user_id, now - Duration::hours(1), now + Duration::hours(1))
            .await
            .unwrap();
        assert!((total - 0.75).abs() < 1e-9);
        let empty = db
            .sum_usage_cost(&user_id, now + Duration::hours(1), now + Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(empty, 0.0);
    }

    #[tokio::test]
    async fn test_budget_alert_log_once_per_month() {
        let db = Database::in_memory().await.unwrap();
        let user_id = db.create_user("budget@example.com").await.unwrap();

        assert!(!db.budget_alert_exists(&user_id, "2026-03", 20).await.unwrap());
        assert!(db
            .insert_budget_alert_log(&user_id, "2026-03", 20, 10.0, 9.0, 0.1)
            .await
            .unwrap());
        assert!(!db
            .insert_budget_alert_log(&user_id, "2026-03", 20, 10.0, 9.5, 0.05)
            .await
            .unwrap());
        assert!(db.budget_alert_exists(&user_id, "2026-03", 20).await.unwrap());
        assert!(!db.budget_alert_exists(&user_id, "2026-04", 20).await.unwrap());
    }
}
