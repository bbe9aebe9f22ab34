use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, instrument};

use super::core::{new_id, now_ts, Database};
use crate::models::{BudgetAlertTarget, User, UserSettings};
use crate::TARGET_DB;

fn settings_from_row(row: &SqliteRow) -> Result<UserSettings, sqlx::Error> {
    Ok(UserSettings {
        user_id: row.try_get("user_id")?,
        anthropic_api_key_enc: row.try_get("anthropic_api_key_enc")?,
        google_api_key_enc: row.try_get("google_api_key_enc")?,
        openai_api_key_enc: row.try_get("openai_api_key_enc")?,
        monthly_budget_usd: row.try_get("monthly_budget_usd")?,
        budget_alert_enabled: row.try_get("budget_alert_enabled")?,
        budget_alert_threshold_pct: row.try_get("budget_alert_threshold_pct")?,
        digest_email_enabled: row.try_get("digest_email_enabled")?,
        facts_model: row.try_get("facts_model")?,
        summary_model: row.try_get("summary_model")?,
        digest_cluster_model: row.try_get("digest_cluster_model")?,
        digest_model: row.try_get("digest_model")?,
        embedding_model: row.try_get("embedding_model")?,
    })
}

impl Database {
    #[instrument(target = "db", level = "info", skip(self))]
    pub async fn create_user(&self, email: &str) -> Result<String, sqlx::Error> {
        let id = new_id();
        sqlx::query("INSERT INTO users (id, email, created_at) VALUES (?1, ?2, ?3)")
            .bind(&id)
            .bind(email.trim())
            .bind(now_ts())
            .execute(self.pool())
            .await?;
        debug!(target: TARGET_DB, "Created user {}", id);
        Ok(id)
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<User>, sqlx::Error> {
        let row = sqlx::query("SELECT id, email FROM users WHERE id = ?1")
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?;
        row.map(|r| {
            Ok(User {
                id: r.try_get("id")?,
                email: r.try_get("email")?,
            })
        })
        .transpose()
    }

    pub async fn list_users(&self) -> Result<Vec<User>, sqlx::Error> {
        let rows = sqlx::query("SELECT id, email FROM users ORDER BY created_at, id")
            .fetch_all(self.pool())
            .await?;
        rows.iter()
            .map(|r| {
                Ok(User {
                    id: r.try_get("id")?,
                    email: r.try_get("email")?,
                })
            })
            .collect()
    }

    pub async fn get_user_settings(&self, user_id: &str) -> Result<Option<UserSettings>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM user_settings WHERE user_id = ?1")
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(settings_from_row).transpose()
    }

    #[instrument(target = "db", level = "info", skip(self, settings), fields(user_id = %settings.user_id))]
    pub async fn upsert_user_settings(&self, settings: &UserSettings) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO user_settings (
                user_id, anthropic_api_key_enc, google_api_key_enc, openai_api_key_enc,
                monthly_budget_usd, budget_alert_enabled, budget_alert_threshold_pct,
                digest_email_enabled, facts_model, summary_model, digest_cluster_model,
                digest_model, embedding_model, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(user_id) DO UPDATE SET
                anthropic_api_key_enc = excluded.anthropic_api_key_enc,
                google_api_key_enc = excluded.google_api_key_enc,
                openai_api_key_enc = excluded.openai_api_key_enc,
                monthly_budget_usd = excluded.monthly_budget_usd,
                budget_alert_enabled = excluded.budget_alert_enabled,
                budget_alert_threshold_pct = excluded.budget_alert_threshold_pct,
                digest_email_enabled = excluded.digest_email_enabled,
                facts_model = excluded.facts_model,
                summary_model = excluded.summary_model,
                digest_cluster_model = excluded.digest_cluster_model,
                digest_model = excluded.digest_model,
                embedding_model = excluded.embedding_model,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&settings.user_id)
        .bind(&settings.anthropic_api_key_enc)
        .bind(&settings.google_api_key_enc)
        .bind(&settings.openai_api_key_enc)
        .bind(settings.monthly_budget_usd)
        .bind(settings.budget_alert_enabled)
        .bind(settings.budget_alert_threshold_pct)
        .bind(settings.digest_email_enabled)
        .bind(&settings.facts_model)
        .bind(&settings.summary_model)
        .bind(&settings.digest_cluster_model)
        .bind(&settings.digest_model)
        .bind(&settings.embedding_model)
        .bind(now_ts())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Users without a settings row receive digest emails.
    pub async fn digest_email_enabled(&self, user_id: &str) -> Result<bool, sqlx::Error> {
        let enabled: Option<bool> =
            sqlx::query_scalar("SELECT digest_email_enabled FROM user_settings WHERE user_id = ?1")
                .bind(user_id)
                .fetch_optional(self.pool())
                .await?;
        Ok(enabled.unwrap_or(true))
    }

    /// Users with budget alerts switched on and a positive budget.
    pub async fn list_budget_alert_targets(&self) -> Result<Vec<BudgetAlertTarget>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT u.id, u.email, s.monthly_budget_usd, s.budget_alert_threshold_pct
            FROM user_settings s
            JOIN users u ON u.id = s.user_id
            WHERE s.budget_alert_enabled = 1
              AND s.monthly_budget_usd IS NOT NULL
              AND s.monthly_budget_usd > 0
            ORDER BY u.id
            "#,
        )
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|r| {
                Ok(BudgetAlertTarget {
                    user_id: r.try_get("id")?,
                    email: r.try_get("email")?,
                    monthly_budget_usd: r.try_get("monthly_budget_usd")?,
                    budget_alert_threshold_pct: r.try_get("budget_alert_threshold_pct")?,
                })
            })
            .collect()
    }
}
