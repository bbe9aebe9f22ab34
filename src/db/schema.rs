use tracing::info;

use super::core::Database;
use crate::TARGET_DB;

impl Database {
    pub(crate) async fn initialize_schema(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.pool().acquire().await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_settings (
                user_id TEXT PRIMARY KEY,
                anthropic_api_key_enc TEXT,
                google_api_key_enc TEXT,
                openai_api_key_enc TEXT,
                monthly_budget_usd REAL,
                budget_alert_enabled BOOLEAN NOT NULL DEFAULT 0,
                budget_alert_threshold_pct INTEGER NOT NULL DEFAULT 20,
                digest_email_enabled BOOLEAN NOT NULL DEFAULT 1,
                facts_model TEXT,
                summary_model TEXT,
                digest_cluster_model TEXT,
                digest_model TEXT,
                embedding_model TEXT,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS sources (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                url TEXT NOT NULL,
                title TEXT,
                enabled BOOLEAN NOT NULL DEFAULT 1,
                last_fetched_at TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(user_id, url),
                FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_sources_user_id ON sources (user_id);

            -- Items belong to a source; deleting the source cascades.
            CREATE TABLE IF NOT EXISTS items (
                id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL,
                url TEXT NOT NULL,
                normalized_url TEXT NOT NULL,
                title TEXT,
                thumbnail_url TEXT,
                content_text TEXT,
                status TEXT NOT NULL DEFAULT 'new',
                processing_error TEXT,
                is_read BOOLEAN NOT NULL DEFAULT 0,
                is_favorite BOOLEAN NOT NULL DEFAULT 0,
                published_at TEXT,
                fetched_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(source_id, normalized_url),
                FOREIGN KEY (source_id) REFERENCES sources (id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_items_status ON items (status);
            CREATE INDEX IF NOT EXISTS idx_items_source_id ON items (source_id);

            CREATE TABLE IF NOT EXISTS item_facts (
                item_id TEXT PRIMARY KEY,
                facts TEXT NOT NULL,
                extracted_at TEXT NOT NULL,
                FOREIGN KEY (item_id) REFERENCES items (id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS item_summaries (
                item_id TEXT PRIMARY KEY,
                summary TEXT NOT NULL,
                topics TEXT NOT NULL,
                translated_title TEXT,
                score REAL,
                score_breakdown TEXT,
                score_reason TEXT,
                summarized_at TEXT NOT NULL,
                FOREIGN KEY (item_id) REFERENCES items (id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_item_summaries_summarized_at ON item_summaries (summarized_at);

            CREATE TABLE IF NOT EXISTS item_embeddings (
                item_id TEXT PRIMARY KEY,
                model TEXT NOT NULL,
                dimensions INTEGER NOT NULL,
                embedding TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (item_id) REFERENCES items (id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS digests (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                digest_date TEXT NOT NULL,
                email_subject TEXT,
                email_body TEXT,
                send_status TEXT,
                send_error TEXT,
                send_tried_at TEXT,
                sent_at TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(user_id, digest_date),
                FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS digest_items (
                digest_id TEXT NOT NULL,
                item_id TEXT NOT NULL,
                rank INTEGER NOT NULL,
                PRIMARY KEY (digest_id, item_id),
                FOREIGN KEY (digest_id) REFERENCES digests (id) ON DELETE CASCADE,
                FOREIGN KEY (item_id) REFERENCES items (id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS digest_cluster_drafts (
                id TEXT PRIMARY KEY,
                digest_id TEXT NOT NULL,
                cluster_key TEXT NOT NULL,
                cluster_label TEXT NOT NULL,
                rank INTEGER NOT NULL,
                item_count INTEGER NOT NULL,
                topics TEXT NOT NULL,
                max_score REAL,
                draft_summary TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(digest_id, rank),
                FOREIGN KEY (digest_id) REFERENCES digests (id) ON DELETE CASCADE
            );

            -- Write-once ledger; duplicates are collapsed by idempotency_key.
            CREATE TABLE IF NOT EXISTS llm_usage_logs (
                id TEXT PRIMARY KEY,
                idempotency_key TEXT NOT NULL UNIQUE,
                user_id TEXT,
                source_id TEXT,
                item_id TEXT,
                digest_id TEXT,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                pricing_model_family TEXT,
                pricing_source TEXT NOT NULL,
                purpose TEXT NOT NULL,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                cache_creation_input_tokens INTEGER NOT NULL DEFAULT 0,
                cache_read_input_tokens INTEGER NOT NULL DEFAULT 0,
                estimated_cost_usd REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_llm_usage_logs_user_created ON llm_usage_logs (user_id, created_at);

            CREATE TABLE IF NOT EXISTS budget_alert_logs (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                month_jst TEXT NOT NULL,
                threshold_pct INTEGER NOT NULL,
                budget_usd REAL NOT NULL,
                used_cost_usd REAL NOT NULL,
                remaining_ratio REAL NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(user_id, month_jst, threshold_pct)
            );

            -- Follow-on pipeline events, consumed at least once.
            CREATE TABLE IF NOT EXISTS event_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                payload TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                available_at TEXT NOT NULL,
                last_error TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_event_queue_available_at ON event_queue (available_at);
            "#,
        )
        .execute(&mut *conn)
        .await?;

        info!(target: TARGET_DB, "Tables ensured to exist");

        Ok(())
    }
}
