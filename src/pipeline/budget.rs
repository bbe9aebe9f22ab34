use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use super::{Pipeline, PipelineError};
use crate::timeutil::jst_month;
use crate::usage::{evaluate_budget, BudgetDecision};
use crate::TARGET_PIPELINE;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BudgetSummary {
    pub month_jst: String,
    pub checked: usize,
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Nothing was evaluated because email delivery is not configured.
    pub mailer_disabled: bool,
}

impl Pipeline {
    /// Sends at most one alert per user, JST month and threshold when the
    /// remaining budget share drops below the user's threshold.
    ///
    /// The alert log row is written only after the email went out, so a
    /// failed send is retried on the next run.
    #[instrument(target = "pipeline", level = "info", skip(self))]
    pub async fn check_budget_alerts(&self, at: DateTime<Utc>) -> Result<BudgetSummary, PipelineError> {
        let month = jst_month(at);
        let mut summary = BudgetSummary {
            month_jst: month.label.clone(),
            ..BudgetSummary::default()
        };
        if !self.mailer.enabled() {
            info!(target: TARGET_PIPELINE, "budget-alert skipped: email disabled");
            summary.mailer_disabled = true;
            return Ok(summary);
        }

        let targets = self.db.list_budget_alert_targets().await?;
        for target in targets {
            summary.checked += 1;
            let used = match self
                .db
                .sum_usage_cost(&target.user_id, month.start, month.end)
                .await
            {
                Ok(used) => used,
                Err(e) => {
                    warn!(target: TARGET_PIPELINE, "budget usage sum failed user_id={}: {}", target.user_id, e);
                    summary.failed += 1;
                    continue;
                }
            };
            let already_alerted = match self
                .db
                .budget_alert_exists(&target.user_id, &month.label, target.budget_alert_threshold_pct)
                .await
            {
                Ok(found) => found,
                Err(e) => {
                    warn!(target: TARGET_PIPELINE, "budget alert lookup failed user_id={}: {}", target.user_id, e);
                    summary.failed += 1;
                    continue;
                }
            };

            let alert = match evaluate_budget(&target, used, already_alerted) {
                BudgetDecision::Alert(alert) => alert,
                _ => {
                    summary.skipped += 1;
                    continue;
                }
            };
            if let Err(e) = self
                .mailer
                .send_budget_alert(&target.email, &month.label, &alert)
                .await
            {
                warn!(target: TARGET_PIPELINE, "budget alert send failed user_id={}: {:#}", target.user_id, e);
                summary.failed += 1;
                continue;
            }
            if let Err(e) = self
                .db
                .insert_budget_alert_log(
                    &target.user_id,
                    &month.label,
                    alert.threshold_pct,
                    alert.monthly_budget_usd,
                    alert.used_cost_usd,
                    alert.remaining_ratio,
                )
                .await
            {
                warn!(target: TARGET_PIPELINE, "budget alert log failed user_id={}: {}", target.user_id, e);
            }
            summary.sent += 1;
        }

        info!(
            target: TARGET_PIPELINE,
            "budget-alert month={} checked={} sent={} skipped={} failed={}",
            summary.month_jst,
            summary.checked,
            summary.sent,
            summary.skipped,
            summary.failed
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LlmUsage, LlmUsageRecord};
    use crate::pipeline::test_support::{harness, Harness};
    use std::sync::atomic::Ordering;

    async fn with_budget(h: &Harness, budget: f64, threshold_pct: i64) {
        let mut settings = h.db.get_user_settings(&h.user_id).await.unwrap().unwrap_or_default();
        settings.user_id = h.user_id.clone();
        settings.monthly_budget_usd = Some(budget);
        settings.budget_alert_enabled = true;
        settings.budget_alert_threshold_pct = threshold_pct;
        h.db.upsert_user_settings(&settings).await.unwrap();
    }

    async fn spend(h: &Harness, key: &str, cost: f64) {
        let record = LlmUsageRecord {
            idempotency_key: key.to_string(),
            user_id: Some(h.user_id.clone()),
            source_id: None,
            item_id: None,
            digest_id: None,
            purpose: "summary".to_string(),
            usage: LlmUsage {
                provider: "anthropic".to_string(),
                model: "claude-haiku".to_string(),
                estimated_cost_usd: cost,
                ..LlmUsage::default()
            },
        };
        h.db.insert_usage(&record).await.unwrap();
    }

    #[tokio::test]
    async fn test_alert_sent_once_per_month() {
        let h = harness().await;
        with_budget(&h, 10.0, 20).await;
        spend(&h, "k1", 8.5).await;

        let first = h.pipeline.check_budget_alerts(Utc::now()).await.unwrap();
        assert_eq!(first.checked, 1);
        assert_eq!(first.sent, 1);
        {
            let alerts = h.mailer.alerts.lock().unwrap();
            assert_eq!(alerts.len(), 1);
            assert!((alerts[0].1.remaining_ratio - 0.15).abs() < 1e-9);
        }

        let second = h.pipeline.check_budget_alerts(Utc::now()).await.unwrap();
        assert_eq!(second.sent, 0);
        assert_eq!(second.skipped, 1);
        assert_eq!(h.mailer.alerts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_within_budget_is_quiet() {
        let h = harness().await;
        with_budget(&h, 10.0, 20).await;
        spend(&h, "k1", 2.0).await;
        let summary = h.pipeline.check_budget_alerts(Utc::now()).await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert!(h.mailer.alerts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_send_is_retried_next_run() {
        let h = harness().await;
        with_budget(&h, 10.0, 20).await;
        spend(&h, "k1", 9.0).await;

        h.mailer.fail.store(true, Ordering::SeqCst);
        let failed = h.pipeline.check_budget_alerts(Utc::now()).await.unwrap();
        assert_eq!(failed.failed, 1);
        let month = jst_month(Utc::now());
        assert!(!h.db.budget_alert_exists(&h.user_id, &month.label, 20).await.unwrap());

        h.mailer.fail.store(false, Ordering::SeqCst);
        let retried = h.pipeline.check_budget_alerts(Utc::now()).await.unwrap();
        assert_eq!(retried.sent, 1);
        assert!(h.db.budget_alert_exists(&h.user_id, &month.label, 20).await.unwrap());
    }

    #[tokio::test]
    async fn test_disabled_mailer_skips_everything() {
        let h = harness().await;
        with_budget(&h, 10.0, 20).await;
        spend(&h, "k1", 9.9).await;
        h.mailer.enabled.store(false, Ordering::SeqCst);
        let summary = h.pipeline.check_budget_alerts(Utc::now()).await.unwrap();
        assert!(summary.mailer_disabled);
        assert_eq!(summary.checked, 0);
    }
}
