use chrono::{DateTime, Utc};
use tracing::{error, info, instrument, warn};

use super::{Pipeline, PipelineError};
use crate::clients::worker::ClusterDraftRequest;
use crate::digest_drafts::{
    build_cluster_drafts, build_compose_items, compress_cluster_drafts, draft_source_lines,
};
use crate::events::{DigestRef, Event};
use crate::models::{DigestDetail, Item, SendStatus, User, UserSettings};
use crate::similarity::reading_plan_clusters;
use crate::timeutil::{digest_window, jst_date};
use crate::usage::{UsageAttribution, PURPOSE_DIGEST, PURPOSE_DIGEST_CLUSTER_DRAFT};
use crate::TARGET_PIPELINE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DigestOutcome {
    Created { digest_id: String },
    /// The digest for this date was already sent and was left untouched.
    AlreadySent { digest_id: String },
    NoItems,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerateSummary {
    pub created: usize,
    pub skipped_sent: usize,
    pub skipped_empty: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeOutcome {
    Composed,
    /// Stored subject and body were found, so no LLM call was made.
    Reused,
    SkippedNoItems,
    AlreadySent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    SkippedResendDisabled,
    SkippedUserDisabled,
    AlreadySent,
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl Pipeline {
    /// Builds today's (JST) digest for one user from items summarized in the
    /// trailing day.
    pub async fn generate_digest_for_user(
        &self,
        user: &User,
        at: DateTime<Utc>,
    ) -> Result<DigestOutcome, PipelineError> {
        let (since, until) = digest_window(at);
        let items = self
            .db
            .list_summarized_for_user(&user.id, since, until)
            .await?;
        if items.is_empty() {
            return Ok(DigestOutcome::NoItems);
        }

        let item_ids: Vec<String> = items.into_iter().map(|i| i.id).collect();
        let creation = self
            .db
            .create_digest(&user.id, jst_date(at), &item_ids)
            .await?;
        if creation.already_sent {
            return Ok(DigestOutcome::AlreadySent {
                digest_id: creation.digest_id,
            });
        }

        let event = Event::DigestCreated(DigestRef {
            digest_id: creation.digest_id.clone(),
            user_id: user.id.clone(),
            to: user.email.clone(),
        });
        if let Err(e) = self.events.emit(event).await {
            warn!(target: TARGET_PIPELINE, "emit digest/created failed digest_id={}: {}", creation.digest_id, e);
        }
        Ok(DigestOutcome::Created {
            digest_id: creation.digest_id,
        })
    }

    /// Daily run over every user (or only `user_ids` when non-empty).
    #[instrument(target = "pipeline", level = "info", skip(self, user_ids))]
    pub async fn generate_digests(
        &self,
        at: DateTime<Utc>,
        user_ids: &[String],
    ) -> Result<GenerateSummary, PipelineError> {
        let users = self.db.list_users().await?;
        let mut summary = GenerateSummary::default();
        for user in users
            .iter()
            .filter(|u| user_ids.is_empty() || user_ids.contains(&u.id))
        {
            match self.generate_digest_for_user(user, at).await {
                Ok(DigestOutcome::Created { .. }) => summary.created += 1,
                Ok(DigestOutcome::AlreadySent { .. }) => summary.skipped_sent += 1,
                Ok(DigestOutcome::NoItems) => summary.skipped_empty += 1,
                Err(e) => {
                    warn!(target: TARGET_PIPELINE, "create digest for {} failed: {}", user.email, e);
                    summary.failed += 1;
                }
            }
        }
        info!(
            target: TARGET_PIPELINE,
            "generate-digest created={} skipped_sent={} skipped_empty={} failed={}",
            summary.created,
            summary.skipped_sent,
            summary.skipped_empty,
            summary.failed
        );
        Ok(summary)
    }

    async fn mark_digest_status(
        &self,
        digest_id: &str,
        status: SendStatus,
        error: Option<&PipelineError>,
    ) {
        let message = error.map(|e| e.to_string());
        if let Err(e) = self
            .db
            .update_send_status(digest_id, status, message.as_deref())
            .await
        {
            warn!(target: TARGET_PIPELINE, "update status failed digest_id={} status={}: {}", digest_id, status, e);
        }
    }

    async fn fetch_digest(&self, digest_id: &str) -> Result<DigestDetail, PipelineError> {
        let fetched = match self.db.get_digest_detail(digest_id).await {
            Ok(Some(detail)) => Ok(detail),
            Ok(None) => Err(PipelineError::InvalidInput(format!("digest {} not found", digest_id))),
            Err(e) => Err(PipelineError::from(e)),
        };
        if let Err(e) = &fetched {
            self.mark_digest_status(digest_id, SendStatus::FetchFailed, Some(e))
                .await;
        }
        fetched
    }

    /// Turns a digest's items into email copy, then emits `digest/copy-composed`.
    ///
    /// Stored copy is reused as is. Drafts are rebuilt wholesale on each
    /// attempt until copy exists.
    #[instrument(target = "pipeline", level = "info", skip(self, data), fields(digest_id = %data.digest_id))]
    pub async fn compose_digest_copy(&self, data: &DigestRef) -> Result<ComposeOutcome, PipelineError> {
        let detail = self.fetch_digest(&data.digest_id).await?;
        if detail.digest.sent_at.is_some() {
            return Ok(ComposeOutcome::AlreadySent);
        }
        if detail.items.is_empty() {
            info!(target: TARGET_PIPELINE, "compose-digest-copy skip-no-items digest_id={}", data.digest_id);
            self.mark_digest_status(&data.digest_id, SendStatus::SkippedNoItems, None)
                .await;
            return Ok(ComposeOutcome::SkippedNoItems);
        }
        self.mark_digest_status(&data.digest_id, SendStatus::Processing, None)
            .await;

        let outcome = if detail.digest.email_copy().is_some() {
            info!(target: TARGET_PIPELINE, "compose-digest-copy reuse-copy digest_id={}", data.digest_id);
            ComposeOutcome::Reused
        } else {
            let settings = self.load_settings(Some(&data.user_id)).await;
            if let Err(e) = self.compose_copy(&detail, data, settings.as_ref()).await {
                self.mark_digest_status(&data.digest_id, SendStatus::ComposeFailed, Some(&e))
                    .await;
                return Err(e);
            }
            ComposeOutcome::Composed
        };

        let event = Event::DigestCopyComposed(data.clone());
        if let Err(e) = self.events.emit(event).await {
            let e = PipelineError::Upstream(e.context("send digest/copy-composed"));
            self.mark_digest_status(&data.digest_id, SendStatus::EnqueueSendFailed, Some(&e))
                .await;
            return Err(e);
        }
        info!(target: TARGET_PIPELINE, "compose-digest-copy complete digest_id={}", data.digest_id);
        Ok(outcome)
    }

    async fn compose_copy(
        &self,
        detail: &DigestDetail,
        data: &DigestRef,
        settings: Option<&UserSettings>,
    ) -> Result<(), PipelineError> {
        let items: Vec<Item> = detail
            .items
            .iter()
            .map(|d| {
                let mut item = d.item.clone();
                item.summary_score = d.summary.score;
                item.summary_topics = d.summary.topics.clone();
                item
            })
            .collect();
        let item_ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
        let embeddings = self.db.get_item_embeddings(&item_ids).await?;
        let clusters = reading_plan_clusters(&items, &embeddings, None);
        let drafts = build_cluster_drafts(&detail.items, &clusters);
        let mut drafts = compress_cluster_drafts(drafts, self.draft_target);

        let attribution = UsageAttribution::for_digest(&data.user_id, &data.digest_id);
        let cluster_model = settings.and_then(|s| non_blank(s.digest_cluster_model.as_deref()));
        let cluster_credentials = self.llm_credentials(settings, cluster_model)?;
        for draft in drafts.iter_mut() {
            let source_lines = draft_source_lines(&draft.draft_summary);
            if source_lines.is_empty() {
                continue;
            }
            let rank = draft.rank;
            let request = ClusterDraftRequest {
                cluster_label: &draft.cluster_label,
                item_count: draft.item_count,
                topics: &draft.topics,
                source_lines: &source_lines,
                model: cluster_model,
            };
            let response = self
                .steps
                .run("compose-cluster-draft", || async {
                    self.content
                        .compose_cluster_draft(&request, &cluster_credentials)
                        .await
                        .map_err(|e| {
                            PipelineError::Upstream(
                                e.context(format!("compose digest cluster draft rank={}", rank)),
                            )
                        })
                })
                .await?;
            if !response.draft_summary.trim().is_empty() {
                draft.draft_summary = response.draft_summary;
            }
            self.record_usage(PURPOSE_DIGEST_CLUSTER_DRAFT, &attribution, response.llm.as_ref())
                .await;
        }

        if !self
            .db
            .replace_cluster_drafts(&data.digest_id, &drafts)
            .await?
        {
            info!(target: TARGET_PIPELINE, "digest {} was sent meanwhile, drafts left as is", data.digest_id);
            return Ok(());
        }
        let stored = self.db.list_cluster_drafts(&data.digest_id).await?;
        let compose_items = build_compose_items(&stored);
        info!(
            target: TARGET_PIPELINE,
            "compose-digest-copy compacted digest_id={} source_items={} cluster_drafts={} compose_items={}",
            data.digest_id,
            detail.items.len(),
            stored.len(),
            compose_items.len()
        );

        let digest_model = settings.and_then(|s| non_blank(s.digest_model.as_deref()));
        let digest_credentials = self.llm_credentials(settings, digest_model)?;
        let copy = self
            .steps
            .run("compose-digest", || async {
                self.content
                    .compose_digest(
                        &detail.digest.digest_date,
                        &compose_items,
                        &digest_credentials,
                        digest_model,
                    )
                    .await
                    .map_err(PipelineError::Upstream)
            })
            .await?;
        self.record_usage(PURPOSE_DIGEST, &attribution, copy.llm.as_ref())
            .await;
        self.db
            .update_email_copy(&data.digest_id, &copy.subject, &copy.body)
            .await?;
        Ok(())
    }

    /// Sends composed copy, honoring the global and per-user email switches.
    #[instrument(target = "pipeline", level = "info", skip(self, data), fields(digest_id = %data.digest_id))]
    pub async fn send_digest(&self, data: &DigestRef) -> Result<SendOutcome, PipelineError> {
        let detail = self.fetch_digest(&data.digest_id).await?;
        if detail.digest.sent_at.is_some() {
            return Ok(SendOutcome::AlreadySent);
        }
        let Some(copy) = detail.digest.email_copy() else {
            let e = PipelineError::InvalidInput("digest email copy is missing".into());
            self.mark_digest_status(&data.digest_id, SendStatus::ComposeFailed, Some(&e))
                .await;
            return Err(e);
        };
        if !self.mailer.enabled() {
            self.mark_digest_status(&data.digest_id, SendStatus::SkippedResendDisabled, None)
                .await;
            return Ok(SendOutcome::SkippedResendDisabled);
        }
        match self.db.digest_email_enabled(&data.user_id).await {
            Ok(true) => {}
            Ok(false) => {
                self.mark_digest_status(&data.digest_id, SendStatus::SkippedUserDisabled, None)
                    .await;
                return Ok(SendOutcome::SkippedUserDisabled);
            }
            Err(e) => {
                let e = PipelineError::from(e);
                self.mark_digest_status(&data.digest_id, SendStatus::UserSettingsFailed, Some(&e))
                    .await;
                return Err(e);
            }
        }
        self.mark_digest_status(&data.digest_id, SendStatus::Processing, None)
            .await;

        let sent = self
            .steps
            .run("send-email", || async {
                self.mailer
                    .send_digest(&data.to, &detail, Some(copy))
                    .await
                    .map_err(PipelineError::Upstream)
            })
            .await;
        if let Err(e) = sent {
            self.mark_digest_status(&data.digest_id, SendStatus::SendEmailFailed, Some(&e))
                .await;
            return Err(e);
        }
        // Delivered; the run only succeeds once sent_at is stored.
        let marked = self
            .steps
            .run("mark-sent", || async {
                self.db
                    .mark_digest_sent(&data.digest_id)
                    .await
                    .map_err(PipelineError::from)
            })
            .await;
        if let Err(e) = marked {
            error!(target: TARGET_PIPELINE, "update sent_at failed digest_id={}: {}", data.digest_id, e);
            self.mark_digest_status(&data.digest_id, SendStatus::SendEmailFailed, Some(&e))
                .await;
            return Err(e);
        }
        info!(target: TARGET_PIPELINE, "send-digest complete digest_id={}", data.digest_id);
        Ok(SendOutcome::Sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::{harness, summarized_item, Harness};
    use chrono::Duration;
    use std::sync::atomic::Ordering;

    fn run_at() -> DateTime<Utc> {
        // The window ending at tomorrow's JST midnight covers items summarized now.
        Utc::now() + Duration::days(1)
    }

    async fn created_digest(h: &Harness) -> DigestRef {
        summarized_item(h, "https://example.com/g1", &["AI"], 0.9).await;
        summarized_item(h, "https://example.com/g2", &["Chips"], 0.4).await;
        let user = h.db.get_user(&h.user_id).await.unwrap().unwrap();
        let outcome = h.pipeline.generate_digest_for_user(&user, run_at()).await.unwrap();
        let DigestOutcome::Created { digest_id } = outcome else {
            panic!("expected a new digest, got {:?}", outcome);
        };
        DigestRef {
            digest_id,
            user_id: user.id,
            to: user.email,
        }
    }

    #[tokio::test]
    async fn test_generate_ranks_by_score_and_emits() {
        let h = harness().await;
        let data = created_digest(&h).await;
        let detail = h.db.get_digest_detail(&data.digest_id).await.unwrap().unwrap();
        assert_eq!(detail.items.len(), 2);
        assert_eq!(detail.items[0].summary.score, Some(0.9));
        assert_eq!(detail.items[0].rank, 1);
        assert_eq!(h.sink.names(), vec!["digest/created".to_string()]);
    }

    #[tokio::test]
    async fn test_generate_after_send_is_a_noop() {
        let h = harness().await;
        let data = created_digest(&h).await;
        h.db.mark_digest_sent(&data.digest_id).await.unwrap();
        summarized_item(&h, "https://example.com/g3", &["AI"], 0.1).await;

        let summary = h.pipeline.generate_digests(run_at(), &[]).await.unwrap();
        assert_eq!(summary.skipped_sent, 1);
        assert_eq!(summary.created, 0);
        let detail = h.db.get_digest_detail(&data.digest_id).await.unwrap().unwrap();
        assert_eq!(detail.items.len(), 2);
    }

    #[tokio::test]
    async fn test_generate_without_items() {
        let h = harness().await;
        let summary = h.pipeline.generate_digests(run_at(), &[]).await.unwrap();
        assert_eq!(summary.skipped_empty, 1);
        let filtered = h
            .pipeline
            .generate_digests(run_at(), &["someone-else".to_string()])
            .await
            .unwrap();
        assert_eq!(filtered, GenerateSummary::default());
    }

    #[tokio::test]
    async fn test_compose_stores_drafts_and_copy_then_reuses() {
        let h = harness().await;
        h.configure_keys(true, false).await;
        let data = created_digest(&h).await;

        let outcome = h.pipeline.compose_digest_copy(&data).await.unwrap();
        assert_eq!(outcome, ComposeOutcome::Composed);
        let drafts = h.db.list_cluster_drafts(&data.digest_id).await.unwrap();
        assert_eq!(drafts.len(), 2);
        assert!(drafts.iter().all(|d| d.draft_summary.starts_with("revised: ")));
        let digest = h.db.get_digest(&data.digest_id).await.unwrap().unwrap();
        assert!(digest.email_copy().is_some());
        assert_eq!(digest.send_status, Some(SendStatus::Processing));
        // two draft revisions + one digest compose
        assert_eq!(h.db.count_usage_rows(&h.user_id).await.unwrap(), 3);

        let again = h.pipeline.compose_digest_copy(&data).await.unwrap();
        assert_eq!(again, ComposeOutcome::Reused);
        assert_eq!(h.content.digest_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.sink.names(),
            vec![
                "digest/created".to_string(),
                "digest/copy-composed".to_string(),
                "digest/copy-composed".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_compose_failure_marks_status() {
        let h = harness().await;
        let data = created_digest(&h).await;

        let err = h.pipeline.compose_digest_copy(&data).await.unwrap_err();
        assert!(matches!(err, PipelineError::Credential(_)));
        let digest = h.db.get_digest(&data.digest_id).await.unwrap().unwrap();
        assert_eq!(digest.send_status, Some(SendStatus::ComposeFailed));
        assert_eq!(digest.send_error.as_deref(), Some("user anthropic api key is required"));
    }

    #[tokio::test]
    async fn test_compose_empty_and_missing_digest() {
        let h = harness().await;
        let user = h.db.get_user(&h.user_id).await.unwrap().unwrap();
        let creation = h
            .db
            .create_digest(&user.id, jst_date(Utc::now()), &[])
            .await
            .unwrap();
        let data = DigestRef {
            digest_id: creation.digest_id.clone(),
            user_id: user.id.clone(),
            to: user.email.clone(),
        };
        assert_eq!(
            h.pipeline.compose_digest_copy(&data).await.unwrap(),
            ComposeOutcome::SkippedNoItems
        );

        let missing = DigestRef {
            digest_id: "missing".to_string(),
            ..data
        };
        assert!(h.pipeline.compose_digest_copy(&missing).await.is_err());
    }

    #[tokio::test]
    async fn test_send_paths() {
        let h = harness().await;
        h.configure_keys(true, false).await;
        let data = created_digest(&h).await;

        let err = h.pipeline.send_digest(&data).await.unwrap_err();
        assert_eq!(err.to_string(), "invalid input: digest email copy is missing");

        h.pipeline.compose_digest_copy(&data).await.unwrap();
        h.mailer.enabled.store(false, Ordering::SeqCst);
        assert_eq!(
            h.pipeline.send_digest(&data).await.unwrap(),
            SendOutcome::SkippedResendDisabled
        );

        h.mailer.enabled.store(true, Ordering::SeqCst);
        h.mailer.fail.store(true, Ordering::SeqCst);
        assert!(h.pipeline.send_digest(&data).await.is_err());
        let digest = h.db.get_digest(&data.digest_id).await.unwrap().unwrap();
        assert_eq!(digest.send_status, Some(SendStatus::SendEmailFailed));

        h.mailer.fail.store(false, Ordering::SeqCst);
        assert_eq!(h.pipeline.send_digest(&data).await.unwrap(), SendOutcome::Sent);
        let digest = h.db.get_digest(&data.digest_id).await.unwrap().unwrap();
        assert!(digest.sent_at.is_some());
        assert_eq!(digest.send_status, Some(SendStatus::Sent));
        assert!(digest.send_error.is_none());
        assert_eq!(h.mailer.sent.lock().unwrap().len(), 1);

        assert_eq!(h.pipeline.send_digest(&data).await.unwrap(), SendOutcome::AlreadySent);
        assert_eq!(h.mailer.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_send_fails_when_sent_marker_cannot_be_written() {
        let h = harness().await;
        h.configure_keys(true, false).await;
        let data = created_digest(&h).await;
        h.pipeline.compose_digest_copy(&data).await.unwrap();
        sqlx::query(
            r#"
            CREATE TRIGGER reject_sent_at BEFORE UPDATE OF sent_at ON digests
            BEGIN SELECT RAISE(ABORT, 'sent_at is locked'); END;
            "#,
        )
        .execute(h.db.pool())
        .await
        .unwrap();

        let err = h.pipeline.send_digest(&data).await.unwrap_err();
        assert!(matches!(err, PipelineError::Persistence(_)));
        assert_eq!(h.mailer.sent.lock().unwrap().len(), 1);
        let digest = h.db.get_digest(&data.digest_id).await.unwrap().unwrap();
        assert!(digest.sent_at.is_none());
        assert_eq!(digest.send_status, Some(SendStatus::SendEmailFailed));
        assert!(digest
            .send_error
            .as_deref()
            .is_some_and(|e| e.contains("sent_at is locked")));
    }

    #[tokio::test]
    async fn test_send_respects_user_opt_out() {
        let h = harness().await;
        h.configure_keys(true, false).await;
        let data = created_digest(&h).await;
        h.pipeline.compose_digest_copy(&data).await.unwrap();

        let mut settings = h.db.get_user_settings(&h.user_id).await.unwrap().unwrap();
        settings.digest_email_enabled = false;
        h.db.upsert_user_settings(&settings).await.unwrap();
        assert_eq!(
            h.pipeline.send_digest(&data).await.unwrap(),
            SendOutcome::SkippedUserDisabled
        );
        assert!(h.mailer.sent.lock().unwrap().is_empty());
    }
}
