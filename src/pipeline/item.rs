use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use super::{Pipeline, PipelineError};
use crate::events::ItemCreated;
use crate::models::{ItemStatus, UserSettings};
use crate::usage::{UsageAttribution, PURPOSE_FACTS, PURPOSE_SUMMARY};
use crate::TARGET_PIPELINE;

#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// The item reached `summarized`; `embedded` reports the best-effort branch.
    Summarized { item_id: String, embedded: bool },
    /// A replay found the item already summarized.
    AlreadySummarized { item_id: String },
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl Pipeline {
    /// Drives one item from `new` to `summarized`, then embeds it best-effort.
    ///
    /// A failure in extract, facts or summarize marks the item `failed` with
    /// the stage name and cause, and ends the run.
    #[instrument(target = "pipeline", level = "info", skip(self, event), fields(item_id = %event.item_id))]
    pub async fn process_item(&self, event: &ItemCreated) -> Result<ItemOutcome, PipelineError> {
        if event.item_id.trim().is_empty() {
            return Err(PipelineError::InvalidInput("item_id is required".into()));
        }
        if event.url.trim().is_empty() {
            return Err(PipelineError::InvalidInput("url is required".into()));
        }
        let item_id = event.item_id.as_str();

        let Some(item) = self.db.get_item(item_id).await? else {
            return Err(PipelineError::InvalidInput(format!("item {} not found", item_id)));
        };
        if item.status == ItemStatus::Summarized {
            info!(target: TARGET_PIPELINE, "process-item skip item_id={} already summarized", item_id);
            return Ok(ItemOutcome::AlreadySummarized {
                item_id: item_id.to_string(),
            });
        }

        let user_id = match self.db.item_owner(item_id).await {
            Ok(owner) => owner,
            Err(e) => {
                warn!(target: TARGET_PIPELINE, "process-item owner lookup failed item_id={}: {}", item_id, e);
                None
            }
        };
        let settings = self.load_settings(user_id.as_deref()).await;
        info!(target: TARGET_PIPELINE, "process-item start item_id={} url={}", item_id, event.url);

        // Extract
        let extracted = match self
            .steps
            .run("extract-body", || async {
                self.content
                    .extract_body(&event.url)
                    .await
                    .map_err(PipelineError::Upstream)
            })
            .await
        {
            Ok(extracted) => extracted,
            Err(e) => return Err(self.fail_item(item_id, "extract body", e).await),
        };
        info!(
            target: TARGET_PIPELINE,
            "process-item extract-body done item_id={} content_len={}",
            item_id,
            extracted.content.len()
        );

        let published_at = extracted
            .published_at
            .as_deref()
            .and_then(|p| DateTime::parse_from_rfc3339(p.trim()).ok())
            .map(|dt| dt.with_timezone(&Utc));
        self.db
            .update_after_extract(
                item_id,
                extracted.title.as_deref(),
                extracted.image_url.as_deref(),
                &extracted.content,
                published_at,
            )
            .await?;

        let title_for_llm: Option<String> = non_blank(extracted.title.as_deref())
            .or_else(|| non_blank(event.title.as_deref()))
            .map(str::to_string);
        let attribution = UsageAttribution {
            user_id: user_id.clone(),
            source_id: Some(event.source_id.clone()),
            item_id: Some(item_id.to_string()),
            digest_id: None,
        };

        // Facts
        let facts_model = settings.as_ref().and_then(|s| non_blank(s.facts_model.as_deref()));
        let facts = match self
            .steps
            .run("extract-facts", || async {
                let credentials = self.llm_credentials(settings.as_ref(), facts_model)?;
                self.content
                    .extract_facts(
                        title_for_llm.as_deref(),
                        &extracted.content,
                        &credentials,
                        facts_model,
                    )
                    .await
                    .map_err(PipelineError::Upstream)
            })
            .await
        {
            Ok(facts) => facts,
            Err(e) => return Err(self.fail_item(item_id, "extract facts", e).await),
        };
        info!(target: TARGET_PIPELINE, "process-item extract-facts done item_id={} facts={}", item_id, facts.facts.len());
        self.record_usage(PURPOSE_FACTS, &attribution, facts.llm.as_ref())
            .await;
        self.db.insert_facts(item_id, &facts.facts).await?;

        // Summarize
        let summary_model = settings.as_ref().and_then(|s| non_blank(s.summary_model.as_deref()));
        let source_chars = extracted.content.chars().count();
        let summary = match self
            .steps
            .run("summarize", || async {
                let credentials = self.llm_credentials(settings.as_ref(), summary_model)?;
                self.content
                    .summarize(
                        title_for_llm.as_deref(),
                        &facts.facts,
                        source_chars,
                        &credentials,
                        summary_model,
                    )
                    .await
                    .map_err(PipelineError::Upstream)
            })
            .await
        {
            Ok(summary) => summary,
            Err(e) => return Err(self.fail_item(item_id, "summarize", e).await),
        };
        info!(
            target: TARGET_PIPELINE,
            "process-item summarize done item_id={} topics={} score={:.3}",
            item_id,
            summary.topics.len(),
            summary.score
        );
        self.record_usage(PURPOSE_SUMMARY, &attribution, summary.llm.as_ref())
            .await;
        self.db.insert_summary(item_id, &summary).await?;

        // Embed, best-effort
        let embedded = match user_id.as_deref() {
            Some(user_id) => {
                let input = super::embed::build_item_embedding_input(
                    title_for_llm.as_deref(),
                    &summary.summary,
                    &summary.topics,
                    &facts.facts,
                );
                match self
                    .create_embedding(user_id, &event.source_id, item_id, settings.as_ref(), &input)
                    .await
                {
                    Ok(outcome) => {
                        info!(
                            target: TARGET_PIPELINE,
                            "process-item create-embedding done item_id={} dims={}",
                            item_id,
                            outcome.dimensions
                        );
                        true
                    }
                    Err(e) => {
                        warn!(target: TARGET_PIPELINE, "process-item embedding skipped item_id={}: {}", item_id, e);
                        false
                    }
                }
            }
            None => {
                warn!(target: TARGET_PIPELINE, "process-item embedding skipped item_id={}: no owner", item_id);
                false
            }
        };

        info!(target: TARGET_PIPELINE, "process-item complete item_id={}", item_id);
        Ok(ItemOutcome::Summarized {
            item_id: item_id.to_string(),
            embedded,
        })
    }

    /// Settings are optional; lookup errors are logged and treated as none.
    pub(crate) async fn load_settings(&self, user_id: Option<&str>) -> Option<UserSettings> {
        let user_id = user_id?;
        match self.db.get_user_settings(user_id).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!(target: TARGET_PIPELINE, "settings lookup failed user_id={}: {}", user_id, e);
                None
            }
        }
    }

    async fn fail_item(&self, item_id: &str, stage: &str, error: PipelineError) -> PipelineError {
        warn!(target: TARGET_PIPELINE, "process-item {} failed item_id={}: {}", stage, item_id, error);
        let message = format!("{}: {}", stage, error);
        if let Err(e) = self.db.mark_item_failed(item_id, &message).await {
            warn!(target: TARGET_PIPELINE, "mark failed item_id={}: {}", item_id, e);
        }
        error
    }

    /// Resets failed items to `new` and re-emits `item/created` for each.
    pub async fn retry_failed_items(&self, limit: i64) -> Result<usize, PipelineError> {
        let targets = self.db.list_failed_for_retry(limit).await?;
        let mut queued = 0;
        for target in targets {
            if !self.db.reset_item_for_retry(&target.item_id).await? {
                continue;
            }
            let event = crate::events::Event::ItemCreated(ItemCreated {
                item_id: target.item_id.clone(),
                source_id: target.source_id,
                url: target.url,
                title: target.title,
            });
            match self.events.emit(event).await {
                Ok(()) => queued += 1,
                Err(e) => {
                    warn!(target: TARGET_PIPELINE, "retry emit failed item_id={}: {}", target.item_id, e);
                }
            }
        }
        info!(target: TARGET_PIPELINE, "retry-failed queued={}", queued);
        Ok(queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::{harness, item_event};
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_happy_path_reaches_summarized_and_logs_usage() {
        let h = harness().await;
        h.configure_keys(true, true).await;
        let event = item_event(&h, "https://example.com/a", Some("Feed title")).await;

        let outcome = h.pipeline.process_item(&event).await.unwrap();
        assert_eq!(
            outcome,
            ItemOutcome::Summarized {
                item_id: event.item_id.clone(),
                embedded: true
            }
        );

        let item = h.db.get_item(&event.item_id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Summarized);
        assert_eq!(item.title.as_deref(), Some("Extracted title"));
        assert_eq!(h.db.get_item_facts(&event.item_id).await.unwrap().len(), 2);
        assert!(h
            .db
            .get_item_embeddings(&[event.item_id.clone()])
            .await
            .unwrap()
            .contains_key(&event.item_id));
        // facts + summary + embedding
        assert_eq!(h.db.count_usage_rows(&h.user_id).await.unwrap(), 3);

        // A replay is a no-op.
        let again = h.pipeline.process_item(&event).await.unwrap();
        assert!(matches!(again, ItemOutcome::AlreadySummarized { .. }));
        assert_eq!(h.content.extract_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_extract_failure_marks_failed_and_stops() {
        let h = harness().await;
        h.configure_keys(true, true).await;
        h.content.fail_extract.store(true, Ordering::SeqCst);
        let event = item_event(&h, "https://example.com/b", None).await;

        let err = h.pipeline.process_item(&event).await.unwrap_err();
        assert!(matches!(err, PipelineError::Upstream(_)));
        let item = h.db.get_item(&event.item_id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert!(item.processing_error.unwrap().starts_with("extract body: "));
        assert_eq!(h.content.facts_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_key_fails_facts_without_calling_worker() {
        let h = harness().await;
        let event = item_event(&h, "https://example.com/c", None).await;

        let err = h.pipeline.process_item(&event).await.unwrap_err();
        assert!(matches!(err, PipelineError::Credential(_)));
        let item = h.db.get_item(&event.item_id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(
            item.processing_error.as_deref(),
            Some("extract facts: user anthropic api key is required")
        );
        assert_eq!(h.content.facts_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_embedding_failure_never_fails_the_item() {
        let h = harness().await;
        h.configure_keys(true, false).await;
        let event = item_event(&h, "https://example.com/d", None).await;

        let outcome = h.pipeline.process_item(&event).await.unwrap();
        assert_eq!(
            outcome,
            ItemOutcome::Summarized {
                item_id: event.item_id.clone(),
                embedded: false
            }
        );
        let item = h.db.get_item(&event.item_id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Summarized);
        assert!(item.processing_error.is_none());
    }

    #[tokio::test]
    async fn test_embedding_call_failure_never_fails_the_item() {
        let h = harness().await;
        h.configure_keys(true, true).await;
        h.embedder.fail.store(true, Ordering::SeqCst);
        let event = item_event(&h, "https://example.com/d2", None).await;

        let outcome = h.pipeline.process_item(&event).await.unwrap();
        assert_eq!(
            outcome,
            ItemOutcome::Summarized {
                item_id: event.item_id.clone(),
                embedded: false
            }
        );
        let item = h.db.get_item(&event.item_id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Summarized);
        assert!(item.processing_error.is_none());
        let stored = h
            .db
            .get_item_embeddings(&[event.item_id.clone()])
            .await
            .unwrap();
        assert!(stored.is_empty());
        // facts + summary only
        assert_eq!(h.db.count_usage_rows(&h.user_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_feed_title_used_when_extraction_has_none() {
        let h = harness().await;
        h.configure_keys(true, false).await;
        h.content.omit_title.store(true, Ordering::SeqCst);
        let event = item_event(&h, "https://example.com/e", Some("  From feed ")).await;

        h.pipeline.process_item(&event).await.unwrap();
        let seen = h.content.last_facts_title.lock().unwrap().clone();
        assert_eq!(seen.as_deref(), Some("From feed"));
    }

    #[tokio::test]
    async fn test_retry_failed_items_requeues() {
        let h = harness().await;
        let event = item_event(&h, "https://example.com/f", None).await;
        h.db.mark_item_failed(&event.item_id, "boom").await.unwrap();

        assert_eq!(h.pipeline.retry_failed_items(10).await.unwrap(), 1);
        let item = h.db.get_item(&event.item_id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::New);
        let emitted = h.sink.names();
        assert_eq!(emitted, vec!["item/created".to_string()]);
    }
}
