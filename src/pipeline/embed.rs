use tracing::{info, instrument, warn};

use super::{Pipeline, PipelineError, SecretKind};
use crate::events::{Event, ItemEmbed};
use crate::models::UserSettings;
use crate::similarity::normalize_vector;
use crate::usage::{select_embedding_model, UsageAttribution, PURPOSE_EMBEDDING};
use crate::TARGET_PIPELINE;

/// At most this many facts go into the embedding text.
pub const MAX_EMBEDDING_FACTS: usize = 12;

#[derive(Debug, Clone, PartialEq)]
pub struct EmbedOutcome {
    pub item_id: String,
    pub model: String,
    pub dimensions: usize,
}

/// Text embedded for an item: labelled title, summary and topic lines, then
/// up to [`MAX_EMBEDDING_FACTS`] facts as a list.
pub fn build_item_embedding_input(
    title: Option<&str>,
    summary: &str,
    topics: &[String],
    facts: &[String],
) -> String {
    let mut out = String::new();
    if let Some(title) = title.filter(|t| !t.is_empty()) {
        out.push_str(&format!("title: {}\n", title));
    }
    if !summary.is_empty() {
        out.push_str(&format!("summary: {}\n", summary));
    }
    if !topics.is_empty() {
        out.push_str(&format!("topics: {}\n", topics.join(", ")));
    }
    if !facts.is_empty() {
        out.push_str("facts:\n");
        for fact in facts.iter().take(MAX_EMBEDDING_FACTS) {
            out.push_str(&format!("- {}\n", fact));
        }
    }
    out
}

impl Pipeline {
    /// Embeds one item and stores the vector, replacing any previous one.
    ///
    /// Needs the user's OpenAI key. The vector is stored unit-length whatever the
    /// embedder returns. Usage is logged only after the vector is stored.
    pub async fn create_embedding(
        &self,
        user_id: &str,
        source_id: &str,
        item_id: &str,
        settings: Option<&UserSettings>,
        input: &str,
    ) -> Result<EmbedOutcome, PipelineError> {
        let api_key = self.decrypt_user_key(settings, SecretKind::OpenAi)?;
        let model = select_embedding_model(
            settings.and_then(|s| s.embedding_model.as_deref()),
            &self.default_embedding_model,
        );

        let result = self
            .steps
            .run("create-embedding", || async {
                self.embedder
                    .embed(&api_key, &model, input)
                    .await
                    .map_err(PipelineError::Upstream)
            })
            .await?;
        let embedding = normalize_vector(&result.embedding);
        self.db
            .upsert_embedding(item_id, &model, &embedding)
            .await?;
        self.record_usage(
            PURPOSE_EMBEDDING,
            &UsageAttribution::for_item(user_id, source_id, item_id),
            Some(&result.usage),
        )
        .await;

        Ok(EmbedOutcome {
            item_id: item_id.to_string(),
            model,
            dimensions: embedding.len(),
        })
    }

    /// Standalone embed run for an already summarized item.
    #[instrument(target = "pipeline", level = "info", skip(self))]
    pub async fn embed_item(&self, item_id: &str) -> Result<EmbedOutcome, PipelineError> {
        if item_id.trim().is_empty() {
            return Err(PipelineError::InvalidInput("item_id is required".into()));
        }
        let Some(candidate) = self.db.get_embedding_candidate(item_id).await? else {
            return Err(PipelineError::InvalidInput(format!(
                "item {} is not summarized",
                item_id
            )));
        };
        let settings = self.load_settings(Some(&candidate.user_id)).await;
        let input = build_item_embedding_input(
            candidate.title.as_deref(),
            &candidate.summary,
            &candidate.topics,
            &candidate.facts,
        );
        let outcome = self
            .create_embedding(
                &candidate.user_id,
                &candidate.source_id,
                &candidate.item_id,
                settings.as_ref(),
                &input,
            )
            .await?;
        info!(
            target: TARGET_PIPELINE,
            "embed-item done item_id={} model={} dims={}",
            outcome.item_id,
            outcome.model,
            outcome.dimensions
        );
        Ok(outcome)
    }

    /// Emits `item/embed` for summarized items that have no embedding yet.
    pub async fn backfill_embeddings(&self, limit: i64) -> Result<usize, PipelineError> {
        let missing = self.db.list_items_missing_embeddings(limit).await?;
        let mut queued = 0;
        for item_id in missing {
            let event = Event::ItemEmbed(ItemEmbed {
                item_id: item_id.clone(),
            });
            match self.events.emit(event).await {
                Ok(()) => queued += 1,
                Err(e) => {
                    warn!(target: TARGET_PIPELINE, "backfill emit failed item_id={}: {}", item_id, e);
                }
            }
        }
        info!(target: TARGET_PIPELINE, "backfill-embeddings queued={}", queued);
        Ok(queued)
    }
}
