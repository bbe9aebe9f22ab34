//! In-memory collaborators for pipeline tests.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::{Pipeline, StepRunner};
use crate::clients::worker::{
    ClusterDraftRequest, ComposeDigestResponse, ExtractBodyResponse, FactsResponse,
    SummarizeResponse, ClusterDraftResponse,
};
use crate::clients::{ContentService, Credentials, Embedder, EmbeddingResult, Mailer};
use crate::db::test_support::seed_user_source;
use crate::db::Database;
use crate::digest_drafts::ComposeDigestItem;
use crate::events::{Event, EventSink, ItemCreated};
use crate::models::{DigestDetail, LlmUsage, UserSettings};
use crate::secrets::SecretCipher;
use crate::usage::{embedding_usage, BudgetAlert};

fn llm(input_tokens: i64) -> Option<LlmUsage> {
    Some(LlmUsage {
        provider: "anthropic".to_string(),
        model: "claude-haiku".to_string(),
        input_tokens,
        output_tokens: 20,
        estimated_cost_usd: 0.001,
        ..LlmUsage::default()
    })
}

#[derive(Default)]
pub(crate) struct FakeContent {
    pub extract_calls: AtomicU32,
    pub facts_calls: AtomicU32,
    pub draft_calls: AtomicU32,
    pub digest_calls: AtomicU32,
    pub fail_extract: AtomicBool,
    pub omit_title: AtomicBool,
    pub last_facts_title: Mutex<Option<String>>,
}

#[async_trait]
impl ContentService for FakeContent {
    async fn extract_body(&self, url: &str) -> Result<ExtractBodyResponse> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_extract.load(Ordering::SeqCst) {
            bail!("worker /extract-body: status 502 body=bad gateway");
        }
        let title = if self.omit_title.load(Ordering::SeqCst) {
            None
        } else {
            Some("Extracted title".to_string())
        };
        Ok(ExtractBodyResponse {
            title,
            content: format!("Body of {}", url),
            published_at: Some("2026-10-01T08:00:00Z".to_string()),
            image_url: None,
        })
    }

    async fn extract_facts(
        &self,
        title: Option<&str>,
        _content: &str,
        _credentials: &Credentials,
        _model: Option<&str>,
    ) -> Result<FactsResponse> {
        self.facts_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_facts_title.lock().unwrap() = title.map(str::to_string);
        Ok(FactsResponse {
            facts: vec!["first fact".to_string(), "second fact".to_string()],
            llm: llm(100),
        })
    }

    async fn summarize(
        &self,
        _title: Option<&str>,
        _facts: &[String],
        _source_text_chars: usize,
        _credentials: &Credentials,
        _model: Option<&str>,
    ) -> Result<SummarizeResponse> {
        Ok(SummarizeResponse {
            summary: "A short summary.".to_string(),
            topics: vec!["AI".to_string()],
            score: 0.7,
            llm: llm(200),
            ..SummarizeResponse::default()
        })
    }

    async fn compose_cluster_draft(
        &self,
        request: &ClusterDraftRequest<'_>,
        _credentials: &Credentials,
    ) -> Result<ClusterDraftResponse> {
        let n = self.draft_calls.fetch_add(1, Ordering::SeqCst) as i64;
        Ok(ClusterDraftResponse {
            draft_summary: format!("revised: {}", request.cluster_label),
            llm: llm(300 + n),
        })
    }

    async fn compose_digest(
        &self,
        digest_date: &str,
        items: &[ComposeDigestItem],
        _credentials: &Credentials,
        _model: Option<&str>,
    ) -> Result<ComposeDigestResponse> {
        self.digest_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ComposeDigestResponse {
            subject: format!("Digest {}", digest_date),
            body: format!("{} topics today", items.len()),
            llm: llm(400),
        })
    }
}

#[derive(Default)]
pub(crate) struct FakeEmbedder {
    pub fail: AtomicBool,
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, _api_key: &str, model: &str, input: &str) -> Result<EmbeddingResult> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("openai embeddings: status 500");
        }
        Ok(EmbeddingResult {
            model: model.to_string(),
            embedding: vec![3.0, 4.0, 0.0],
            usage: embedding_usage(model, input.len() as i64 / 4),
        })
    }
}

pub(crate) struct FakeMailer {
    pub enabled: AtomicBool,
    pub fail: AtomicBool,
    pub sent: Mutex<Vec<(String, String)>>,
    pub alerts: Mutex<Vec<(String, BudgetAlert)>>,
}

impl Default for FakeMailer {
    fn default() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            fail: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            alerts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Mailer for FakeMailer {
    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    async fn send_digest(
        &self,
        to: &str,
        digest: &DigestDetail,
        _copy: Option<(&str, &str)>,
    ) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("resend: status 500");
        }
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), digest.digest.id.clone()));
        Ok(())
    }

    async fn send_budget_alert(&self, to: &str, _month_label: &str, alert: &BudgetAlert) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("resend: status 500");
        }
        self.alerts
            .lock()
            .unwrap()
            .push((to.to_string(), alert.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    pub events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn names(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, event: Event) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

pub(crate) struct Harness {
    pub pipeline: Pipeline,
    pub db: Database,
    pub content: Arc<FakeContent>,
    pub embedder: Arc<FakeEmbedder>,
    pub mailer: Arc<FakeMailer>,
    pub sink: Arc<RecordingSink>,
    pub user_id: String,
    pub source_id: String,
}

impl Harness {
    /// Stores encrypted provider keys for the seeded user.
    pub async fn configure_keys(&self, anthropic: bool, openai: bool) {
        let encrypt = |enabled: bool, key: &str| {
            enabled.then(|| self.pipeline.cipher.encrypt(key).unwrap())
        };
        let settings = UserSettings {
            user_id: self.user_id.clone(),
            anthropic_api_key_enc: encrypt(anthropic, "test-anthropic-key"),
            openai_api_key_enc: encrypt(openai, "test-openai-key"),
            digest_email_enabled: true,
            budget_alert_threshold_pct: 20,
            ..UserSettings::default()
        };
        self.db.upsert_user_settings(&settings).await.unwrap();
    }
}

pub(crate) async fn harness() -> Harness {
    let db = Database::in_memory().await.unwrap();
    let (user_id, source_id) = seed_user_source(&db).await;
    let content = Arc::new(FakeContent::default());
    let embedder = Arc::new(FakeEmbedder::default());
    let mailer = Arc::new(FakeMailer::default());
    let sink = Arc::new(RecordingSink::default());
    let pipeline = Pipeline {
        db: db.clone(),
        content: content.clone(),
        embedder: embedder.clone(),
        mailer: mailer.clone(),
        events: sink.clone(),
        cipher: SecretCipher::from_passphrase(Some("test-passphrase")),
        steps: StepRunner::once(),
        default_embedding_model: "text-embedding-3-small".to_string(),
        draft_target: 20,
    };
    Harness {
        pipeline,
        db,
        content,
        embedder,
        mailer,
        sink,
        user_id,
        source_id,
    }
}

/// Inserts a `new` feed item and returns the event announcing it.
pub(crate) async fn item_event(h: &Harness, url: &str, title: Option<&str>) -> ItemCreated {
    let item_id = h
        .db
        .insert_feed_item(&h.source_id, url, title, None)
        .await
        .unwrap()
        .unwrap();
    ItemCreated {
        item_id,
        source_id: h.source_id.clone(),
        url: url.to_string(),
        title: title.map(str::to_string),
    }
}

/// Inserts an item that already went through facts and summary.
pub(crate) async fn summarized_item(h: &Harness, url: &str, topics: &[&str], score: f64) -> String {
    let item_id = h
        .db
        .insert_feed_item(&h.source_id, url, Some("Seeded title"), None)
        .await
        .unwrap()
        .unwrap();
    h.db
        .insert_facts(&item_id, &["seeded fact".to_string()])
        .await
        .unwrap();
    let summary = SummarizeResponse {
        summary: format!("Summary of {}", url),
        topics: topics.iter().map(|t| t.to_string()).collect(),
        score,
        ..SummarizeResponse::default()
    };
    h.db.insert_summary(&item_id, &summary).await.unwrap();
    item_id
}
