use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of an item as it moves through the enrichment pipeline.
///
/// `Failed` can be reached from any in-progress state. A retry re-enters at `New`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    New,
    Fetched,
    FactsExtracted,
    Summarized,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::New => "new",
            ItemStatus::Fetched => "fetched",
            ItemStatus::FactsExtracted => "facts_extracted",
            ItemStatus::Summarized => "summarized",
            ItemStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(ItemStatus::New),
            "fetched" => Ok(ItemStatus::Fetched),
            "facts_extracted" => Ok(ItemStatus::FactsExtracted),
            "summarized" => Ok(ItemStatus::Summarized),
            "failed" => Ok(ItemStatus::Failed),
            other => Err(anyhow::anyhow!("unknown item status: {}", other)),
        }
    }
}

/// Delivery state of a digest. Stored as a plain string column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Processing,
    ComposeFailed,
    SkippedNoItems,
    SkippedUserDisabled,
    SkippedResendDisabled,
    Sent,
    SendEmailFailed,
    FetchFailed,
    EnqueueSendFailed,
    UserSettingsFailed,
}

impl SendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendStatus::Processing => "processing",
            SendStatus::ComposeFailed => "compose_failed",
            SendStatus::SkippedNoItems => "skipped_no_items",
            SendStatus::SkippedUserDisabled => "skipped_user_disabled",
            SendStatus::SkippedResendDisabled => "skipped_resend_disabled",
            SendStatus::Sent => "sent",
            SendStatus::SendEmailFailed => "send_email_failed",
            SendStatus::FetchFailed => "fetch_failed",
            SendStatus::EnqueueSendFailed => "enqueue_send_failed",
            SendStatus::UserSettingsFailed => "user_settings_failed",
        }
    }
}

impl fmt::Display for SendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SendStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(SendStatus::Processing),
            "compose_failed" => Ok(SendStatus::ComposeFailed),
            "skipped_no_items" => Ok(SendStatus::SkippedNoItems),
            "skipped_user_disabled" => Ok(SendStatus::SkippedUserDisabled),
            "skipped_resend_disabled" => Ok(SendStatus::SkippedResendDisabled),
            "sent" => Ok(SendStatus::Sent),
            "send_email_failed" => Ok(SendStatus::SendEmailFailed),
            "fetch_failed" => Ok(SendStatus::FetchFailed),
            "enqueue_send_failed" => Ok(SendStatus::EnqueueSendFailed),
            "user_settings_failed" => Ok(SendStatus::UserSettingsFailed),
            other => Err(anyhow::anyhow!("unknown send status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub user_id: String,
    pub url: String,
    pub title: Option<String>,
    pub enabled: bool,
    pub last_fetched_at: Option<String>,
    pub last_error: Option<String>,
}

/// An item as seen by the similarity and ranking surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub source_id: String,
    pub url: String,
    pub title: Option<String>,
    pub thumbnail_url: Option<String>,
    pub status: ItemStatus,
    pub summary_score: Option<f64>,
    pub summary_topics: Vec<String>,
    pub is_read: bool,
    pub is_favorite: bool,
    pub processing_error: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemSummary {
    pub summary: String,
    pub topics: Vec<String>,
    pub score: Option<f64>,
    pub translated_title: Option<String>,
}

/// Enriched item as consumed by the digest draft builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestItemDetail {
    pub rank: i64,
    pub item: Item,
    pub summary: ItemSummary,
    pub facts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemEmbedding {
    pub item_id: String,
    pub model: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DigestClusterDraft {
    pub cluster_key: String,
    pub cluster_label: String,
    pub rank: i64,
    pub item_count: i64,
    pub topics: Vec<String>,
    pub max_score: Option<f64>,
    pub draft_summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Digest {
    pub id: String,
    pub user_id: String,
    pub digest_date: String,
    pub email_subject: Option<String>,
    pub email_body: Option<String>,
    pub send_status: Option<SendStatus>,
    pub send_error: Option<String>,
    pub send_tried_at: Option<String>,
    pub sent_at: Option<String>,
}

impl Digest {
    /// Stored email copy, present only once both subject and body were written.
    pub fn email_copy(&self) -> Option<(&str, &str)> {
        match (self.email_subject.as_deref(), self.email_body.as_deref()) {
            (Some(subject), Some(body)) => Some((subject, body)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestDetail {
    pub digest: Digest,
    pub items: Vec<DigestItemDetail>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserSettings {
    pub user_id: String,
    pub anthropic_api_key_enc: Option<String>,
    pub google_api_key_enc: Option<String>,
    pub openai_api_key_enc: Option<String>,
    pub monthly_budget_usd: Option<f64>,
    pub budget_alert_enabled: bool,
    pub budget_alert_threshold_pct: i64,
    pub digest_email_enabled: bool,
    pub facts_model: Option<String>,
    pub summary_model: Option<String>,
    pub digest_cluster_model: Option<String>,
    pub digest_model: Option<String>,
    pub embedding_model: Option<String>,
}

/// A semantically similar item proposed for a target item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedItem {
    pub id: String,
    pub source_id: String,
    pub url: String,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub topics: Vec<String>,
    pub summary_score: Option<f64>,
    pub similarity: f64,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    pub reason: Option<String>,
    pub reason_topics: Vec<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Token accounting returned by every billable external call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmUsage {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub pricing_model_family: Option<String>,
    #[serde(default)]
    pub pricing_source: Option<String>,
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub cache_creation_input_tokens: i64,
    #[serde(default)]
    pub cache_read_input_tokens: i64,
    #[serde(default)]
    pub estimated_cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmUsageRecord {
    pub idempotency_key: String,
    pub user_id: Option<String>,
    pub source_id: Option<String>,
    pub item_id: Option<String>,
    pub digest_id: Option<String>,
    pub purpose: String,
    pub usage: LlmUsage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetAlertTarget {
    pub user_id: String,
    pub email: String,
    pub monthly_budget_usd: f64,
    pub budget_alert_threshold_pct: i64,
}

/// Everything the embed stage needs about a summarized item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingCandidate {
    pub item_id: String,
    pub source_id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub summary: String,
    pub topics: Vec<String>,
    pub facts: Vec<String>,
}

/// A failed item that can be sent through the pipeline again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryTarget {
    pub item_id: String,
    pub source_id: String,
    pub user_id: String,
    pub url: String,
    pub title: Option<String>,
}
