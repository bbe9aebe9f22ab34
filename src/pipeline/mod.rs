//! Item and digest pipeline stages.
//!
//! Each public run is one unit of work triggered by an event or a schedule.
//! Runs may be delivered more than once; every stage writes with upserts or
//! checks persisted state first, so replays converge on the same result.

pub mod budget;
pub mod digest;
pub mod embed;
pub mod item;
pub mod steps;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::clients::{ContentService, Credentials, Embedder, Mailer};
use crate::db::Database;
use crate::environment::Config;
use crate::events::EventSink;
use crate::models::{LlmUsage, UserSettings};
use crate::providers::{classify_model, ProviderKind};
use crate::secrets::{SecretCipher, SecretError};
use crate::usage::{usage_record, UsageAttribution};
use crate::TARGET_PIPELINE;

pub use steps::StepRunner;

/// Stored failure text is capped at this many characters.
pub const MAX_ERROR_CHARS: usize = 2000;

/// Cuts `message` to at most [`MAX_ERROR_CHARS`] characters.
pub fn truncate_error(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_CHARS) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Rejected before any I/O.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Missing key or encryption not configured. Retrying will not help.
    #[error("{0}")]
    Credential(String),
    /// An external service failed or returned an error status.
    #[error("{0:#}")]
    Upstream(anyhow::Error),
    #[error("persistence: {0}")]
    Persistence(#[from] sqlx::Error),
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Upstream(_) | PipelineError::Persistence(_))
    }
}

/// Which stored key a stage needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    Anthropic,
    Google,
    OpenAi,
}

impl SecretKind {
    fn label(&self) -> &'static str {
        match self {
            SecretKind::Anthropic => "anthropic",
            SecretKind::Google => "google",
            SecretKind::OpenAi => "openai",
        }
    }

    fn encrypted_value<'a>(&self, settings: &'a UserSettings) -> Option<&'a str> {
        let value = match self {
            SecretKind::Anthropic => settings.anthropic_api_key_enc.as_deref(),
            SecretKind::Google => settings.google_api_key_enc.as_deref(),
            SecretKind::OpenAi => settings.openai_api_key_enc.as_deref(),
        };
        value.filter(|v| !v.trim().is_empty())
    }
}

impl From<ProviderKind> for SecretKind {
    fn from(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::Anthropic => SecretKind::Anthropic,
            ProviderKind::Google => SecretKind::Google,
        }
    }
}

/// Shared collaborators for every pipeline run.
#[derive(Clone)]
pub struct Pipeline {
    pub db: Database,
    pub content: Arc<dyn ContentService>,
    pub embedder: Arc<dyn Embedder>,
    pub mailer: Arc<dyn Mailer>,
    pub events: Arc<dyn EventSink>,
    pub cipher: SecretCipher,
    pub steps: StepRunner,
    pub default_embedding_model: String,
    pub draft_target: usize,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        db: Database,
        content: Arc<dyn ContentService>,
        embedder: Arc<dyn Embedder>,
        mailer: Arc<dyn Mailer>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            db,
            content,
            embedder,
            mailer,
            events,
            cipher: SecretCipher::from_passphrase(config.user_secret_encryption_key.as_deref()),
            steps: StepRunner::new(config.step_max_attempts, Duration::from_secs(2)),
            default_embedding_model: config.openai_embedding_model.clone(),
            draft_target: config.digest_draft_target,
        }
    }

    /// Decrypts one of the user's stored provider keys.
    pub fn decrypt_user_key(
        &self,
        settings: Option<&UserSettings>,
        kind: SecretKind,
    ) -> Result<String, PipelineError> {
        let required = || PipelineError::Credential(format!("user {} api key is required", kind.label()));
        let encrypted = settings.and_then(|s| kind.encrypted_value(s)).ok_or_else(required)?;
        match self.cipher.decrypt(encrypted) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            Ok(_) => Err(required()),
            Err(SecretError::Disabled) => Err(PipelineError::Credential(SecretError::Disabled.to_string())),
            Err(e) => Err(PipelineError::Credential(format!(
                "decrypt user {} key: {}",
                kind.label(),
                e
            ))),
        }
    }

    /// Credentials for an LLM call, routed by the model name.
    pub fn llm_credentials(
        &self,
        settings: Option<&UserSettings>,
        model: Option<&str>,
    ) -> Result<Credentials, PipelineError> {
        let provider = classify_model(model);
        let key = self.decrypt_user_key(settings, provider.into())?;
        Ok(match provider {
            ProviderKind::Anthropic => Credentials {
                anthropic_api_key: Some(key),
                google_api_key: None,
            },
            ProviderKind::Google => Credentials {
                anthropic_api_key: None,
                google_api_key: Some(key),
            },
        })
    }

    /// Appends a usage row. Failures are logged and never fail the caller.
    pub async fn record_usage(
        &self,
        purpose: &str,
        attribution: &UsageAttribution,
        usage: Option<&LlmUsage>,
    ) {
        let Some(record) = usage.and_then(|u| usage_record(purpose, attribution, u)) else {
            return;
        };
        match self.db.insert_usage(&record).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(target: TARGET_PIPELINE, purpose, "usage already recorded");
            }
            Err(e) => {
                warn!(target: TARGET_PIPELINE, purpose, "usage insert failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support;

#[cfg(test)]
mod tests {
    use super::*;
    use super::test_support::harness;

    #[test]
    fn test_truncate_error_on_char_boundary() {
        assert_eq!(truncate_error("short"), "short");
        let long = "é".repeat(2500);
        let cut = truncate_error(&long);
        assert_eq!(cut.chars().count(), MAX_ERROR_CHARS);
    }

    #[test]
    fn test_retryable_taxonomy() {
        assert!(PipelineError::Upstream(anyhow::anyhow!("502")).is_retryable());
        assert!(PipelineError::Persistence(sqlx::Error::RowNotFound).is_retryable());
        assert!(!PipelineError::Credential("x".into()).is_retryable());
        assert!(!PipelineError::InvalidInput("x".into()).is_retryable());
    }

    #[tokio::test]
    async fn test_credential_routing_by_model() {
        let h = harness().await;
        let settings = UserSettings {
            anthropic_api_key_enc: Some(h.pipeline.cipher.encrypt("ant-key").unwrap()),
            google_api_key_enc: None,
            ..UserSettings::default()
        };

        let creds = h.pipeline.llm_credentials(Some(&settings), Some("claude-haiku")).unwrap();
        assert_eq!(creds.anthropic_api_key.as_deref(), Some("ant-key"));

        let err = h
            .pipeline
            .llm_credentials(Some(&settings), Some("gemini-2.5-flash"))
            .unwrap_err();
        assert_eq!(err.to_string(), "user google api key is required");

        let err = h.pipeline.llm_credentials(None, None).unwrap_err();
        assert_eq!(err.to_string(), "user anthropic api key is required");
    }

    #[tokio::test]
    async fn test_disabled_cipher_is_a_credential_error() {
        let mut h = harness().await;
        let settings = UserSettings {
            anthropic_api_key_enc: Some("opaque".to_string()),
            ..UserSettings::default()
        };
        h.pipeline.cipher = SecretCipher::Disabled;
        let err = h.pipeline.llm_credentials(Some(&settings), None).unwrap_err();
        assert_eq!(err.to_string(), "user secret encryption is not configured");
    }
}
