use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::body_snippet;
use crate::digest_drafts::ComposeDigestItem;
use crate::environment::Config;
use crate::models::LlmUsage;
use crate::TARGET_LLM_REQUEST;

const HEADER_WORKER_SECRET: &str = "X-Internal-Worker-Secret";
const HEADER_ANTHROPIC_KEY: &str = "X-Anthropic-Api-Key";
const HEADER_GOOGLE_KEY: &str = "X-Google-Api-Key";
const ERROR_BODY_LIMIT: usize = 4096;

/// Decrypted provider keys forwarded to the worker for one call.
#[derive(Clone, Default, PartialEq)]
pub struct Credentials {
    pub anthropic_api_key: Option<String>,
    pub google_api_key: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("anthropic_api_key", &self.anthropic_api_key.as_ref().map(|_| "<redacted>"))
            .field("google_api_key", &self.google_api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractBodyResponse {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FactsResponse {
    #[serde(default)]
    pub facts: Vec<String>,
    #[serde(default)]
    pub llm: Option<LlmUsage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SummarizeResponse {
    pub summary: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub translated_title: Option<String>,
    #[serde(default)]
    pub score_breakdown: Option<serde_json::Value>,
    #[serde(default)]
    pub score_reason: Option<String>,
    #[serde(default)]
    pub llm: Option<LlmUsage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterDraftRequest<'a> {
    pub cluster_label: &'a str,
    pub item_count: i64,
    pub topics: &'a [String],
    pub source_lines: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<&'a str>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterDraftResponse {
    #[serde(default)]
    pub draft_summary: String,
    #[serde(default)]
    pub llm: Option<LlmUsage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComposeDigestResponse {
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub llm: Option<LlmUsage>,
}

/// Text services backed by LLMs: extraction, facts, summaries and digest copy.
#[async_trait]
pub trait ContentService: Send + Sync {
    async fn extract_body(&self, url: &str) -> Result<ExtractBodyResponse>;

    async fn extract_facts(
        &self,
        title: Option<&str>,
        content: &str,
        credentials: &Credentials,
        model: Option<&str>,
    ) -> Result<FactsResponse>;

    async fn summarize(
        &self,
        title: Option<&str>,
        facts: &[String],
        source_text_chars: usize,
        credentials: &Credentials,
        model: Option<&str>,
    ) -> Result<SummarizeResponse>;

    async fn compose_cluster_draft(
        &self,
        request: &ClusterDraftRequest<'_>,
        credentials: &Credentials,
    ) -> Result<ClusterDraftResponse>;

    async fn compose_digest(
        &self,
        digest_date: &str,
        items: &[ComposeDigestItem],
        credentials: &Credentials,
        model: Option<&str>,
    ) -> Result<ComposeDigestResponse>;
}

#[derive(Serialize)]
struct ExtractBodyRequest<'a> {
    url: &'a str,
}

#[derive(Serialize)]
struct ExtractFactsRequest<'a> {
    title: Option<&'a str>,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Serialize)]
struct SummarizeRequest<'a> {
    title: Option<&'a str>,
    facts: &'a [String],
    source_text_chars: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Serialize)]
struct ComposeDigestRequest<'a> {
    digest_date: &'a str,
    items: &'a [ComposeDigestItem],
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

/// HTTP client for the internal LLM worker service.
#[derive(Clone)]
pub struct WorkerClient {
    client: reqwest::Client,
    base_url: String,
    internal_secret: Option<String>,
    compose_digest_timeout: Duration,
}

impl WorkerClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.worker_timeout)
            .gzip(true)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            client,
            base_url: config.worker_url.trim_end_matches('/').to_string(),
            internal_secret: config.internal_worker_secret.clone(),
            compose_digest_timeout: config.worker_compose_digest_timeout,
        })
    }

    async fn post<B, R>(
        &self,
        path: &str,
        body: &B,
        credentials: Option<&Credentials>,
        timeout: Option<Duration>,
    ) -> Result<R>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .json(body);
        if let Some(secret) = self.internal_secret.as_deref().filter(|s| !s.is_empty()) {
            request = request.header(HEADER_WORKER_SECRET, secret);
        }
        if let Some(credentials) = credentials {
            if let Some(key) = credentials.anthropic_api_key.as_deref().filter(|k| !k.is_empty()) {
                request = request.header(HEADER_ANTHROPIC_KEY, key);
            }
            if let Some(key) = credentials.google_api_key.as_deref().filter(|k| !k.is_empty()) {
                request = request.header(HEADER_GOOGLE_KEY, key);
            }
        }
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        debug!(target: TARGET_LLM_REQUEST, "POST {}", url);
        let response = request
            .send()
            .await
            .with_context(|| format!("worker {}: request failed", path))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .with_context(|| format!("worker {}: failed to read body", path))?;
        if status.as_u16() >= 400 {
            warn!(target: TARGET_LLM_REQUEST, "worker {} returned {}", path, status.as_u16());
            anyhow::bail!(
                "worker {}: status {} body={}",
                path,
                status.as_u16(),
                body_snippet(&text, ERROR_BODY_LIMIT)
            );
        }
        serde_json::from_str(&text).with_context(|| format!("worker {}: invalid response", path))
    }
}

#[async_trait]
impl ContentService for WorkerClient {
    #[instrument(target = "llm_request", level = "info", skip(self))]
    async fn extract_body(&self, url: &str) -> Result<ExtractBodyResponse> {
        self.post("/extract-body", &ExtractBodyRequest { url }, None, None)
            .await
    }

    #[instrument(target = "llm_request", level = "info", skip(self, content, credentials))]
    async fn extract_facts(
        &self,
        title: Option<&str>,
        content: &str,
        credentials: &Credentials,
        model: Option<&str>,
    ) -> Result<FactsResponse> {
        let body = ExtractFactsRequest {
            title,
            content,
            model,
        };
        self.post("/extract-facts", &body, Some(credentials), None)
            .await
    }

    #[instrument(target = "llm_request", level = "info", skip(self, facts, credentials))]
    async fn summarize(
        &self,
        title: Option<&str>,
        facts: &[String],
        source_text_chars: usize,
        credentials: &Credentials,
        model: Option<&str>,
    ) -> Result<SummarizeResponse> {
        let body = SummarizeRequest {
            title,
            facts,
            source_text_chars,
            model,
        };
        self.post("/summarize", &body, Some(credentials), None).await
    }

    #[instrument(target = "llm_request", level = "info", skip_all, fields(label = request.cluster_label))]
    async fn compose_cluster_draft(
        &self,
        request: &ClusterDraftRequest<'_>,
        credentials: &Credentials,
    ) -> Result<ClusterDraftResponse> {
        self.post(
            "/compose-digest-cluster-draft",
            request,
            Some(credentials),
            None,
        )
        .await
    }

    #[instrument(target = "llm_request", level = "info", skip(self, items, credentials), fields(items = items.len()))]
    async fn compose_digest(
        &self,
        digest_date: &str,
        items: &[ComposeDigestItem],
        credentials: &Credentials,
        model: Option<&str>,
    ) -> Result<ComposeDigestResponse> {
        let body = ComposeDigestRequest {
            digest_date,
            items,
            model,
        };
        self.post(
            "/compose-digest",
            &body,
            Some(credentials),
            Some(self.compose_digest_timeout),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_hides_keys() {
        let credentials = Credentials {
            anthropic_api_key: Some("sk-ant-secret".to_string()),
            google_api_key: None,
        };
        let printed = format!("{:?}", credentials);
        assert!(!printed.contains("sk-ant-secret"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_summarize_response_tolerates_missing_fields() {
        let parsed: SummarizeResponse = serde_json::from_str(
            r#"{"summary":"s","topics":["AI"],"score":0.7,
                "llm":{"provider":"anthropic","model":"claude-haiku","input_tokens":10}}"#,
        )
        .unwrap();
        assert_eq!(parsed.topics, vec!["AI".to_string()]);
        assert!(parsed.translated_title.is_none());
        let llm = parsed.llm.unwrap();
        assert_eq!(llm.input_tokens, 10);
        assert_eq!(llm.output_tokens, 0);
    }

    #[test]
    fn test_compose_request_shape() {
        let topics = vec!["AI".to_string()];
        let lines = vec!["- a".to_string()];
        let request = ClusterDraftRequest {
            cluster_label: "AI",
            item_count: 2,
            topics: &topics,
            source_lines: &lines,
            model: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["item_count"], 2);
        assert!(value.get("model").is_none());
    }
}
