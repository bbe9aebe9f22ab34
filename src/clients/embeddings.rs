use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

use super::body_snippet;
use crate::models::LlmUsage;
use crate::usage::embedding_usage;
use crate::TARGET_LLM_REQUEST;

const EMBEDDING_TIMEOUT: Duration = Duration::from_secs(30);

/// A unit-length embedding plus the usage it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingResult {
    pub model: String,
    pub embedding: Vec<f32>,
    pub usage: LlmUsage,
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, api_key: &str, model: &str, input: &str) -> Result<EmbeddingResult>;
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    data: Vec<EmbeddingData>,
    #[serde(default)]
    usage: Option<EmbeddingUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingUsage {
    #[serde(default)]
    prompt_tokens: i64,
}

/// Embeddings over an OpenAI-compatible `/v1/embeddings` endpoint.
#[derive(Clone)]
pub struct OpenAiEmbeddings {
    client: reqwest::Client,
    endpoint: String,
}

impl OpenAiEmbeddings {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(EMBEDDING_TIMEOUT)
            .build()
            .context("failed to build OpenAI HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/v1/embeddings", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbeddings {
    #[instrument(target = "llm_request", level = "info", skip(self, api_key, input), fields(chars = input.len()))]
    async fn embed(&self, api_key: &str, model: &str, input: &str) -> Result<EmbeddingResult> {
        anyhow::ensure!(!api_key.trim().is_empty(), "openai api key is required");

        let response = self
            .client
            .post(&self.endpoint)
            .header(AUTHORIZATION, format!("Bearer {}", api_key.trim()))
            .header(CONTENT_TYPE, "application/json")
            .json(&EmbeddingRequest { model, input })
            .send()
            .await
            .context("openai embeddings: request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            anyhow::bail!(
                "openai embeddings: status {} body={}",
                status.as_u16(),
                body_snippet(&body, 4096)
            );
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .context("failed to parse OpenAI embedding response")?;
        parse_embedding_response(model, parsed)
    }
}

fn parse_embedding_response(model: &str, parsed: EmbeddingResponse) -> Result<EmbeddingResult> {
    let embedding = parsed
        .data
        .into_iter()
        .next()
        .map(|d| d.embedding)
        .filter(|e| !e.is_empty())
        .ok_or_else(|| anyhow::anyhow!("openai embeddings: empty embedding"))?;
    let input_tokens = parsed.usage.map(|u| u.prompt_tokens).unwrap_or(0);
    debug!(
        target: TARGET_LLM_REQUEST,
        "Embedding received: {} dimensions, {} tokens",
        embedding.len(),
        input_tokens
    );
    Ok(EmbeddingResult {
        model: model.to_string(),
        embedding,
        usage: embedding_usage(model, input_tokens),
    })
}
