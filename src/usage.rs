//! Usage ledger helpers: idempotency keys for billable calls, monthly budget
//! evaluation and static embedding pricing.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::models::{BudgetAlertTarget, LlmUsage, LlmUsageRecord};

pub const PURPOSE_FACTS: &str = "facts";
pub const PURPOSE_SUMMARY: &str = "summary";
pub const PURPOSE_EMBEDDING: &str = "embedding";
pub const PURPOSE_DIGEST: &str = "digest";
pub const PURPOSE_DIGEST_CLUSTER_DRAFT: &str = "digest_cluster_draft";

const UNKNOWN_PRICING_SOURCE: &str = "unknown";

/// Who a billable call is charged to. Any id may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageAttribution {
    pub user_id: Option<String>,
    pub source_id: Option<String>,
    pub item_id: Option<String>,
    pub digest_id: Option<String>,
}

impl UsageAttribution {
    pub fn for_item(user_id: &str, source_id: &str, item_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            source_id: Some(source_id.to_string()),
            item_id: Some(item_id.to_string()),
            digest_id: None,
        }
    }

    pub fn for_digest(user_id: &str, digest_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            digest_id: Some(digest_id.to_string()),
            ..Self::default()
        }
    }
}

/// Hex SHA-256 over every field that identifies one logical call.
///
/// Absent ids hash as empty strings, so retries of the same call collapse
/// into one ledger row.
pub fn idempotency_key(attribution: &UsageAttribution, usage: &LlmUsage, purpose: &str) -> String {
    let id = |v: &Option<String>| v.clone().unwrap_or_default();
    let material = format!(
        "purpose={}|provider={}|model={}|u={}|s={}|i={}|d={}|in={}|out={}|cw={}|cr={}",
        purpose,
        usage.provider,
        usage.model,
        id(&attribution.user_id),
        id(&attribution.source_id),
        id(&attribution.item_id),
        id(&attribution.digest_id),
        usage.input_tokens,
        usage.output_tokens,
        usage.cache_creation_input_tokens,
        usage.cache_read_input_tokens,
    );
    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Builds the ledger row for a call, or `None` when the usage cannot be
/// attributed to a provider and model.
pub fn usage_record(
    purpose: &str,
    attribution: &UsageAttribution,
    usage: &LlmUsage,
) -> Option<LlmUsageRecord> {
    if usage.provider.trim().is_empty() || usage.model.trim().is_empty() {
        return None;
    }
    let mut usage = usage.clone();
    if usage
        .pricing_source
        .as_deref()
        .map_or(true, |s| s.trim().is_empty())
    {
        usage.pricing_source = Some(UNKNOWN_PRICING_SOURCE.to_string());
    }
    Some(LlmUsageRecord {
        idempotency_key: idempotency_key(attribution, &usage, purpose),
        user_id: attribution.user_id.clone(),
        source_id: attribution.source_id.clone(),
        item_id: attribution.item_id.clone(),
        digest_id: attribution.digest_id.clone(),
        purpose: purpose.to_string(),
        usage,
    })
}

/// Result of checking one user's spend against their monthly budget.
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetDecision {
    /// Budget is zero or negative.
    NotConfigured,
    /// Remaining share is still at or above the threshold.
    WithinBudget { remaining_ratio: f64 },
    /// Threshold crossed but this month's alert already went out.
    AlreadyAlerted { remaining_ratio: f64 },
    Alert(BudgetAlert),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetAlert {
    pub monthly_budget_usd: f64,
    pub used_cost_usd: f64,
    pub remaining_budget_usd: f64,
    pub remaining_ratio: f64,
    pub threshold_pct: i64,
}

impl BudgetAlert {
    pub fn remaining_pct(&self) -> f64 {
        self.remaining_ratio * 100.0
    }
}

/// Alerts iff `(budget - used) / budget < threshold_pct / 100` and no alert
/// has been logged for this threshold in the current month.
pub fn evaluate_budget(target: &BudgetAlertTarget, used: f64, already_alerted: bool) -> BudgetDecision {
    let budget = target.monthly_budget_usd;
    if budget <= 0.0 || !budget.is_finite() {
        return BudgetDecision::NotConfigured;
    }
    let remaining = budget - used;
    let remaining_ratio = remaining / budget;
    let threshold = target.budget_alert_threshold_pct as f64 / 100.0;
    if remaining_ratio >= threshold {
        return BudgetDecision::WithinBudget { remaining_ratio };
    }
    if already_alerted {
        return BudgetDecision::AlreadyAlerted { remaining_ratio };
    }
    BudgetDecision::Alert(BudgetAlert {
        monthly_budget_usd: budget,
        used_cost_usd: used,
        remaining_budget_usd: remaining,
        remaining_ratio,
        threshold_pct: target.budget_alert_threshold_pct,
    })
}

pub const EMBEDDING_PROVIDER: &str = "openai";
pub const EMBEDDING_PRICING_SOURCE: &str = "openai_static_embeddings";

/// USD per one million input tokens.
const EMBEDDING_PRICES: &[(&str, f64)] = &[
    ("text-embedding-3-small", 0.02),
    ("text-embedding-3-large", 0.13),
];

pub fn is_supported_embedding_model(model: &str) -> bool {
    EMBEDDING_PRICES.iter().any(|(name, _)| *name == model.trim())
}

/// The user's embedding model when it is one we can price, else the default.
pub fn select_embedding_model(user_model: Option<&str>, default_model: &str) -> String {
    match user_model.map(str::trim) {
        Some(model) if is_supported_embedding_model(model) => model.to_string(),
        _ => default_model.to_string(),
    }
}

/// Usage for an embedding call, priced from the static table.
pub fn embedding_usage(model: &str, input_tokens: i64) -> LlmUsage {
    let per_million = EMBEDDING_PRICES
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, price)| *price)
        .unwrap_or(0.0);
    LlmUsage {
        provider: EMBEDDING_PROVIDER.to_string(),
        model: model.to_string(),
        pricing_model_family: Some(model.to_string()),
        pricing_source: Some(EMBEDDING_PRICING_SOURCE.to_string()),
        input_tokens,
        estimated_cost_usd: input_tokens as f64 / 1_000_000.0 * per_million,
        ..LlmUsage::default()
    }
}
