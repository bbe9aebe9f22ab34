use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::digest_drafts::DEFAULT_DRAFT_TARGET;

/// Retrieves an environment variable and splits it into a vector of strings based on a delimiter.
///
/// Empty segments are dropped.
///
/// # Arguments
/// - `var`: The name of the environment variable.
/// - `delimiter`: The character to split the environment variable's value by.
///
/// # Returns
/// - `Vec<String>`
pub fn get_env_var_as_vec(var: &str, delimiter: char) -> Vec<String> {
    env::var(var)
        .unwrap_or_default()
        .split(delimiter)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Reads and parses an environment variable, falling back to `default` when
/// it is unset, blank or unparsable.
pub fn get_env_var_or<T: FromStr>(var: &str, default: T) -> T {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Non-empty trimmed value of an environment variable.
pub fn get_env_var_opt(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub worker_url: String,
    pub worker_timeout: Duration,
    pub worker_compose_digest_timeout: Duration,
    pub internal_worker_secret: Option<String>,
    pub openai_api_base_url: String,
    pub openai_embedding_model: String,
    pub user_secret_encryption_key: Option<String>,
    pub resend_api_key: Option<String>,
    pub resend_from_email: Option<String>,
    pub resend_from_name: String,
    pub digest_draft_target: usize,
    /// Restricts digest generation to these users when non-empty.
    pub digest_user_ids: Vec<String>,
    pub step_max_attempts: u32,
    pub event_poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "sifto.db".to_string(),
            worker_url: "http://localhost:8000".to_string(),
            worker_timeout: Duration::from_secs(60),
            worker_compose_digest_timeout: Duration::from_secs(180),
            internal_worker_secret: None,
            openai_api_base_url: "https://api.openai.com".to_string(),
            openai_embedding_model: "text-embedding-3-small".to_string(),
            user_secret_encryption_key: None,
            resend_api_key: None,
            resend_from_email: None,
            resend_from_name: "Sifto".to_string(),
            digest_draft_target: DEFAULT_DRAFT_TARGET,
            digest_user_ids: Vec::new(),
            step_max_attempts: 3,
            event_poll_interval: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Self {
            database_path: get_env_var_or("DATABASE_PATH", defaults.database_path),
            worker_url: get_env_var_or("WORKER_URL", defaults.worker_url)
                .trim_end_matches('/')
                .to_string(),
            worker_timeout: Duration::from_secs(get_env_var_or("WORKER_TIMEOUT_SECS", 60)),
            worker_compose_digest_timeout: Duration::from_secs(get_env_var_or(
                "WORKER_COMPOSE_DIGEST_TIMEOUT_SECS",
                180,
            )),
            internal_worker_secret: get_env_var_opt("INTERNAL_WORKER_SECRET"),
            openai_api_base_url: get_env_var_or("OPENAI_API_BASE_URL", defaults.openai_api_base_url)
                .trim_end_matches('/')
                .to_string(),
            openai_embedding_model: get_env_var_or(
                "OPENAI_EMBEDDING_MODEL",
                defaults.openai_embedding_model,
            ),
            user_secret_encryption_key: get_env_var_opt("USER_SECRET_ENCRYPTION_KEY"),
            resend_api_key: get_env_var_opt("RESEND_API_KEY"),
            resend_from_email: get_env_var_opt("RESEND_FROM_EMAIL"),
            resend_from_name: get_env_var_or("RESEND_FROM_NAME", defaults.resend_from_name),
            digest_draft_target: get_env_var_or("DIGEST_DRAFT_TARGET", DEFAULT_DRAFT_TARGET),
            digest_user_ids: get_env_var_as_vec("DIGEST_USER_IDS", ','),
            step_max_attempts: get_env_var_or("STEP_MAX_ATTEMPTS", 3u32).max(1),
            event_poll_interval: Duration::from_secs(get_env_var_or("EVENT_POLL_SECS", 10)),
        }
    }

    /// Email sending needs both an API key and a sender address.
    pub fn email_enabled(&self) -> bool {
        self.resend_api_key.is_some() && self.resend_from_email.is_some()
    }
}
