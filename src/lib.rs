pub mod clients;
pub mod db;
pub mod digest_drafts;
pub mod environment;
pub mod events;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod plan;
pub mod providers;
pub mod related;
pub mod rss;
pub mod schedule;
pub mod secrets;
pub mod similarity;
pub mod timeutil;
pub mod usage;

pub const TARGET_WEB_REQUEST: &str = "web_request";
pub const TARGET_LLM_REQUEST: &str = "llm_request";
pub const TARGET_DB: &str = "db_query";
pub const TARGET_PIPELINE: &str = "pipeline";
