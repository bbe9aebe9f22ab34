//! Polls every enabled source and turns new entries into items.

use anyhow::{anyhow, Result};
use reqwest::{cookie::Jar, header};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::parser::{parse_feed, FeedEntry};
use crate::db::Database;
use crate::events::{Event, EventSink, ItemCreated};
use crate::models::Source;
use crate::TARGET_WEB_REQUEST;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = "Mozilla/5.0 (compatible; sifto/0.4; feed reader)";
const ACCEPT: &str = "application/feed+json, application/json, application/rss+xml, application/atom+xml, application/xml, text/xml, */*;q=0.9";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub sources: usize,
    pub failed_sources: usize,
    pub new_items: usize,
}

pub fn create_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .cookie_store(true)
        .cookie_provider(Arc::new(Jar::default()))
        .gzip(true)
        .timeout(REQUEST_TIMEOUT)
        .redirect(reqwest::redirect::Policy::default())
        .build()
        .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))
}

/// Downloads and parses one feed.
pub async fn fetch_feed(client: &reqwest::Client, url: &str) -> Result<Vec<FeedEntry>> {
    debug!(target: TARGET_WEB_REQUEST, "Loading feed from {}", url);
    let response = client
        .get(url)
        .header(header::USER_AGENT, USER_AGENT)
        .header(header::ACCEPT, ACCEPT)
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!("HTTP error: {}", status));
    }
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|ct| ct.to_str().ok())
        .map(|s| s.to_lowercase());
    let body = response.text().await?;
    parse_feed(&body, content_type.as_deref())
}

/// Stores entries as `new` items and announces the ones that were created.
///
/// Entries already known for the source are skipped. Returns the number of
/// new items.
pub async fn ingest_entries(
    db: &Database,
    events: &dyn EventSink,
    source: &Source,
    entries: &[FeedEntry],
) -> usize {
    let mut created = 0;
    for entry in entries {
        let item_id = match db
            .insert_feed_item(&source.id, &entry.url, entry.title.as_deref(), entry.published_at)
            .await
        {
            Ok(Some(id)) => id,
            Ok(None) => continue,
            Err(e) => {
                error!(target: TARGET_WEB_REQUEST, "Failed to upsert item {}: {}", entry.url, e);
                continue;
            }
        };
        created += 1;
        let event = Event::ItemCreated(ItemCreated {
            item_id,
            source_id: source.id.clone(),
            url: entry.url.clone(),
            title: entry.title.clone(),
        });
        if let Err(e) = events.emit(event).await {
            warn!(target: TARGET_WEB_REQUEST, "Failed to send item/created for {}: {}", entry.url, e);
        }
    }
    created
}

/// One polling pass over every enabled source.
///
/// A failing feed records its error on the source and does not stop the pass.
pub async fn fetch_all_sources(db: &Database, events: &dyn EventSink) -> Result<FetchSummary> {
    let client = create_http_client()?;
    let sources = db.list_enabled_sources().await?;
    let mut summary = FetchSummary {
        sources: sources.len(),
        ..FetchSummary::default()
    };

    for source in &sources {
        match fetch_feed(&client, &source.url).await {
            Ok(entries) => {
                let created = ingest_entries(db, events, source, &entries).await;
                summary.new_items += created;
                if created > 0 {
                    info!(target: TARGET_WEB_REQUEST, "Processed feed: {} - {} new items", source.url, created);
                } else {
                    debug!(target: TARGET_WEB_REQUEST, "Processed feed: {} - no new items", source.url);
                }
                if let Err(e) = db.record_source_fetch(&source.id, None).await {
                    warn!(target: TARGET_WEB_REQUEST, "Failed to stamp source {}: {}", source.id, e);
                }
            }
            Err(e) => {
                summary.failed_sources += 1;
                error!(target: TARGET_WEB_REQUEST, "fetch rss {}: {:#}", source.url, e);
                let reason = format!("fetch error: {:#}", e);
                if let Err(e) = db.record_source_fetch(&source.id, Some(&reason)).await {
                    warn!(target: TARGET_WEB_REQUEST, "Failed to stamp source {}: {}", source.id, e);
                }
            }
        }
    }

    info!(
        target: TARGET_WEB_REQUEST,
        "fetch-rss sources={} failed={} new_items={}",
        summary.sources,
        summary.failed_sources,
        summary.new_items
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::seed_user_source;
    use crate::pipeline::test_support::RecordingSink;

    #[tokio::test]
    async fn test_ingest_emits_only_for_new_items() {
        let db = Database::in_memory().await.unwrap();
        let (_, source_id) = seed_user_source(&db).await;
        let source = db.get_source(&source_id).await.unwrap().unwrap();
        let sink = RecordingSink::default();
        let entries = vec![
            FeedEntry {
                url: "https://news.example/a".to_string(),
                title: Some("A".to_string()),
                published_at: None,
            },
            FeedEntry {
                url: "https://news.example/b?utm_source=rss".to_string(),
                title: None,
                published_at: None,
            },
        ];

        assert_eq!(ingest_entries(&db, &sink, &source, &entries).await, 2);
        assert_eq!(ingest_entries(&db, &sink, &source, &entries).await, 0);
        assert_eq!(sink.names(), vec!["item/created".to_string(), "item/created".to_string()]);

        let events = sink.events.lock().unwrap();
        let Event::ItemCreated(first) = &events[0] else {
            panic!("unexpected event {:?}", events[0]);
        };
        assert_eq!(first.title.as_deref(), Some("A"));
        assert_eq!(first.source_id, source_id);
    }
}
