//! Feed parsing for RSS, Atom and JSON Feed documents.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use feed_rs::parser;
use serde::Deserialize;
use std::io::Cursor;
use tracing::debug;

use crate::TARGET_WEB_REQUEST;

/// One linkable entry of a fetched feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
    pub url: String,
    pub title: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct JsonFeed {
    #[serde(default)]
    items: Vec<JsonFeedItem>,
}

#[derive(Debug, Deserialize)]
struct JsonFeedItem {
    id: Option<String>,
    url: Option<String>,
    title: Option<String>,
    date_published: Option<String>,
}

fn entry(url: Option<String>, title: Option<String>, published_at: Option<DateTime<Utc>>) -> Option<FeedEntry> {
    let url = url?.trim().to_string();
    if url.is_empty() {
        return None;
    }
    let title = title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    Some(FeedEntry {
        url,
        title,
        published_at,
    })
}

fn parse_xml(text: &str) -> Result<Vec<FeedEntry>, feed_rs::parser::ParseFeedError> {
    let feed = parser::parse(Cursor::new(text.as_bytes()))?;
    Ok(feed
        .entries
        .into_iter()
        .filter_map(|e| {
            entry(
                e.links.first().map(|link| link.href.clone()),
                e.title.map(|t| t.content),
                e.published.or(e.updated),
            )
        })
        .collect())
}

/// Parses a feed body into entries that carry a link.
///
/// JSON Feed is chosen by content type. XML that fails to parse is retried
/// once after [`cleanup_xml`].
pub fn parse_feed(text: &str, content_type: Option<&str>) -> Result<Vec<FeedEntry>> {
    if content_type.is_some_and(|ct| ct.contains("json")) {
        let feed: JsonFeed =
            serde_json::from_str(text).map_err(|e| anyhow!("JSON parsing error: {}", e))?;
        return Ok(feed
            .items
            .into_iter()
            .filter_map(|item| {
                let published_at = item.date_published.as_deref().and_then(parse_date);
                entry(item.url.or(item.id), item.title, published_at)
            })
            .collect());
    }

    match parse_xml(text) {
        Ok(entries) => Ok(entries),
        Err(first_err) => {
            let cleaned = cleanup_xml(text);
            if !(cleaned.contains("<rss") || cleaned.contains("<feed") || cleaned.contains("<rdf")) {
                let preview = if text.chars().all(|c| c.is_ascii_graphic() || c.is_whitespace()) {
                    text.chars().take(100).collect::<String>()
                } else {
                    "[binary data]".to_string()
                };
                return Err(anyhow!("Content is not RSS or Atom feed: {}", preview));
            }
            debug!(target: TARGET_WEB_REQUEST, "Retrying feed parse after XML cleanup: {}", first_err);
            parse_xml(&cleaned).map_err(|second_err| {
                anyhow!(
                    "XML parsing error even after cleanup. First error: {}. Second error: {}",
                    first_err,
                    second_err
                )
            })
        }
    }
}

/// Parse a date string in the formats feeds commonly use.
pub fn parse_date(date_str: &str) -> Option<DateTime<Utc>> {
    let date_str = date_str.trim();
    if let Ok(date) = DateTime::parse_from_rfc3339(date_str) {
        return Some(date.with_timezone(&Utc));
    }
    if let Ok(date) = DateTime::parse_from_rfc2822(date_str) {
        return Some(date.with_timezone(&Utc));
    }
    if let Ok(date) = DateTime::parse_from_str(date_str, "%Y-%m-%dT%H:%M:%S%z") {
        return Some(date.with_timezone(&Utc));
    }
    None
}

/// Strips leading junk and fixes HTML entities that XML parsers reject.
pub fn cleanup_xml(xml: &str) -> String {
    let mut cleaned = xml.trim().trim_start_matches('\u{FEFF}').to_string();

    if let Some(start) = cleaned.find("<?xml") {
        cleaned = cleaned[start..].to_string();
    } else if let Some(start) = cleaned.find("<rss") {
        cleaned = cleaned[start..].to_string();
    } else if let Some(start) = cleaned.find("<feed") {
        cleaned = cleaned[start..].to_string();
    }

    cleaned = cleaned
        .replace("&nbsp;", "&#160;")
        .replace("&ndash;", "&#8211;")
        .replace("&mdash;", "&#8212;")
        .replace("&rsquo;", "&#8217;")
        .replace("&lsquo;", "&#8216;")
        .replace("&rdquo;", "&#8221;")
        .replace("&ldquo;", "&#8220;")
        .replace("&amp;amp;", "&amp;")
        .replace("&apos;", "&#39;");

    cleaned = cleaned
        .chars()
        .filter(|&c| {
            matches!(c,
                '\u{0009}' | '\u{000A}' | '\u{000D}' |
                '\u{0020}'..='\u{D7FF}' |
                '\u{E000}'..='\u{FFFD}' |
                '\u{10000}'..='\u{10FFFF}'
            )
        })
        .collect();

    if !cleaned.starts_with("<?xml") {
        cleaned = format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{}", cleaned);
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Example</title>
    <link>https://news.example/</link>
    <description>d</description>
    <item>
      <title> First post </title>
      <link>https://news.example/a</link>
      <pubDate>Tue, 10 Jun 2025 04:00:00 GMT</pubDate>
    </item>
    <item>
      <title>No link</title>
    </item>
    <item>
      <link>https://news.example/b</link>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn test_parse_rss_skips_entries_without_link() {
        let entries = parse_feed(RSS, Some("application/rss+xml")).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].url, "https://news.example/a");
        assert_eq!(entries[0].title.as_deref(), Some("First post"));
        assert!(entries[0].published_at.is_some());
        assert_eq!(entries[1].title, None);
    }

    #[test]
    fn test_parse_json_feed() {
        let body = r#"{"version":"https://jsonfeed.org/version/1.1","items":[
            {"id":"https://j.example/1","title":"One","date_published":"2025-06-01T10:00:00+09:00"},
            {"url":"https://j.example/2"},
            {"title":"nothing"}
        ]}"#;
        let entries = parse_feed(body, Some("application/feed+json")).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].url, "https://j.example/1");
        assert_eq!(
            entries[0].published_at.map(|d| d.to_rfc3339()),
            Some("2025-06-01T01:00:00+00:00".to_string())
        );
    }

    #[test]
    fn test_cleanup_recovers_leading_garbage() {
        let body = format!("\u{FEFF}  junk{}", RSS.trim_start_matches("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        let entries = parse_feed(&body, None).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_non_feed_is_an_error() {
        let err = parse_feed("<html><body>hi</body></html>", Some("text/html")).unwrap_err();
        assert!(err.to_string().starts_with("Content is not RSS or Atom feed"));
    }

    #[test]
    fn test_parse_date_formats() {
        assert!(parse_date("2025-06-01T10:00:00Z").is_some());
        assert!(parse_date("Sun, 01 Jun 2025 10:00:00 +0000").is_some());
        assert!(parse_date("yesterday").is_none());
    }
}
