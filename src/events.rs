//! Named follow-on events that advance the pipeline asynchronously.
//!
//! Events are delivered at least once. Handlers must tolerate replays.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::Database;
use crate::TARGET_PIPELINE;

pub const ITEM_CREATED: &str = "item/created";
pub const ITEM_EMBED: &str = "item/embed";
pub const DIGEST_CREATED: &str = "digest/created";
pub const DIGEST_COPY_COMPOSED: &str = "digest/copy-composed";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemCreated {
    pub item_id: String,
    pub source_id: String,
    pub url: String,
    /// Feed-provided title, used when extraction finds none.
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemEmbed {
    pub item_id: String,
}

/// Payload shared by both digest events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestRef {
    pub digest_id: String,
    pub user_id: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ItemCreated(ItemCreated),
    ItemEmbed(ItemEmbed),
    DigestCreated(DigestRef),
    DigestCopyComposed(DigestRef),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::ItemCreated(_) => ITEM_CREATED,
            Event::ItemEmbed(_) => ITEM_EMBED,
            Event::DigestCreated(_) => DIGEST_CREATED,
            Event::DigestCopyComposed(_) => DIGEST_COPY_COMPOSED,
        }
    }

    pub fn payload(&self) -> Result<serde_json::Value> {
        let value = match self {
            Event::ItemCreated(data) => serde_json::to_value(data)?,
            Event::ItemEmbed(data) => serde_json::to_value(data)?,
            Event::DigestCreated(data) | Event::DigestCopyComposed(data) => {
                serde_json::to_value(data)?
            }
        };
        Ok(value)
    }

    pub fn from_parts(name: &str, payload: serde_json::Value) -> Result<Self> {
        let event = match name {
            ITEM_CREATED => Event::ItemCreated(serde_json::from_value(payload)?),
            ITEM_EMBED => Event::ItemEmbed(serde_json::from_value(payload)?),
            DIGEST_CREATED => Event::DigestCreated(serde_json::from_value(payload)?),
            DIGEST_COPY_COMPOSED => Event::DigestCopyComposed(serde_json::from_value(payload)?),
            other => anyhow::bail!("unknown event: {}", other),
        };
        Ok(event)
    }
}

/// Where pipeline stages publish follow-on events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: Event) -> Result<()>;
}

#[async_trait]
impl EventSink for Database {
    async fn emit(&self, event: Event) -> Result<()> {
        let payload = event.payload()?;
        let id = self.enqueue_event(event.name(), &payload).await?;
        debug!(target: TARGET_PIPELINE, "Emitted {} as queue entry {}", event.name(), id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_parts_round_trip() {
        let event = Event::ItemCreated(ItemCreated {
            item_id: "i1".to_string(),
            source_id: "s1".to_string(),
            url: "https://example.com/a".to_string(),
            title: None,
        });
        let payload = event.payload().unwrap();
        assert_eq!(payload["item_id"], "i1");
        assert_eq!(Event::from_parts(event.name(), payload).unwrap(), event);
    }

    #[test]
    fn test_unknown_event_rejected() {
        let err = Event::from_parts("digest/deleted", serde_json::json!({})).unwrap_err();
        assert!(err.to_string().contains("unknown event"));
        assert!(Event::from_parts(ITEM_EMBED, serde_json::json!({"id": 1})).is_err());
    }

    #[tokio::test]
    async fn test_database_sink_enqueues() {
        let db = Database::in_memory().await.unwrap();
        db.emit(Event::ItemEmbed(ItemEmbed {
            item_id: "i1".to_string(),
        }))
        .await
        .unwrap();
        let queued = db
            .claim_next_event(chrono::Duration::minutes(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queued.name, ITEM_EMBED);
        assert_eq!(queued.payload["item_id"], "i1");
    }
}
