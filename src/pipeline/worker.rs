use chrono::Duration as ChronoDuration;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::{Pipeline, PipelineError};
use crate::db::QueuedEvent;
use crate::events::Event;
use crate::TARGET_PIPELINE;

/// Claimed events stay hidden from other workers this long.
const EVENT_LEASE_MINUTES: i64 = 15;
/// Deliveries per event before it is dropped.
pub const MAX_EVENT_ATTEMPTS: i64 = 5;
const RELEASE_BASE_SECS: i64 = 30;
const RELEASE_MAX_SECS: i64 = 3600;

/// What happened to one claimed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Done,
    /// Failed with a retryable error and was put back with a delay.
    Released,
    /// Failed for good (bad payload, permanent error or out of attempts).
    Dropped,
}

fn release_delay(attempts: i64) -> ChronoDuration {
    let exp = (attempts - 1).clamp(0, 10) as u32;
    ChronoDuration::seconds((RELEASE_BASE_SECS * 2i64.pow(exp)).min(RELEASE_MAX_SECS))
}

impl Pipeline {
    async fn dispatch(&self, event: &Event) -> Result<(), PipelineError> {
        match event {
            Event::ItemCreated(data) => self.process_item(data).await.map(|_| ()),
            Event::ItemEmbed(data) => self.embed_item(&data.item_id).await.map(|_| ()),
            Event::DigestCreated(data) => self.compose_digest_copy(data).await.map(|_| ()),
            Event::DigestCopyComposed(data) => self.send_digest(data).await.map(|_| ()),
        }
    }

    /// Runs the handler for one claimed event and settles it in the queue.
    pub async fn handle_event(&self, queued: QueuedEvent) -> Result<Disposition, sqlx::Error> {
        let event = match Event::from_parts(&queued.name, queued.payload) {
            Ok(event) => event,
            Err(e) => {
                error!(target: TARGET_PIPELINE, "dropping event {} ({}): {}", queued.id, queued.name, e);
                self.db.ack_event(queued.id).await?;
                return Ok(Disposition::Dropped);
            }
        };

        debug!(target: TARGET_PIPELINE, "handling event {} ({}) attempt {}", queued.id, queued.name, queued.attempts);
        match self.dispatch(&event).await {
            Ok(()) => {
                self.db.ack_event(queued.id).await?;
                Ok(Disposition::Done)
            }
            Err(e) if e.is_retryable() && queued.attempts < MAX_EVENT_ATTEMPTS => {
                let delay = release_delay(queued.attempts);
                warn!(
                    target: TARGET_PIPELINE,
                    "event {} ({}) failed, retrying in {}s ({}/{}): {}",
                    queued.id,
                    queued.name,
                    delay.num_seconds(),
                    queued.attempts,
                    MAX_EVENT_ATTEMPTS,
                    e
                );
                self.db
                    .release_event(queued.id, delay, &e.to_string())
                    .await?;
                Ok(Disposition::Released)
            }
            Err(e) => {
                error!(
                    target: TARGET_PIPELINE,
                    "event {} ({}) failed after {} attempt(s): {}",
                    queued.id,
                    queued.name,
                    queued.attempts,
                    e
                );
                self.db.ack_event(queued.id).await?;
                Ok(Disposition::Dropped)
            }
        }
    }

    /// Handles every event that is available now and returns how many were claimed.
    pub async fn drain_events(&self) -> Result<usize, sqlx::Error> {
        let lease = ChronoDuration::minutes(EVENT_LEASE_MINUTES);
        let mut handled = 0;
        while let Some(queued) = self.db.claim_next_event(lease).await? {
            self.handle_event(queued).await?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Long-running consumer. Sleeps `poll_interval` whenever the queue is empty.
    pub async fn run_event_worker(&self, poll_interval: Duration) {
        info!(target: TARGET_PIPELINE, "event worker started, polling every {:?}", poll_interval);
        loop {
            match self.drain_events().await {
                Ok(0) => sleep(poll_interval).await,
                Ok(n) => debug!(target: TARGET_PIPELINE, "event worker handled {} event(s)", n),
                Err(e) => {
                    error!(target: TARGET_PIPELINE, "event queue error ({:?}), sleeping for 5 seconds.", e);
                    sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }
}
