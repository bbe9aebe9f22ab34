use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::PipelineError;
use crate::TARGET_PIPELINE;

/// Runs a named unit of work, retrying retryable failures with exponential
/// backoff and jitter.
///
/// Steps must be safe to run more than once: each one either writes with an
/// upsert or checks persisted state before acting.
#[derive(Debug, Clone)]
pub struct StepRunner {
    max_attempts: u32,
    base_delay: Duration,
}

impl StepRunner {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Single attempt, no delay. Used by tests and one-shot CLI runs.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exp = self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1).min(6));
        let jitter_ms = (self.base_delay.as_millis() / 2) as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        exp + jitter
    }

    pub async fn run<T, F, Fut>(&self, step: &str, mut f: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let mut attempt = 1;
        loop {
            debug!(target: TARGET_PIPELINE, step, attempt, "step start");
            match f().await {
                Ok(value) => {
                    debug!(target: TARGET_PIPELINE, step, attempt, "step done");
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    warn!(target: TARGET_PIPELINE, step, attempt, "step failed: {}", e);
                    let delay = self.backoff(attempt);
                    info!(
                        target: TARGET_PIPELINE,
                        "Retrying step {} in {:?} ({}/{})",
                        step,
                        delay,
                        attempt + 1,
                        self.max_attempts
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(target: TARGET_PIPELINE, step, attempt, "step failed: {}", e);
                    return Err(e);
                }
            }
        }
    }
}
