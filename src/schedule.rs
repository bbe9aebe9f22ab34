//! Periodic triggers for the long-running `run` command.

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};

use crate::pipeline::Pipeline;
use crate::rss::fetch_all_sources;
use crate::TARGET_PIPELINE;

pub const FEED_POLL_INTERVAL: Duration = Duration::from_secs(600);
/// 06:00 JST.
pub const DIGEST_HOUR_UTC: u32 = 21;
/// 09:00 JST.
pub const BUDGET_HOUR_UTC: u32 = 0;

/// Next instant strictly after `now` that falls on `hour_utc:00` UTC.
pub fn next_daily_run(now: DateTime<Utc>, hour_utc: u32) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(hour_utc % 24, 0, 0).unwrap_or(NaiveTime::MIN);
    let today = now.date_naive().and_time(time).and_utc();
    if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}

async fn sleep_until(at: DateTime<Utc>) {
    let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    sleep(wait).await;
}

pub async fn feed_loop(pipeline: Pipeline) {
    loop {
        if let Err(e) = fetch_all_sources(&pipeline.db, pipeline.events.as_ref()).await {
            error!(target: TARGET_PIPELINE, "fetch-rss failed: {:#}", e);
        }
        sleep(FEED_POLL_INTERVAL).await;
    }
}

pub async fn digest_loop(pipeline: Pipeline, user_ids: Vec<String>) {
    loop {
        let next = next_daily_run(Utc::now(), DIGEST_HOUR_UTC);
        info!(target: TARGET_PIPELINE, "next digest run at {}", next);
        sleep_until(next).await;
        if let Err(e) = pipeline.generate_digests(Utc::now(), &user_ids).await {
            error!(target: TARGET_PIPELINE, "generate-digest failed: {}", e);
        }
    }
}

pub async fn budget_loop(pipeline: Pipeline) {
    loop {
        let next = next_daily_run(Utc::now(), BUDGET_HOUR_UTC);
        info!(target: TARGET_PIPELINE, "next budget check at {}", next);
        sleep_until(next).await;
        if let Err(e) = pipeline.check_budget_alerts(Utc::now()).await {
            error!(target: TARGET_PIPELINE, "check-budget-alerts failed: {}", e);
        }
    }
}
