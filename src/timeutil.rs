//! Calendar helpers pinned to Japan Standard Time (UTC+9, no DST).
//!
//! Digest dates and budget months are JST calendar units while everything
//! stored in the database is UTC.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};

const JST_OFFSET_HOURS: i64 = 9;

/// JST calendar date of an instant.
pub fn jst_date(at: DateTime<Utc>) -> NaiveDate {
    (at + Duration::hours(JST_OFFSET_HOURS)).date_naive()
}

/// UTC instant of JST midnight on `date`.
pub fn jst_midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)) - Duration::hours(JST_OFFSET_HOURS)
}

/// Start of the JST day containing `at`.
pub fn start_of_day_jst(at: DateTime<Utc>) -> DateTime<Utc> {
    jst_midnight(jst_date(at))
}

/// Window of items that belong in the digest for the JST day containing `at`:
/// the whole previous JST day.
pub fn digest_window(at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let today = start_of_day_jst(at);
    (today - Duration::days(1), today)
}

/// A JST calendar month as a half-open UTC range plus its `YYYY-MM` label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JstMonth {
    pub label: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

pub fn jst_month(at: DateTime<Utc>) -> JstMonth {
    let date = jst_date(at);
    let first = date - Duration::days(date.day0() as i64);
    let probe = first + Duration::days(32);
    let next_first = probe - Duration::days(probe.day0() as i64);
    JstMonth {
        label: format!("{:04}-{:02}", first.year(), first.month()),
        start: jst_midnight(first),
        end: jst_midnight(next_first),
    }
}
