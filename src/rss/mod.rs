//! Feed polling: fetches each enabled source, parses RSS, Atom or JSON Feed,
//! and stores unseen entries as items.

mod fetcher;
mod parser;

pub use self::fetcher::{create_http_client, fetch_all_sources, fetch_feed, ingest_entries, FetchSummary};
pub use self::parser::{cleanup_xml, parse_date, parse_feed, FeedEntry};
