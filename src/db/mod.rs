// Re-export the Database struct and other public items
pub mod core;
mod digests;
mod events;
mod items;
mod schema;
mod sources;
mod usage;
mod users;

#[cfg(test)]
pub(crate) mod test_support;

pub use self::core::{format_ts, now_ts, parse_ts, Database};
pub use digests::DigestCreation;
pub use events::QueuedEvent;
pub use items::normalize_item_url;
