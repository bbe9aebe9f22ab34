//! Digest cluster drafts: building one draft per topic cluster, compressing
//! the draft list to a fixed budget, and shaping drafts into composer input.

pub mod builder;
pub mod compose;
pub mod compressor;

pub use builder::{build_cluster_drafts, UNTAGGED_LABEL};
pub use compose::{build_compose_items, draft_source_lines, ComposeDigestItem, COMPOSE_DETAIL_CUTOFF};
pub use compressor::{compress_cluster_drafts, DEFAULT_DRAFT_TARGET};

/// Maximum number of member lines written into a draft body.
pub const MAX_DRAFT_LINES: usize = 4;
