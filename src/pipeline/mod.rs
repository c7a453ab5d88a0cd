//! Message transform pipeline.
//!
//! Every inbound message flows through:
//! 1. `RuleSet::first_match()`: drop on a filter rule match
//! 2. Link unmasking + rewrite rules: neutralise hidden links, strip promotions
//! 3. Media substitution: swap captioned images for the replacement asset
//!
//! `transform()` is pure; it never touches the platform.

pub mod filter;
pub mod rules;
pub mod types;

pub use filter::{SubstitutionPolicy, TextEdit, transform};
pub use rules::{FilterRule, LinkPolicy, MatchMode, RewriteRule, RuleSet};
pub use types::{
    Delivery, DropReason, EntityKind, InboundMessage, Media, MediaKind, MessageEntity, MessageId,
    OutboundMedia, ReplacementAsset, TransformResult,
};
