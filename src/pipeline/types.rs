//! Shared types for the relay pipeline.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Platform message id, unique within one source channel.
pub type MessageId = i64;

// ── Inbound message ─────────────────────────────────────────────────

/// A message received on the source channel.
///
/// The platform adapter converts its native update format into this struct.
/// `entities` describe spans of the message body, which is `text` for plain
/// messages and the media caption for media messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Platform sequence number, scoped to the source channel.
    pub id: MessageId,
    /// Message text (absent for media messages).
    pub text: Option<String>,
    /// Formatting and link spans over the body, in byte offsets.
    pub entities: Vec<MessageEntity>,
    /// Optional attachment.
    pub media: Option<Media>,
    /// When the platform reported the message.
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Plain text message.
    pub fn text(id: MessageId, text: impl Into<String>) -> Self {
        Self {
            id,
            text: Some(text.into()),
            entities: Vec::new(),
            media: None,
            received_at: Utc::now(),
        }
    }

    /// Media message with an optional caption.
    pub fn media(id: MessageId, media: Media) -> Self {
        Self {
            id,
            text: None,
            entities: Vec::new(),
            media: Some(media),
            received_at: Utc::now(),
        }
    }

    pub fn with_entities(mut self, entities: Vec<MessageEntity>) -> Self {
        self.entities = entities;
        self
    }

    /// The text the filters and link rewriting operate on.
    pub fn body(&self) -> &str {
        self.text
            .as_deref()
            .or_else(|| self.media.as_ref().and_then(|m| m.caption.as_deref()))
            .unwrap_or("")
    }
}

/// A span over the message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEntity {
    /// Byte offset into the body.
    pub offset: usize,
    /// Length in bytes.
    pub length: usize,
    pub kind: EntityKind,
}

impl MessageEntity {
    pub fn new(offset: usize, length: usize, kind: EntityKind) -> Self {
        Self {
            offset,
            length,
            kind,
        }
    }

    pub fn end(&self) -> usize {
        self.offset + self.length
    }
}

/// What an entity marks up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityKind {
    /// Markdown-style hyperlink: display text hides `url`.
    TextLink { url: String },
    /// A visible URL in the text.
    Url,
    /// Pure formatting (bold, italic, code, ...), carried by its platform name.
    Style { name: String },
    /// Anything the platform detects by itself (mentions, hashtags, ...).
    Other { name: String },
}

// ── Media ───────────────────────────────────────────────────────────

/// Attachment descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    pub kind: MediaKind,
    /// Platform reference used to re-send the original attachment.
    pub file_id: String,
    pub caption: Option<String>,
}

impl Media {
    pub fn new(kind: MediaKind, file_id: impl Into<String>) -> Self {
        Self {
            kind,
            file_id: file_id.into(),
            caption: None,
        }
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    /// True when the caption carries any non-whitespace text.
    pub fn has_caption(&self) -> bool {
        self.caption.as_deref().is_some_and(|c| !c.trim().is_empty())
    }
}

const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".webp", ".bmp"];

/// Kind of attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Document {
        mime_type: Option<String>,
        file_name: Option<String>,
    },
    Video,
    Animation,
    Audio,
    Other,
}

impl MediaKind {
    /// Whether the attachment is an image and may be substituted.
    pub fn is_image(&self) -> bool {
        match self {
            Self::Photo => true,
            Self::Document {
                mime_type,
                file_name,
            } => {
                let by_mime = mime_type
                    .as_deref()
                    .is_some_and(|m| m.to_ascii_lowercase().starts_with("image/"));
                let by_name = file_name.as_deref().is_some_and(|name| {
                    let lower = name.to_ascii_lowercase();
                    IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
                });
                by_mime || by_name
            }
            _ => false,
        }
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Document { .. } => "document",
            Self::Video => "video",
            Self::Animation => "animation",
            Self::Audio => "audio",
            Self::Other => "other",
        }
    }
}

/// The fixed image that replaces substituted attachments.
#[derive(Clone, PartialEq, Eq)]
pub struct ReplacementAsset {
    pub file_name: String,
    pub bytes: Arc<Vec<u8>>,
}

impl ReplacementAsset {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes: Arc::new(bytes),
        }
    }
}

impl std::fmt::Debug for ReplacementAsset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplacementAsset")
            .field("file_name", &self.file_name)
            .field("len", &self.bytes.len())
            .finish()
    }
}

// ── Transform result ────────────────────────────────────────────────

/// Media attached to an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMedia {
    None,
    /// Re-send the source attachment unchanged.
    Original { kind: MediaKind, file_id: String },
    /// Upload the configured replacement image.
    Replacement(ReplacementAsset),
}

impl OutboundMedia {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Original { .. } => "original",
            Self::Replacement(_) => "replacement",
        }
    }
}

/// A transformed message ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Id of the source message this delivery was produced from.
    pub source_id: MessageId,
    /// Final body: message text, or caption when `media` is present.
    pub text: String,
    /// Formatting entities remapped onto `text`.
    pub entities: Vec<MessageEntity>,
    pub media: OutboundMedia,
}

/// Why a message was not relayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DropReason {
    /// A configured filter rule matched the body.
    FilteredByRule { rule: String },
    /// Rewrite rules removed all text from a text-only message.
    EmptyAfterRewrite,
    /// Nothing to relay (no text, no media).
    Empty,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FilteredByRule { rule } => write!(f, "filtered by rule {rule:?}"),
            Self::EmptyAfterRewrite => f.write_str("empty after rewrite"),
            Self::Empty => f.write_str("empty message"),
        }
    }
}

/// Outcome of running a message through the filter pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformResult {
    Deliver(Delivery),
    Dropped(DropReason),
}
