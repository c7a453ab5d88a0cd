//! Platform collaborator contract.
//!
//! The relay core never talks to a messaging network directly. It is handed
//! an `Arc<dyn Platform>` that can resolve identifiers, stream inbound
//! messages and send outbound ones.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::{PlatformError, ResolutionError, SendError};
use crate::pipeline::types::{Delivery, InboundMessage, MessageId};

/// Opaque, platform-resolved reference to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle(i64);

impl ChannelHandle {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user-supplied channel identifier, normalised.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelIdentifier {
    /// Numeric chat id, including `-100…` channel ids.
    Numeric(i64),
    /// Public handle without the leading `@`.
    Handle(String),
    /// Private invite link hash (`t.me/+hash`, `t.me/joinchat/hash`).
    Invite(String),
}

const LINK_PREFIXES: &[&str] = &[
    "https://t.me/",
    "http://t.me/",
    "t.me/",
    "https://telegram.me/",
    "http://telegram.me/",
    "telegram.me/",
];

impl ChannelIdentifier {
    /// Parse a raw identifier: numeric id, `@handle`, bare handle or link.
    pub fn parse(raw: &str) -> Result<Self, ResolutionError> {
        let raw = raw.trim();
        let not_found = || ResolutionError::NotFound {
            identifier: raw.to_string(),
        };
        if raw.is_empty() {
            return Err(not_found());
        }

        if let Ok(id) = raw.parse::<i64>() {
            return Ok(Self::Numeric(id));
        }

        if let Some(path) = LINK_PREFIXES
            .iter()
            .find_map(|prefix| strip_prefix_ignore_case(raw, prefix))
        {
            let mut segments = path.split('/').filter(|s| !s.is_empty());
            let first = segments.next().ok_or_else(not_found)?;
            if let Some(hash) = first.strip_prefix('+') {
                return Ok(Self::Invite(hash.to_string()));
            }
            if first.eq_ignore_ascii_case("joinchat") {
                let hash = segments.next().ok_or_else(not_found)?;
                return Ok(Self::Invite(hash.to_string()));
            }
            let handle = first.split(['?', '#']).next().unwrap_or(first);
            return Self::handle(handle).ok_or_else(not_found);
        }

        Self::handle(raw.strip_prefix('@').unwrap_or(raw)).ok_or_else(not_found)
    }

    fn handle(name: &str) -> Option<Self> {
        let valid = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        valid.then(|| Self::Handle(name.to_string()))
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

impl std::fmt::Display for ChannelIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Numeric(id) => write!(f, "{id}"),
            Self::Handle(h) => write!(f, "@{h}"),
            Self::Invite(hash) => write!(f, "t.me/+{hash}"),
        }
    }
}

/// Result of a successful identifier lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedChannel {
    pub handle: ChannelHandle,
    pub title: Option<String>,
}

/// Acknowledgement of an outbound send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: MessageId,
}

/// Something the platform reports on a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    Message(InboundMessage),
    /// The session is no longer authenticated.
    SessionInvalidated,
    /// The subscribed channel can no longer be reached.
    Unreachable { reason: String },
}

/// Stream of inbound platform events for one subscription.
pub type EventStream = Pin<Box<dyn Stream<Item = PlatformEvent> + Send>>;

/// The platform client collaborator.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Platform name for logging (e.g. "telegram").
    fn name(&self) -> &str;

    /// Map an identifier onto a channel handle.
    async fn resolve_identifier(
        &self,
        identifier: &ChannelIdentifier,
    ) -> Result<ResolvedChannel, ResolutionError>;

    /// Start streaming inbound messages for `channel`, in arrival order.
    ///
    /// A new subscription replaces any previous one.
    async fn subscribe(&self, channel: &ChannelHandle) -> Result<EventStream, PlatformError>;

    /// Send one transformed message to `channel`.
    async fn send(
        &self,
        channel: &ChannelHandle,
        delivery: &Delivery,
    ) -> Result<SentMessage, SendError>;

    /// Obtain a fresh session after invalidation.
    async fn reauthenticate(&self) -> Result<(), PlatformError>;
}
