//! Telegram platform: long-polls the Bot API and relays through it.
//!
//! Entity offsets on the wire are UTF-16 code units; the rest of the crate
//! works in byte offsets, so every conversion happens in this file.

use std::ops::Range;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channels::platform::{
    ChannelHandle, ChannelIdentifier, EventStream, Platform, PlatformEvent, ResolvedChannel,
    SentMessage,
};
use crate::error::{PlatformError, ResolutionError, SendError};
use crate::pipeline::types::{
    Delivery, EntityKind, InboundMessage, Media, MediaKind, MessageEntity, OutboundMedia,
};

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Maximum message length for Telegram's sendMessage API, in UTF-16 units.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Maximum caption length for media messages, in UTF-16 units.
const TELEGRAM_MAX_CAPTION_LENGTH: usize = 1024;

/// Pause before polling again after a failed getUpdates.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

const STYLE_ENTITIES: &[&str] = &[
    "bold",
    "italic",
    "underline",
    "strikethrough",
    "spoiler",
    "code",
    "pre",
    "blockquote",
    "expandable_blockquote",
];

/// Telegram platform: connects to the Bot API via long-polling.
pub struct TelegramPlatform {
    bot_token: SecretString,
    api_base: String,
    client: reqwest::Client,
    poll_timeout_secs: u64,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl TelegramPlatform {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            api_base: DEFAULT_API_BASE.to_string(),
            client: reqwest::Client::new(),
            poll_timeout_secs: 30,
            poller: Mutex::new(None),
        }
    }

    /// Point the client at a different Bot API server.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_poll_timeout(mut self, secs: u64) -> Self {
        self.poll_timeout_secs = secs;
        self
    }

    fn api_url(&self, method: &str) -> String {
        method_url(&self.api_base, &self.bot_token, method)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<T, ApiFailure> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| ApiFailure::Transport(e.to_string()))?;
        read_response(resp).await
    }

    async fn call_multipart<T: DeserializeOwned>(
        &self,
        method: &str,
        form: Form,
    ) -> Result<T, ApiFailure> {
        let resp = self
            .client
            .post(self.api_url(method))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ApiFailure::Transport(e.to_string()))?;
        read_response(resp).await
    }

    /// Send text, splitting over the 4096 unit limit.
    /// Returns the id of the first chunk.
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        entities: &[MessageEntity],
    ) -> Result<SentMessage, SendError> {
        let mut first = None;
        for range in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            let (chunk, chunk_entities) = slice_entities(text, entities, range);
            let mut body = serde_json::json!({
                "chat_id": chat_id,
                "text": chunk,
            });
            if let Some(wire) = entities_to_wire(chunk, &chunk_entities) {
                body["entities"] = wire;
            }
            let sent: WireMessage = self
                .call("sendMessage", &body)
                .await
                .map_err(ApiFailure::into_send_error)?;
            first.get_or_insert(sent.message_id);
        }
        first
            .map(|message_id| SentMessage { message_id })
            .ok_or_else(|| SendError::Permanent("message text is empty".into()))
    }

    /// Re-send an existing attachment by `file_id`.
    async fn send_media_by_id(
        &self,
        chat_id: i64,
        kind: &MediaKind,
        file_id: &str,
        caption: &str,
        entities: &[MessageEntity],
    ) -> Result<SentMessage, SendError> {
        let (method, field) = media_method(kind);
        let inline_caption = caption_fits(caption);

        let mut body = serde_json::json!({ "chat_id": chat_id });
        body[field] = serde_json::Value::String(file_id.to_string());
        if inline_caption && !caption.is_empty() {
            body["caption"] = serde_json::Value::String(caption.to_string());
            if let Some(wire) = entities_to_wire(caption, entities) {
                body["caption_entities"] = wire;
            }
        }

        let sent: WireMessage = self
            .call(method, &body)
            .await
            .map_err(ApiFailure::into_send_error)?;

        if !inline_caption {
            self.send_caption_follow_up(chat_id, sent.message_id, caption, entities).await;
        }
        Ok(SentMessage {
            message_id: sent.message_id,
        })
    }

    /// Send a caption too long to attach inline as its own message.
    ///
    /// The media is already delivered at this point, so a failure here is
    /// logged rather than returned: failing the send would make the
    /// dispatcher post the media a second time.
    async fn send_caption_follow_up(
        &self,
        chat_id: i64,
        media_message_id: i64,
        caption: &str,
        entities: &[MessageEntity],
    ) {
        if let Err(e) = self.send_text(chat_id, caption, entities).await {
            tracing::warn!(
                chat_id,
                media_message_id,
                error = %e,
                "Media sent but its caption follow-up failed"
            );
        }
    }

    /// Upload the replacement image with the original caption.
    async fn send_replacement(
        &self,
        chat_id: i64,
        file_name: &str,
        bytes: Vec<u8>,
        caption: &str,
        entities: &[MessageEntity],
    ) -> Result<SentMessage, SendError> {
        let inline_caption = caption_fits(caption);
        let part = Part::bytes(bytes).file_name(file_name.to_string());

        let mut form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part("photo", part);

        if inline_caption && !caption.is_empty() {
            form = form.text("caption", caption.to_string());
            if let Some(wire) = entities_to_wire(caption, entities) {
                form = form.text("caption_entities", wire.to_string());
            }
        }

        let sent: WireMessage = self
            .call_multipart("sendPhoto", form)
            .await
            .map_err(ApiFailure::into_send_error)?;

        if !inline_caption {
            self.send_caption_follow_up(chat_id, sent.message_id, caption, entities).await;
        }

        tracing::debug!(chat_id, file_name, "Telegram replacement photo sent");
        Ok(SentMessage {
            message_id: sent.message_id,
        })
    }

    fn replace_poller(&self, handle: JoinHandle<()>) {
        let mut slot = self.poller.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }
}

impl Drop for TelegramPlatform {
    fn drop(&mut self) {
        let slot = self.poller.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }
}

// ── Platform trait implementation ───────────────────────────────────

#[async_trait]
impl Platform for TelegramPlatform {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn resolve_identifier(
        &self,
        identifier: &ChannelIdentifier,
    ) -> Result<ResolvedChannel, ResolutionError> {
        let chat_id = match identifier {
            ChannelIdentifier::Numeric(id) => serde_json::json!(id),
            ChannelIdentifier::Handle(handle) => serde_json::json!(format!("@{handle}")),
            // Bot accounts cannot join or look up chats by invite link.
            ChannelIdentifier::Invite(_) => {
                return Err(ResolutionError::AccessDenied {
                    identifier: identifier.to_string(),
                });
            }
        };

        let chat: WireChat = self
            .call("getChat", &serde_json::json!({ "chat_id": chat_id }))
            .await
            .map_err(|failure| failure.into_resolution_error(identifier))?;

        Ok(ResolvedChannel {
            handle: ChannelHandle::new(chat.id),
            title: chat.title.or(chat.username),
        })
    }

    async fn subscribe(&self, channel: &ChannelHandle) -> Result<EventStream, PlatformError> {
        // Confirm the bot can see the chat before starting the poller.
        let _: WireChat = self
            .call("getChat", &serde_json::json!({ "chat_id": channel.id() }))
            .await
            .map_err(|failure| match failure {
                ApiFailure::Api { status: 401, description, .. } => {
                    PlatformError::SessionInvalidated {
                        reason: description,
                    }
                }
                other => PlatformError::SubscribeFailed {
                    channel: channel.to_string(),
                    reason: other.to_string(),
                },
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let poller = Poller {
            client: self.client.clone(),
            url: self.api_url("getUpdates"),
            chat_id: channel.id(),
            timeout_secs: self.poll_timeout_secs,
        };
        self.replace_poller(tokio::spawn(poller.run(tx)));

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn send(
        &self,
        channel: &ChannelHandle,
        delivery: &Delivery,
    ) -> Result<SentMessage, SendError> {
        let chat_id = channel.id();
        match &delivery.media {
            OutboundMedia::None => {
                self.send_text(chat_id, &delivery.text, &delivery.entities)
                    .await
            }
            OutboundMedia::Original { kind, file_id } => {
                self.send_media_by_id(chat_id, kind, file_id, &delivery.text, &delivery.entities)
                    .await
            }
            OutboundMedia::Replacement(asset) => {
                self.send_replacement(
                    chat_id,
                    &asset.file_name,
                    asset.bytes.as_ref().clone(),
                    &delivery.text,
                    &delivery.entities,
                )
                .await
            }
        }
    }

    async fn reauthenticate(&self) -> Result<(), PlatformError> {
        match self
            .call::<serde_json::Value>("getMe", &serde_json::json!({}))
            .await
        {
            Ok(_) => Ok(()),
            Err(ApiFailure::Api {
                status: 401,
                description,
                ..
            }) => Err(PlatformError::SessionInvalidated {
                reason: description,
            }),
            Err(other) => Err(PlatformError::Http(other.to_string())),
        }
    }
}

// ── Long-poll loop ──────────────────────────────────────────────────

struct Poller {
    client: reqwest::Client,
    url: String,
    chat_id: i64,
    timeout_secs: u64,
}

impl Poller {
    async fn run(self, tx: mpsc::UnboundedSender<PlatformEvent>) {
        let mut offset: i64 = 0;

        tracing::info!(chat_id = self.chat_id, "Telegram poller listening for posts");

        loop {
            let body = serde_json::json!({
                "offset": offset,
                "timeout": self.timeout_secs,
                "allowed_updates": ["channel_post", "message", "my_chat_member"]
            });

            let result = match self.client.post(&self.url).json(&body).send().await {
                Ok(resp) => read_response::<Vec<WireUpdate>>(resp).await,
                Err(e) => Err(ApiFailure::Transport(e.to_string())),
            };

            let updates = match result {
                Ok(updates) => updates,
                Err(ApiFailure::Api {
                    status: 401,
                    description,
                    ..
                }) => {
                    tracing::warn!("Telegram session rejected: {description}");
                    let _ = tx.send(PlatformEvent::SessionInvalidated);
                    return;
                }
                Err(e) => {
                    tracing::warn!("Telegram poll error: {e}");
                    tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                    continue;
                }
            };

            for update in updates {
                if update.update_id < offset {
                    continue;
                }
                offset = update.update_id + 1;

                let Some(event) = update.into_event(self.chat_id) else {
                    continue;
                };
                let terminal = matches!(event, PlatformEvent::Unreachable { .. });
                if tx.send(event).is_err() {
                    tracing::info!("Telegram subscriber dropped; poller exiting");
                    return;
                }
                if terminal {
                    return;
                }
            }
        }
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WireChat {
    id: i64,
    title: Option<String>,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUpdate {
    update_id: i64,
    message: Option<WireMessage>,
    channel_post: Option<WireMessage>,
    my_chat_member: Option<WireMemberUpdate>,
}

impl WireUpdate {
    fn into_event(self, chat_id: i64) -> Option<PlatformEvent> {
        if let Some(member) = self.my_chat_member {
            return member.into_event(chat_id);
        }
        let message = self.channel_post.or(self.message)?;
        if message.chat.as_ref().map(|c| c.id) != Some(chat_id) {
            return None;
        }
        Some(PlatformEvent::Message(message.into_inbound()))
    }
}

#[derive(Debug, Deserialize)]
struct WireMemberUpdate {
    chat: WireChat,
    new_chat_member: WireMember,
}

#[derive(Debug, Deserialize)]
struct WireMember {
    status: String,
}

impl WireMemberUpdate {
    fn into_event(self, chat_id: i64) -> Option<PlatformEvent> {
        if self.chat.id != chat_id {
            return None;
        }
        match self.new_chat_member.status.as_str() {
            "left" | "kicked" => Some(PlatformEvent::Unreachable {
                reason: format!("bot status changed to {}", self.new_chat_member.status),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireFile {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct WireDocument {
    file_id: String,
    mime_type: Option<String>,
    file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireEntity {
    #[serde(rename = "type")]
    kind: String,
    offset: usize,
    length: usize,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    message_id: i64,
    chat: Option<WireChat>,
    #[serde(default)]
    date: i64,
    text: Option<String>,
    #[serde(default)]
    entities: Vec<WireEntity>,
    caption: Option<String>,
    #[serde(default)]
    caption_entities: Vec<WireEntity>,
    #[serde(default)]
    photo: Vec<WireFile>,
    document: Option<WireDocument>,
    animation: Option<WireFile>,
    video: Option<WireFile>,
    audio: Option<WireFile>,
    voice: Option<WireFile>,
    sticker: Option<WireFile>,
}

impl WireMessage {
    fn into_inbound(self) -> InboundMessage {
        let received_at = DateTime::<Utc>::from_timestamp(self.date, 0).unwrap_or_else(Utc::now);

        let msg = match (self.media(), self.text) {
            (Some(mut media), _) => {
                let entities = self
                    .caption
                    .as_deref()
                    .map(|c| entities_from_wire(c, self.caption_entities))
                    .unwrap_or_default();
                media.caption = self.caption;
                InboundMessage::media(self.message_id, media).with_entities(entities)
            }
            (None, Some(text)) => {
                let entities = entities_from_wire(&text, self.entities);
                InboundMessage::text(self.message_id, text).with_entities(entities)
            }
            (None, None) => InboundMessage {
                id: self.message_id,
                text: None,
                entities: Vec::new(),
                media: None,
                received_at,
            },
        };
        InboundMessage { received_at, ..msg }
    }

    fn media(&self) -> Option<Media> {
        // Animations also carry a `document` field, so check them first.
        if let Some(file) = &self.animation {
            return Some(Media::new(MediaKind::Animation, &file.file_id));
        }
        if let Some(largest) = self.photo.last() {
            return Some(Media::new(MediaKind::Photo, &largest.file_id));
        }
        if let Some(doc) = &self.document {
            let kind = MediaKind::Document {
                mime_type: doc.mime_type.clone(),
                file_name: doc.file_name.clone(),
            };
            return Some(Media::new(kind, &doc.file_id));
        }
        if let Some(file) = &self.video {
            return Some(Media::new(MediaKind::Video, &file.file_id));
        }
        if let Some(file) = &self.audio {
            return Some(Media::new(MediaKind::Audio, &file.file_id));
        }
        self.voice
            .as_ref()
            .or(self.sticker.as_ref())
            .map(|file| Media::new(MediaKind::Other, &file.file_id))
    }
}

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum ApiFailure {
    Transport(String),
    Api {
        status: u16,
        description: String,
        retry_after: Option<u64>,
    },
}

impl std::fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(reason) => write!(f, "transport error: {reason}"),
            Self::Api {
                status,
                description,
                ..
            } => write!(f, "HTTP {status}: {description}"),
        }
    }
}

impl ApiFailure {
    fn into_send_error(self) -> SendError {
        match self {
            Self::Transport(reason) => SendError::Transient(reason),
            Self::Api {
                status,
                description,
                retry_after,
            } => match status {
                429 => SendError::FloodWait {
                    cooldown: Duration::from_secs(retry_after.unwrap_or(1)),
                },
                401 => SendError::SessionInvalidated,
                403 => SendError::Unreachable(description),
                400 if is_chat_missing(&description) => SendError::Unreachable(description),
                500.. => SendError::Transient(format!("HTTP {status}: {description}")),
                _ => SendError::Permanent(format!("HTTP {status}: {description}")),
            },
        }
    }

    fn into_resolution_error(self, identifier: &ChannelIdentifier) -> ResolutionError {
        let identifier = identifier.to_string();
        match self {
            Self::Api { status: 400, .. } => ResolutionError::NotFound { identifier },
            Self::Api { status: 403, .. } => ResolutionError::AccessDenied { identifier },
            other => ResolutionError::Transport {
                identifier,
                reason: other.to_string(),
            },
        }
    }
}

fn is_chat_missing(description: &str) -> bool {
    let lower = description.to_ascii_lowercase();
    lower.contains("chat not found") || lower.contains("channel_private")
}

async fn read_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ApiFailure> {
    let status = resp.status().as_u16();
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| ApiFailure::Transport(e.to_string()))?;

    let parsed: ApiResponse<T> = match serde_json::from_slice(&bytes) {
        Ok(parsed) => parsed,
        Err(e) if (200..300).contains(&status) => {
            return Err(ApiFailure::Transport(format!("invalid response body: {e}")));
        }
        Err(_) => {
            return Err(ApiFailure::Api {
                status,
                description: String::from_utf8_lossy(&bytes).into_owned(),
                retry_after: None,
            });
        }
    };

    match parsed.result {
        Some(result) if parsed.ok => Ok(result),
        _ => Err(ApiFailure::Api {
            // A failed call sometimes comes back as 200 with ok=false.
            status: if (200..300).contains(&status) { 400 } else { status },
            description: parsed.description.unwrap_or_default(),
            retry_after: parsed.parameters.and_then(|p| p.retry_after),
        }),
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn method_url(api_base: &str, token: &SecretString, method: &str) -> String {
    format!("{api_base}/bot{}/{method}", token.expose_secret())
}

fn media_method(kind: &MediaKind) -> (&'static str, &'static str) {
    match kind {
        MediaKind::Photo => ("sendPhoto", "photo"),
        MediaKind::Video => ("sendVideo", "video"),
        MediaKind::Animation => ("sendAnimation", "animation"),
        MediaKind::Audio => ("sendAudio", "audio"),
        MediaKind::Document { .. } | MediaKind::Other => ("sendDocument", "document"),
    }
}

fn caption_fits(caption: &str) -> bool {
    caption.encode_utf16().count() <= TELEGRAM_MAX_CAPTION_LENGTH
}

/// Byte offset of a UTF-16 position in `text`.
fn utf16_to_byte(text: &str, utf16_offset: usize) -> usize {
    let mut units = 0;
    for (idx, ch) in text.char_indices() {
        if units >= utf16_offset {
            return idx;
        }
        units += ch.len_utf16();
    }
    text.len()
}

/// UTF-16 position of a byte offset in `text`.
fn byte_to_utf16(text: &str, byte_offset: usize) -> usize {
    text.char_indices()
        .take_while(|(idx, _)| *idx < byte_offset)
        .map(|(_, ch)| ch.len_utf16())
        .sum()
}

fn entities_from_wire(text: &str, wire: Vec<WireEntity>) -> Vec<MessageEntity> {
    wire.into_iter()
        .filter_map(|e| {
            let start = utf16_to_byte(text, e.offset);
            let end = utf16_to_byte(text, e.offset + e.length);
            if end <= start {
                return None;
            }
            let kind = match (e.kind.as_str(), e.url) {
                ("text_link", Some(url)) => EntityKind::TextLink { url },
                ("url", _) => EntityKind::Url,
                (name, _) if STYLE_ENTITIES.contains(&name) => EntityKind::Style {
                    name: name.to_string(),
                },
                (name, _) => EntityKind::Other {
                    name: name.to_string(),
                },
            };
            Some(MessageEntity::new(start, end - start, kind))
        })
        .collect()
}

/// Wire form of the entities worth sending back. Platform-detected
/// entities (mentions, hashtags, ...) are re-detected by Telegram.
fn entities_to_wire(text: &str, entities: &[MessageEntity]) -> Option<serde_json::Value> {
    let wire: Vec<serde_json::Value> = entities
        .iter()
        .filter_map(|e| {
            let offset = byte_to_utf16(text, e.offset);
            let length = byte_to_utf16(text, e.end()) - offset;
            let mut value = serde_json::json!({ "offset": offset, "length": length });
            match &e.kind {
                EntityKind::TextLink { url } => {
                    value["type"] = "text_link".into();
                    value["url"] = url.as_str().into();
                }
                EntityKind::Url => value["type"] = "url".into(),
                EntityKind::Style { name } => value["type"] = name.as_str().into(),
                EntityKind::Other { .. } => return None,
            }
            Some(value)
        })
        .collect();
    (!wire.is_empty()).then_some(serde_json::Value::Array(wire))
}

/// Byte length of the longest prefix of `text` within `max_units` UTF-16 units.
fn utf16_prefix_len(text: &str, max_units: usize) -> usize {
    let mut units = 0;
    for (idx, c) in text.char_indices() {
        units += c.len_utf16();
        if units > max_units {
            // Always make progress, even if one char exceeds the budget.
            return if idx == 0 { c.len_utf8() } else { idx };
        }
    }
    text.len()
}

/// Cut `text` to `range` and clip `entities` onto the cut.
fn slice_entities<'a>(
    text: &'a str,
    entities: &[MessageEntity],
    range: Range<usize>,
) -> (&'a str, Vec<MessageEntity>) {
    let clipped = entities
        .iter()
        .filter_map(|e| {
            let start = e.offset.max(range.start);
            let end = e.end().min(range.end);
            (end > start)
                .then(|| MessageEntity::new(start - range.start, end - start, e.kind.clone()))
        })
        .collect();
    (&text[range], clipped)
}

/// Split a message into byte ranges of at most `max_units` UTF-16 units.
/// Tries to split on newlines, then spaces, then hard-cuts on a char boundary.
fn split_message(text: &str, max_units: usize) -> Vec<Range<usize>> {
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let remaining = &text[start..];
        let limit = utf16_prefix_len(remaining, max_units);

        if limit == remaining.len() {
            chunks.push(start..text.len());
            break;
        }

        let window = &remaining[..limit];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&at| at > 0)
            .unwrap_or(limit);

        chunks.push(start..start + split_at);

        let rest = &remaining[split_at..];
        start += split_at + (rest.len() - rest.trim_start().len());
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::ReplacementAsset;
    use futures::StreamExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TOKEN: &str = "123:ABC";

    fn platform(server: &MockServer) -> TelegramPlatform {
        TelegramPlatform::new(SecretString::from(TOKEN.to_string()))
            .with_api_base(server.uri())
            .with_poll_timeout(0)
    }

    fn ok(result: serde_json::Value) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .set_body_json(serde_json::json!({ "ok": true, "result": result }))
    }

    fn api_error(status: u16, description: &str) -> ResponseTemplate {
        ResponseTemplate::new(status).set_body_json(serde_json::json!({
            "ok": false,
            "error_code": status,
            "description": description,
        }))
    }

    async fn request_bodies(server: &MockServer) -> Vec<serde_json::Value> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter_map(|req| serde_json::from_slice(&req.body).ok())
            .collect()
    }

    // ── Basic platform tests ────────────────────────────────────────

    #[test]
    fn telegram_platform_name() {
        let p = TelegramPlatform::new(SecretString::from("fake-token".to_string()));
        assert_eq!(p.name(), "telegram");
    }

    #[test]
    fn telegram_api_url() {
        let p = TelegramPlatform::new(SecretString::from(TOKEN.to_string()));
        assert_eq!(
            p.api_url("getMe"),
            "https://api.telegram.org/bot123:ABC/getMe"
        );
    }

    #[test]
    fn telegram_api_base_trailing_slash() {
        let p = TelegramPlatform::new(SecretString::from(TOKEN.to_string()))
            .with_api_base("http://localhost:8081/");
        assert_eq!(p.api_url("getChat"), "http://localhost:8081/bot123:ABC/getChat");
    }

    // ── Offset conversion ───────────────────────────────────────────

    #[test]
    fn utf16_offsets_map_to_bytes() {
        // "🚀" is 2 UTF-16 units and 4 bytes; "é" is 1 unit and 2 bytes.
        let text = "🚀 café link";
        assert_eq!(utf16_to_byte(text, 0), 0);
        assert_eq!(utf16_to_byte(text, 2), 4);
        assert_eq!(utf16_to_byte(text, 3), 5);
        assert_eq!(utf16_to_byte(text, 8), 11);
        assert_eq!(utf16_to_byte(text, 99), text.len());
        assert_eq!(byte_to_utf16(text, 11), 8);
        assert_eq!(byte_to_utf16(text, 4), 2);
    }

    #[test]
    fn wire_entities_round_trip_through_bytes() {
        let text = "🚀 Signal here";
        let wire = vec![WireEntity {
            kind: "text_link".into(),
            offset: 10,
            length: 4,
            url: Some("https://spam.example".into()),
        }];
        let entities = entities_from_wire(text, wire);
        assert_eq!(&text[entities[0].offset..entities[0].end()], "here");

        let back = entities_to_wire(text, &entities).unwrap();
        assert_eq!(back[0]["offset"], 10);
        assert_eq!(back[0]["length"], 4);
        assert_eq!(back[0]["type"], "text_link");
    }

    #[test]
    fn platform_detected_entities_are_not_sent() {
        let entities = vec![MessageEntity::new(
            0,
            5,
            EntityKind::Other {
                name: "mention".into(),
            },
        )];
        assert!(entities_to_wire("@chan", &entities).is_none());
    }

    // ── Update parsing ──────────────────────────────────────────────

    #[test]
    fn channel_post_with_photo_becomes_media_message() {
        let update: WireUpdate = serde_json::from_value(serde_json::json!({
            "update_id": 7,
            "channel_post": {
                "message_id": 42,
                "chat": { "id": -1001, "title": "Signals" },
                "date": 1_700_000_000,
                "photo": [{ "file_id": "small" }, { "file_id": "large" }],
                "caption": "Buy now",
                "caption_entities": [{ "type": "bold", "offset": 0, "length": 3 }]
            }
        }))
        .unwrap();

        let Some(PlatformEvent::Message(msg)) = update.into_event(-1001) else {
            panic!("expected a message event");
        };
        assert_eq!(msg.id, 42);
        assert_eq!(msg.text, None);
        let media = msg.media.unwrap();
        assert_eq!(media.kind, MediaKind::Photo);
        assert_eq!(media.file_id, "large");
        assert_eq!(media.caption.as_deref(), Some("Buy now"));
        assert_eq!(msg.entities.len(), 1);
        assert_eq!(msg.received_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn posts_from_other_chats_are_ignored() {
        let update: WireUpdate = serde_json::from_value(serde_json::json!({
            "update_id": 1,
            "channel_post": {
                "message_id": 1,
                "chat": { "id": -2002 },
                "text": "hello"
            }
        }))
        .unwrap();
        assert!(update.into_event(-1001).is_none());
    }

    #[test]
    fn animation_wins_over_document() {
        let update: WireUpdate = serde_json::from_value(serde_json::json!({
            "update_id": 1,
            "channel_post": {
                "message_id": 3,
                "chat": { "id": -1001 },
                "animation": { "file_id": "anim" },
                "document": { "file_id": "anim", "mime_type": "video/mp4" }
            }
        }))
        .unwrap();
        let Some(PlatformEvent::Message(msg)) = update.into_event(-1001) else {
            panic!("expected a message event");
        };
        assert_eq!(msg.media.unwrap().kind, MediaKind::Animation);
    }

    #[test]
    fn bot_removed_from_source_is_unreachable() {
        let update: WireUpdate = serde_json::from_value(serde_json::json!({
            "update_id": 9,
            "my_chat_member": {
                "chat": { "id": -1001 },
                "new_chat_member": { "status": "kicked" }
            }
        }))
        .unwrap();
        assert!(matches!(
            update.into_event(-1001),
            Some(PlatformEvent::Unreachable { .. })
        ));
    }

    // ── Error classification ────────────────────────────────────────

    #[test]
    fn send_errors_classified_by_status() {
        let api = |status, description: &str, retry_after| ApiFailure::Api {
            status,
            description: description.into(),
            retry_after,
        };
        assert_eq!(
            api(429, "Too Many Requests: retry after 17", Some(17)).into_send_error(),
            SendError::FloodWait {
                cooldown: Duration::from_secs(17)
            }
        );
        assert!(matches!(
            api(502, "Bad Gateway", None).into_send_error(),
            SendError::Transient(_)
        ));
        assert!(matches!(
            api(400, "Bad Request: chat not found", None).into_send_error(),
            SendError::Unreachable(_)
        ));
        assert!(matches!(
            api(403, "Forbidden: bot is not a member", None).into_send_error(),
            SendError::Unreachable(_)
        ));
        assert_eq!(
            api(401, "Unauthorized", None).into_send_error(),
            SendError::SessionInvalidated
        );
        assert!(matches!(
            api(400, "Bad Request: message text is empty", None).into_send_error(),
            SendError::Permanent(_)
        ));
        assert!(matches!(
            ApiFailure::Transport("connection reset".into()).into_send_error(),
            SendError::Transient(_)
        ));
    }

    // ── Message splitting tests ─────────────────────────────────────

    fn pieces(text: &str, max: usize) -> Vec<&str> {
        split_message(text, max)
            .into_iter()
            .map(|r| &text[r])
            .collect()
    }

    #[test]
    fn split_message_short() {
        assert_eq!(pieces("Hello", 4096), vec!["Hello"]);
    }

    #[test]
    fn split_message_exact_limit() {
        let msg = "a".repeat(4096);
        let chunks = pieces(&msg, 4096);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 4096);
    }

    #[test]
    fn split_message_over_limit_on_newline() {
        let msg = format!("{}\n{}", "a".repeat(2000), "b".repeat(3000));
        let chunks = pieces(&msg, 4096);
        assert_eq!(chunks, vec!["a".repeat(2000), "b".repeat(3000)]);
    }

    #[test]
    fn split_message_no_good_split_point() {
        let msg = "a".repeat(5000);
        let chunks = pieces(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 4096);
        assert_eq!(chunks[1].len(), 904);
    }

    #[test]
    fn split_message_counts_chars_not_bytes() {
        let msg = "é".repeat(10);
        let chunks = pieces(&msg, 4);
        assert_eq!(chunks, vec!["éééé", "éééé", "éé"]);
    }

    #[test]
    fn split_message_counts_utf16_units() {
        // Each of these emoji is a surrogate pair: two units, one char.
        let msg = "😀".repeat(5);
        let chunks = pieces(&msg, 4);
        assert_eq!(chunks, vec!["😀😀", "😀😀", "😀"]);
    }

    #[test]
    fn split_message_never_cuts_a_surrogate_pair() {
        let msg = format!("a{}", "😀".repeat(2));
        let chunks = pieces(&msg, 2);
        assert_eq!(chunks, vec!["a", "😀", "😀"]);
    }

    #[test]
    fn caption_limit_is_measured_in_utf16_units() {
        assert!(caption_fits(&"a".repeat(1024)));
        assert!(!caption_fits(&"a".repeat(1025)));
        // 600 chars, 1200 units.
        assert!(!caption_fits(&"😀".repeat(600)));
        assert!(caption_fits(&"😀".repeat(512)));
    }

    #[test]
    fn slice_entities_clips_to_chunk() {
        let text = "aaaa bbbb";
        let entities = vec![MessageEntity::new(
            2,
            5,
            EntityKind::Style {
                name: "bold".into(),
            },
        )];
        let (chunk, clipped) = slice_entities(text, &entities, 5..9);
        assert_eq!(chunk, "bbbb");
        assert_eq!(clipped, vec![MessageEntity::new(0, 2, entities[0].kind.clone())]);
    }

    // ── HTTP behaviour (wiremock) ───────────────────────────────────

    #[tokio::test]
    async fn resolves_handle_via_get_chat() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/getChat"))
            .respond_with(ok(serde_json::json!({
                "id": -1001234,
                "type": "channel",
                "title": "Signals"
            })))
            .mount(&server)
            .await;

        let p = platform(&server);
        let resolved = p
            .resolve_identifier(&ChannelIdentifier::Handle("signals".into()))
            .await
            .unwrap();
        assert_eq!(resolved.handle, ChannelHandle::new(-1001234));
        assert_eq!(resolved.title.as_deref(), Some("Signals"));

        let bodies = request_bodies(&server).await;
        assert_eq!(bodies[0]["chat_id"], "@signals");
    }

    #[tokio::test]
    async fn unknown_chat_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/getChat"))
            .respond_with(api_error(400, "Bad Request: chat not found"))
            .mount(&server)
            .await;

        let err = platform(&server)
            .resolve_identifier(&ChannelIdentifier::Numeric(-1009))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionError::NotFound { .. }));
    }

    #[tokio::test]
    async fn invite_links_are_access_denied_without_a_request() {
        let server = MockServer::start().await;
        let err = platform(&server)
            .resolve_identifier(&ChannelIdentifier::Invite("AbC".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionError::AccessDenied { .. }));
        assert!(request_bodies(&server).await.is_empty());
    }

    #[tokio::test]
    async fn send_text_includes_entities() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/sendMessage"))
            .respond_with(ok(serde_json::json!({ "message_id": 555 })))
            .mount(&server)
            .await;

        let delivery = Delivery {
            source_id: 1,
            text: "Hello world".into(),
            entities: vec![MessageEntity::new(
                0,
                5,
                EntityKind::Style {
                    name: "bold".into(),
                },
            )],
            media: OutboundMedia::None,
        };
        let sent = platform(&server)
            .send(&ChannelHandle::new(-100), &delivery)
            .await
            .unwrap();
        assert_eq!(sent.message_id, 555);

        let bodies = request_bodies(&server).await;
        assert_eq!(bodies[0]["chat_id"], -100);
        assert_eq!(bodies[0]["text"], "Hello world");
        assert_eq!(bodies[0]["entities"][0]["type"], "bold");
    }

    #[tokio::test]
    async fn send_original_media_by_file_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/sendVideo"))
            .respond_with(ok(serde_json::json!({ "message_id": 8 })))
            .mount(&server)
            .await;

        let delivery = Delivery {
            source_id: 1,
            text: "clip".into(),
            entities: vec![],
            media: OutboundMedia::Original {
                kind: MediaKind::Video,
                file_id: "vid-1".into(),
            },
        };
        platform(&server)
            .send(&ChannelHandle::new(-100), &delivery)
            .await
            .unwrap();

        let bodies = request_bodies(&server).await;
        assert_eq!(bodies[0]["video"], "vid-1");
        assert_eq!(bodies[0]["caption"], "clip");
    }

    #[tokio::test]
    async fn long_caption_moves_to_follow_up_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/sendPhoto"))
            .respond_with(ok(serde_json::json!({ "message_id": 10 })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/sendMessage"))
            .respond_with(ok(serde_json::json!({ "message_id": 11 })))
            .expect(1)
            .mount(&server)
            .await;

        let delivery = Delivery {
            source_id: 1,
            text: "x".repeat(1500),
            entities: vec![],
            media: OutboundMedia::Original {
                kind: MediaKind::Photo,
                file_id: "p".into(),
            },
        };
        let sent = platform(&server)
            .send(&ChannelHandle::new(-100), &delivery)
            .await
            .unwrap();
        assert_eq!(sent.message_id, 10);

        let bodies = request_bodies(&server).await;
        assert!(bodies[0].get("caption").is_none());
    }

    #[tokio::test]
    async fn emoji_caption_over_the_unit_limit_moves_to_follow_up() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/sendPhoto"))
            .respond_with(ok(serde_json::json!({ "message_id": 20 })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/sendMessage"))
            .respond_with(ok(serde_json::json!({ "message_id": 21 })))
            .expect(1)
            .mount(&server)
            .await;

        let delivery = Delivery {
            source_id: 1,
            text: "😀".repeat(600),
            entities: vec![],
            media: OutboundMedia::Original {
                kind: MediaKind::Photo,
                file_id: "p".into(),
            },
        };
        let sent = platform(&server)
            .send(&ChannelHandle::new(-100), &delivery)
            .await
            .unwrap();
        assert_eq!(sent.message_id, 20);

        let bodies = request_bodies(&server).await;
        assert!(bodies[0].get("caption").is_none());
    }

    #[tokio::test]
    async fn failed_caption_follow_up_still_reports_the_media() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/sendPhoto"))
            .respond_with(ok(serde_json::json!({ "message_id": 30 })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/sendMessage"))
            .respond_with(api_error(502, "Bad Gateway"))
            .mount(&server)
            .await;

        let delivery = Delivery {
            source_id: 1,
            text: "x".repeat(1500),
            entities: vec![],
            media: OutboundMedia::Original {
                kind: MediaKind::Photo,
                file_id: "p".into(),
            },
        };
        let sent = platform(&server)
            .send(&ChannelHandle::new(-100), &delivery)
            .await
            .unwrap();
        assert_eq!(sent.message_id, 30);
    }

    #[tokio::test]
    async fn replacement_is_uploaded_as_multipart() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/sendPhoto"))
            .respond_with(ok(serde_json::json!({ "message_id": 77 })))
            .mount(&server)
            .await;

        let delivery = Delivery {
            source_id: 1,
            text: "Buy now".into(),
            entities: vec![],
            media: OutboundMedia::Replacement(ReplacementAsset::new(
                "replacement.png",
                vec![0x89, 0x50, 0x4E, 0x47],
            )),
        };
        let sent = platform(&server)
            .send(&ChannelHandle::new(-100), &delivery)
            .await
            .unwrap();
        assert_eq!(sent.message_id, 77);

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(body.contains("replacement.png"));
        assert!(body.contains("Buy now"));
    }

    #[tokio::test]
    async fn flood_wait_reports_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/sendMessage"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "ok": false,
                "error_code": 429,
                "description": "Too Many Requests: retry after 12",
                "parameters": { "retry_after": 12 }
            })))
            .mount(&server)
            .await;

        let delivery = Delivery {
            source_id: 1,
            text: "hi".into(),
            entities: vec![],
            media: OutboundMedia::None,
        };
        let err = platform(&server)
            .send(&ChannelHandle::new(-100), &delivery)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SendError::FloodWait {
                cooldown: Duration::from_secs(12)
            }
        );
    }

    #[tokio::test]
    async fn reauthenticate_maps_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/getMe"))
            .respond_with(api_error(401, "Unauthorized"))
            .mount(&server)
            .await;

        let err = platform(&server).reauthenticate().await.unwrap_err();
        assert!(matches!(err, PlatformError::SessionInvalidated { .. }));
    }

    #[tokio::test]
    async fn subscribe_streams_source_posts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/getChat"))
            .respond_with(ok(serde_json::json!({ "id": -1001, "type": "channel" })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/getUpdates"))
            .respond_with(ok(serde_json::json!([
                {
                    "update_id": 1,
                    "channel_post": {
                        "message_id": 5,
                        "chat": { "id": -1001 },
                        "text": "first"
                    }
                },
                {
                    "update_id": 2,
                    "channel_post": {
                        "message_id": 6,
                        "chat": { "id": -1001 },
                        "text": "second"
                    }
                }
            ])))
            .mount(&server)
            .await;

        let p = platform(&server);
        let mut stream = p.subscribe(&ChannelHandle::new(-1001)).await.unwrap();

        let Some(PlatformEvent::Message(first)) = stream.next().await else {
            panic!("expected first message");
        };
        let Some(PlatformEvent::Message(second)) = stream.next().await else {
            panic!("expected second message");
        };
        assert_eq!(first.text.as_deref(), Some("first"));
        assert_eq!(second.id, 6);
    }

    #[tokio::test]
    async fn poller_reports_session_invalidation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/getChat"))
            .respond_with(ok(serde_json::json!({ "id": -1001, "type": "channel" })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/getUpdates"))
            .respond_with(api_error(401, "Unauthorized"))
            .mount(&server)
            .await;

        let p = platform(&server);
        let mut stream = p.subscribe(&ChannelHandle::new(-1001)).await.unwrap();
        assert_eq!(stream.next().await, Some(PlatformEvent::SessionInvalidated));
        assert_eq!(stream.next().await, None);
    }
}
