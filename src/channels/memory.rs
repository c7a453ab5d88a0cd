//! In-process platform for dry runs and tests.
//!
//! Channels are registered up front, inbound streams are scripted or fed
//! live, and every send attempt is recorded with its (tokio) timestamp so
//! rate and ordering properties can be asserted under paused time.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::channels::platform::{
    ChannelHandle, ChannelIdentifier, EventStream, Platform, PlatformEvent, ResolvedChannel,
    SentMessage,
};
use crate::error::{PlatformError, ResolutionError, SendError};
use crate::pipeline::types::{Delivery, InboundMessage};

/// A send attempt seen by the platform.
#[derive(Debug, Clone)]
pub struct SendAttempt {
    pub channel: ChannelHandle,
    pub delivery: Delivery,
    pub at: Instant,
    /// `None` when the attempt succeeded.
    pub error: Option<SendError>,
}

#[derive(Default)]
struct Inner {
    channels: HashMap<ChannelIdentifier, ResolvedChannel>,
    scripted_streams: VecDeque<Vec<PlatformEvent>>,
    live: Option<mpsc::UnboundedSender<PlatformEvent>>,
    subscribe_results: VecDeque<Result<(), PlatformError>>,
    send_results: VecDeque<Result<(), SendError>>,
    reauth_results: VecDeque<Result<(), PlatformError>>,
    attempts: Vec<SendAttempt>,
}

/// Scriptable in-memory `Platform`.
pub struct MemoryPlatform {
    inner: Mutex<Inner>,
    send_latency: Duration,
    next_message_id: AtomicI64,
    resolve_calls: AtomicUsize,
    subscribe_calls: AtomicUsize,
    reauth_calls: AtomicUsize,
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            send_latency: Duration::ZERO,
            next_message_id: AtomicI64::new(1),
            resolve_calls: AtomicUsize::new(0),
            subscribe_calls: AtomicUsize::new(0),
            reauth_calls: AtomicUsize::new(0),
        }
    }

    /// Register a channel the platform can resolve.
    pub fn with_channel(
        self,
        identifier: ChannelIdentifier,
        id: i64,
        title: impl Into<String>,
    ) -> Self {
        self.lock().channels.insert(
            identifier,
            ResolvedChannel {
                handle: ChannelHandle::new(id),
                title: Some(title.into()),
            },
        );
        self
    }

    /// Time each send takes to be acknowledged.
    pub fn with_send_latency(mut self, latency: Duration) -> Self {
        self.send_latency = latency;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Forget a channel; later lookups fail with `NotFound`.
    pub fn remove_channel(&self, identifier: &ChannelIdentifier) {
        self.lock().channels.remove(identifier);
    }

    /// Queue a finite event stream for the next `subscribe` call.
    pub fn script_stream(&self, events: Vec<PlatformEvent>) {
        self.lock().scripted_streams.push_back(events);
    }

    /// Convenience: script a stream of plain messages.
    pub fn script_messages(&self, messages: impl IntoIterator<Item = InboundMessage>) {
        self.script_stream(messages.into_iter().map(PlatformEvent::Message).collect());
    }

    /// Push an event into the live (unscripted) subscription.
    /// Returns false when nobody is subscribed.
    pub fn push_event(&self, event: PlatformEvent) -> bool {
        self.lock()
            .live
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    /// End the live subscription's stream.
    pub fn close_live(&self) {
        self.lock().live = None;
    }

    /// Result for the next `subscribe` call; unscripted calls succeed.
    pub fn script_subscribe(&self, result: Result<(), PlatformError>) {
        self.lock().subscribe_results.push_back(result);
    }

    /// Result for the next send attempt; unscripted attempts succeed.
    pub fn script_send(&self, result: Result<(), SendError>) {
        self.lock().send_results.push_back(result);
    }

    /// Result for the next reauthentication; unscripted attempts succeed.
    pub fn script_reauth(&self, result: Result<(), PlatformError>) {
        self.lock().reauth_results.push_back(result);
    }

    pub fn attempts(&self) -> Vec<SendAttempt> {
        self.lock().attempts.clone()
    }

    /// Successful sends in order.
    pub fn delivered(&self) -> Vec<SendAttempt> {
        self.lock()
            .attempts
            .iter()
            .filter(|a| a.error.is_none())
            .cloned()
            .collect()
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn reauth_calls(&self) -> usize {
        self.reauth_calls.load(Ordering::SeqCst)
    }
}

impl Default for MemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Platform for MemoryPlatform {
    fn name(&self) -> &str {
        "memory"
    }

    async fn resolve_identifier(
        &self,
        identifier: &ChannelIdentifier,
    ) -> Result<ResolvedChannel, ResolutionError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        self.lock()
            .channels
            .get(identifier)
            .cloned()
            .ok_or_else(|| ResolutionError::NotFound {
                identifier: identifier.to_string(),
            })
    }

    async fn subscribe(&self, _channel: &ChannelHandle) -> Result<EventStream, PlatformError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.lock();
        inner.subscribe_results.pop_front().unwrap_or(Ok(()))?;
        if let Some(events) = inner.scripted_streams.pop_front() {
            return Ok(Box::pin(futures::stream::iter(events)));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        inner.live = Some(tx);
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
        if !self.send_latency.is_zero() {
            tokio::time::sleep(self.send_latency).await;
        }

        let mut inner = self.lock();
        let result = inner.send_results.pop_front().unwrap_or(Ok(()));
        inner.attempts.push(SendAttempt {
            channel: *channel,
            delivery: delivery.clone(),
            at: Instant::now(),
            error: result.as_ref().err().cloned(),
        });

        result.map(|()| SentMessage {
            message_id: self.next_message_id.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn reauthenticate(&self) -> Result<(), PlatformError> {
        self.reauth_calls.fetch_add(1, Ordering::SeqCst);
        self.lock().reauth_results.pop_front().unwrap_or(Ok(()))
    }
}
