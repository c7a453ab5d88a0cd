//! Relay loop: the state machine that moves messages source → destination.
//!
//! ```text
//! Idle → Resolving → Streaming → Draining → Stopped
//!            ↑           │
//!            └── Reauthenticating
//! ```
//!
//! Events from the source are handled strictly in arrival order: duplicate
//! check, transform, dispatch, bookkeeping. A message's failure never stops
//! the loop. Only startup failures and exhausted reauthentication are fatal;
//! a failed resubscription later in the run is retried with backoff.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::channels::platform::{EventStream, Platform, PlatformEvent};
use crate::error::{ChannelRole, ConfigError, PlatformError, RelayError};
use crate::pipeline::filter::{SubstitutionPolicy, transform};
use crate::pipeline::rules::RuleSet;
use crate::pipeline::types::{InboundMessage, TransformResult};
use crate::relay::dispatcher::{DeliveryOutcome, Dispatcher, FailureReason, RetryPolicy};
use crate::relay::events::{EventBus, RelayEvent};
use crate::relay::ledger::DeliveryLedger;
use crate::relay::resolver::{ChannelRef, ChannelResolver};
use crate::store::DeliveryRecord;

/// Lifecycle state of the relay loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    Idle,
    Resolving,
    Streaming,
    Reauthenticating,
    Draining,
    Stopped,
}

impl std::fmt::Display for RelayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Resolving => "resolving",
            Self::Streaming => "streaming",
            Self::Reauthenticating => "reauthenticating",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Immutable inputs for one relay run.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub source: String,
    pub destination: String,
    pub rules: RuleSet,
    pub media_policy: SubstitutionPolicy,
    pub min_delay: Duration,
    pub retry: RetryPolicy,
    pub max_reauth_attempts: u32,
}

impl RelaySettings {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            rules: RuleSet::empty(),
            media_policy: SubstitutionPolicy::disabled(),
            min_delay: Duration::from_secs(3),
            retry: RetryPolicy::default(),
            max_reauth_attempts: 5,
        }
    }
}

/// Per-run counters, returned when the loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub delivered: u64,
    pub dropped: u64,
    pub duplicates: u64,
    pub failed: u64,
}

/// Why the streaming phase ended.
#[derive(Debug)]
enum StreamExit {
    Shutdown,
    Ended,
    SessionInvalidated,
    SourceUnreachable(String),
}

enum Subscription {
    Stream(EventStream),
    SessionInvalidated,
    Shutdown,
}

struct Route {
    source: ChannelRef,
    destination: ChannelRef,
}

pub struct RelayLoop {
    platform: Arc<dyn Platform>,
    settings: RelaySettings,
    resolver: ChannelResolver,
    dispatcher: Dispatcher,
    ledger: DeliveryLedger,
    events: EventBus,
    state: watch::Sender<RelayState>,
    stats: RelayStats,
}

impl RelayLoop {
    pub fn new(
        platform: Arc<dyn Platform>,
        settings: RelaySettings,
        ledger: DeliveryLedger,
    ) -> Self {
        let events = EventBus::default();
        let dispatcher = Dispatcher::new(
            platform.clone(),
            settings.min_delay,
            settings.retry.clone(),
            events.clone(),
        );
        let (state, _) = watch::channel(RelayState::Idle);
        Self {
            resolver: ChannelResolver::new(platform.clone()),
            platform,
            settings,
            dispatcher,
            ledger,
            events,
            state,
            stats: RelayStats::default(),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    /// Follow state changes from another task.
    pub fn watch_state(&self) -> watch::Receiver<RelayState> {
        self.state.subscribe()
    }

    pub fn ledger(&self) -> &DeliveryLedger {
        &self.ledger
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    /// Run until `shutdown` turns true or the source stream ends.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<RelayStats, RelayError> {
        let result = self.run_until_stopped(&mut shutdown).await;
        self.transition(RelayState::Stopped);
        match &result {
            Ok(()) => info!(
                delivered = self.stats.delivered,
                dropped = self.stats.dropped,
                duplicates = self.stats.duplicates,
                failed = self.stats.failed,
                "Relay stopped"
            ),
            Err(e) => warn!(error = %e, "Relay stopped with a fatal error"),
        }
        result.map(|()| self.stats)
    }

    async fn run_until_stopped(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), RelayError> {
        self.transition(RelayState::Resolving);
        let mut route = self.resolve_route().await?;
        self.ledger.set_source(route.source.handle.id());

        let mut resubscribing = false;
        loop {
            let stream = match self.subscribe_source(&route, shutdown, resubscribing).await? {
                Subscription::Stream(stream) => stream,
                Subscription::SessionInvalidated => {
                    if !self.reauthenticate(shutdown).await? {
                        break;
                    }
                    route = self.resolve_route().await?;
                    continue;
                }
                Subscription::Shutdown => break,
            };
            resubscribing = true;

            self.transition(RelayState::Streaming);
            info!(
                source = route.source.display_name(),
                destination = route.destination.display_name(),
                durable = self.ledger.is_durable(),
                "Relay streaming"
            );

            match self.stream_events(stream, shutdown, &mut route).await? {
                StreamExit::Shutdown => {
                    info!("Shutdown requested, draining");
                    break;
                }
                StreamExit::Ended => {
                    info!("Source stream ended, draining");
                    break;
                }
                StreamExit::SessionInvalidated => {
                    if !self.reauthenticate(shutdown).await? {
                        break;
                    }
                    route = self.resolve_route().await?;
                }
                StreamExit::SourceUnreachable(reason) => {
                    warn!(%reason, "Source channel unreachable");
                    self.transition(RelayState::Resolving);
                    self.reresolve(ChannelRole::Source, &mut route).await;
                }
            }
        }

        self.transition(RelayState::Draining);
        Ok(())
    }

    /// Subscribe to the source channel.
    ///
    /// The first subscription of a run fails fast. Later ones (after
    /// reauthentication or re-resolution) retry with backoff until they
    /// succeed or shutdown is requested.
    async fn subscribe_source(
        &mut self,
        route: &Route,
        shutdown: &mut watch::Receiver<bool>,
        resubscribing: bool,
    ) -> Result<Subscription, RelayError> {
        let mut attempt: u32 = 0;
        loop {
            let error = match self.platform.subscribe(&route.source.handle).await {
                Ok(stream) => return Ok(Subscription::Stream(stream)),
                Err(PlatformError::SessionInvalidated { reason }) => {
                    warn!(%reason, "Session rejected while subscribing");
                    return Ok(Subscription::SessionInvalidated);
                }
                Err(e) if !resubscribing => return Err(e.into()),
                Err(e) => e,
            };

            attempt = attempt.saturating_add(1);
            let delay = self.settings.retry.delay_for(attempt);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Resubscribe failed, retrying"
            );
            tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown) => return Ok(Subscription::Shutdown),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Resolve both channels. Cached entries are reused.
    async fn resolve_route(&mut self) -> Result<Route, RelayError> {
        self.transition(RelayState::Resolving);
        let source = self
            .resolver
            .resolve(&self.settings.source)
            .await
            .map_err(|source| ConfigError::Unresolvable {
                role: ChannelRole::Source,
                source,
            })?;
        let destination = self
            .resolver
            .resolve(&self.settings.destination)
            .await
            .map_err(|source| ConfigError::Unresolvable {
                role: ChannelRole::Destination,
                source,
            })?;
        Ok(Route {
            source,
            destination,
        })
    }

    /// Drop the cached mapping for `role` and look it up again.
    /// On failure the previous handle is kept.
    async fn reresolve(&mut self, role: ChannelRole, route: &mut Route) {
        let identifier = match role {
            ChannelRole::Source => self.settings.source.clone(),
            ChannelRole::Destination => self.settings.destination.clone(),
        };
        self.resolver.invalidate(&identifier);

        match self.resolver.resolve(&identifier).await {
            Ok(channel) => {
                match role {
                    ChannelRole::Source => {
                        self.ledger.set_source(channel.handle.id());
                        route.source = channel;
                    }
                    ChannelRole::Destination => route.destination = channel,
                }
                self.events.publish(RelayEvent::Reresolved { role });
            }
            Err(e) => warn!(%role, error = %e, "Re-resolution failed; keeping previous handle"),
        }
    }

    async fn stream_events(
        &mut self,
        mut stream: EventStream,
        shutdown: &mut watch::Receiver<bool>,
        route: &mut Route,
    ) -> Result<StreamExit, RelayError> {
        loop {
            let event = tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown) => return Ok(StreamExit::Shutdown),
                event = stream.next() => event,
            };

            match event {
                None => return Ok(StreamExit::Ended),
                Some(PlatformEvent::Message(msg)) => {
                    if let Some(exit) = self.handle_message(msg, route).await? {
                        return Ok(exit);
                    }
                }
                Some(PlatformEvent::SessionInvalidated) => {
                    return Ok(StreamExit::SessionInvalidated);
                }
                Some(PlatformEvent::Unreachable { reason }) => {
                    return Ok(StreamExit::SourceUnreachable(reason));
                }
            }
        }
    }

    async fn handle_message(
        &mut self,
        msg: InboundMessage,
        route: &mut Route,
    ) -> Result<Option<StreamExit>, RelayError> {
        let source_id = msg.id;
        if self.ledger.contains(source_id).await {
            self.stats.duplicates += 1;
            self.events.publish(RelayEvent::Duplicate { source_id });
            return Ok(None);
        }

        let delivery = match transform(&msg, &self.settings.rules, &self.settings.media_policy)? {
            TransformResult::Deliver(delivery) => delivery,
            TransformResult::Dropped(reason) => {
                self.stats.dropped += 1;
                self.ledger.mark_settled(source_id);
                self.events.publish(RelayEvent::Dropped { source_id, reason });
                return Ok(None);
            }
        };

        match self
            .dispatcher
            .dispatch(&route.destination.handle, delivery)
            .await
        {
            DeliveryOutcome::Success(sent) => {
                let record = DeliveryRecord::new(source_id, sent.message_id);
                self.ledger.record_delivery(record.clone()).await;
                self.stats.delivered += 1;
                self.events.publish(RelayEvent::Delivered { record });
                Ok(None)
            }
            DeliveryOutcome::Failed { reason } => {
                self.stats.failed += 1;
                self.events.publish(RelayEvent::DeliveryFailed {
                    source_id,
                    reason: reason.clone(),
                });
                // Session and reachability failures stay unsettled so a replay
                // of the same id can still be delivered.
                match reason {
                    FailureReason::SessionInvalidated => Ok(Some(StreamExit::SessionInvalidated)),
                    FailureReason::Unreachable { .. } => {
                        self.reresolve(ChannelRole::Destination, route).await;
                        Ok(None)
                    }
                    FailureReason::RetriesExhausted { .. } | FailureReason::Rejected { .. } => {
                        self.ledger.mark_settled(source_id);
                        Ok(None)
                    }
                }
            }
        }
    }

    /// Ask the platform for a fresh session, backing off between attempts.
    /// Returns `Ok(false)` if shutdown was requested meanwhile.
    async fn reauthenticate(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool, RelayError> {
        self.transition(RelayState::Reauthenticating);
        let max_attempts = self.settings.max_reauth_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self.platform.reauthenticate().await {
                Ok(()) => {
                    info!(attempt, "Session re-established");
                    return Ok(true);
                }
                Err(e) => warn!(attempt, max_attempts, error = %e, "Reauthentication failed"),
            }

            if attempt < max_attempts {
                let delay = self.settings.retry.delay_for(attempt);
                tokio::select! {
                    biased;
                    _ = wait_for_shutdown(shutdown) => return Ok(false),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        Err(RelayError::ReauthenticationExhausted {
            attempts: max_attempts,
        })
    }

    fn transition(&mut self, next: RelayState) {
        if *self.state.borrow() == next {
            return;
        }
        self.state.send_replace(next);
        self.events.publish(RelayEvent::StateChanged { state: next });
    }
}

/// Resolves once `shutdown` is true. Never resolves if the sender is gone.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
