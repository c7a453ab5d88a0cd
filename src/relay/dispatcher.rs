//! Rate-limited dispatcher.
//!
//! One send lane per dispatcher: sends are serialised, spaced by a minimum
//! delay, and paused channel-wide while a flood-wait cool-down runs.
//! Transient failures are retried with exponential backoff up to a bounded
//! number of attempts; permanent failures are returned immediately.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::channels::platform::{ChannelHandle, Platform, SentMessage};
use crate::error::SendError;
use crate::pipeline::types::Delivery;
use crate::relay::events::{EventBus, RelayEvent};

/// Bounded retry policy for transient send failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per message, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Spread each delay over ±20% to avoid lock-step retries.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before the retry that follows failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let mut delay = self.initial_delay.as_millis() as f64 * multiplier;
        if self.jitter {
            delay *= rand::thread_rng().gen_range(0.8..=1.2);
        }
        let max = self.max_delay.as_millis() as f64;
        Duration::from_millis(delay.min(max) as u64)
    }
}

/// Why a message could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Every attempt failed with a transient error.
    RetriesExhausted { attempts: u32, last_error: String },
    /// The platform rejected the content.
    Rejected { error: String },
    /// The destination cannot be reached.
    Unreachable { error: String },
    /// The session expired mid-send.
    SessionInvalidated,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RetriesExhausted {
                attempts,
                last_error,
            } => write!(f, "gave up after {attempts} attempts: {last_error}"),
            Self::Rejected { error } => write!(f, "rejected: {error}"),
            Self::Unreachable { error } => write!(f, "destination unreachable: {error}"),
            Self::SessionInvalidated => f.write_str("session invalidated"),
        }
    }
}

/// Terminal result of dispatching one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success(SentMessage),
    Failed { reason: FailureReason },
}

/// A message being dispatched. Lives only inside `Dispatcher::dispatch`.
#[derive(Debug)]
struct DispatchTicket {
    payload: Delivery,
    /// Attempts that reached the platform without a flood-wait.
    attempt_count: u32,
    next_eligible_time: Instant,
}

impl DispatchTicket {
    fn new(payload: Delivery) -> Self {
        Self {
            payload,
            attempt_count: 0,
            next_eligible_time: Instant::now(),
        }
    }
}

/// Shared state of the single send lane.
#[derive(Debug, Default)]
struct Lane {
    last_send: Option<Instant>,
    suspended_until: Option<Instant>,
}

impl Lane {
    fn eligible_at(&self, min_delay: Duration) -> Instant {
        let spaced = self
            .last_send
            .map(|at| at + min_delay)
            .unwrap_or_else(Instant::now);
        match self.suspended_until {
            Some(until) => spaced.max(until),
            None => spaced,
        }
    }
}

pub struct Dispatcher {
    platform: Arc<dyn Platform>,
    min_delay: Duration,
    retry: RetryPolicy,
    events: EventBus,
    lane: Mutex<Lane>,
}

impl Dispatcher {
    pub fn new(
        platform: Arc<dyn Platform>,
        min_delay: Duration,
        retry: RetryPolicy,
        events: EventBus,
    ) -> Self {
        Self {
            platform,
            min_delay,
            retry,
            events,
            lane: Mutex::new(Lane::default()),
        }
    }

    /// Send one delivery to `destination`, retrying as the policy allows.
    ///
    /// Concurrent callers queue on the lane, so spacing and flood-wait
    /// suspension apply across all of them.
    pub async fn dispatch(
        &self,
        destination: &ChannelHandle,
        delivery: Delivery,
    ) -> DeliveryOutcome {
        let mut lane = self.lane.lock().await;
        let mut ticket = DispatchTicket::new(delivery);
        let source_id = ticket.payload.source_id;

        loop {
            let eligible = lane
                .eligible_at(self.min_delay)
                .max(ticket.next_eligible_time);
            if eligible > Instant::now() {
                tokio::time::sleep_until(eligible).await;
            }

            let result = self.platform.send(destination, &ticket.payload).await;
            let now = Instant::now();
            lane.last_send = Some(now);
            if !matches!(result, Err(SendError::FloodWait { .. })) {
                ticket.attempt_count += 1;
            }

            let reason = match result {
                Ok(sent) => {
                    debug!(
                        message_id = source_id,
                        attempts = ticket.attempt_count,
                        media = ticket.payload.media.label(),
                        "Dispatch acknowledged"
                    );
                    return DeliveryOutcome::Success(sent);
                }
                Err(SendError::FloodWait { cooldown }) => {
                    lane.suspended_until = Some(now + cooldown);
                    self.events.publish(RelayEvent::Throttled { cooldown });
                    continue;
                }
                Err(SendError::Transient(message)) => {
                    if ticket.attempt_count >= self.retry.max_attempts {
                        FailureReason::RetriesExhausted {
                            attempts: ticket.attempt_count,
                            last_error: message,
                        }
                    } else {
                        let delay = self.retry.delay_for(ticket.attempt_count);
                        ticket.next_eligible_time = now + delay;
                        self.events.publish(RelayEvent::Backoff {
                            source_id,
                            attempt: ticket.attempt_count,
                            delay,
                        });
                        continue;
                    }
                }
                Err(SendError::Permanent(error)) => FailureReason::Rejected { error },
                Err(SendError::Unreachable(error)) => FailureReason::Unreachable { error },
                Err(SendError::SessionInvalidated) => FailureReason::SessionInvalidated,
            };
            return DeliveryOutcome::Failed { reason };
        }
    }
}
