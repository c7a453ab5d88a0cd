//! Relay event vocabulary and the bus that carries it.
//!
//! Every event is logged through `tracing` when published and broadcast to
//! any observer that subscribed. Publishing never blocks and never fails:
//! with no subscribers the event is only logged.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::ChannelRole;
use crate::pipeline::types::{DropReason, MessageId};
use crate::relay::dispatcher::FailureReason;
use crate::relay::relay_loop::RelayState;
use crate::store::DeliveryRecord;

/// Something an observability collaborator may want to know.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RelayEvent {
    StateChanged {
        state: RelayState,
    },
    /// A source message id was seen again and skipped.
    Duplicate {
        source_id: MessageId,
    },
    Dropped {
        source_id: MessageId,
        reason: DropReason,
    },
    Delivered {
        record: DeliveryRecord,
    },
    DeliveryFailed {
        source_id: MessageId,
        reason: FailureReason,
    },
    /// The platform asked for a channel-wide pause.
    Throttled {
        #[serde(serialize_with = "as_millis")]
        cooldown: Duration,
    },
    /// A transient send failure will be retried after `delay`.
    Backoff {
        source_id: MessageId,
        attempt: u32,
        #[serde(serialize_with = "as_millis")]
        delay: Duration,
    },
    Reresolved {
        role: ChannelRole,
    },
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl RelayEvent {
    fn log(&self) {
        match self {
            Self::StateChanged { state } => info!(%state, "Relay state changed"),
            Self::Duplicate { source_id } => {
                debug!(message_id = source_id, "Duplicate message skipped")
            }
            Self::Dropped { source_id, reason } => {
                info!(message_id = source_id, %reason, "Message dropped")
            }
            Self::Delivered { record } => info!(
                message_id = record.source_message_id,
                destination_message_id = record.destination_message_id,
                "Message relayed"
            ),
            Self::DeliveryFailed { source_id, reason } => {
                warn!(message_id = source_id, %reason, "Message not delivered")
            }
            Self::Throttled { cooldown } => warn!(
                cooldown_secs = cooldown.as_secs_f64(),
                "Flood wait: suspending sends"
            ),
            Self::Backoff {
                source_id,
                attempt,
                delay,
            } => warn!(
                message_id = source_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Send failed, backing off"
            ),
            Self::Reresolved { role } => info!(%role, "Channel re-resolved"),
        }
    }
}

/// Broadcast bus for relay events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RelayEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: RelayEvent) {
        event.log();
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
