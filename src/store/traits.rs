//! `DeliveryStore` trait: async interface for durable delivery records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;
use crate::pipeline::types::MessageId;

/// Proof that a source message reached the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub source_message_id: MessageId,
    pub destination_message_id: MessageId,
    pub delivered_at: DateTime<Utc>,
}

impl DeliveryRecord {
    pub fn new(source_message_id: MessageId, destination_message_id: MessageId) -> Self {
        Self {
            source_message_id,
            destination_message_id,
            delivered_at: Utc::now(),
        }
    }
}

/// Backend-agnostic store for delivery records, keyed by source chat.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Insert a record. Re-inserting the same source message is a no-op.
    async fn insert_delivery(
        &self,
        source_chat: i64,
        record: &DeliveryRecord,
    ) -> Result<(), DatabaseError>;

    /// Look up the record for a source message.
    async fn get_delivery(
        &self,
        source_chat: i64,
        source_message_id: MessageId,
    ) -> Result<Option<DeliveryRecord>, DatabaseError>;

    /// Delete records delivered before `cutoff`. Returns the number removed.
    async fn prune_deliveries(&self, cutoff: DateTime<Utc>) -> Result<u64, DatabaseError>;

    /// Delete every record. Returns the number removed.
    async fn reset_deliveries(&self) -> Result<u64, DatabaseError>;

    /// Number of records held for a source chat.
    async fn count_deliveries(&self, source_chat: i64) -> Result<i64, DatabaseError>;
}
