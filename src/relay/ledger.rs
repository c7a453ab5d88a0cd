//! Delivery ledger: duplicate suppression for one source channel.
//!
//! Delivered ids map to their `DeliveryRecord`. Ids that were dropped or
//! failed permanently are "settled": they were processed once and must not
//! be dispatched again either. Settled ids are never persisted.
//!
//! With a `DeliveryStore` attached, records are mirrored to it and lookups
//! fall back to it on a memory miss. Any store error downgrades the ledger
//! to memory-only for the rest of the run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::DatabaseError;
use crate::pipeline::types::MessageId;
use crate::store::{DeliveryRecord, DeliveryStore};

pub struct DeliveryLedger {
    records: HashMap<MessageId, DeliveryRecord>,
    settled: HashSet<MessageId>,
    store: Option<Arc<dyn DeliveryStore>>,
    source_chat: i64,
}

impl DeliveryLedger {
    pub fn in_memory() -> Self {
        Self {
            records: HashMap::new(),
            settled: HashSet::new(),
            store: None,
            source_chat: 0,
        }
    }

    pub fn with_store(store: Arc<dyn DeliveryStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::in_memory()
        }
    }

    /// Scope the ledger to a source chat. Switching chats clears memory.
    pub fn set_source(&mut self, source_chat: i64) {
        if self.source_chat != source_chat {
            self.records.clear();
            self.settled.clear();
            self.source_chat = source_chat;
        }
    }

    pub fn is_durable(&self) -> bool {
        self.store.is_some()
    }

    /// Whether `id` was already processed.
    pub async fn contains(&mut self, id: MessageId) -> bool {
        if self.records.contains_key(&id) || self.settled.contains(&id) {
            return true;
        }
        let Some(store) = self.store.clone() else {
            return false;
        };
        match store.get_delivery(self.source_chat, id).await {
            Ok(Some(record)) => {
                self.records.insert(id, record);
                true
            }
            Ok(None) => false,
            Err(e) => {
                self.degrade(e);
                false
            }
        }
    }

    /// Remember a successful delivery.
    pub async fn record_delivery(&mut self, record: DeliveryRecord) {
        if let Some(store) = self.store.clone() {
            if let Err(e) = store.insert_delivery(self.source_chat, &record).await {
                self.degrade(e);
            }
        }
        self.settled.remove(&record.source_message_id);
        self.records.insert(record.source_message_id, record);
    }

    /// Remember that `id` was processed without a delivery.
    pub fn mark_settled(&mut self, id: MessageId) {
        if !self.records.contains_key(&id) {
            self.settled.insert(id);
        }
    }

    pub fn is_settled(&self, id: MessageId) -> bool {
        self.settled.contains(&id)
    }

    pub fn get(&self, id: MessageId) -> Option<&DeliveryRecord> {
        self.records.get(&id)
    }

    /// Deliveries remembered in memory this session.
    pub fn delivered_count(&self) -> usize {
        self.records.len()
    }

    fn degrade(&mut self, error: DatabaseError) {
        warn!(
            error = %error,
            "Delivery store failed; continuing with in-memory duplicate suppression"
        );
        self.store = None;
    }
}

impl Default for DeliveryLedger {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Startup maintenance for a durable ledger: optional reset, then pruning.
pub async fn prepare_store(
    store: &dyn DeliveryStore,
    retention_days: i64,
    reset: bool,
) -> Result<(), DatabaseError> {
    if reset {
        let removed = store.reset_deliveries().await?;
        info!(removed, "Delivery ledger reset");
    }
    let cutoff = chrono::Utc::now() - chrono::Duration::days(retention_days);
    let pruned = store.prune_deliveries(cutoff).await?;
    if pruned > 0 {
        info!(pruned, retention_days, "Pruned old delivery records");
    }
    Ok(())
}
