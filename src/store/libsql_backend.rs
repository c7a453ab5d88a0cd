//! libSQL backend: async `DeliveryStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::pipeline::types::MessageId;
use crate::store::migrations;
use crate::store::traits::{DeliveryRecord, DeliveryStore};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Delivery database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn row_to_record(row: &libsql::Row) -> Result<DeliveryRecord, libsql::Error> {
    let delivered_str: String = row.get(2)?;
    Ok(DeliveryRecord {
        source_message_id: row.get(0)?,
        destination_message_id: row.get(1)?,
        delivered_at: parse_datetime(&delivered_str),
    })
}

#[async_trait]
impl DeliveryStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn insert_delivery(
        &self,
        source_chat: i64,
        record: &DeliveryRecord,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO deliveries \
                 (source_chat, source_message_id, destination_message_id, delivered_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    source_chat,
                    record.source_message_id,
                    record.destination_message_id,
                    record.delivered_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_delivery: {e}")))?;

        debug!(
            source_chat,
            source_message_id = record.source_message_id,
            "Delivery record stored"
        );
        Ok(())
    }

    async fn get_delivery(
        &self,
        source_chat: i64,
        source_message_id: MessageId,
    ) -> Result<Option<DeliveryRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT source_message_id, destination_message_id, delivered_at \
                 FROM deliveries WHERE source_chat = ?1 AND source_message_id = ?2",
                params![source_chat, source_message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_delivery: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_record(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("get_delivery row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_delivery: {e}"))),
        }
    }

    async fn prune_deliveries(&self, cutoff: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let removed = self
            .conn()
            .execute(
                "DELETE FROM deliveries WHERE delivered_at < ?1",
                params![cutoff.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune_deliveries: {e}")))?;
        Ok(removed)
    }

    async fn reset_deliveries(&self) -> Result<u64, DatabaseError> {
        let removed = self
            .conn()
            .execute("DELETE FROM deliveries", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_deliveries: {e}")))?;
        Ok(removed)
    }

    async fn count_deliveries(&self, source_chat: i64) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM deliveries WHERE source_chat = ?1",
                params![source_chat],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_deliveries: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0)),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_deliveries: {e}"))),
        }
    }
}
