//! Persistence layer: optional libSQL-backed delivery records.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{DeliveryRecord, DeliveryStore};
