//! Persistence layer: libSQL-backed idempotency store.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{CleanupReport, CrossAccountMoveRecord, IdempotencyStore, ProcessedRecord};
