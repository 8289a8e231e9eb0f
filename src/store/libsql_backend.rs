//! libSQL backend: async `IdempotencyStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::pipeline::types::{Uid, days_before};
use crate::store::migrations;
use crate::store::traits::{
    CleanupReport, CrossAccountMoveRecord, IdempotencyStore, ProcessedRecord,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        info!(path = %path.display(), "Database opened");
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

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Delete closed records older than `cutoff`.
    ///
    /// A transfer is open while its target copy has no processed record.
    /// Open transfers are kept, and so is every processed record that a
    /// remaining transfer refers to.
    pub async fn cleanup_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<CleanupReport, DatabaseError> {
        let conn = self.conn();
        let cutoff = timestamp(cutoff);

        let moves_deleted = conn
            .execute(
                "DELETE FROM cross_account_moves
                 WHERE moved_at < ?1
                   AND EXISTS (
                       SELECT 1 FROM processed_messages p
                       WHERE p.account = cross_account_moves.target_account
                         AND p.uid = cross_account_moves.target_uid
                   )",
                params![cutoff.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cleanup moves: {e}")))?;

        let processed_deleted = conn
            .execute(
                "DELETE FROM processed_messages
                 WHERE processed_at < ?1
                   AND NOT EXISTS (
                       SELECT 1 FROM cross_account_moves m
                       WHERE (m.source_account = processed_messages.account
                              AND m.source_uid = processed_messages.uid)
                          OR (m.target_account = processed_messages.account
                              AND m.target_uid = processed_messages.uid)
                   )",
                params![cutoff],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cleanup processed: {e}")))?;

        Ok(CleanupReport {
            processed_deleted,
            moves_deleted,
        })
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: RFC 3339, UTC, fixed microsecond precision,
/// so stored values compare correctly as text.
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
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

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn uid_value(uid: Uid) -> i64 {
    i64::from(uid.0)
}

fn uid_from_column(value: i64) -> Result<Uid, DatabaseError> {
    u32::try_from(value)
        .map(Uid)
        .map_err(|_| DatabaseError::Serialization(format!("uid out of range: {value}")))
}

const PROCESSED_COLUMNS: &str = "account, uid, processed_at, rules_applied, message_id, subject";

const MOVE_COLUMNS: &str =
    "source_account, source_uid, target_account, target_uid, chain_depth, moved_at";

fn row_to_processed(row: &libsql::Row) -> Result<ProcessedRecord, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));
    let rules_json: String = row.get(3).map_err(parse)?;
    let rules_applied: Vec<String> = serde_json::from_str(&rules_json)
        .map_err(|e| DatabaseError::Serialization(format!("rules_applied: {e}")))?;
    let processed_str: String = row.get(2).map_err(parse)?;

    Ok(ProcessedRecord {
        account: row.get(0).map_err(parse)?,
        uid: uid_from_column(row.get(1).map_err(parse)?)?,
        processed_at: parse_datetime(&processed_str),
        rules_applied,
        message_id: row.get(4).ok(),
        subject: row.get(5).ok(),
    })
}

fn row_to_move(row: &libsql::Row) -> Result<CrossAccountMoveRecord, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));
    let depth: i64 = row.get(4).map_err(parse)?;
    let moved_str: String = row.get(5).map_err(parse)?;

    Ok(CrossAccountMoveRecord {
        source_account: row.get(0).map_err(parse)?,
        source_uid: uid_from_column(row.get(1).map_err(parse)?)?,
        target_account: row.get(2).map_err(parse)?,
        target_uid: uid_from_column(row.get(3).map_err(parse)?)?,
        chain_depth: u32::try_from(depth)
            .map_err(|_| DatabaseError::Serialization(format!("chain_depth: {depth}")))?,
        moved_at: parse_datetime(&moved_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl IdempotencyStore for LibSqlBackend {
    async fn is_processed(&self, account: &str, uid: Uid) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM processed_messages WHERE account = ?1 AND uid = ?2",
                params![account, uid_value(uid)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("is_processed: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("is_processed: {e}")))?;
        Ok(row.is_some())
    }

    async fn mark_processed(
        &self,
        account: &str,
        uid: Uid,
        rules_applied: &[String],
        message_id: Option<&str>,
        subject: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let rules_json = serde_json::to_string(rules_applied)
            .map_err(|e| DatabaseError::Serialization(format!("rules_applied: {e}")))?;

        let inserted = self
            .conn()
            .execute(
                "INSERT INTO processed_messages
                    (account, uid, processed_at, rules_applied, message_id, subject)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (account, uid) DO NOTHING",
                params![
                    account,
                    uid_value(uid),
                    timestamp(Utc::now()),
                    rules_json,
                    opt_text(message_id),
                    opt_text(subject),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_processed: {e}")))?;

        debug!(account, uid = %uid, inserted = inserted > 0, "Marked processed");
        Ok(inserted > 0)
    }

    async fn get_processed(
        &self,
        account: &str,
        uid: Uid,
    ) -> Result<Option<ProcessedRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {PROCESSED_COLUMNS} FROM processed_messages WHERE account = ?1 AND uid = ?2"
                ),
                params![account, uid_value(uid)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_processed: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_processed(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_processed: {e}"))),
        }
    }

    async fn mark_cross_account_move(
        &self,
        source_account: &str,
        source_uid: Uid,
        target_account: &str,
        target_uid: Uid,
        chain_depth: u32,
    ) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO cross_account_moves
                    (source_account, source_uid, target_account, target_uid, chain_depth, moved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (source_account, source_uid) DO NOTHING",
                params![
                    source_account,
                    uid_value(source_uid),
                    target_account,
                    uid_value(target_uid),
                    i64::from(chain_depth),
                    timestamp(Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_cross_account_move: {e}")))?;

        debug!(
            source_account,
            source_uid = %source_uid,
            target_account,
            target_uid = %target_uid,
            chain_depth,
            "Recorded cross-account move"
        );
        Ok(inserted > 0)
    }

    async fn get_cross_account_move(
        &self,
        source_account: &str,
        source_uid: Uid,
    ) -> Result<Option<CrossAccountMoveRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MOVE_COLUMNS} FROM cross_account_moves
                     WHERE source_account = ?1 AND source_uid = ?2"
                ),
                params![source_account, uid_value(source_uid)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_cross_account_move: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_move(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_cross_account_move: {e}"))),
        }
    }

    async fn chain_depth_of(&self, account: &str, uid: Uid) -> Result<Option<u32>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT MAX(chain_depth) FROM cross_account_moves
                 WHERE target_account = ?1 AND target_uid = ?2",
                params![account, uid_value(uid)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("chain_depth_of: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("chain_depth_of: {e}")))?;

        // MAX over no rows yields a single NULL.
        match row.and_then(|r| r.get::<i64>(0).ok()) {
            Some(depth) => u32::try_from(depth)
                .map(Some)
                .map_err(|_| DatabaseError::Serialization(format!("chain_depth: {depth}"))),
            None => Ok(None),
        }
    }

    async fn cleanup(&self, retention_days: u32) -> Result<CleanupReport, DatabaseError> {
        let cutoff = days_before(Utc::now(), retention_days);
        if cutoff == DateTime::<Utc>::MIN_UTC {
            debug!(retention_days, "Retention reaches past the earliest timestamp, nothing to delete");
            return Ok(CleanupReport::default());
        }
        let report = self.cleanup_before(cutoff).await?;
        info!(
            retention_days,
            processed_deleted = report.processed_deleted,
            moves_deleted = report.moves_deleted,
            "Idempotency store cleanup complete"
        );
        Ok(report)
    }

    async fn processed_count(&self, account: &str) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM processed_messages WHERE account = ?1",
                params![account],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("processed_count: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("processed_count: {e}")))?;
        match row {
            Some(row) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("processed_count: {e}")))?;
                Ok(count.max(0) as u64)
            }
            None => Ok(0),
        }
    }
}
