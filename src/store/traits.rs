//! `IdempotencyStore` trait: durable record of which messages have been
//! handled and which arrived through a cross-account transfer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::pipeline::types::Uid;

/// A message that completed a processing run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedRecord {
    pub account: String,
    pub uid: Uid,
    pub processed_at: DateTime<Utc>,
    /// Names of the rules whose actions ran, in evaluation order.
    pub rules_applied: Vec<String>,
    /// `Message-ID` header.
    pub message_id: Option<String>,
    pub subject: Option<String>,
}

/// A transfer of one message from one account to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossAccountMoveRecord {
    pub source_account: String,
    pub source_uid: Uid,
    pub target_account: String,
    pub target_uid: Uid,
    /// Hop count of the lineage after this transfer.
    pub chain_depth: u32,
    pub moved_at: DateTime<Utc>,
}

/// Rows removed by a cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub processed_deleted: u64,
    pub moves_deleted: u64,
}

/// Backend-agnostic idempotency store.
///
/// Writes are insert-if-absent so concurrent account processors sharing
/// one backing database never clobber each other.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn is_processed(&self, account: &str, uid: Uid) -> Result<bool, DatabaseError>;

    /// Record a processed message. Returns `false` if a record already
    /// existed; the existing record is left unchanged.
    async fn mark_processed(
        &self,
        account: &str,
        uid: Uid,
        rules_applied: &[String],
        message_id: Option<&str>,
        subject: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    async fn get_processed(
        &self,
        account: &str,
        uid: Uid,
    ) -> Result<Option<ProcessedRecord>, DatabaseError>;

    /// Record a transfer keyed by its source. Returns `false` if the source
    /// was already recorded.
    async fn mark_cross_account_move(
        &self,
        source_account: &str,
        source_uid: Uid,
        target_account: &str,
        target_uid: Uid,
        chain_depth: u32,
    ) -> Result<bool, DatabaseError>;

    async fn get_cross_account_move(
        &self,
        source_account: &str,
        source_uid: Uid,
    ) -> Result<Option<CrossAccountMoveRecord>, DatabaseError>;

    /// Whether `(account, uid)` is the target copy of a recorded transfer.
    async fn is_from_cross_account_move(
        &self,
        account: &str,
        uid: Uid,
    ) -> Result<bool, DatabaseError> {
        Ok(self.chain_depth_of(account, uid).await?.is_some())
    }

    /// Chain depth of the transfer that produced `(account, uid)`, if any.
    async fn chain_depth_of(&self, account: &str, uid: Uid) -> Result<Option<u32>, DatabaseError>;

    /// Delete records older than `retention_days`, keeping open chains.
    async fn cleanup(&self, retention_days: u32) -> Result<CleanupReport, DatabaseError>;

    async fn processed_count(&self, account: &str) -> Result<u64, DatabaseError>;
}
