//! Mailbox gateway: the narrow interface the pipeline consumes.
//!
//! Implementations own one connection to one account. Protocol details
//! (TLS, OAuth2, IMAP wire format) live behind this trait; the pipeline only
//! sees folders, UIDs and message snapshots.

#[cfg(any(test, feature = "test-support"))]
pub mod memory;

#[cfg(any(test, feature = "test-support"))]
pub use memory::{MemoryGateway, MemoryServer, OpKind, Operation};

use async_trait::async_trait;
use secrecy::SecretString;

use crate::config::AccountConfig;
use crate::error::{BackupError, GatewayError};
use crate::pipeline::types::{Flag, FolderHandle, Message, Uid};

/// Login material for `authenticate`.
#[derive(Debug, Clone, Copy)]
pub struct Credentials<'a> {
    pub username: &'a str,
    pub password: &'a SecretString,
}

impl<'a> Credentials<'a> {
    pub fn for_account(account: &'a AccountConfig) -> Self {
        Self {
            username: &account.username,
            password: &account.password,
        }
    }
}

/// One authenticated mailbox connection.
///
/// UIDs returned by `search_unprocessed`, `move_message` and `append` must be
/// stable across sessions for the same message and unique within the
/// account, across all of its folders. Processed-message records and
/// transfer records are keyed by (account, UID) alone, so a UID reused in a
/// second folder would be treated as already processed.
#[async_trait]
pub trait MailboxGateway: Send + Sync {
    async fn connect(&self, host: &str, port: u16, use_tls: bool) -> Result<(), GatewayError>;

    async fn authenticate(&self, credentials: Credentials<'_>) -> Result<(), GatewayError>;

    async fn open_folder(&self, path: &str, read_write: bool)
    -> Result<FolderHandle, GatewayError>;

    /// Candidate UIDs in the folder (not flagged deleted), ascending.
    /// Local idempotency filtering is the caller's job.
    async fn search_unprocessed(&self, folder: &FolderHandle) -> Result<Vec<Uid>, GatewayError>;

    async fn fetch_message(&self, folder: &FolderHandle, uid: Uid)
    -> Result<Message, GatewayError>;

    /// Move a message. Returns the UID in the destination when the server
    /// reports it.
    async fn move_message(
        &self,
        folder: &str,
        uid: Uid,
        dest_folder: &str,
    ) -> Result<Option<Uid>, GatewayError>;

    /// Append a message to a folder, returning its new UID.
    async fn append(&self, folder: &str, message: &Message) -> Result<Uid, GatewayError>;

    async fn set_flags(&self, folder: &str, uid: Uid, flags: &[Flag])
    -> Result<(), GatewayError>;

    async fn clear_flags(
        &self,
        folder: &str,
        uid: Uid,
        flags: &[Flag],
    ) -> Result<(), GatewayError>;

    /// Permanently remove messages flagged deleted.
    async fn expunge(&self, folder: &str) -> Result<(), GatewayError>;

    async fn folder_exists(&self, path: &str) -> Result<bool, GatewayError>;

    async fn create_folder(&self, path: &str) -> Result<(), GatewayError>;

    async fn disconnect(&self) -> Result<(), GatewayError>;
}

/// Builds fresh, unconnected gateways for an account's own run.
pub trait GatewayFactory: Send + Sync {
    fn create(&self, account: &AccountConfig) -> Box<dyn MailboxGateway>;
}

/// Opens connected, authenticated gateways for cross-account transfers.
#[async_trait]
pub trait AccountConnector: Send + Sync {
    async fn open_account(&self, account: &str) -> Result<Box<dyn MailboxGateway>, GatewayError>;
}

/// Takes a snapshot of a message before it is deleted.
#[async_trait]
pub trait BackupPolicy: Send + Sync {
    async fn backup(&self, account: &str, message: &Message) -> Result<(), BackupError>;
}
