//! Error types for mailflow.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Processor error: {0}")]
    Processor(#[from] ProcessorError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Duplicate rule name: {0}")]
    DuplicateRule(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Whether an operation that failed may succeed if attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Permanent,
}

/// Mailbox gateway errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transient protocol error: {0}")]
    Transient(String),

    #[error("Authentication failed for {account}: {reason}")]
    Auth { account: String, reason: String },

    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    #[error("Message {uid} not found in {folder}")]
    MessageNotFound { folder: String, uid: u32 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Unknown account: {0}")]
    UnknownAccount(String),
}

impl GatewayError {
    /// Classify the error for the retry policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Connection(_) | Self::Timeout(_) | Self::Transient(_) => ErrorClass::Retryable,
            Self::Auth { .. }
            | Self::FolderNotFound(_)
            | Self::MessageNotFound { .. }
            | Self::Protocol(_)
            | Self::NotConnected
            | Self::UnknownAccount(_) => ErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

/// Backup collaborator errors. Logged, never fatal to a delete.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("Backup of message {uid} failed: {reason}")]
    Failed { uid: u32, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Account processor errors.
///
/// `Connect`, `Authenticate`, `OpenFolder` and `Search` abort the whole
/// account run. `Gateway` and `Database` fail a single message.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("Connect to {account} failed: {source}")]
    Connect {
        account: String,
        #[source]
        source: GatewayError,
    },

    #[error("Authentication for {account} failed: {source}")]
    Authenticate {
        account: String,
        #[source]
        source: GatewayError,
    },

    #[error("Opening folder {folder} failed: {source}")]
    OpenFolder {
        folder: String,
        #[source]
        source: GatewayError,
    },

    #[error("Searching folder {folder} failed: {source}")]
    Search {
        folder: String,
        #[source]
        source: GatewayError,
    },

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
