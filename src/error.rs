//! Error types for the outreach sequencer.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Recipient with email {0} already exists")]
    DuplicateEmail(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Outbound mail transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build message: {0}")]
    Build(String),

    #[error("SMTP send via {host} failed: {reason}")]
    SendFailed { host: String, reason: String },

    #[error("SMTP task failed: {0}")]
    Task(String),
}

/// Mailbox (IMAP) errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Failed to connect to {host}:{port}: {reason}")]
    ConnectFailed {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Login failed for {user}")]
    AuthFailed { user: String },

    #[error("IMAP command {command} failed: {reason}")]
    Command { command: String, reason: String },

    #[error("IMAP read timed out after {0:?}")]
    Timeout(Duration),

    #[error("IMAP session already closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that abort a dispatch invocation.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("No sender credentials found (wanted {kind})")]
    NoCredential { kind: String },

    #[error("Template \"{name}\" not found or inactive")]
    NoActiveTemplate { name: String },

    #[error("Send to {email} failed: {source}")]
    Send {
        email: String,
        #[source]
        source: TransportError,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Errors that abort a reconciliation invocation.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("No email provided and no credentials found")]
    NoCredential,

    #[error("IMAP credential for {email} not found or incomplete")]
    IncompleteCredential { email: String },

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Lead submission rejections.
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("Email is required")]
    MissingEmail,

    #[error("Invalid email address {address}: {reason}")]
    InvalidEmail { address: String, reason: String },

    #[error("This email is already registered: {0}")]
    Duplicate(String),

    #[error("Database error: {0}")]
    Database(DatabaseError),
}

impl From<DatabaseError> for IntakeError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::DuplicateEmail(email) => Self::Duplicate(email),
            other => Self::Database(other),
        }
    }
}
