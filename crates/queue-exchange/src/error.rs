//! Error types for token issuing and message exchange.

use crate::transport::Role;
use std::time::Duration;
use thiserror::Error;

/// Top-level error for every exchange operation
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Operation cancelled before completion")]
    Cancelled,

    #[error("Runtime error: {message}")]
    Runtime { message: String },
}

impl ExchangeError {
    /// Check if error is transient and the operation may be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Credential(_) => false,
            Self::Connection(e) => e.is_transient(),
            // The unit's outcome is unknown; the caller must inspect before retrying
            Self::Transaction(_) => false,
            Self::Delivery(e) => e.is_transient(),
            Self::Validation(_) => false,
            Self::Configuration(_) => false,
            Self::Timeout { .. } => true,
            Self::Cancelled => false,
            Self::Runtime { .. } => false,
        }
    }

    /// Check if error should be retried
    pub fn should_retry(&self) -> bool {
        self.is_transient()
    }

    /// Get suggested retry delay
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Connection(ConnectionError::HandshakeFailed { .. }) => {
                Some(Duration::from_secs(5))
            }
            Self::Delivery(DeliveryError::EnqueueFailed { .. }) => Some(Duration::from_secs(1)),
            Self::Timeout { .. } => Some(Duration::from_secs(1)),
            _ => None,
        }
    }
}

/// Failures while signing, encoding, parsing or verifying a token
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("Resource URI must not be empty")]
    EmptyResourceUri,

    #[error("Key name must not be empty")]
    EmptyKeyName,

    #[error("Shared key must not be empty")]
    EmptyKey,

    #[error("Token validity must be at least one second")]
    InvalidValidity,

    #[error("Token expiry overflows the epoch range (validity {validity_secs}s)")]
    ExpiryOverflow { validity_secs: u64 },

    #[error("Failed to initialise HMAC-SHA256: {message}")]
    SigningFailed { message: String },

    #[error("Failed to decode token field '{field}': {message}")]
    Encoding { field: String, message: String },

    #[error("Malformed token: {message}")]
    MalformedToken { message: String },

    #[error("Token signature does not match")]
    SignatureMismatch,

    #[error("Token for '{resource}' expired at epoch second {expired_at}")]
    Expired { resource: String, expired_at: i64 },
}

/// Handshake, authorization and handle lifecycle failures
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Handshake with '{entity}' failed: {message}")]
    HandshakeFailed { entity: String, message: String },

    #[error("Not authorized for '{entity}': {message}")]
    Unauthorized { entity: String, message: String },

    #[error("Entity not found: {entity}")]
    EntityNotFound { entity: String },

    #[error("Connection to '{entity}' is already closed")]
    Closed { entity: String },

    #[error("Connection to '{entity}' was opened as {actual:?}, operation requires {expected:?}")]
    RoleMismatch {
        entity: String,
        expected: Role,
        actual: Role,
    },

    #[error("Malformed connection string: {message}")]
    MalformedConnectionString { message: String },

    #[error("Failed to close connection to '{entity}': {message}")]
    CloseFailed { entity: String, message: String },

    #[error("Link to '{entity}' was detached by the broker: {message}")]
    LinkDetached { entity: String, message: String },
}

impl ConnectionError {
    /// Check if error is transient and the connect attempt may be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::HandshakeFailed { .. } => true,
            Self::Unauthorized { .. } => false,
            Self::EntityNotFound { .. } => false,
            Self::Closed { .. } => false,
            Self::RoleMismatch { .. } => false,
            Self::MalformedConnectionString { .. } => false,
            Self::CloseFailed { .. } => true,
            Self::LinkDetached { .. } => true,
        }
    }
}

/// Transaction unit failures
///
/// A failed commit or rollback leaves the unit's outcome indeterminate from the
/// caller's point of view. It must never be treated as committed.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Commit of transaction {transaction_id} failed: {message}")]
    CommitFailed {
        transaction_id: String,
        message: String,
    },

    #[error("Rollback of transaction {transaction_id} failed: {message} (after: {cause})")]
    RollbackFailed {
        transaction_id: String,
        message: String,
        cause: String,
    },

    #[error("Transaction {transaction_id} is not open (state: {state})")]
    NotOpen {
        transaction_id: String,
        state: String,
    },

    #[error("Unknown transaction: {transaction_id}")]
    Unknown { transaction_id: String },
}

/// Per-message send, receive and settlement failures
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Enqueue of message {index} to '{entity}' failed: {message}")]
    EnqueueFailed {
        entity: String,
        index: usize,
        message: String,
    },

    #[error("Lock {lock_token} was lost or has expired")]
    LockLost { lock_token: String },

    #[error("Message with lock {lock_token} is already settled")]
    AlreadySettled { lock_token: String },

    #[error("Lease on message {message_id} was lost (stale pop receipt or expired visibility)")]
    LeaseLost { message_id: String },

    #[error("Message not found: {message_id}")]
    MessageNotFound { message_id: String },

    #[error("Settlement of lock {lock_token} failed: {message}")]
    SettlementFailed { lock_token: String, message: String },

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },
}

impl DeliveryError {
    /// Check if error is transient
    pub fn is_transient(&self) -> bool {
        match self {
            Self::EnqueueFailed { .. } => true,
            Self::LockLost { .. } => false,
            Self::AlreadySettled { .. } => false,
            Self::LeaseLost { .. } => false,
            Self::MessageNotFound { .. } => false,
            Self::SettlementFailed { .. } => true,
            Self::MessageTooLarge { .. } => false,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

/// Validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
