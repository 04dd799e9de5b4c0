//! # Queue Exchange
//!
//! Time-bounded access tokens and transactional message exchange against
//! queue/topic brokers with at-least-once delivery.
//!
//! This library provides:
//! - Shared access signature issuing, parsing and verification
//! - Authenticated single-role connections to queues, topics and subscriptions
//! - All-or-nothing batch sends inside transaction units
//! - Peek-lock receiving with transactional completion and forwarding
//! - A lease-based queue client (visibility timeouts and pop receipts)
//! - Blocking and non-blocking execution over the same operations
//! - An in-memory broker with fault injection
//!
//! ## Module Organization
//!
//! - [`token`] - Token issuing and verification
//! - [`connection`] - Connection strings, the connection factory and handles
//! - [`transport`] - The broker boundary traits
//! - [`sender`], [`receiver`], [`lease`] - Exchange operations
//! - [`subscription`], [`blocking`] - Execution modes
//! - [`providers`] - Broker implementations

pub mod blocking;
pub mod clock;
pub mod config;
pub mod connection;
pub mod credential;
pub mod error;
pub mod lease;
pub mod message;
pub mod providers;
pub mod receiver;
pub mod retry;
pub mod sender;
pub mod subscription;
pub mod token;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use blocking::BlockingExchange;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ExchangeConfig;
pub use connection::{
    AuthMode, ConnectionFactory, ConnectionHandle, ConnectionString, TransactionState,
    TransactionUnit,
};
pub use credential::{Credential, SharedKey};
pub use error::{
    ConfigurationError, ConnectionError, CredentialError, DeliveryError, ExchangeError,
    TransactionError, ValidationError,
};
pub use lease::LeaseQueueClient;
pub use message::{
    BatchSummary, EntityAddress, EntityName, EntityProperties, LeasedMessage, LockToken,
    MessageId, OutboundMessage, PopReceipt, ReceiveOutcome, ReceivedMessage, SendReceipt,
    SendResult, Timestamp, TransactionId,
};
pub use providers::{InMemoryBroker, InMemoryConfig};
pub use receiver::LockModeReceiver;
pub use retry::RetryPolicy;
pub use sender::TransactionalSender;
pub use subscription::{Cancellation, Completion, Notification, Subscription};
pub use token::{SignedToken, TokenIssuer};
pub use transport::{BrokerLink, BrokerTransport, Role};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
