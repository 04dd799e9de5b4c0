//! Broker boundary.
//!
//! The exchange never speaks a wire protocol itself. A [`BrokerTransport`]
//! performs the authenticated handshake and hands back a [`BrokerLink`]: a
//! single-entity, single-role channel exposing the broker primitives the
//! sender, receiver and lease client are built from.
//!
//! Implementations must roll back every transaction still open on a link when
//! that link is closed.

use crate::connection::ConnectionString;
use crate::credential::SharedKey;
use crate::error::ExchangeError;
use crate::message::{
    EntityAddress, EntityProperties, LeasedMessage, LockToken, MessageId, OutboundMessage,
    PopReceipt, ReceivedMessage, SendReceipt, TransactionId,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Direction a connection is opened for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Sender,
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sender => write!(f, "sender"),
            Self::Receiver => write!(f, "receiver"),
        }
    }
}

/// Proof of access presented during the handshake
#[derive(Clone)]
pub enum Authorization {
    /// Connection string embedding a signed, time-bounded token
    SharedAccessSignature(ConnectionString),
    /// The long-lived shared key itself
    SharedKey { key_name: String, key: SharedKey },
}

impl fmt::Debug for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SharedAccessSignature(connection_string) => f
                .debug_tuple("SharedAccessSignature")
                .field(connection_string)
                .finish(),
            Self::SharedKey { key_name, key } => f
                .debug_struct("SharedKey")
                .field("key_name", key_name)
                .field("key", key)
                .finish(),
        }
    }
}

/// Everything a transport needs to open a link
#[derive(Debug, Clone)]
pub struct LinkRequest {
    /// `<namespace>.<broker_domain>`
    pub endpoint: String,
    pub entity: EntityAddress,
    pub role: Role,
    pub authorization: Authorization,
}

/// Opens authenticated links to broker entities
#[async_trait]
pub trait BrokerTransport: Send + Sync + fmt::Debug {
    /// Perform the handshake for one entity and role
    async fn open_link(&self, request: LinkRequest) -> Result<Box<dyn BrokerLink>, ExchangeError>;
}

/// An open, authenticated channel to one entity
///
/// Peek-lock operations apply to queues and subscriptions; lease operations
/// apply to queues only. Transaction-enrolled work stays provisional until the
/// unit commits.
#[async_trait]
pub trait BrokerLink: Send + Sync + fmt::Debug {
    /// Broker-assigned link identifier (for logging)
    fn link_id(&self) -> &str;

    /// Open a new transaction unit on this link
    async fn create_transaction(&self) -> Result<TransactionId, ExchangeError>;

    /// Make every operation enrolled in the unit visible atomically
    async fn commit_transaction(&self, transaction: &TransactionId) -> Result<(), ExchangeError>;

    /// Discard every operation enrolled in the unit
    async fn rollback_transaction(&self, transaction: &TransactionId)
        -> Result<(), ExchangeError>;

    /// Enqueue a message, provisionally when a transaction is given
    async fn enqueue(
        &self,
        message: &OutboundMessage,
        transaction: Option<&TransactionId>,
    ) -> Result<MessageId, ExchangeError>;

    /// Lock up to `max_count` messages, waiting at most `wait_timeout` for the first
    async fn receive_locked(
        &self,
        max_count: usize,
        wait_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, ExchangeError>;

    /// Remove a locked message, provisionally when a transaction is given
    async fn complete(
        &self,
        lock_token: &LockToken,
        transaction: Option<&TransactionId>,
    ) -> Result<(), ExchangeError>;

    /// Release a lock so the message can be delivered again
    async fn abandon(&self, lock_token: &LockToken) -> Result<(), ExchangeError>;

    /// Add a message to a lease queue
    async fn enqueue_leased(&self, body: Bytes) -> Result<SendReceipt, ExchangeError>;

    /// Lease up to `count` messages for `visibility_timeout`
    async fn receive_leased(
        &self,
        count: usize,
        visibility_timeout: Duration,
        wait_timeout: Duration,
    ) -> Result<Vec<LeasedMessage>, ExchangeError>;

    /// Delete a leased message; the receipt must be current
    async fn delete_leased(
        &self,
        message_id: &MessageId,
        pop_receipt: &PopReceipt,
    ) -> Result<(), ExchangeError>;

    /// Replace content and lease of a leased message, returning the new receipt
    async fn update_leased(
        &self,
        message_id: &MessageId,
        pop_receipt: &PopReceipt,
        body: Bytes,
        visibility_timeout: Duration,
    ) -> Result<PopReceipt, ExchangeError>;

    /// Entity statistics
    async fn properties(&self) -> Result<EntityProperties, ExchangeError>;

    /// Close the link, rolling back any transaction still open on it
    async fn close(&self) -> Result<(), ExchangeError>;
}
