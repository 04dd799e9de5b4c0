//! Message types for exchange operations including core domain identifiers.

use crate::error::ValidationError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated queue, topic or subscription name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityName(String);

impl EntityName {
    /// Create new entity name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        // Validate length
        if name.is_empty() || name.len() > 260 {
            return Err(ValidationError::OutOfRange {
                field: "entity_name".to_string(),
                message: "must be 1-260 characters".to_string(),
            });
        }

        // Validate characters (ASCII alphanumeric, hyphens, underscores, periods)
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(ValidationError::InvalidFormat {
                field: "entity_name".to_string(),
                message: "only ASCII alphanumeric, hyphens, underscores and periods allowed"
                    .to_string(),
            });
        }

        // Validate no consecutive hyphens or leading/trailing hyphens
        if name.starts_with('-') || name.ends_with('-') || name.contains("--") {
            return Err(ValidationError::InvalidFormat {
                field: "entity_name".to_string(),
                message: "no leading/trailing hyphens or consecutive hyphens".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get entity name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// The broker entity a connection is bound to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityAddress {
    /// Point-to-point queue (send and receive)
    Queue(EntityName),
    /// Topic (send only)
    Topic(EntityName),
    /// Subscription on a topic (receive only)
    Subscription {
        topic: EntityName,
        subscription: EntityName,
    },
}

impl EntityAddress {
    /// Queue address from a raw name
    pub fn queue(name: &str) -> Result<Self, ValidationError> {
        Ok(Self::Queue(name.parse()?))
    }

    /// Topic address from a raw name
    pub fn topic(name: &str) -> Result<Self, ValidationError> {
        Ok(Self::Topic(name.parse()?))
    }

    /// Subscription address from raw topic and subscription names
    pub fn subscription(topic: &str, subscription: &str) -> Result<Self, ValidationError> {
        Ok(Self::Subscription {
            topic: topic.parse()?,
            subscription: subscription.parse()?,
        })
    }

    /// Broker-relative path of the entity
    pub fn path(&self) -> String {
        match self {
            Self::Queue(name) | Self::Topic(name) => name.to_string(),
            Self::Subscription {
                topic,
                subscription,
            } => format!("{}/subscriptions/{}", topic, subscription),
        }
    }

    /// Whether messages can be sent to this entity
    pub fn accepts_sends(&self) -> bool {
        matches!(self, Self::Queue(_) | Self::Topic(_))
    }

    /// Whether messages can be received from this entity
    pub fn accepts_receives(&self) -> bool {
        matches!(self, Self::Queue(_) | Self::Subscription { .. })
    }
}

impl std::fmt::Display for EntityAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path())
    }
}

/// Unique identifier for messages within the broker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        let id = uuid::Uuid::new_v4();
        Self(id.to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Opaque capability to settle one peek-locked delivery
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// Wrap a broker-issued lock token
    pub fn new(token: String) -> Self {
        Self(token)
    }

    /// Generate a fresh random lock token
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get lock token as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque capability to delete or update one leased message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PopReceipt(String);

impl PopReceipt {
    /// Wrap a broker-issued pop receipt
    pub fn new(receipt: String) -> Self {
        Self(receipt)
    }

    /// Generate a fresh random pop receipt
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get pop receipt as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PopReceipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Broker-side identifier of a transaction unit
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(String);

impl TransactionId {
    /// Wrap a broker-issued transaction identifier
    pub fn new(id: String) -> Self {
        Self(id)
    }

    /// Get transaction ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Create timestamp from whole seconds since the Unix epoch
    pub fn from_epoch_seconds(seconds: i64) -> Option<Self> {
        DateTime::from_timestamp(seconds, 0).map(Self)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Whole seconds since the Unix epoch
    pub fn epoch_seconds(&self) -> i64 {
        self.0.timestamp()
    }

    /// Add a duration, returning `None` on overflow
    pub fn checked_add(&self, duration: Duration) -> Option<Self> {
        let delta = chrono::Duration::from_std(duration).ok()?;
        self.0.checked_add_signed(delta).map(Self)
    }

    /// Add a duration, clamping at the maximum representable time
    pub fn saturating_add(&self, duration: Duration) -> Self {
        self.checked_add(duration)
            .unwrap_or(Self(DateTime::<Utc>::MAX_UTC))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = s.parse::<DateTime<Utc>>()?;
        Ok(Self::from_datetime(dt))
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// A message to be sent to a queue or topic
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub body: Bytes,
    pub message_id: Option<MessageId>,
    pub correlation_id: Option<String>,
    pub properties: HashMap<String, String>,
}

impl OutboundMessage {
    /// Create new message with body
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            message_id: None,
            correlation_id: None,
            properties: HashMap::new(),
        }
    }

    /// Create a message whose body is UTF-8 text
    pub fn from_text(text: &str) -> Self {
        Self::new(Bytes::copy_from_slice(text.as_bytes()))
    }

    /// Set an explicit message ID (otherwise the broker assigns one)
    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = Some(message_id);
        self
    }

    /// Add correlation ID for tracking
    pub fn with_correlation_id(mut self, correlation_id: String) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Add application property
    pub fn with_property(mut self, key: String, value: String) -> Self {
        self.properties.insert(key, value);
        self
    }
}

/// A message delivered under peek-lock
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub body: Bytes,
    pub correlation_id: Option<String>,
    pub properties: HashMap<String, String>,
    pub lock_token: LockToken,
    pub delivery_count: u32,
    pub enqueued_at: Timestamp,
    pub locked_until: Timestamp,
}

impl ReceivedMessage {
    /// Body as UTF-8 text, if it is valid UTF-8
    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Convert back to an outbound message (for forwarding)
    pub fn to_outbound(&self) -> OutboundMessage {
        OutboundMessage {
            body: self.body.clone(),
            message_id: None,
            correlation_id: self.correlation_id.clone(),
            properties: self.properties.clone(),
        }
    }

    /// Check whether the lock has lapsed at the given instant
    pub fn is_lock_expired_at(&self, now: Timestamp) -> bool {
        now >= self.locked_until
    }
}

/// A message leased from a plain queue under a visibility timeout
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedMessage {
    pub message_id: MessageId,
    pub body: Bytes,
    pub pop_receipt: PopReceipt,
    pub dequeue_count: u32,
    pub inserted_at: Timestamp,
    pub visible_at: Timestamp,
}

impl LeasedMessage {
    /// Body as UTF-8 text, if it is valid UTF-8
    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

// ============================================================================
// Operation Results
// ============================================================================

/// Outcome of a committed transactional send
#[derive(Debug, Clone, PartialEq)]
pub struct SendResult {
    pub entity: String,
    pub transaction_id: Option<TransactionId>,
    pub message_ids: Vec<MessageId>,
}

/// Outcome of a committed receive-and-complete batch
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiveOutcome {
    pub entity: String,
    pub transaction_id: Option<TransactionId>,
    pub messages: Vec<ReceivedMessage>,
}

impl ReceiveOutcome {
    /// Bodies of the completed messages decoded as UTF-8 (lossy)
    pub fn texts(&self) -> Vec<String> {
        self.messages
            .iter()
            .map(|m| String::from_utf8_lossy(&m.body).into_owned())
            .collect()
    }
}

/// Terminal summary delivered by non-blocking operations
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSummary {
    pub entity: String,
    pub transaction_id: Option<TransactionId>,
    pub count: usize,
}

/// Receipt for a message added to a plain (lease) queue
#[derive(Debug, Clone, PartialEq)]
pub struct SendReceipt {
    pub message_id: MessageId,
    pub pop_receipt: PopReceipt,
    pub inserted_at: Timestamp,
}

/// Entity statistics reported by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityProperties {
    pub entity: String,
    /// Best-effort count; eventually consistent on real brokers
    pub approximate_message_count: u64,
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
