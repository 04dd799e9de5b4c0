//! In-memory broker for testing and development.
//!
//! This module provides a fully functional in-memory [`BrokerTransport`] that:
//! - Authenticates links with signed tokens or shared keys against registered policies
//! - Implements peek-lock delivery with lock expiry and delivery counts
//! - Implements lease (visibility timeout) delivery with pop receipts
//! - Supports transaction units spanning sends and completions
//! - Fans topic messages out to their subscriptions
//! - Injects one-shot faults for exercising failure paths
//!
//! Lock and lease windows are evaluated against an injected [`Clock`], so a
//! [`ManualClock`](crate::clock::ManualClock) can expire them deterministically.
//! Expired locks are reclaimed whenever the entity is next touched, and a
//! receiver waiting on the entity re-checks no later than the earliest expiry.

use crate::clock::{Clock, SystemClock};
use crate::credential::SharedKey;
use crate::error::{
    ConnectionError, DeliveryError, ExchangeError, TransactionError, ValidationError,
};
use crate::message::{
    EntityAddress, EntityProperties, LeasedMessage, LockToken, MessageId, OutboundMessage,
    PopReceipt, ReceivedMessage, SendReceipt, Timestamp, TransactionId,
};
use crate::transport::{Authorization, BrokerLink, BrokerTransport, LinkRequest};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Longest a waiting receive sleeps while a lock or lease on its entity is pending
///
/// Bounds the wait when the broker clock is not wall time.
const EXPIRY_RECHECK: Duration = Duration::from_millis(100);

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// In-memory broker configuration
#[derive(Debug, Clone)]
pub struct InMemoryConfig {
    /// How long a peek-lock is held before the message becomes visible again
    pub lock_duration: Duration,
    /// Largest accepted message body in bytes
    pub max_message_size: usize,
    /// Create queues and topics on first use
    pub auto_create_entities: bool,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(60),
            max_message_size: 256 * 1024,
            auto_create_entities: true,
        }
    }
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntityKind {
    Queue,
    Topic,
    Subscription,
}

#[derive(Debug)]
struct EntityState {
    kind: EntityKind,
    /// FIFO order; locked and leased messages keep their position
    messages: VecDeque<StoredMessage>,
    /// Subscription paths (topics only)
    subscriptions: Vec<String>,
}

impl EntityState {
    fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            messages: VecDeque::new(),
            subscriptions: Vec::new(),
        }
    }

    /// Make expired, unsettled locks and leases visible again
    fn reclaim_expired(&mut self, now: Timestamp) {
        for message in self.messages.iter_mut() {
            let expired = match &message.delivery {
                Delivery::Locked {
                    until,
                    settling: None,
                    ..
                } => *until <= now,
                Delivery::Leased { until } => *until <= now,
                _ => false,
            };
            if expired {
                message.delivery = Delivery::Available;
                message.pop_receipt = None;
            }
        }
    }

    /// Earliest instant at which an unsettled lock or a lease lapses
    fn next_expiry(&self) -> Option<Timestamp> {
        self.messages
            .iter()
            .filter_map(|message| match &message.delivery {
                Delivery::Locked {
                    until,
                    settling: None,
                    ..
                } => Some(*until),
                Delivery::Leased { until } => Some(*until),
                _ => None,
            })
            .min()
    }

    fn locked_position(&self, lock_token: &LockToken) -> Option<usize> {
        self.messages.iter().position(|m| {
            matches!(&m.delivery, Delivery::Locked { token, .. } if token == lock_token)
        })
    }

    fn position_of(&self, message_id: &MessageId) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| &m.message_id == message_id)
    }
}

#[derive(Debug, Clone)]
enum Delivery {
    Available,
    Locked {
        token: LockToken,
        until: Timestamp,
        /// Completion enrolled in a transaction that has not resolved yet
        settling: Option<TransactionId>,
    },
    Leased {
        until: Timestamp,
    },
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: MessageId,
    body: Bytes,
    correlation_id: Option<String>,
    properties: HashMap<String, String>,
    enqueued_at: Timestamp,
    delivery_count: u32,
    delivery: Delivery,
    /// Current lease capability; `None` once the lease lapses
    pop_receipt: Option<PopReceipt>,
}

impl StoredMessage {
    fn from_outbound(message: &OutboundMessage, now: Timestamp) -> Self {
        Self {
            message_id: message.message_id.clone().unwrap_or_default(),
            body: message.body.clone(),
            correlation_id: message.correlation_id.clone(),
            properties: message.properties.clone(),
            enqueued_at: now,
            delivery_count: 0,
            delivery: Delivery::Available,
            pop_receipt: None,
        }
    }
}

#[derive(Debug)]
struct PendingTransaction {
    owner_link: String,
    sends: Vec<(String, StoredMessage)>,
    completions: Vec<(String, LockToken)>,
}

/// One-shot fault switches
#[derive(Debug, Default)]
struct Faults {
    handshake_failures: u32,
    enqueue_failure_at: Option<usize>,
    enqueues_seen: usize,
    complete_failure_at: Option<usize>,
    completes_seen: usize,
    fail_next_commit: bool,
    fail_next_rollback: bool,
}

impl Faults {
    fn trip_enqueue(&mut self) -> bool {
        let Some(at) = self.enqueue_failure_at else {
            return false;
        };
        self.enqueues_seen += 1;
        if self.enqueues_seen == at {
            self.enqueue_failure_at = None;
            self.enqueues_seen = 0;
            return true;
        }
        false
    }

    fn trip_complete(&mut self) -> bool {
        let Some(at) = self.complete_failure_at else {
            return false;
        };
        self.completes_seen += 1;
        if self.completes_seen == at {
            self.complete_failure_at = None;
            self.completes_seen = 0;
            return true;
        }
        false
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    keys: HashMap<String, SharedKey>,
    entities: HashMap<String, EntityState>,
    transactions: HashMap<TransactionId, PendingTransaction>,
    /// Settled lock token -> end of the lock it settled
    settled: HashMap<LockToken, Timestamp>,
    /// Open link id -> entity path
    links: HashMap<String, String>,
    faults: Faults,
    next_id: u64,
}

impl BrokerState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    /// Remember a settled lock until its window would have closed anyway
    fn settle(&mut self, token: LockToken, until: Timestamp, now: Timestamp) {
        self.settled.retain(|_, lapses| *lapses > now);
        self.settled.insert(token, until);
    }

    fn is_settled(&self, token: &LockToken, now: Timestamp) -> bool {
        self.settled.get(token).map_or(false, |until| *until > now)
    }

    fn entity_mut(&mut self, path: &str) -> Result<&mut EntityState, ConnectionError> {
        self.entities
            .get_mut(path)
            .ok_or_else(|| ConnectionError::EntityNotFound {
                entity: path.to_string(),
            })
    }

    /// Append a message to a queue or subscription, or fan it out from a topic
    fn deliver(&mut self, path: &str, message: StoredMessage) {
        let targets = match self.entities.get(path) {
            Some(entity) if entity.kind == EntityKind::Topic => entity.subscriptions.clone(),
            Some(_) => vec![path.to_string()],
            None => Vec::new(),
        };

        for target in targets {
            if let Some(entity) = self.entities.get_mut(&target) {
                entity.messages.push_back(message.clone());
            }
        }
    }

    /// Undo a transaction's provisional work
    fn release(&mut self, id: &TransactionId, pending: PendingTransaction, now: Timestamp) {
        for (path, token) in pending.completions {
            let Some(entity) = self.entities.get_mut(&path) else {
                continue;
            };
            let Some(message) = entity
                .locked_position(&token)
                .and_then(|p| entity.messages.get_mut(p))
            else {
                continue;
            };

            let mut expired = false;
            if let Delivery::Locked {
                until, settling, ..
            } = &mut message.delivery
            {
                if settling.as_ref() == Some(id) {
                    *settling = None;
                }
                expired = *until <= now;
            }
            if expired {
                message.delivery = Delivery::Available;
            }
        }
        debug!(transaction_id = %id, "Transaction released");
    }

    fn ensure_link(&self, link_id: &str, path: &str) -> Result<(), ConnectionError> {
        if self.links.contains_key(link_id) {
            Ok(())
        } else {
            Err(ConnectionError::Closed {
                entity: path.to_string(),
            })
        }
    }
}

#[derive(Debug)]
struct BrokerInner {
    endpoint: String,
    config: InMemoryConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<BrokerState>,
    available: Notify,
}

impl BrokerInner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

// ============================================================================
// InMemoryBroker
// ============================================================================

/// In-memory broker serving a single namespace endpoint
///
/// Clones share the same state.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    /// Create a broker for `endpoint` (e.g. `contoso.servicebus.windows.net`)
    pub fn new(endpoint: impl Into<String>, config: InMemoryConfig) -> Self {
        Self::with_clock(endpoint, config, Arc::new(SystemClock))
    }

    /// Create a broker whose lock, lease and token checks use `clock`
    pub fn with_clock(
        endpoint: impl Into<String>,
        config: InMemoryConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                endpoint: endpoint.into(),
                config,
                clock,
                state: Mutex::new(BrokerState::default()),
                available: Notify::new(),
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Register a shared access policy the broker accepts
    pub fn authorize_key(&self, key_name: impl Into<String>, key: SharedKey) {
        self.inner.lock().keys.insert(key_name.into(), key);
    }

    /// Create a queue (no-op if it exists)
    pub fn create_queue(&self, name: &str) -> Result<(), ExchangeError> {
        let address = EntityAddress::queue(name)?;
        self.inner
            .lock()
            .entities
            .entry(address.path())
            .or_insert_with(|| EntityState::new(EntityKind::Queue));
        Ok(())
    }

    /// Create a subscription on a topic, creating the topic if needed
    pub fn create_subscription(&self, topic: &str, subscription: &str) -> Result<(), ExchangeError> {
        let address = EntityAddress::subscription(topic, subscription)?;
        let path = address.path();

        let mut state = self.inner.lock();
        let topic_state = state
            .entities
            .entry(topic.to_string())
            .or_insert_with(|| EntityState::new(EntityKind::Topic));
        if topic_state.kind != EntityKind::Topic {
            return Err(ValidationError::InvalidFormat {
                field: "topic".to_string(),
                message: format!("'{}' already exists and is not a topic", topic),
            }
            .into());
        }
        if !topic_state.subscriptions.contains(&path) {
            topic_state.subscriptions.push(path.clone());
        }
        state
            .entities
            .entry(path)
            .or_insert_with(|| EntityState::new(EntityKind::Subscription));
        Ok(())
    }

    /// Committed messages stored in an entity, including locked and leased ones
    pub fn message_count(&self, path: &str) -> usize {
        self.inner
            .lock()
            .entities
            .get(path)
            .map(|e| e.messages.len())
            .unwrap_or(0)
    }

    /// Number of links that have been opened and not yet closed
    pub fn open_link_count(&self) -> usize {
        self.inner.lock().links.len()
    }

    /// Number of transaction units not yet committed or rolled back
    pub fn open_transaction_count(&self) -> usize {
        self.inner.lock().transactions.len()
    }

    // ------------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------------

    /// Fail the next `count` handshakes with a transient error
    pub fn fail_handshakes(&self, count: u32) {
        self.inner.lock().faults.handshake_failures = count;
    }

    /// Fail the `ordinal`-th enqueue (1-based) from now on, once
    pub fn fail_enqueue_at(&self, ordinal: usize) {
        let mut state = self.inner.lock();
        state.faults.enqueue_failure_at = Some(ordinal);
        state.faults.enqueues_seen = 0;
    }

    /// Fail the `ordinal`-th completion (1-based) from now on, once
    pub fn fail_complete_at(&self, ordinal: usize) {
        let mut state = self.inner.lock();
        state.faults.complete_failure_at = Some(ordinal);
        state.faults.completes_seen = 0;
    }

    /// Fail the next commit; the unit is rolled back broker-side
    pub fn fail_next_commit(&self) {
        self.inner.lock().faults.fail_next_commit = true;
    }

    /// Fail the next rollback; the unit stays open until its link closes
    pub fn fail_next_rollback(&self) {
        self.inner.lock().faults.fail_next_rollback = true;
    }

    // ------------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------------

    fn authorize(
        &self,
        state: &BrokerState,
        request: &LinkRequest,
        path: &str,
    ) -> Result<(), ConnectionError> {
        let unauthorized = |message: String| ConnectionError::Unauthorized {
            entity: path.to_string(),
            message,
        };

        if request.endpoint != self.inner.endpoint {
            return Err(unauthorized(format!(
                "unknown endpoint '{}'",
                request.endpoint
            )));
        }

        match &request.authorization {
            Authorization::SharedAccessSignature(connection_string) => {
                if connection_string.endpoint() != self.inner.endpoint {
                    return Err(unauthorized(format!(
                        "connection string endpoint '{}' does not match",
                        connection_string.endpoint()
                    )));
                }

                let token = connection_string.token();
                let key = state
                    .keys
                    .get(token.key_name())
                    .ok_or_else(|| unauthorized(format!("unknown key name '{}'", token.key_name())))?;

                token
                    .verify(key, self.inner.clock.now())
                    .map_err(|e| unauthorized(e.to_string()))?;

                let requested = format!("{}/{}", self.inner.endpoint, path);
                if !token.covers(&requested) {
                    return Err(unauthorized(format!(
                        "token scope '{}' does not cover '{}'",
                        token.resource_uri(),
                        requested
                    )));
                }
                Ok(())
            }
            Authorization::SharedKey { key_name, key } => {
                use subtle::ConstantTimeEq;

                let expected = state
                    .keys
                    .get(key_name)
                    .ok_or_else(|| unauthorized(format!("unknown key name '{}'", key_name)))?;
                let matches = expected.len() == key.len()
                    && bool::from(expected.expose_bytes().ct_eq(key.expose_bytes()));
                if matches {
                    Ok(())
                } else {
                    Err(unauthorized("shared key does not match".to_string()))
                }
            }
        }
    }

    fn resolve_entity(
        &self,
        state: &mut BrokerState,
        entity: &EntityAddress,
    ) -> Result<(), ConnectionError> {
        let path = entity.path();
        let (expected, creatable) = match entity {
            EntityAddress::Queue(_) => (EntityKind::Queue, true),
            EntityAddress::Topic(_) => (EntityKind::Topic, true),
            EntityAddress::Subscription { .. } => (EntityKind::Subscription, false),
        };

        match state.entities.get(&path) {
            Some(existing) if existing.kind == expected => Ok(()),
            Some(_) => Err(ConnectionError::EntityNotFound { entity: path }),
            None if creatable && self.inner.config.auto_create_entities => {
                debug!(entity = %path, "Auto-creating entity");
                state.entities.insert(path, EntityState::new(expected));
                Ok(())
            }
            None => Err(ConnectionError::EntityNotFound { entity: path }),
        }
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    async fn open_link(&self, request: LinkRequest) -> Result<Box<dyn BrokerLink>, ExchangeError> {
        let path = request.entity.path();
        let mut state = self.inner.lock();

        if state.faults.handshake_failures > 0 {
            state.faults.handshake_failures -= 1;
            return Err(ConnectionError::HandshakeFailed {
                entity: path,
                message: "injected handshake failure".to_string(),
            }
            .into());
        }

        self.authorize(&state, &request, &path)?;
        self.resolve_entity(&mut state, &request.entity)?;

        let link_id = state.next_id("link");
        state.links.insert(link_id.clone(), path.clone());

        info!(
            entity = %path,
            role = %request.role,
            link_id = %link_id,
            "Link attached"
        );

        Ok(Box::new(InMemoryLink {
            link_id,
            entity: request.entity,
            path,
            broker: Arc::clone(&self.inner),
        }))
    }
}

// ============================================================================
// InMemoryLink
// ============================================================================

#[derive(Debug)]
struct InMemoryLink {
    link_id: String,
    entity: EntityAddress,
    path: String,
    broker: Arc<BrokerInner>,
}

impl InMemoryLink {
    fn now(&self) -> Timestamp {
        self.broker.clock.now()
    }

    fn require_queue(&self) -> Result<(), ValidationError> {
        match self.entity {
            EntityAddress::Queue(_) => Ok(()),
            _ => Err(ValidationError::InvalidFormat {
                field: "entity".to_string(),
                message: format!("lease operations require a queue, not '{}'", self.path),
            }),
        }
    }

    fn deadline(wait_timeout: Duration) -> tokio::time::Instant {
        let now = tokio::time::Instant::now();
        now.checked_add(wait_timeout)
            .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
    }

    /// Run `take` until it yields at least one item or the wait elapses
    async fn wait_for<T, F>(&self, wait_timeout: Duration, mut take: F) -> Result<Vec<T>, ExchangeError>
    where
        F: FnMut(&mut BrokerState, Timestamp) -> Result<Vec<T>, ExchangeError> + Send,
        T: Send,
    {
        let deadline = Self::deadline(wait_timeout);

        loop {
            let notified = self.broker.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (batch, next_expiry) = {
                let mut state = self.broker.lock();
                let now = self.now();
                let batch = take(&mut *state, now)?;
                let next_expiry = state
                    .entities
                    .get(&self.path)
                    .and_then(EntityState::next_expiry)
                    .map(|until| {
                        (until.as_datetime() - now.as_datetime())
                            .to_std()
                            .unwrap_or(Duration::ZERO)
                    });
                (batch, next_expiry)
            };
            if !batch.is_empty() {
                return Ok(batch);
            }

            let wake_at = match next_expiry {
                Some(remaining) => {
                    deadline.min(tokio::time::Instant::now() + remaining.min(EXPIRY_RECHECK))
                }
                None => deadline,
            };
            if tokio::time::timeout_at(wake_at, notified).await.is_err()
                && tokio::time::Instant::now() >= deadline
            {
                return Ok(Vec::new());
            }
        }
    }
}

#[async_trait]
impl BrokerLink for InMemoryLink {
    fn link_id(&self) -> &str {
        &self.link_id
    }

    async fn create_transaction(&self) -> Result<TransactionId, ExchangeError> {
        let mut state = self.broker.lock();
        state.ensure_link(&self.link_id, &self.path)?;

        let id = TransactionId::new(state.next_id("txn"));
        state.transactions.insert(
            id.clone(),
            PendingTransaction {
                owner_link: self.link_id.clone(),
                sends: Vec::new(),
                completions: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn commit_transaction(&self, transaction: &TransactionId) -> Result<(), ExchangeError> {
        let now = self.now();
        let mut state = self.broker.lock();
        state.ensure_link(&self.link_id, &self.path)?;

        let pending = state
            .transactions
            .remove(transaction)
            .ok_or_else(|| TransactionError::Unknown {
                transaction_id: transaction.to_string(),
            })?;

        let commit_failed = |message: String| TransactionError::CommitFailed {
            transaction_id: transaction.to_string(),
            message,
        };

        if state.faults.fail_next_commit {
            state.faults.fail_next_commit = false;
            state.release(transaction, pending, now);
            return Err(commit_failed("injected commit failure".to_string()).into());
        }

        // Every enrolled completion must still hold a live lock
        let lapsed = pending.completions.iter().find(|(path, token)| {
            let held = state.entities.get(path).and_then(|entity| {
                entity
                    .locked_position(token)
                    .and_then(|p| entity.messages.get(p))
            });
            !matches!(
                held.map(|m| &m.delivery),
                Some(Delivery::Locked { until, settling: Some(id), .. })
                    if *until > now && id == transaction
            )
        });
        if let Some((_, token)) = lapsed {
            let message = format!("lock {} expired before commit", token);
            state.release(transaction, pending, now);
            self.broker.available.notify_waiters();
            return Err(commit_failed(message).into());
        }

        let completed = pending.completions.len();
        let sent = pending.sends.len();
        for (path, token) in pending.completions {
            let removed = state.entities.get_mut(&path).and_then(|entity| {
                entity
                    .locked_position(&token)
                    .and_then(|position| entity.messages.remove(position))
            });
            if let Some(Delivery::Locked { until, .. }) = removed.map(|m| m.delivery) {
                state.settle(token, until, now);
            }
        }
        for (path, message) in pending.sends {
            state.deliver(&path, message);
        }

        debug!(
            transaction_id = %transaction,
            sent,
            completed,
            "Transaction committed"
        );
        self.broker.available.notify_waiters();
        Ok(())
    }

    async fn rollback_transaction(&self, transaction: &TransactionId) -> Result<(), ExchangeError> {
        let now = self.now();
        let mut state = self.broker.lock();
        state.ensure_link(&self.link_id, &self.path)?;

        if state.faults.fail_next_rollback {
            state.faults.fail_next_rollback = false;
            return Err(ConnectionError::LinkDetached {
                entity: self.path.clone(),
                message: "injected rollback failure".to_string(),
            }
            .into());
        }

        let pending = state
            .transactions
            .remove(transaction)
            .ok_or_else(|| TransactionError::Unknown {
                transaction_id: transaction.to_string(),
            })?;
        state.release(transaction, pending, now);
        self.broker.available.notify_waiters();
        Ok(())
    }

    async fn enqueue(
        &self,
        message: &OutboundMessage,
        transaction: Option<&TransactionId>,
    ) -> Result<MessageId, ExchangeError> {
        let now = self.now();
        let mut state = self.broker.lock();
        state.ensure_link(&self.link_id, &self.path)?;

        let max_size = self.broker.config.max_message_size;
        if message.body.len() > max_size {
            return Err(DeliveryError::MessageTooLarge {
                size: message.body.len(),
                max_size,
            }
            .into());
        }

        let index = match transaction {
            Some(id) => state
                .transactions
                .get(id)
                .map(|pending| pending.sends.len())
                .ok_or_else(|| TransactionError::Unknown {
                    transaction_id: id.to_string(),
                })?,
            None => 0,
        };

        if state.faults.trip_enqueue() {
            return Err(DeliveryError::EnqueueFailed {
                entity: self.path.clone(),
                index,
                message: "injected transport failure".to_string(),
            }
            .into());
        }

        let stored = StoredMessage::from_outbound(message, now);
        let message_id = stored.message_id.clone();

        match transaction.and_then(|id| state.transactions.get_mut(id)) {
            Some(pending) => pending.sends.push((self.path.clone(), stored)),
            None => {
                state.deliver(&self.path, stored);
                self.broker.available.notify_waiters();
            }
        }

        Ok(message_id)
    }

    async fn receive_locked(
        &self,
        max_count: usize,
        wait_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, ExchangeError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let lock_duration = self.broker.config.lock_duration;
        self.wait_for(wait_timeout, |state, now| {
            state.ensure_link(&self.link_id, &self.path)?;
            let entity = state.entity_mut(&self.path)?;
            entity.reclaim_expired(now);

            let until = now.saturating_add(lock_duration);
            let mut batch = Vec::new();
            for message in entity.messages.iter_mut() {
                if batch.len() >= max_count {
                    break;
                }
                if !matches!(message.delivery, Delivery::Available) {
                    continue;
                }

                let token = LockToken::generate();
                message.delivery_count += 1;
                message.delivery = Delivery::Locked {
                    token: token.clone(),
                    until,
                    settling: None,
                };
                message.pop_receipt = None;

                batch.push(ReceivedMessage {
                    message_id: message.message_id.clone(),
                    body: message.body.clone(),
                    correlation_id: message.correlation_id.clone(),
                    properties: message.properties.clone(),
                    lock_token: token,
                    delivery_count: message.delivery_count,
                    enqueued_at: message.enqueued_at,
                    locked_until: until,
                });
            }
            Ok(batch)
        })
        .await
    }

    async fn complete(
        &self,
        lock_token: &LockToken,
        transaction: Option<&TransactionId>,
    ) -> Result<(), ExchangeError> {
        let now = self.now();
        let mut guard = self.broker.lock();
        let state = &mut *guard;
        state.ensure_link(&self.link_id, &self.path)?;

        if state.faults.trip_complete() {
            return Err(DeliveryError::SettlementFailed {
                lock_token: lock_token.to_string(),
                message: "injected settlement failure".to_string(),
            }
            .into());
        }

        if state.is_settled(lock_token, now) {
            return Err(DeliveryError::AlreadySettled {
                lock_token: lock_token.to_string(),
            }
            .into());
        }

        if let Some(id) = transaction {
            if !state.transactions.contains_key(id) {
                return Err(TransactionError::Unknown {
                    transaction_id: id.to_string(),
                }
                .into());
            }
        }

        let entity = state
            .entities
            .get_mut(&self.path)
            .ok_or_else(|| ConnectionError::EntityNotFound {
                entity: self.path.clone(),
            })?;
        entity.reclaim_expired(now);

        let lock_lost = || DeliveryError::LockLost {
            lock_token: lock_token.to_string(),
        };
        let position = entity.locked_position(lock_token).ok_or_else(lock_lost)?;
        let message = entity.messages.get_mut(position).ok_or_else(lock_lost)?;

        match &mut message.delivery {
            Delivery::Locked {
                settling: Some(_), ..
            } => {
                return Err(DeliveryError::AlreadySettled {
                    lock_token: lock_token.to_string(),
                }
                .into())
            }
            Delivery::Locked { settling, .. } => {
                if let Some(id) = transaction {
                    *settling = Some(id.clone());
                }
            }
            _ => return Err(lock_lost().into()),
        }

        match transaction {
            Some(id) => {
                if let Some(pending) = state.transactions.get_mut(id) {
                    pending
                        .completions
                        .push((self.path.clone(), lock_token.clone()));
                }
            }
            None => {
                let removed = entity.messages.remove(position);
                if let Some(Delivery::Locked { until, .. }) = removed.map(|m| m.delivery) {
                    state.settle(lock_token.clone(), until, now);
                }
            }
        }
        Ok(())
    }

    async fn abandon(&self, lock_token: &LockToken) -> Result<(), ExchangeError> {
        let now = self.now();
        let mut guard = self.broker.lock();
        let state = &mut *guard;
        state.ensure_link(&self.link_id, &self.path)?;

        if state.is_settled(lock_token, now) {
            return Err(DeliveryError::AlreadySettled {
                lock_token: lock_token.to_string(),
            }
            .into());
        }

        let entity = state.entity_mut(&self.path)?;
        entity.reclaim_expired(now);

        let message = entity
            .locked_position(lock_token)
            .and_then(|p| entity.messages.get_mut(p))
            .ok_or_else(|| DeliveryError::LockLost {
                lock_token: lock_token.to_string(),
            })?;

        if matches!(message.delivery, Delivery::Locked { settling: Some(_), .. }) {
            return Err(DeliveryError::AlreadySettled {
                lock_token: lock_token.to_string(),
            }
            .into());
        }

        message.delivery = Delivery::Available;
        self.broker.available.notify_waiters();
        Ok(())
    }

    async fn enqueue_leased(&self, body: Bytes) -> Result<SendReceipt, ExchangeError> {
        self.require_queue()?;
        let now = self.now();
        let mut state = self.broker.lock();
        state.ensure_link(&self.link_id, &self.path)?;

        let max_size = self.broker.config.max_message_size;
        if body.len() > max_size {
            return Err(DeliveryError::MessageTooLarge {
                size: body.len(),
                max_size,
            }
            .into());
        }

        if state.faults.trip_enqueue() {
            return Err(DeliveryError::EnqueueFailed {
                entity: self.path.clone(),
                index: 0,
                message: "injected transport failure".to_string(),
            }
            .into());
        }

        let mut stored = StoredMessage::from_outbound(&OutboundMessage::new(body), now);
        let pop_receipt = PopReceipt::generate();
        stored.pop_receipt = Some(pop_receipt.clone());

        let receipt = SendReceipt {
            message_id: stored.message_id.clone(),
            pop_receipt,
            inserted_at: now,
        };
        state.deliver(&self.path, stored);
        self.broker.available.notify_waiters();
        Ok(receipt)
    }

    async fn receive_leased(
        &self,
        count: usize,
        visibility_timeout: Duration,
        wait_timeout: Duration,
    ) -> Result<Vec<LeasedMessage>, ExchangeError> {
        self.require_queue()?;
        if count == 0 {
            return Ok(Vec::new());
        }

        self.wait_for(wait_timeout, |state, now| {
            state.ensure_link(&self.link_id, &self.path)?;
            let entity = state.entity_mut(&self.path)?;
            entity.reclaim_expired(now);

            let until = now.saturating_add(visibility_timeout);
            let mut batch = Vec::new();
            for message in entity.messages.iter_mut() {
                if batch.len() >= count {
                    break;
                }
                if !matches!(message.delivery, Delivery::Available) {
                    continue;
                }

                let pop_receipt = PopReceipt::generate();
                message.delivery_count += 1;
                message.delivery = Delivery::Leased { until };
                message.pop_receipt = Some(pop_receipt.clone());

                batch.push(LeasedMessage {
                    message_id: message.message_id.clone(),
                    body: message.body.clone(),
                    pop_receipt,
                    dequeue_count: message.delivery_count,
                    inserted_at: message.enqueued_at,
                    visible_at: until,
                });
            }
            Ok(batch)
        })
        .await
    }

    async fn delete_leased(
        &self,
        message_id: &MessageId,
        pop_receipt: &PopReceipt,
    ) -> Result<(), ExchangeError> {
        self.require_queue()?;
        let now = self.now();
        let mut state = self.broker.lock();
        state.ensure_link(&self.link_id, &self.path)?;

        let entity = state.entity_mut(&self.path)?;
        entity.reclaim_expired(now);

        let position = entity
            .position_of(message_id)
            .ok_or_else(|| DeliveryError::MessageNotFound {
                message_id: message_id.to_string(),
            })?;

        let current = entity
            .messages
            .get(position)
            .and_then(|m| m.pop_receipt.as_ref());
        if current != Some(pop_receipt) {
            return Err(DeliveryError::LeaseLost {
                message_id: message_id.to_string(),
            }
            .into());
        }

        entity.messages.remove(position);
        Ok(())
    }

    async fn update_leased(
        &self,
        message_id: &MessageId,
        pop_receipt: &PopReceipt,
        body: Bytes,
        visibility_timeout: Duration,
    ) -> Result<PopReceipt, ExchangeError> {
        self.require_queue()?;
        let now = self.now();
        let mut state = self.broker.lock();
        state.ensure_link(&self.link_id, &self.path)?;

        let entity = state.entity_mut(&self.path)?;
        entity.reclaim_expired(now);

        let message = entity
            .position_of(message_id)
            .and_then(|p| entity.messages.get_mut(p))
            .ok_or_else(|| DeliveryError::MessageNotFound {
                message_id: message_id.to_string(),
            })?;

        if message.pop_receipt.as_ref() != Some(pop_receipt) {
            return Err(DeliveryError::LeaseLost {
                message_id: message_id.to_string(),
            }
            .into());
        }

        let new_receipt = PopReceipt::generate();
        message.body = body;
        message.delivery = Delivery::Leased {
            until: now.saturating_add(visibility_timeout),
        };
        message.pop_receipt = Some(new_receipt.clone());

        if visibility_timeout.is_zero() {
            self.broker.available.notify_waiters();
        }
        Ok(new_receipt)
    }

    async fn properties(&self) -> Result<EntityProperties, ExchangeError> {
        let state = self.broker.lock();
        state.ensure_link(&self.link_id, &self.path)?;

        let entity = state
            .entities
            .get(&self.path)
            .ok_or_else(|| ConnectionError::EntityNotFound {
                entity: self.path.clone(),
            })?;

        let count = match entity.kind {
            EntityKind::Topic => entity
                .subscriptions
                .iter()
                .filter_map(|path| state.entities.get(path))
                .map(|s| s.messages.len())
                .sum(),
            _ => entity.messages.len(),
        };

        Ok(EntityProperties {
            entity: self.path.clone(),
            approximate_message_count: count as u64,
        })
    }

    async fn close(&self) -> Result<(), ExchangeError> {
        let now = self.now();
        let mut state = self.broker.lock();
        if state.links.remove(&self.link_id).is_none() {
            return Ok(());
        }

        let owned: Vec<TransactionId> = state
            .transactions
            .iter()
            .filter(|(_, pending)| pending.owner_link == self.link_id)
            .map(|(id, _)| id.clone())
            .collect();

        for id in owned {
            if let Some(pending) = state.transactions.remove(&id) {
                warn!(
                    link_id = %self.link_id,
                    transaction_id = %id,
                    "Rolling back transaction left open on closing link"
                );
                state.release(&id, pending, now);
            }
        }

        debug!(entity = %self.path, link_id = %self.link_id, "Link detached");
        self.broker.available.notify_waiters();
        Ok(())
    }
}
