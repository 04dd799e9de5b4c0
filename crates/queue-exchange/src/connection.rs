//! Authenticated connections to broker entities.
//!
//! [`ConnectionFactory::connect`] turns a [`Credential`] into a
//! [`ConnectionHandle`] bound to exactly one entity and one [`Role`]. In
//! [`AuthMode::SignedToken`] mode a fresh token is issued for every connection
//! and embedded in a connection string of the form
//! `Endpoint=<namespace>.<domain>;SharedAccessSignature=<token>`.
//!
//! Handles are exclusively owned. Whoever opens one closes it, on every exit
//! path; a handle that is dropped while still open releases its link in the
//! background and logs a warning.

use crate::clock::{Clock, SystemClock};
use crate::config::ExchangeConfig;
use crate::credential::Credential;
use crate::error::{
    ConnectionError, CredentialError, ExchangeError, TransactionError, ValidationError,
};
use crate::message::{
    EntityAddress, EntityProperties, LeasedMessage, LockToken, MessageId, OutboundMessage,
    PopReceipt, ReceivedMessage, SendReceipt, TransactionId,
};
use crate::retry::{RetryPolicy, RetryState};
use crate::token::{SignedToken, TokenIssuer};
use crate::transport::{Authorization, BrokerLink, BrokerTransport, LinkRequest, Role};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;

/// Default broker domain appended to the namespace
pub const DEFAULT_BROKER_DOMAIN: &str = "servicebus.windows.net";

/// How the factory proves access during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Issue a time-bounded token per connection
    #[default]
    SignedToken,
    /// Present the shared key directly
    SharedKey,
}

// ============================================================================
// Connection String
// ============================================================================

/// `Endpoint=<host>;SharedAccessSignature=<token>`
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    endpoint: String,
    token: SignedToken,
}

impl ConnectionString {
    pub fn new(endpoint: impl Into<String>, token: SignedToken) -> Self {
        Self {
            endpoint: endpoint.into(),
            token,
        }
    }

    /// Endpoint host (no scheme)
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn token(&self) -> &SignedToken {
        &self.token
    }

    /// Parse a connection string; an `sb://` scheme and trailing `/` are tolerated
    pub fn parse(value: &str) -> Result<Self, ExchangeError> {
        let mut endpoint = None;
        let mut token = None;

        for segment in value.trim().split(';').filter(|s| !s.is_empty()) {
            let (name, raw) = segment
                .split_once('=')
                .ok_or_else(|| malformed(&format!("segment '{}' has no value", segment)))?;

            match name.trim() {
                "Endpoint" => {
                    let host = raw
                        .trim()
                        .trim_start_matches("sb://")
                        .trim_end_matches('/')
                        .to_string();
                    endpoint = Some(host);
                }
                "SharedAccessSignature" => token = Some(SignedToken::parse(raw)?),
                _ => {}
            }
        }

        let endpoint = endpoint
            .filter(|e| !e.is_empty())
            .ok_or_else(|| malformed("missing Endpoint"))?;
        let token = token.ok_or_else(|| malformed("missing SharedAccessSignature"))?;

        Ok(Self { endpoint, token })
    }
}

fn malformed(message: &str) -> ExchangeError {
    ConnectionError::MalformedConnectionString {
        message: message.to_string(),
    }
    .into()
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Endpoint={};SharedAccessSignature={}",
            self.endpoint, self.token
        )
    }
}

impl FromStr for ConnectionString {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("endpoint", &self.endpoint)
            .field("token", &self.token)
            .finish()
    }
}

// ============================================================================
// Connection Factory
// ============================================================================

/// Builds authenticated, single-role connections
#[derive(Debug, Clone)]
pub struct ConnectionFactory {
    transport: Arc<dyn BrokerTransport>,
    issuer: TokenIssuer,
    broker_domain: String,
    auth_mode: AuthMode,
    retry_policy: RetryPolicy,
}

impl ConnectionFactory {
    /// Create a factory with default settings and the system clock
    pub fn new(transport: Arc<dyn BrokerTransport>) -> Self {
        Self {
            transport,
            issuer: TokenIssuer::new(Arc::new(SystemClock)),
            broker_domain: DEFAULT_BROKER_DOMAIN.to_string(),
            auth_mode: AuthMode::SignedToken,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Create a factory from loaded configuration
    pub fn from_config(transport: Arc<dyn BrokerTransport>, config: &ExchangeConfig) -> Self {
        Self::new(transport)
            .with_broker_domain(config.broker_domain.clone())
            .with_auth_mode(config.auth_mode)
            .with_token_validity(config.token_validity())
            .with_retry_policy(RetryPolicy::from_settings(&config.retry))
    }

    /// Replace the clock used for token expiry
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.issuer = TokenIssuer::new(clock).with_validity(self.issuer.validity());
        self
    }

    pub fn with_broker_domain(mut self, broker_domain: impl Into<String>) -> Self {
        self.broker_domain = broker_domain.into();
        self
    }

    pub fn with_auth_mode(mut self, auth_mode: AuthMode) -> Self {
        self.auth_mode = auth_mode;
        self
    }

    pub fn with_token_validity(mut self, validity: Duration) -> Self {
        self.issuer = self.issuer.with_validity(validity);
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn broker_domain(&self) -> &str {
        &self.broker_domain
    }

    pub fn auth_mode(&self) -> AuthMode {
        self.auth_mode
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Issue a fresh token for the credential's scope and wrap it in a connection string
    pub fn connection_string(
        &self,
        credential: &Credential,
    ) -> Result<ConnectionString, CredentialError> {
        let token = self.issuer.issue_for(credential, &self.broker_domain)?;
        Ok(ConnectionString::new(
            credential.endpoint(&self.broker_domain),
            token,
        ))
    }

    /// Open a connection to `entity` for `role`
    ///
    /// The entity must accept the requested direction: topics are send-only and
    /// subscriptions are receive-only.
    pub async fn connect(
        &self,
        credential: &Credential,
        entity: &EntityAddress,
        role: Role,
    ) -> Result<ConnectionHandle, ExchangeError> {
        check_direction(entity, role)?;

        let authorization = match self.auth_mode {
            AuthMode::SignedToken => {
                Authorization::SharedAccessSignature(self.connection_string(credential)?)
            }
            AuthMode::SharedKey => Authorization::SharedKey {
                key_name: credential.key_name().to_string(),
                key: credential.shared_key().clone(),
            },
        };

        let request = LinkRequest {
            endpoint: credential.endpoint(&self.broker_domain),
            entity: entity.clone(),
            role,
            authorization,
        };

        debug!(
            entity = %entity,
            role = %role,
            auth_mode = ?self.auth_mode,
            "Opening broker link"
        );

        match self.transport.open_link(request).await {
            Ok(link) => {
                info!(
                    entity = %entity,
                    role = %role,
                    link_id = link.link_id(),
                    "Connection established"
                );
                Ok(ConnectionHandle::new(link, entity.clone(), role))
            }
            Err(e) => {
                warn!(entity = %entity, role = %role, error = %e, "Connection failed");
                Err(e)
            }
        }
    }

    /// [`connect`](Self::connect), retrying transient failures with backoff
    pub async fn connect_with_retry(
        &self,
        credential: &Credential,
        entity: &EntityAddress,
        role: Role,
    ) -> Result<ConnectionHandle, ExchangeError> {
        let mut state = RetryState::new();

        loop {
            match self.connect(credential, entity, role).await {
                Ok(handle) => return Ok(handle),
                Err(e) if state.can_retry(&self.retry_policy, &e) => {
                    let delay = state.get_delay(&self.retry_policy, &e);
                    warn!(
                        entity = %entity,
                        attempt = state.attempt + 1,
                        max_attempts = self.retry_policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient connection failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    state.next_attempt();
                }
                Err(e) => {
                    error!(
                        entity = %entity,
                        attempts = state.attempt + 1,
                        error = %e,
                        "Connection attempts exhausted"
                    );
                    return Err(e);
                }
            }
        }
    }
}

fn check_direction(entity: &EntityAddress, role: Role) -> Result<(), ValidationError> {
    let allowed = match role {
        Role::Sender => entity.accepts_sends(),
        Role::Receiver => entity.accepts_receives(),
    };
    if allowed {
        Ok(())
    } else {
        Err(ValidationError::InvalidFormat {
            field: "entity".to_string(),
            message: format!("'{}' cannot be opened as a {}", entity, role),
        })
    }
}

// ============================================================================
// Transaction Unit
// ============================================================================

/// Resolution state of a transaction unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committed,
    Aborted,
    /// Commit or rollback failed; the broker-side outcome is unknown
    Indeterminate,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            Self::Open => "open",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
            Self::Indeterminate => "indeterminate",
        };
        f.write_str(state)
    }
}

/// Atomic scope: every operation enrolled becomes visible on commit or not at all
///
/// Resolved by exactly one of [`ConnectionHandle::commit`] or
/// [`ConnectionHandle::abort`].
#[derive(Debug)]
pub struct TransactionUnit {
    id: TransactionId,
    entity: String,
    state: TransactionState,
}

impl TransactionUnit {
    fn new(id: TransactionId, entity: String) -> Self {
        Self {
            id,
            entity,
            state: TransactionState::Open,
        }
    }

    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == TransactionState::Open
    }

    fn ensure_open(&self) -> Result<(), TransactionError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransactionError::NotOpen {
                transaction_id: self.id.to_string(),
                state: self.state.to_string(),
            })
        }
    }
}

impl Drop for TransactionUnit {
    fn drop(&mut self) {
        if self.is_open() {
            warn!(
                transaction_id = %self.id,
                entity = %self.entity,
                "Transaction unit dropped while open; it rolls back when its link closes"
            );
        }
    }
}

// ============================================================================
// Connection Handle
// ============================================================================

/// An open connection to one entity in one role
#[derive(Debug)]
pub struct ConnectionHandle {
    link: Option<Box<dyn BrokerLink>>,
    entity: EntityAddress,
    role: Role,
}

impl ConnectionHandle {
    /// Wrap an open link
    pub fn new(link: Box<dyn BrokerLink>, entity: EntityAddress, role: Role) -> Self {
        Self {
            link: Some(link),
            entity,
            role,
        }
    }

    pub fn entity(&self) -> &EntityAddress {
        &self.entity
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    /// Identifier of the underlying link while open
    pub fn link_id(&self) -> Option<&str> {
        self.link.as_deref().map(|link| link.link_id())
    }

    fn link(&self) -> Result<&dyn BrokerLink, ConnectionError> {
        self.link
            .as_deref()
            .ok_or_else(|| ConnectionError::Closed {
                entity: self.entity.path(),
            })
    }

    fn link_as(&self, expected: Role) -> Result<&dyn BrokerLink, ConnectionError> {
        if self.role != expected {
            return Err(ConnectionError::RoleMismatch {
                entity: self.entity.path(),
                expected,
                actual: self.role,
            });
        }
        self.link()
    }

    /// Close the connection; closing an already closed handle is a no-op
    ///
    /// The handle counts as closed even when the broker reports a close failure.
    pub async fn close(&mut self) -> Result<(), ExchangeError> {
        let Some(link) = self.link.take() else {
            return Ok(());
        };

        let link_id = link.link_id().to_string();
        match link.close().await {
            Ok(()) => {
                debug!(entity = %self.entity, link_id = %link_id, "Connection closed");
                Ok(())
            }
            Err(e) => {
                warn!(entity = %self.entity, link_id = %link_id, error = %e, "Close failed");
                Err(ConnectionError::CloseFailed {
                    entity: self.entity.path(),
                    message: e.to_string(),
                }
                .into())
            }
        }
    }

    /// Close after an operation has finished; a failure is logged, not returned
    pub(crate) async fn close_quietly(&mut self) {
        if let Err(e) = self.close().await {
            warn!(entity = %self.entity, error = %e, "Close failed after operation");
        }
    }

    // ------------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------------

    /// Open a transaction unit on this connection
    pub async fn begin_transaction(&self) -> Result<TransactionUnit, ExchangeError> {
        let id = self.link()?.create_transaction().await?;
        debug!(entity = %self.entity, transaction_id = %id, "Transaction opened");
        Ok(TransactionUnit::new(id, self.entity.path()))
    }

    /// Commit an open unit
    ///
    /// On failure the unit becomes [`TransactionState::Indeterminate`]; it is
    /// never reported as committed.
    pub async fn commit(&self, unit: &mut TransactionUnit) -> Result<(), ExchangeError> {
        unit.ensure_open()?;
        let link = self.link()?;

        match link.commit_transaction(&unit.id).await {
            Ok(()) => {
                unit.state = TransactionState::Committed;
                debug!(entity = %self.entity, transaction_id = %unit.id, "Transaction committed");
                Ok(())
            }
            Err(e) => {
                unit.state = TransactionState::Indeterminate;
                error!(
                    entity = %self.entity,
                    transaction_id = %unit.id,
                    error = %e,
                    "Transaction commit failed"
                );
                Err(as_transaction_error(e, |message| {
                    TransactionError::CommitFailed {
                        transaction_id: unit.id.to_string(),
                        message,
                    }
                }))
            }
        }
    }

    /// Roll back an open unit
    ///
    /// A failed rollback is reported as [`TransactionError::RollbackFailed`].
    pub async fn abort(&self, unit: &mut TransactionUnit) -> Result<(), ExchangeError> {
        self.abort_after(unit, "rollback requested").await
    }

    /// Roll back an open unit because of `cause`
    pub(crate) async fn abort_after(
        &self,
        unit: &mut TransactionUnit,
        cause: &str,
    ) -> Result<(), ExchangeError> {
        unit.ensure_open()?;
        let link = self.link()?;

        match link.rollback_transaction(&unit.id).await {
            Ok(()) => {
                unit.state = TransactionState::Aborted;
                debug!(entity = %self.entity, transaction_id = %unit.id, "Transaction aborted");
                Ok(())
            }
            Err(e) => {
                unit.state = TransactionState::Indeterminate;
                error!(
                    entity = %self.entity,
                    transaction_id = %unit.id,
                    error = %e,
                    "Transaction rollback failed"
                );
                Err(as_transaction_error(e, |message| {
                    TransactionError::RollbackFailed {
                        transaction_id: unit.id.to_string(),
                        message,
                        cause: cause.to_string(),
                    }
                }))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Peek-lock operations
    // ------------------------------------------------------------------------

    /// Enqueue one message, provisionally inside `unit` when given
    pub async fn enqueue(
        &self,
        message: &OutboundMessage,
        unit: Option<&TransactionUnit>,
    ) -> Result<MessageId, ExchangeError> {
        let link = self.link_as(Role::Sender)?;
        if let Some(unit) = unit {
            unit.ensure_open()?;
        }
        link.enqueue(message, unit.map(|u| &u.id)).await
    }

    /// Lock up to `max_count` messages
    pub async fn receive_locked(
        &self,
        max_count: usize,
        wait_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, ExchangeError> {
        self.link_as(Role::Receiver)?
            .receive_locked(max_count, wait_timeout)
            .await
    }

    /// Complete a locked message, provisionally inside `unit` when given
    pub async fn complete(
        &self,
        lock_token: &LockToken,
        unit: Option<&TransactionUnit>,
    ) -> Result<(), ExchangeError> {
        let link = self.link_as(Role::Receiver)?;
        if let Some(unit) = unit {
            unit.ensure_open()?;
        }
        link.complete(lock_token, unit.map(|u| &u.id)).await
    }

    /// Release a lock immediately
    pub async fn abandon(&self, lock_token: &LockToken) -> Result<(), ExchangeError> {
        self.link_as(Role::Receiver)?.abandon(lock_token).await
    }

    // ------------------------------------------------------------------------
    // Lease operations
    // ------------------------------------------------------------------------

    pub async fn enqueue_leased(&self, body: Bytes) -> Result<SendReceipt, ExchangeError> {
        self.link_as(Role::Sender)?.enqueue_leased(body).await
    }

    pub async fn receive_leased(
        &self,
        count: usize,
        visibility_timeout: Duration,
        wait_timeout: Duration,
    ) -> Result<Vec<LeasedMessage>, ExchangeError> {
        self.link_as(Role::Receiver)?
            .receive_leased(count, visibility_timeout, wait_timeout)
            .await
    }

    pub async fn delete_leased(
        &self,
        message_id: &MessageId,
        pop_receipt: &PopReceipt,
    ) -> Result<(), ExchangeError> {
        self.link_as(Role::Receiver)?
            .delete_leased(message_id, pop_receipt)
            .await
    }

    pub async fn update_leased(
        &self,
        message_id: &MessageId,
        pop_receipt: &PopReceipt,
        body: Bytes,
        visibility_timeout: Duration,
    ) -> Result<PopReceipt, ExchangeError> {
        self.link_as(Role::Receiver)?
            .update_leased(message_id, pop_receipt, body, visibility_timeout)
            .await
    }

    /// Entity statistics (either role)
    pub async fn properties(&self) -> Result<EntityProperties, ExchangeError> {
        self.link()?.properties().await
    }
}

/// Report a failed commit or rollback as a transaction error
///
/// A transport failure during resolution leaves the outcome unknown, so it must
/// not surface as a retryable connection error.
fn as_transaction_error(
    error: ExchangeError,
    wrap: impl FnOnce(String) -> TransactionError,
) -> ExchangeError {
    match error {
        ExchangeError::Transaction(e) => e.into(),
        other => wrap(other.to_string()).into(),
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };

        warn!(
            entity = %self.entity,
            role = %self.role,
            link_id = link.link_id(),
            "Connection handle dropped while open; closing in background"
        );

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let entity = self.entity.path();
                runtime.spawn(async move {
                    if let Err(e) = link.close().await {
                        warn!(entity = %entity, error = %e, "Background close failed");
                    }
                });
            }
            Err(_) => {
                warn!(
                    entity = %self.entity,
                    "No async runtime available; link released without a close handshake"
                );
            }
        }
    }
}
