//! All-or-nothing batch sends.
//!
//! A batch is enqueued inside one transaction unit and committed only when
//! every enqueue succeeded. Any failure aborts the unit, so either every
//! message in the batch becomes visible or none does.

use crate::config::ExchangeConfig;
use crate::connection::{ConnectionFactory, ConnectionHandle, TransactionUnit};
use crate::credential::Credential;
use crate::error::{ConnectionError, ExchangeError, ValidationError};
use crate::message::{EntityAddress, MessageId, OutboundMessage, SendResult};
use crate::subscription::{Cancellation, SendSubscription, Subscription};
use crate::transport::Role;
use std::sync::Arc;
use tracing::{debug, error, info};

#[cfg(test)]
#[path = "sender_tests.rs"]
mod tests;

/// Default upper bound on messages per batch
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Send `messages` in one transaction unit, consuming and closing `handle`
///
/// An empty batch closes the handle and succeeds without opening a unit.
pub async fn send_batch(
    handle: ConnectionHandle,
    messages: &[OutboundMessage],
) -> Result<SendResult, ExchangeError> {
    send_batch_until(handle, messages, &Cancellation::never()).await
}

pub(crate) async fn send_batch_until(
    mut handle: ConnectionHandle,
    messages: &[OutboundMessage],
    cancel: &Cancellation,
) -> Result<SendResult, ExchangeError> {
    let outcome = send_in_new_unit(&handle, messages, cancel).await;

    // The unit is already resolved; a close failure does not change its outcome
    handle.close_quietly().await;

    outcome
}

async fn send_in_new_unit(
    handle: &ConnectionHandle,
    messages: &[OutboundMessage],
    cancel: &Cancellation,
) -> Result<SendResult, ExchangeError> {
    let entity = handle.entity().path();

    if messages.is_empty() {
        debug!(entity = %entity, "Empty batch; nothing to send");
        return Ok(SendResult {
            entity,
            transaction_id: None,
            message_ids: Vec::new(),
        });
    }

    if handle.role() != Role::Sender {
        return Err(ConnectionError::RoleMismatch {
            entity,
            expected: Role::Sender,
            actual: handle.role(),
        }
        .into());
    }

    let mut unit = cancel.guard(handle.begin_transaction()).await?;

    let enqueued = enqueue_all(handle, &unit, messages, cancel).await;
    let message_ids = match enqueued {
        Ok(ids) => ids,
        Err(e) => {
            error!(
                entity = %entity,
                batch_size = messages.len(),
                transaction_id = %unit.id(),
                error = %e,
                "Batch send failed; aborting transaction"
            );
            return Err(abort_after(handle, &mut unit, e).await);
        }
    };

    if cancel.is_cancelled() {
        return Err(abort_after(handle, &mut unit, ExchangeError::Cancelled).await);
    }

    handle.commit(&mut unit).await?;

    info!(
        entity = %entity,
        batch_size = messages.len(),
        transaction_id = %unit.id(),
        "Batch committed"
    );

    Ok(SendResult {
        entity,
        transaction_id: Some(unit.id().clone()),
        message_ids,
    })
}

async fn enqueue_all(
    handle: &ConnectionHandle,
    unit: &TransactionUnit,
    messages: &[OutboundMessage],
    cancel: &Cancellation,
) -> Result<Vec<MessageId>, ExchangeError> {
    let mut ids = Vec::with_capacity(messages.len());
    for message in messages {
        ids.push(cancel.guard(handle.enqueue(message, Some(unit))).await?);
    }
    Ok(ids)
}

/// Enroll `messages` in a unit the caller owns; the caller commits or aborts
pub async fn send_in(
    handle: &ConnectionHandle,
    unit: &TransactionUnit,
    messages: &[OutboundMessage],
) -> Result<Vec<MessageId>, ExchangeError> {
    enqueue_all(handle, unit, messages, &Cancellation::never()).await
}

/// Roll `unit` back after `cause`, reporting a failed rollback alongside it
pub(crate) async fn abort_after(
    handle: &ConnectionHandle,
    unit: &mut TransactionUnit,
    cause: ExchangeError,
) -> ExchangeError {
    match handle.abort_after(unit, &cause.to_string()).await {
        Ok(()) => cause,
        Err(rollback) => rollback,
    }
}

pub(crate) fn check_batch_size(len: usize, max: usize) -> Result<(), ValidationError> {
    if len > max {
        return Err(ValidationError::OutOfRange {
            field: "batch_size".to_string(),
            message: format!("{} messages exceeds the maximum of {}", len, max),
        });
    }
    Ok(())
}

// ============================================================================
// Transactional Sender
// ============================================================================

/// Connects and sends batches to one queue or topic
#[derive(Debug, Clone)]
pub struct TransactionalSender {
    factory: Arc<ConnectionFactory>,
    credential: Credential,
    entity: EntityAddress,
    max_batch_size: usize,
}

impl TransactionalSender {
    /// Create a sender; `entity` must accept sends
    pub fn new(
        factory: Arc<ConnectionFactory>,
        credential: Credential,
        entity: EntityAddress,
    ) -> Result<Self, ExchangeError> {
        if !entity.accepts_sends() {
            return Err(ValidationError::InvalidFormat {
                field: "entity".to_string(),
                message: format!("'{}' does not accept sends", entity),
            }
            .into());
        }

        Ok(Self {
            factory,
            credential,
            entity,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        })
    }

    /// Create a sender using the configured batch limit
    pub fn from_config(
        factory: Arc<ConnectionFactory>,
        credential: Credential,
        entity: EntityAddress,
        config: &ExchangeConfig,
    ) -> Result<Self, ExchangeError> {
        Ok(Self::new(factory, credential, entity)?.with_max_batch_size(config.max_batch_size))
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn entity(&self) -> &EntityAddress {
        &self.entity
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub(crate) fn factory(&self) -> &ConnectionFactory {
        &self.factory
    }

    pub(crate) fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Connect, send the batch atomically, and close
    pub async fn send(&self, messages: &[OutboundMessage]) -> Result<SendResult, ExchangeError> {
        self.send_until(messages, &Cancellation::never()).await
    }

    /// Send UTF-8 text bodies as one batch
    pub async fn send_texts<S: AsRef<str>>(&self, texts: &[S]) -> Result<SendResult, ExchangeError> {
        let messages: Vec<OutboundMessage> = texts
            .iter()
            .map(|text| OutboundMessage::from_text(text.as_ref()))
            .collect();
        self.send(&messages).await
    }

    /// Spawn the send and observe it through a subscription
    pub fn spawn_send(&self, messages: Vec<OutboundMessage>) -> SendSubscription {
        let sender = self.clone();
        Subscription::spawn(messages.len(), move |cancel| async move {
            sender.send_until(&messages, &cancel).await
        })
    }

    pub(crate) async fn send_until(
        &self,
        messages: &[OutboundMessage],
        cancel: &Cancellation,
    ) -> Result<SendResult, ExchangeError> {
        check_batch_size(messages.len(), self.max_batch_size)?;

        if messages.is_empty() {
            return Ok(SendResult {
                entity: self.entity.path(),
                transaction_id: None,
                message_ids: Vec::new(),
            });
        }

        let handle = cancel
            .guard(
                self.factory
                    .connect_with_retry(&self.credential, &self.entity, Role::Sender),
            )
            .await?;

        send_batch_until(handle, messages, cancel).await
    }
}
