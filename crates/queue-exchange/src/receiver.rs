//! Peek-lock receiving.
//!
//! Each delivered message is `Locked` until it is completed, abandoned, or its
//! lock lapses. [`LockModeReceiver::receive_and_complete`] locks a batch and
//! completes every message inside one transaction unit, so the batch is either
//! removed as a whole or left for redelivery.

use crate::config::{ExchangeConfig, MAX_BATCH_LIMIT};
use crate::connection::{ConnectionFactory, ConnectionHandle, TransactionUnit};
use crate::credential::Credential;
use crate::error::{ExchangeError, ValidationError};
use crate::message::{EntityAddress, ReceiveOutcome, ReceivedMessage};
use crate::sender::{abort_after, check_batch_size, send_in, TransactionalSender};
use crate::subscription::{Cancellation, ReceiveSubscription, Subscription};
use crate::transport::Role;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

#[cfg(test)]
#[path = "receiver_tests.rs"]
mod tests;

/// Default upper bound on messages per receive
pub const DEFAULT_MAX_RECEIVE_COUNT: usize = 100;

/// Lock up to `max_count` messages, waiting at most `wait_timeout` for the first
///
/// Returning fewer than `max_count` (or none) when the wait elapses is normal.
pub async fn receive_batch(
    handle: &ConnectionHandle,
    max_count: usize,
    wait_timeout: Duration,
) -> Result<Vec<ReceivedMessage>, ExchangeError> {
    check_receive_count(max_count, MAX_BATCH_LIMIT)?;

    let messages = handle.receive_locked(max_count, wait_timeout).await?;
    debug!(
        entity = %handle.entity(),
        max_count,
        received = messages.len(),
        "Received batch"
    );
    Ok(messages)
}

/// Complete a locked message, provisionally inside `unit` when given
pub async fn complete(
    handle: &ConnectionHandle,
    message: &ReceivedMessage,
    unit: Option<&TransactionUnit>,
) -> Result<(), ExchangeError> {
    handle.complete(&message.lock_token, unit).await
}

/// Release a message's lock so it can be delivered again
pub async fn abandon(
    handle: &ConnectionHandle,
    message: &ReceivedMessage,
) -> Result<(), ExchangeError> {
    handle.abandon(&message.lock_token).await
}

fn check_receive_count(max_count: usize, limit: usize) -> Result<(), ValidationError> {
    if max_count == 0 || max_count > limit {
        return Err(ValidationError::OutOfRange {
            field: "max_count".to_string(),
            message: format!("must be between 1 and {}, got {}", limit, max_count),
        });
    }
    Ok(())
}

/// Abort `unit` after `cause`, then release every lock still held
async fn fail_batch(
    handle: &ConnectionHandle,
    unit: &mut TransactionUnit,
    messages: &[ReceivedMessage],
    cause: ExchangeError,
) -> ExchangeError {
    let failure = if unit.is_open() {
        abort_after(handle, unit, cause).await
    } else {
        cause
    };
    release_locks(handle, messages).await;
    failure
}

async fn release_locks(handle: &ConnectionHandle, messages: &[ReceivedMessage]) {
    for message in messages {
        if let Err(e) = handle.abandon(&message.lock_token).await {
            debug!(
                entity = %handle.entity(),
                lock_token = %message.lock_token,
                error = %e,
                "Lock not released; it lapses on its own"
            );
        }
    }
}

// ============================================================================
// Lock Mode Receiver
// ============================================================================

/// Receives from one queue or subscription under peek-lock
#[derive(Debug, Clone)]
pub struct LockModeReceiver {
    factory: Arc<ConnectionFactory>,
    credential: Credential,
    entity: EntityAddress,
    max_receive_count: usize,
}

impl LockModeReceiver {
    /// Create a receiver; `entity` must accept receives
    pub fn new(
        factory: Arc<ConnectionFactory>,
        credential: Credential,
        entity: EntityAddress,
    ) -> Result<Self, ExchangeError> {
        if !entity.accepts_receives() {
            return Err(ValidationError::InvalidFormat {
                field: "entity".to_string(),
                message: format!("'{}' does not accept receives", entity),
            }
            .into());
        }

        Ok(Self {
            factory,
            credential,
            entity,
            max_receive_count: DEFAULT_MAX_RECEIVE_COUNT,
        })
    }

    /// Create a receiver using the configured receive limit
    pub fn from_config(
        factory: Arc<ConnectionFactory>,
        credential: Credential,
        entity: EntityAddress,
        config: &ExchangeConfig,
    ) -> Result<Self, ExchangeError> {
        Ok(Self::new(factory, credential, entity)?
            .with_max_receive_count(config.receive.max_count))
    }

    pub fn with_max_receive_count(mut self, max_receive_count: usize) -> Self {
        self.max_receive_count = max_receive_count;
        self
    }

    pub fn entity(&self) -> &EntityAddress {
        &self.entity
    }

    pub fn max_receive_count(&self) -> usize {
        self.max_receive_count
    }

    /// Lock a batch and complete it atomically
    ///
    /// On any failure the unit is aborted, the locks are released, and the
    /// error is returned; the messages stay in the entity.
    pub async fn receive_and_complete(
        &self,
        max_count: usize,
        wait_timeout: Duration,
    ) -> Result<ReceiveOutcome, ExchangeError> {
        self.receive_and_complete_until(max_count, wait_timeout, &Cancellation::never())
            .await
    }

    /// Move a batch to `destination`: completions and sends share one unit
    pub async fn receive_and_forward(
        &self,
        destination: &TransactionalSender,
        max_count: usize,
        wait_timeout: Duration,
    ) -> Result<ReceiveOutcome, ExchangeError> {
        check_receive_count(max_count, self.max_receive_count)?;
        check_batch_size(max_count, destination.max_batch_size())?;

        let mut source = self
            .factory
            .connect_with_retry(&self.credential, &self.entity, Role::Receiver)
            .await?;

        let mut target = match destination
            .factory()
            .connect_with_retry(destination.credential(), destination.entity(), Role::Sender)
            .await
        {
            Ok(target) => target,
            Err(e) => {
                source.close_quietly().await;
                return Err(e);
            }
        };

        let outcome = forward_batch(&source, &target, max_count, wait_timeout).await;

        target.close_quietly().await;
        source.close_quietly().await;
        outcome
    }

    /// Spawn a receive-and-complete and observe it through a subscription
    pub fn spawn_receive_and_complete(
        &self,
        max_count: usize,
        wait_timeout: Duration,
    ) -> ReceiveSubscription {
        let receiver = self.clone();
        Subscription::spawn(max_count, move |cancel| async move {
            receiver
                .receive_and_complete_until(max_count, wait_timeout, &cancel)
                .await
        })
    }

    pub(crate) async fn receive_and_complete_until(
        &self,
        max_count: usize,
        wait_timeout: Duration,
        cancel: &Cancellation,
    ) -> Result<ReceiveOutcome, ExchangeError> {
        check_receive_count(max_count, self.max_receive_count)?;

        let mut handle = cancel
            .guard(
                self.factory
                    .connect_with_retry(&self.credential, &self.entity, Role::Receiver),
            )
            .await?;

        let outcome = complete_batch(&handle, max_count, wait_timeout, cancel).await;

        handle.close_quietly().await;
        outcome
    }
}

async fn complete_batch(
    handle: &ConnectionHandle,
    max_count: usize,
    wait_timeout: Duration,
    cancel: &Cancellation,
) -> Result<ReceiveOutcome, ExchangeError> {
    let entity = handle.entity().path();
    let mut unit = cancel.guard(handle.begin_transaction()).await?;

    let messages = match cancel.guard(handle.receive_locked(max_count, wait_timeout)).await {
        Ok(messages) => messages,
        Err(e) => {
            error!(entity = %entity, transaction_id = %unit.id(), error = %e, "Receive failed");
            return Err(fail_batch(handle, &mut unit, &[], e).await);
        }
    };

    for message in &messages {
        let completed = cancel
            .guard(handle.complete(&message.lock_token, Some(&unit)))
            .await;
        if let Err(e) = completed {
            error!(
                entity = %entity,
                batch_size = messages.len(),
                transaction_id = %unit.id(),
                lock_token = %message.lock_token,
                error = %e,
                "Completion failed; aborting transaction"
            );
            return Err(fail_batch(handle, &mut unit, &messages, e).await);
        }
    }

    if cancel.is_cancelled() {
        return Err(fail_batch(handle, &mut unit, &messages, ExchangeError::Cancelled).await);
    }

    if let Err(e) = handle.commit(&mut unit).await {
        return Err(fail_batch(handle, &mut unit, &messages, e).await);
    }

    info!(
        entity = %entity,
        batch_size = messages.len(),
        transaction_id = %unit.id(),
        "Batch received and completed"
    );

    Ok(ReceiveOutcome {
        entity,
        transaction_id: Some(unit.id().clone()),
        messages,
    })
}

async fn forward_batch(
    source: &ConnectionHandle,
    target: &ConnectionHandle,
    max_count: usize,
    wait_timeout: Duration,
) -> Result<ReceiveOutcome, ExchangeError> {
    let entity = source.entity().path();
    let mut unit = source.begin_transaction().await?;

    let messages = match source.receive_locked(max_count, wait_timeout).await {
        Ok(messages) => messages,
        Err(e) => return Err(fail_batch(source, &mut unit, &[], e).await),
    };

    for message in &messages {
        let forwarded = async {
            send_in(target, &unit, std::slice::from_ref(&message.to_outbound())).await?;
            source.complete(&message.lock_token, Some(&unit)).await
        };
        let result = forwarded.await;
        if let Err(e) = result {
            error!(
                entity = %entity,
                destination = %target.entity(),
                batch_size = messages.len(),
                transaction_id = %unit.id(),
                error = %e,
                "Forward failed; aborting transaction"
            );
            return Err(fail_batch(source, &mut unit, &messages, e).await);
        }
    }

    if let Err(e) = source.commit(&mut unit).await {
        return Err(fail_batch(source, &mut unit, &messages, e).await);
    }

    info!(
        entity = %entity,
        destination = %target.entity(),
        batch_size = messages.len(),
        transaction_id = %unit.id(),
        "Batch forwarded"
    );

    Ok(ReceiveOutcome {
        entity,
        transaction_id: Some(unit.id().clone()),
        messages,
    })
}
