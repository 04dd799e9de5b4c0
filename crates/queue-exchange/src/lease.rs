//! Lease-based queue client.
//!
//! Plain queues have no transactions. A receive leases messages for a
//! visibility timeout and hands back a pop receipt per message; deleting or
//! updating a message requires the current receipt. An update replaces the body
//! and the lease together and invalidates the old receipt.

use crate::config::{ExchangeConfig, MAX_LEASE_COUNT, MAX_VISIBILITY_SECS};
use crate::connection::{ConnectionFactory, ConnectionHandle};
use crate::credential::Credential;
use crate::error::{ExchangeError, ValidationError};
use crate::message::{EntityAddress, LeasedMessage, MessageId, PopReceipt, SendReceipt};
use crate::transport::Role;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "lease_tests.rs"]
mod tests;

/// Default lease length
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time to wait for a message to arrive
pub const DEFAULT_LEASE_WAIT: Duration = Duration::from_secs(50);

/// Client for one lease queue
#[derive(Debug, Clone)]
pub struct LeaseQueueClient {
    factory: Arc<ConnectionFactory>,
    credential: Credential,
    queue: EntityAddress,
    visibility_timeout: Duration,
    wait_timeout: Duration,
}

impl LeaseQueueClient {
    /// Create a client; `queue` must be a queue address
    pub fn new(
        factory: Arc<ConnectionFactory>,
        credential: Credential,
        queue: EntityAddress,
    ) -> Result<Self, ExchangeError> {
        if !matches!(queue, EntityAddress::Queue(_)) {
            return Err(ValidationError::InvalidFormat {
                field: "entity".to_string(),
                message: format!("lease operations require a queue, not '{}'", queue),
            }
            .into());
        }

        Ok(Self {
            factory,
            credential,
            queue,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            wait_timeout: DEFAULT_LEASE_WAIT,
        })
    }

    /// Create a client using the configured lease timings
    pub fn from_config(
        factory: Arc<ConnectionFactory>,
        credential: Credential,
        queue: EntityAddress,
        config: &ExchangeConfig,
    ) -> Result<Self, ExchangeError> {
        Ok(Self::new(factory, credential, queue)?
            .with_visibility_timeout(config.lease.visibility_timeout())
            .with_wait_timeout(config.lease.wait_timeout()))
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    pub fn queue(&self) -> &EntityAddress {
        &self.queue
    }

    /// Add a message; the receipt allows an immediate delete
    pub async fn send(&self, body: impl Into<Bytes>) -> Result<SendReceipt, ExchangeError> {
        let body = body.into();
        let mut handle = self.open(Role::Sender).await?;
        let result = handle.enqueue_leased(body).await;
        handle.close_quietly().await;

        let receipt = result?;
        debug!(queue = %self.queue, message_id = %receipt.message_id, "Message added");
        Ok(receipt)
    }

    /// Lease up to `count` messages (1..=32) for `visibility_timeout`
    pub async fn receive(
        &self,
        count: usize,
        visibility_timeout: Duration,
        wait_timeout: Duration,
    ) -> Result<Vec<LeasedMessage>, ExchangeError> {
        check_count(count)?;
        check_visibility(visibility_timeout)?;

        let mut handle = self.open(Role::Receiver).await?;
        let result = handle
            .receive_leased(count, visibility_timeout, wait_timeout)
            .await;
        handle.close_quietly().await;

        let messages = result?;
        debug!(queue = %self.queue, count, leased = messages.len(), "Messages leased");
        Ok(messages)
    }

    /// Lease one message with the client's default timings
    pub async fn receive_one(&self) -> Result<Option<LeasedMessage>, ExchangeError> {
        let mut messages = self
            .receive(1, self.visibility_timeout, self.wait_timeout)
            .await?;
        Ok(messages.pop())
    }

    /// Delete a leased message; fails if the receipt is stale or the lease lapsed
    pub async fn delete(
        &self,
        message_id: &MessageId,
        pop_receipt: &PopReceipt,
    ) -> Result<(), ExchangeError> {
        let mut handle = self.open(Role::Receiver).await?;
        let result = handle.delete_leased(message_id, pop_receipt).await;
        handle.close_quietly().await;

        if let Err(e) = &result {
            warn!(queue = %self.queue, message_id = %message_id, error = %e, "Delete failed");
        }
        result
    }

    /// Replace body and lease together, returning the new receipt
    pub async fn update(
        &self,
        message_id: &MessageId,
        pop_receipt: &PopReceipt,
        body: impl Into<Bytes>,
        visibility_timeout: Duration,
    ) -> Result<PopReceipt, ExchangeError> {
        check_visibility(visibility_timeout)?;

        let mut handle = self.open(Role::Receiver).await?;
        let result = handle
            .update_leased(message_id, pop_receipt, body.into(), visibility_timeout)
            .await;
        handle.close_quietly().await;

        if let Err(e) = &result {
            warn!(queue = %self.queue, message_id = %message_id, error = %e, "Update failed");
        }
        result
    }

    /// Best-effort message count
    pub async fn approximate_count(&self) -> Result<u64, ExchangeError> {
        let mut handle = self.open(Role::Receiver).await?;
        let result = handle.properties().await;
        handle.close_quietly().await;
        Ok(result?.approximate_message_count)
    }

    /// Lease up to `count` messages and delete each, returning their bodies
    ///
    /// A failed delete stops the drain; messages not yet deleted become visible
    /// again when their lease lapses.
    pub async fn drain(&self, count: usize) -> Result<Vec<Bytes>, ExchangeError> {
        check_count(count)?;

        let mut handle = self.open(Role::Receiver).await?;
        let result = drain_with(&handle, count, self.visibility_timeout, self.wait_timeout).await;
        handle.close_quietly().await;

        let bodies = result?;
        info!(queue = %self.queue, drained = bodies.len(), "Queue drained");
        Ok(bodies)
    }

    async fn open(&self, role: Role) -> Result<ConnectionHandle, ExchangeError> {
        self.factory
            .connect_with_retry(&self.credential, &self.queue, role)
            .await
    }
}

async fn drain_with(
    handle: &ConnectionHandle,
    count: usize,
    visibility_timeout: Duration,
    wait_timeout: Duration,
) -> Result<Vec<Bytes>, ExchangeError> {
    let messages = handle
        .receive_leased(count, visibility_timeout, wait_timeout)
        .await?;

    let mut bodies = Vec::with_capacity(messages.len());
    for message in messages {
        handle
            .delete_leased(&message.message_id, &message.pop_receipt)
            .await?;
        bodies.push(message.body);
    }
    Ok(bodies)
}

fn check_count(count: usize) -> Result<(), ValidationError> {
    if count == 0 || count > MAX_LEASE_COUNT {
        return Err(ValidationError::OutOfRange {
            field: "count".to_string(),
            message: format!("must be between 1 and {}, got {}", MAX_LEASE_COUNT, count),
        });
    }
    Ok(())
}

fn check_visibility(visibility_timeout: Duration) -> Result<(), ValidationError> {
    let secs = visibility_timeout.as_secs();
    if secs == 0 || secs > MAX_VISIBILITY_SECS {
        return Err(ValidationError::OutOfRange {
            field: "visibility_timeout".to_string(),
            message: format!(
                "must be between 1 and {} seconds, got {}",
                MAX_VISIBILITY_SECS, secs
            ),
        });
    }
    Ok(())
}
