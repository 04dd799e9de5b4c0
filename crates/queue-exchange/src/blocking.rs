//! Blocking execution mode.
//!
//! [`BlockingExchange`] owns a Tokio runtime and drives the same async
//! operations the non-blocking mode spawns, blocking the calling thread until
//! the broker round trip and the transaction resolution complete. Every
//! blocking call is bounded by the configured operation timeout.

use crate::config::ExchangeConfig;
use crate::error::ExchangeError;
use crate::lease::LeaseQueueClient;
use crate::message::{
    LeasedMessage, MessageId, OutboundMessage, PopReceipt, ReceiveOutcome, SendReceipt, SendResult,
};
use crate::receiver::LockModeReceiver;
use crate::sender::TransactionalSender;
use crate::subscription::{Completion, ReceiveSubscription, SendSubscription, Subscription};
use bytes::Bytes;
use std::future::Future;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, warn};

#[cfg(test)]
#[path = "blocking_tests.rs"]
mod tests;

/// Runs exchange operations to completion on the calling thread
#[derive(Debug)]
pub struct BlockingExchange {
    runtime: Runtime,
    operation_timeout: Duration,
}

impl BlockingExchange {
    /// Build a runtime with `worker_threads` workers for spawned operations
    pub fn new(worker_threads: usize) -> Result<Self, ExchangeError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("queue-exchange")
            .enable_all()
            .build()
            .map_err(|e| ExchangeError::Runtime {
                message: e.to_string(),
            })?;

        let operation_timeout = ExchangeConfig::default().operation_timeout();
        debug!(
            worker_threads,
            operation_timeout_secs = operation_timeout.as_secs(),
            "Blocking exchange runtime started"
        );
        Ok(Self {
            runtime,
            operation_timeout,
        })
    }

    /// Build a runtime bounded by `config.operation_timeout_secs`
    pub fn from_config(worker_threads: usize, config: &ExchangeConfig) -> Result<Self, ExchangeError> {
        Ok(Self::new(worker_threads)?.with_operation_timeout(config.operation_timeout()))
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    /// Drive `operation` to completion
    ///
    /// Fails with [`ExchangeError::Runtime`] when called from inside an async
    /// context, where blocking would stall the caller's executor. An operation
    /// still running after the operation timeout is dropped, which rolls back
    /// its open transaction unit, and [`ExchangeError::Timeout`] is returned.
    pub fn block_on<T, F>(&self, operation: F) -> Result<T, ExchangeError>
    where
        F: Future<Output = Result<T, ExchangeError>>,
    {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(ExchangeError::Runtime {
                message: "blocking call made from inside an async context".to_string(),
            });
        }

        let limit = self.operation_timeout;
        self.runtime.block_on(async move {
            match tokio::time::timeout(limit, operation).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(timeout_secs = limit.as_secs_f64(), "Blocking operation timed out");
                    Err(ExchangeError::Timeout { duration: limit })
                }
            }
        })
    }

    // ------------------------------------------------------------------------
    // Transactional operations
    // ------------------------------------------------------------------------

    pub fn send(
        &self,
        sender: &TransactionalSender,
        messages: &[OutboundMessage],
    ) -> Result<SendResult, ExchangeError> {
        self.block_on(sender.send(messages))
    }

    pub fn receive_and_complete(
        &self,
        receiver: &LockModeReceiver,
        max_count: usize,
        wait_timeout: Duration,
    ) -> Result<ReceiveOutcome, ExchangeError> {
        self.block_on(receiver.receive_and_complete(max_count, wait_timeout))
    }

    pub fn receive_and_forward(
        &self,
        receiver: &LockModeReceiver,
        destination: &TransactionalSender,
        max_count: usize,
        wait_timeout: Duration,
    ) -> Result<ReceiveOutcome, ExchangeError> {
        self.block_on(receiver.receive_and_forward(destination, max_count, wait_timeout))
    }

    // ------------------------------------------------------------------------
    // Lease operations
    // ------------------------------------------------------------------------

    pub fn lease_send(
        &self,
        client: &LeaseQueueClient,
        body: impl Into<Bytes>,
    ) -> Result<SendReceipt, ExchangeError> {
        self.block_on(client.send(body))
    }

    pub fn lease_receive(
        &self,
        client: &LeaseQueueClient,
        count: usize,
        visibility_timeout: Duration,
        wait_timeout: Duration,
    ) -> Result<Vec<LeasedMessage>, ExchangeError> {
        self.block_on(client.receive(count, visibility_timeout, wait_timeout))
    }

    pub fn lease_delete(
        &self,
        client: &LeaseQueueClient,
        message_id: &MessageId,
        pop_receipt: &PopReceipt,
    ) -> Result<(), ExchangeError> {
        self.block_on(client.delete(message_id, pop_receipt))
    }

    pub fn lease_update(
        &self,
        client: &LeaseQueueClient,
        message_id: &MessageId,
        pop_receipt: &PopReceipt,
        body: impl Into<Bytes>,
        visibility_timeout: Duration,
    ) -> Result<PopReceipt, ExchangeError> {
        self.block_on(client.update(message_id, pop_receipt, body, visibility_timeout))
    }

    // ------------------------------------------------------------------------
    // Non-blocking operations on the owned runtime
    // ------------------------------------------------------------------------

    /// Start a send on the owned runtime without blocking
    pub fn spawn_send(
        &self,
        sender: &TransactionalSender,
        messages: Vec<OutboundMessage>,
    ) -> SendSubscription {
        let _entered = self.runtime.enter();
        sender.spawn_send(messages)
    }

    /// Start a receive-and-complete on the owned runtime without blocking
    pub fn spawn_receive_and_complete(
        &self,
        receiver: &LockModeReceiver,
        max_count: usize,
        wait_timeout: Duration,
    ) -> ReceiveSubscription {
        let _entered = self.runtime.enter();
        receiver.spawn_receive_and_complete(max_count, wait_timeout)
    }

    /// Block until a spawned operation reaches its terminal signal or `timeout`
    pub fn wait<I, S>(
        &self,
        subscription: Subscription<I, S>,
        timeout: Duration,
    ) -> Result<Completion<I, S>, ExchangeError>
    where
        I: Send + 'static,
        S: Send + 'static,
    {
        self.block_on(subscription.wait(timeout))
    }

    /// Cancel a spawned operation and wait for its cleanup
    pub fn dispose<I, S>(&self, subscription: &mut Subscription<I, S>) -> Result<(), ExchangeError>
    where
        I: Send + 'static,
        S: Send + 'static,
    {
        self.block_on(async {
            subscription.dispose().await;
            Ok(())
        })
    }
}
