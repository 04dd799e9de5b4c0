//! Non-blocking execution: spawned operations observed through a subscription.
//!
//! An operation is spawned on the current Tokio runtime and reports through a
//! bounded channel of [`Notification`]s: zero or more `Item`s followed by
//! exactly one terminal `Completed` or `Failed`. The channel is sized to the
//! batch plus one, so the terminal signal is buffered even if nobody polls.
//!
//! Cancellation is explicit. [`Subscription::dispose`] raises the operation's
//! [`Cancellation`], stops delivery, and waits for the operation's own cleanup
//! (abort the open transaction unit, close the connection) to finish.

use crate::config::MAX_BATCH_LIMIT;
use crate::error::ExchangeError;
use crate::message::{BatchSummary, MessageId, ReceiveOutcome, ReceivedMessage, SendResult};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "subscription_tests.rs"]
mod tests;

// ============================================================================
// Cancellation
// ============================================================================

/// Observer side of a cancellation signal
#[derive(Debug, Clone)]
pub struct Cancellation {
    receiver: Option<watch::Receiver<bool>>,
}

/// Trigger side of a cancellation signal
#[derive(Debug)]
pub struct CancelSignal {
    sender: watch::Sender<bool>,
}

impl CancelSignal {
    /// Raise the signal; repeated calls are harmless
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

impl Cancellation {
    /// A cancellation that never fires (blocking mode)
    pub fn never() -> Self {
        Self { receiver: None }
    }

    /// Create a connected signal/observer pair
    pub fn pair() -> (CancelSignal, Self) {
        let (sender, receiver) = watch::channel(false);
        (
            CancelSignal { sender },
            Self {
                receiver: Some(receiver),
            },
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.receiver
            .as_ref()
            .map(|receiver| *receiver.borrow())
            .unwrap_or(false)
    }

    /// Resolve once cancelled; never resolves for [`Cancellation::never`]
    pub async fn cancelled(&self) {
        let Some(receiver) = &self.receiver else {
            return std::future::pending().await;
        };

        let mut receiver = receiver.clone();
        if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            // Signal dropped without firing
            std::future::pending::<()>().await;
        }
    }

    /// Run `operation` unless cancellation fires first
    pub async fn guard<T, F>(&self, operation: F) -> Result<T, ExchangeError>
    where
        F: Future<Output = Result<T, ExchangeError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(ExchangeError::Cancelled),
            result = operation => result,
        }
    }
}

// ============================================================================
// Notifications
// ============================================================================

/// One signal from a non-blocking operation
#[derive(Debug)]
pub enum Notification<I, S> {
    /// A per-message result, in batch order
    Item(I),
    /// Terminal success
    Completed(S),
    /// Terminal failure
    Failed(ExchangeError),
}

impl<I, S> Notification<I, S> {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Item(_))
    }
}

/// Splits an operation result into per-item notifications and a summary
pub trait IntoNotifications {
    type Item: Send + 'static;
    type Summary: Send + 'static;

    fn into_notifications(self) -> (Vec<Self::Item>, Self::Summary);
}

impl IntoNotifications for SendResult {
    type Item = MessageId;
    type Summary = BatchSummary;

    fn into_notifications(self) -> (Vec<Self::Item>, Self::Summary) {
        let summary = BatchSummary {
            entity: self.entity,
            transaction_id: self.transaction_id,
            count: self.message_ids.len(),
        };
        (self.message_ids, summary)
    }
}

impl IntoNotifications for ReceiveOutcome {
    type Item = ReceivedMessage;
    type Summary = BatchSummary;

    fn into_notifications(self) -> (Vec<Self::Item>, Self::Summary) {
        let summary = BatchSummary {
            entity: self.entity,
            transaction_id: self.transaction_id,
            count: self.messages.len(),
        };
        (self.messages, summary)
    }
}

/// Everything a successful operation delivered
#[derive(Debug)]
pub struct Completion<I, S> {
    pub items: Vec<I>,
    pub summary: S,
}

// ============================================================================
// Subscription
// ============================================================================

/// Handle to a spawned operation
pub struct Subscription<I, S> {
    receiver: mpsc::Receiver<Notification<I, S>>,
    cancel: Option<CancelSignal>,
    task: Option<JoinHandle<()>>,
    finished: bool,
}

/// Subscription to a transactional send
pub type SendSubscription = Subscription<MessageId, BatchSummary>;

/// Subscription to a receive-and-complete batch
pub type ReceiveSubscription = Subscription<ReceivedMessage, BatchSummary>;

impl<I, S> Subscription<I, S>
where
    I: Send + 'static,
    S: Send + 'static,
{
    /// Spawn `operation` on the current runtime
    ///
    /// `expected_items` bounds how many items the operation can produce. Outside
    /// a Tokio runtime the subscription fails immediately.
    pub fn spawn<T, F, Fut>(expected_items: usize, operation: F) -> Self
    where
        T: IntoNotifications<Item = I, Summary = S> + Send,
        F: FnOnce(Cancellation) -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>> + Send + 'static,
    {
        let capacity = expected_items.min(MAX_BATCH_LIMIT).saturating_add(1);
        let (sender, receiver) = mpsc::channel(capacity);

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                let _ = sender.try_send(Notification::Failed(ExchangeError::Runtime {
                    message: e.to_string(),
                }));
                return Self {
                    receiver,
                    cancel: None,
                    task: None,
                    finished: false,
                };
            }
        };

        let (signal, cancellation) = Cancellation::pair();
        let operation = operation(cancellation);

        let task = runtime.spawn(async move {
            match operation.await {
                Ok(result) => {
                    let (items, summary) = result.into_notifications();
                    for item in items {
                        if sender.send(Notification::Item(item)).await.is_err() {
                            return;
                        }
                    }
                    let _ = sender.send(Notification::Completed(summary)).await;
                }
                Err(e) => {
                    let _ = sender.send(Notification::Failed(e)).await;
                }
            }
        });

        Self {
            receiver,
            cancel: Some(signal),
            task: Some(task),
            finished: false,
        }
    }

    /// Next notification; `None` after the terminal signal or disposal
    pub async fn next(&mut self) -> Option<Notification<I, S>> {
        if self.finished {
            return None;
        }

        let notification = self.receiver.recv().await;
        match &notification {
            Some(n) if !n.is_terminal() => {}
            _ => self.finished = true,
        }
        notification
    }

    /// Wait up to `timeout` for the terminal signal
    ///
    /// On timeout the operation is disposed before `Timeout` is returned.
    pub async fn wait(mut self, timeout: Duration) -> Result<Completion<I, S>, ExchangeError> {
        let deadline = tokio::time::Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(60 * 60 * 24 * 365));
        let mut items = Vec::new();

        loop {
            match tokio::time::timeout_at(deadline, self.next()).await {
                Ok(Some(Notification::Item(item))) => items.push(item),
                Ok(Some(Notification::Completed(summary))) => {
                    self.join().await;
                    return Ok(Completion { items, summary });
                }
                Ok(Some(Notification::Failed(e))) => {
                    self.join().await;
                    return Err(e);
                }
                Ok(None) => {
                    self.join().await;
                    return Err(ExchangeError::Runtime {
                        message: "operation ended without a terminal signal".to_string(),
                    });
                }
                Err(_) => {
                    warn!(timeout_ms = timeout.as_millis() as u64, "Operation timed out; disposing");
                    self.dispose().await;
                    return Err(ExchangeError::Timeout { duration: timeout });
                }
            }
        }
    }

    /// Deliver every notification to `callback`, then wait for the task to end
    pub async fn for_each<F>(mut self, mut callback: F)
    where
        F: FnMut(Notification<I, S>),
    {
        while let Some(notification) = self.next().await {
            callback(notification);
        }
        self.join().await;
    }

    /// Cancel the operation and wait for its cleanup; a second call is a no-op
    pub async fn dispose(&mut self) {
        let Some(task) = self.task.take() else {
            self.finished = true;
            return;
        };

        if let Some(signal) = &self.cancel {
            signal.cancel();
        }
        self.receiver.close();
        self.finished = true;

        if let Err(e) = task.await {
            if e.is_panic() {
                warn!("Operation panicked before disposal completed");
            }
        }
        debug!("Subscription disposed");
    }

    /// Whether the terminal signal was observed or the subscription disposed
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!("Operation task panicked");
                }
            }
        }
    }
}

impl<I, S> std::fmt::Debug for Subscription<I, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("running", &self.task.is_some())
            .field("finished", &self.finished)
            .finish()
    }
}

impl<I, S> Drop for Subscription<I, S> {
    fn drop(&mut self) {
        if self.task.is_some() {
            if let Some(signal) = &self.cancel {
                signal.cancel();
            }
            debug!("Subscription dropped while running; cancellation signalled");
        }
    }
}
