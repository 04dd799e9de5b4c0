//! Integration tests for blocking and non-blocking execution
//!
//! These tests verify:
//! - Spawned operations deliver items, then exactly one terminal signal
//! - Failures reach subscribers that start listening late
//! - Disposing twice is safe and releases the connection
//! - The blocking mode runs the same operations on the calling thread

mod common;

use common::{batch, Harness, SHORT_WAIT};
use queue_exchange::{BlockingExchange, ExchangeError, Notification};
use std::time::Duration;

/// Items arrive in order, then one completion
#[tokio::test]
async fn test_spawned_send_then_receive() {
    let harness = Harness::new();

    let mut sent = Vec::new();
    harness
        .sender("orders")
        .spawn_send(batch(&["a", "b", "c"]))
        .for_each(|n| sent.push(n))
        .await;
    assert_eq!(sent.len(), 4);
    assert!(matches!(sent[3], Notification::Completed(ref s) if s.count == 3));

    let completion = harness
        .receiver("orders")
        .spawn_receive_and_complete(10, SHORT_WAIT)
        .wait(Duration::from_secs(5))
        .await
        .unwrap();

    let texts: Vec<_> = completion
        .items
        .iter()
        .filter_map(|m| m.body_text().map(str::to_string))
        .collect();
    assert_eq!(texts, vec!["a", "b", "c"]);
    assert_eq!(harness.broker.message_count("orders"), 0);
}

/// A failure that happens before anyone listens is still delivered
#[tokio::test]
async fn test_late_subscriber_sees_failure() {
    let harness = Harness::new();
    harness.broker.fail_enqueue_at(2);

    let mut subscription = harness.sender("orders").spawn_send(batch(&["a", "b", "c"]));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!subscription.is_finished());

    assert!(matches!(
        subscription.next().await,
        Some(Notification::Failed(ExchangeError::Delivery(_)))
    ));
    assert!(subscription.next().await.is_none());
    assert_eq!(harness.broker.message_count("orders"), 0);
    harness.assert_released();
}

/// Disposing twice cancels once and releases the link and unit
#[tokio::test]
async fn test_dispose_twice_releases_resources() {
    let harness = Harness::new();
    let mut subscription = harness
        .receiver("orders")
        .spawn_receive_and_complete(10, Duration::from_secs(300));

    while harness.broker.open_transaction_count() == 0 {
        tokio::task::yield_now().await;
    }

    subscription.dispose().await;
    subscription.dispose().await;

    harness.assert_released();
}

/// Waiting past the deadline disposes the operation
#[tokio::test]
async fn test_wait_timeout_releases_resources() {
    let harness = Harness::new();
    let subscription = harness
        .receiver("orders")
        .spawn_receive_and_complete(10, Duration::from_secs(300));

    let result = subscription.wait(Duration::from_millis(50)).await;

    assert!(matches!(result, Err(ExchangeError::Timeout { .. })));
    harness.assert_released();
}

/// The blocking mode drives the same exchange from synchronous code
#[test]
fn test_blocking_exchange_round_trip() {
    let harness = Harness::new();
    let exchange = BlockingExchange::new(2).unwrap();

    exchange
        .send(&harness.sender("orders"), &batch(&["a", "b", "c"]))
        .unwrap();
    assert_eq!(harness.broker.message_count("orders"), 3);

    let outcome = exchange
        .receive_and_complete(&harness.receiver("orders"), 100, SHORT_WAIT)
        .unwrap();

    assert_eq!(outcome.texts(), vec!["a", "b", "c"]);
    assert_eq!(harness.broker.message_count("orders"), 0);
    harness.assert_released();
}

/// Blocking failures are returned, with nothing left behind
#[test]
fn test_blocking_failure_is_returned() {
    let harness = Harness::new();
    let exchange = BlockingExchange::new(1).unwrap();
    harness.broker.fail_enqueue_at(3);

    let result = exchange.send(&harness.sender("orders"), &batch(&["a", "b", "c"]));

    assert!(result.is_err());
    assert_eq!(harness.broker.message_count("orders"), 0);
    harness.assert_released();
}
