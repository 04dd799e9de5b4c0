//! Tests for the queue-exchange library module.

use super::*;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_entity_name_validation() {
    assert!(EntityName::new("orders".to_string()).is_ok());
    assert!(EntityName::new("az204-queue.v2_a".to_string()).is_ok());

    assert!(EntityName::new("".to_string()).is_err());
    assert!(EntityName::new("-leading".to_string()).is_err());
    assert!(EntityName::new("double--hyphen".to_string()).is_err());
    assert!(EntityName::new("bad@name".to_string()).is_err());
}

#[test]
fn test_errors_classify_transience() {
    let handshake: ExchangeError = ConnectionError::HandshakeFailed {
        entity: "orders".to_string(),
        message: "reset".to_string(),
    }
    .into();
    let commit: ExchangeError = TransactionError::CommitFailed {
        transaction_id: "t".to_string(),
        message: "lost".to_string(),
    }
    .into();

    assert!(handshake.is_transient());
    assert!(!commit.is_transient());
}

/// Exercises the re-exported surface end to end
#[tokio::test]
async fn test_public_surface_round_trip() {
    let clock = ManualClock::at_epoch_seconds(1_700_000_000);
    let broker = InMemoryBroker::with_clock(
        "contoso.servicebus.windows.net",
        InMemoryConfig::default(),
        Arc::new(clock.clone()),
    );
    let key = SharedKey::from_string("c2VjcmV0LWtleQ==".to_string());
    broker.authorize_key("RootManageSharedAccessKey", key.clone());

    let factory = Arc::new(
        ConnectionFactory::new(Arc::new(broker.clone())).with_clock(Arc::new(clock)),
    );
    let credential =
        Credential::new("RootManageSharedAccessKey", key, "contoso", "orders").unwrap();
    let queue = EntityAddress::queue("orders").unwrap();

    let sender =
        TransactionalSender::new(factory.clone(), credential.clone(), queue.clone()).unwrap();
    let receiver = LockModeReceiver::new(factory, credential, queue).unwrap();

    sender.send_texts(&["hello"]).await.unwrap();
    let outcome = receiver
        .receive_and_complete(10, Duration::from_millis(10))
        .await
        .unwrap();

    assert_eq!(outcome.texts(), vec!["hello"]);
    assert_eq!(broker.message_count("orders"), 0);
}
