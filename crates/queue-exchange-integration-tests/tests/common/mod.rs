//! Common test utilities for queue-exchange integration tests
//!
//! This module provides:
//! - A harness wiring an in-memory broker, a manual clock and a connection factory
//! - Builders for senders, receivers and lease clients scoped to one entity

#![allow(dead_code)]

use queue_exchange::{
    ConnectionFactory, Credential, EntityAddress, InMemoryBroker, InMemoryConfig,
    LeaseQueueClient, LockModeReceiver, ManualClock, OutboundMessage, SharedKey,
    TransactionalSender,
};
use std::sync::Arc;
use std::time::Duration;

pub const ENDPOINT: &str = "contoso.servicebus.windows.net";
pub const NAMESPACE: &str = "contoso";
pub const KEY_NAME: &str = "RootManageSharedAccessKey";
pub const START: i64 = 1_700_000_000;

/// Receive wait used when messages are expected to be available
pub const SHORT_WAIT: Duration = Duration::from_millis(20);

pub fn key() -> SharedKey {
    SharedKey::from_string("c2VjcmV0LWtleQ==".to_string())
}

pub fn credential(entity_path: &str) -> Credential {
    Credential::new(KEY_NAME, key(), NAMESPACE, entity_path).unwrap()
}

pub fn batch(texts: &[&str]) -> Vec<OutboundMessage> {
    texts.iter().map(|t| OutboundMessage::from_text(t)).collect()
}

// ============================================================================
// Harness
// ============================================================================

/// Broker, clock and factory shared by one scenario
pub struct Harness {
    pub broker: InMemoryBroker,
    pub clock: ManualClock,
    pub factory: Arc<ConnectionFactory>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(InMemoryConfig::default())
    }

    pub fn with_config(config: InMemoryConfig) -> Self {
        let clock = ManualClock::at_epoch_seconds(START);
        let broker = InMemoryBroker::with_clock(ENDPOINT, config, Arc::new(clock.clone()));
        broker.authorize_key(KEY_NAME, key());
        let factory =
            ConnectionFactory::new(Arc::new(broker.clone())).with_clock(Arc::new(clock.clone()));

        Self {
            broker,
            clock,
            factory: Arc::new(factory),
        }
    }

    pub fn sender(&self, queue: &str) -> TransactionalSender {
        TransactionalSender::new(
            self.factory.clone(),
            credential(queue),
            EntityAddress::queue(queue).unwrap(),
        )
        .unwrap()
    }

    pub fn topic_sender(&self, topic: &str) -> TransactionalSender {
        TransactionalSender::new(
            self.factory.clone(),
            credential(topic),
            EntityAddress::topic(topic).unwrap(),
        )
        .unwrap()
    }

    pub fn receiver(&self, queue: &str) -> LockModeReceiver {
        LockModeReceiver::new(
            self.factory.clone(),
            credential(queue),
            EntityAddress::queue(queue).unwrap(),
        )
        .unwrap()
    }

    pub fn subscription_receiver(&self, topic: &str, subscription: &str) -> LockModeReceiver {
        let address = EntityAddress::subscription(topic, subscription).unwrap();
        LockModeReceiver::new(self.factory.clone(), credential(&address.path()), address).unwrap()
    }

    pub fn lease_client(&self, queue: &str) -> LeaseQueueClient {
        LeaseQueueClient::new(
            self.factory.clone(),
            credential(queue),
            EntityAddress::queue(queue).unwrap(),
        )
        .unwrap()
        .with_wait_timeout(Duration::ZERO)
    }

    /// Assert no link or transaction unit outlived its operation
    pub fn assert_released(&self) {
        assert_eq!(self.broker.open_link_count(), 0, "links left open");
        assert_eq!(
            self.broker.open_transaction_count(),
            0,
            "transaction units left open"
        );
    }
}
