//! Tests for connection strings, the connection factory and handles.

use super::*;
use crate::clock::ManualClock;
use crate::credential::SharedKey;
use crate::message::Timestamp;
use crate::providers::{InMemoryBroker, InMemoryConfig};
use async_trait::async_trait;
use std::sync::Mutex;

const KEY_NAME: &str = "RootManageSharedAccessKey";

fn key() -> SharedKey {
    SharedKey::from_string("c2VjcmV0LWtleQ==".to_string())
}

fn credential() -> Credential {
    Credential::new(KEY_NAME, key(), "contoso", "orders").unwrap()
}

fn orders() -> EntityAddress {
    EntityAddress::queue("orders").unwrap()
}

// ============================================================================
// Scripted broker double
// ============================================================================

/// Behaviour of the scripted link and a log of the calls it saw
#[derive(Debug, Default)]
struct Script {
    fail_commit: bool,
    detach_on_commit: bool,
    fail_rollback: bool,
    fail_close: bool,
    calls: Mutex<Vec<String>>,
}

impl Script {
    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

fn detached() -> ExchangeError {
    ConnectionError::LinkDetached {
        entity: "orders".to_string(),
        message: "scripted failure".to_string(),
    }
    .into()
}

#[derive(Debug)]
struct ScriptedLink {
    script: Arc<Script>,
}

#[async_trait]
impl BrokerLink for ScriptedLink {
    fn link_id(&self) -> &str {
        "scripted-link"
    }

    async fn create_transaction(&self) -> Result<TransactionId, ExchangeError> {
        self.script.record("create");
        Ok(TransactionId::new("txn-1".to_string()))
    }

    async fn commit_transaction(&self, _: &TransactionId) -> Result<(), ExchangeError> {
        self.script.record("commit");
        if self.script.fail_commit {
            return Err(TransactionError::CommitFailed {
                transaction_id: "txn-1".to_string(),
                message: "scripted failure".to_string(),
            }
            .into());
        }
        if self.script.detach_on_commit {
            return Err(detached());
        }
        Ok(())
    }

    async fn rollback_transaction(&self, _: &TransactionId) -> Result<(), ExchangeError> {
        self.script.record("rollback");
        if self.script.fail_rollback {
            return Err(detached());
        }
        Ok(())
    }

    async fn enqueue(
        &self,
        _: &OutboundMessage,
        transaction: Option<&TransactionId>,
    ) -> Result<MessageId, ExchangeError> {
        self.script.record(if transaction.is_some() {
            "enqueue-in-txn"
        } else {
            "enqueue"
        });
        Ok(MessageId::new())
    }

    async fn receive_locked(
        &self,
        _: usize,
        _: Duration,
    ) -> Result<Vec<ReceivedMessage>, ExchangeError> {
        self.script.record("receive");
        Ok(Vec::new())
    }

    async fn complete(&self, _: &LockToken, _: Option<&TransactionId>) -> Result<(), ExchangeError> {
        self.script.record("complete");
        Ok(())
    }

    async fn abandon(&self, _: &LockToken) -> Result<(), ExchangeError> {
        self.script.record("abandon");
        Ok(())
    }

    async fn enqueue_leased(&self, _: Bytes) -> Result<SendReceipt, ExchangeError> {
        self.script.record("enqueue-leased");
        Ok(SendReceipt {
            message_id: MessageId::new(),
            pop_receipt: PopReceipt::generate(),
            inserted_at: Timestamp::now(),
        })
    }

    async fn receive_leased(
        &self,
        _: usize,
        _: Duration,
        _: Duration,
    ) -> Result<Vec<LeasedMessage>, ExchangeError> {
        self.script.record("receive-leased");
        Ok(Vec::new())
    }

    async fn delete_leased(&self, _: &MessageId, _: &PopReceipt) -> Result<(), ExchangeError> {
        self.script.record("delete-leased");
        Ok(())
    }

    async fn update_leased(
        &self,
        _: &MessageId,
        _: &PopReceipt,
        _: Bytes,
        _: Duration,
    ) -> Result<PopReceipt, ExchangeError> {
        self.script.record("update-leased");
        Ok(PopReceipt::generate())
    }

    async fn properties(&self) -> Result<EntityProperties, ExchangeError> {
        self.script.record("properties");
        Ok(EntityProperties {
            entity: "orders".to_string(),
            approximate_message_count: 0,
        })
    }

    async fn close(&self) -> Result<(), ExchangeError> {
        self.script.record("close");
        if self.script.fail_close {
            return Err(detached());
        }
        Ok(())
    }
}

/// Transport that records requests and hands out scripted links
#[derive(Debug, Default)]
struct RecordingTransport {
    script: Arc<Script>,
    requests: Mutex<Vec<LinkRequest>>,
}

impl RecordingTransport {
    fn with_script(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Arc::new(script),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<LinkRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrokerTransport for RecordingTransport {
    async fn open_link(&self, request: LinkRequest) -> Result<Box<dyn BrokerLink>, ExchangeError> {
        self.requests.lock().unwrap().push(request);
        Ok(Box::new(ScriptedLink {
            script: self.script.clone(),
        }))
    }
}

fn scripted(script: Script) -> (Arc<RecordingTransport>, ConnectionFactory) {
    let transport = RecordingTransport::with_script(script);
    let factory = ConnectionFactory::new(transport.clone())
        .with_clock(Arc::new(ManualClock::at_epoch_seconds(1_700_000_000)));
    (transport, factory)
}

async fn open(script: Script, role: Role) -> (Arc<RecordingTransport>, ConnectionHandle) {
    let (transport, factory) = scripted(script);
    let handle = factory.connect(&credential(), &orders(), role).await.unwrap();
    (transport, handle)
}

// ============================================================================
// Connection String Tests
// ============================================================================

mod connection_strings {
    use super::*;

    #[test]
    fn test_factory_builds_endpoint_and_token() {
        let (_, factory) = scripted(Script::default());

        let connection_string = factory.connection_string(&credential()).unwrap();
        let rendered = connection_string.to_string();

        assert!(rendered.starts_with(
            "Endpoint=contoso.servicebus.windows.net;SharedAccessSignature=SharedAccessSignature \
             sr=contoso.servicebus.windows.net%2Forders&sig="
        ));
        assert!(rendered.ends_with("&se=1700604800&skn=RootManageSharedAccessKey"));
        assert_eq!(connection_string.endpoint(), "contoso.servicebus.windows.net");
    }

    #[test]
    fn test_parse_round_trip() {
        let (_, factory) = scripted(Script::default());
        let original = factory.connection_string(&credential()).unwrap();

        let parsed: ConnectionString = original.to_string().parse().unwrap();

        assert_eq!(parsed, original);
    }

    #[test]
    fn test_parse_tolerates_scheme_and_trailing_slash() {
        let (_, factory) = scripted(Script::default());
        let token = factory.connection_string(&credential()).unwrap().token().clone();
        let raw = format!(
            "Endpoint=sb://contoso.servicebus.windows.net/;SharedAccessSignature={};",
            token
        );

        let parsed = ConnectionString::parse(&raw).unwrap();

        assert_eq!(parsed.endpoint(), "contoso.servicebus.windows.net");
        assert_eq!(parsed.token(), &token);
    }

    #[test]
    fn test_parse_missing_parts() {
        let missing_token = ConnectionString::parse("Endpoint=contoso.servicebus.windows.net");
        assert!(matches!(
            missing_token,
            Err(ExchangeError::Connection(
                ConnectionError::MalformedConnectionString { .. }
            ))
        ));

        let missing_endpoint =
            ConnectionString::parse("SharedAccessSignature=SharedAccessSignature sr=a&sig=b&se=1&skn=c");
        assert!(matches!(
            missing_endpoint,
            Err(ExchangeError::Connection(
                ConnectionError::MalformedConnectionString { .. }
            ))
        ));
    }

    #[test]
    fn test_parse_rejects_malformed_token() {
        let result = ConnectionString::parse(
            "Endpoint=contoso.servicebus.windows.net;SharedAccessSignature=not-a-token",
        );
        assert!(matches!(result, Err(ExchangeError::Credential(_))));
    }

    #[test]
    fn test_debug_redacts_signature() {
        let (_, factory) = scripted(Script::default());
        let connection_string = factory.connection_string(&credential()).unwrap();

        let debug = format!("{:?}", connection_string);

        assert!(!debug.contains(connection_string.token().signature()));
        assert!(debug.contains("contoso.servicebus.windows.net"));
    }
}

// ============================================================================
// Factory Tests
// ============================================================================

mod factory {
    use super::*;

    #[tokio::test]
    async fn test_signed_token_mode_sends_connection_string() {
        let (transport, mut handle) = open(Script::default(), Role::Sender).await;

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].endpoint, "contoso.servicebus.windows.net");
        assert_eq!(requests[0].role, Role::Sender);
        match &requests[0].authorization {
            Authorization::SharedAccessSignature(cs) => {
                assert_eq!(cs.token().resource_uri(), "contoso.servicebus.windows.net/orders");
                assert_eq!(cs.token().key_name(), KEY_NAME);
            }
            other => panic!("unexpected authorization: {:?}", other),
        }

        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_shared_key_mode_sends_key() {
        let (transport, factory) = scripted(Script::default());
        let mut handle = factory
            .with_auth_mode(AuthMode::SharedKey)
            .connect(&credential(), &orders(), Role::Receiver)
            .await
            .unwrap();

        match &transport.requests()[0].authorization {
            Authorization::SharedKey { key_name, key } => {
                assert_eq!(key_name, KEY_NAME);
                assert_eq!(key.expose_bytes(), b"c2VjcmV0LWtleQ==");
            }
            other => panic!("unexpected authorization: {:?}", other),
        }

        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_direction_checked_before_handshake() {
        let (transport, factory) = scripted(Script::default());

        let topic = EntityAddress::topic("events").unwrap();
        let subscription = EntityAddress::subscription("events", "audit").unwrap();

        let receive_from_topic = factory.connect(&credential(), &topic, Role::Receiver).await;
        let send_to_subscription = factory
            .connect(&credential(), &subscription, Role::Sender)
            .await;

        assert!(matches!(
            receive_from_topic,
            Err(ExchangeError::Validation(ValidationError::InvalidFormat { .. }))
        ));
        assert!(matches!(
            send_to_subscription,
            Err(ExchangeError::Validation(ValidationError::InvalidFormat { .. }))
        ));
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_from_config_applies_settings() {
        let config = ExchangeConfig {
            namespace: "contoso".to_string(),
            broker_domain: "servicebus.example.net".to_string(),
            auth_mode: AuthMode::SharedKey,
            ..ExchangeConfig::default()
        };

        let factory =
            ConnectionFactory::from_config(RecordingTransport::with_script(Script::default()), &config);

        assert_eq!(factory.broker_domain(), "servicebus.example.net");
        assert_eq!(factory.auth_mode(), AuthMode::SharedKey);
        assert_eq!(factory.retry_policy().max_attempts, config.retry.max_attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_with_retry_recovers_from_transient_failures() {
        let clock = ManualClock::at_epoch_seconds(1_700_000_000);
        let broker = InMemoryBroker::with_clock(
            "contoso.servicebus.windows.net",
            InMemoryConfig::default(),
            Arc::new(clock.clone()),
        );
        broker.authorize_key(KEY_NAME, key());
        broker.fail_handshakes(2);

        let factory = ConnectionFactory::new(Arc::new(broker.clone()))
            .with_clock(Arc::new(clock))
            .with_retry_policy(RetryPolicy::default().without_jitter());

        let mut handle = factory
            .connect_with_retry(&credential(), &orders(), Role::Sender)
            .await
            .unwrap();

        assert!(handle.is_open());
        handle.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_with_retry_gives_up() {
        let broker = InMemoryBroker::new("contoso.servicebus.windows.net", InMemoryConfig::default());
        broker.authorize_key(KEY_NAME, key());
        broker.fail_handshakes(10);

        let factory = ConnectionFactory::new(Arc::new(broker))
            .with_retry_policy(RetryPolicy::default().without_jitter());

        let result = factory
            .connect_with_retry(&credential(), &orders(), Role::Sender)
            .await;

        assert!(matches!(
            result,
            Err(ExchangeError::Connection(ConnectionError::HandshakeFailed { .. }))
        ));
    }
}

// ============================================================================
// Handle Tests
// ============================================================================

mod handles {
    use super::*;

    #[tokio::test]
    async fn test_role_mismatch_is_rejected() {
        let (transport, mut handle) = open(Script::default(), Role::Receiver).await;

        let result = handle.enqueue(&OutboundMessage::from_text("x"), None).await;

        assert!(matches!(
            result,
            Err(ExchangeError::Connection(ConnectionError::RoleMismatch {
                expected: Role::Sender,
                actual: Role::Receiver,
                ..
            }))
        ));
        assert!(!transport.script.calls().contains(&"enqueue".to_string()));
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_properties_available_to_either_role() {
        let (_, mut handle) = open(Script::default(), Role::Sender).await;
        let properties = handle.properties().await.unwrap();
        assert_eq!(properties.entity, "orders");
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (transport, mut handle) = open(Script::default(), Role::Sender).await;

        handle.close().await.unwrap();
        handle.close().await.unwrap();

        assert!(!handle.is_open());
        assert_eq!(handle.link_id(), None);
        let closes = transport.script.calls().iter().filter(|c| *c == "close").count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        let (_, mut handle) = open(Script::default(), Role::Sender).await;
        handle.close().await.unwrap();

        let result = handle.begin_transaction().await;

        assert!(matches!(
            result,
            Err(ExchangeError::Connection(ConnectionError::Closed { .. }))
        ));
    }

    #[tokio::test]
    async fn test_close_failure_still_closes_handle() {
        let script = Script {
            fail_close: true,
            ..Script::default()
        };
        let (_, mut handle) = open(script, Role::Sender).await;

        let result = handle.close().await;

        assert!(matches!(
            result,
            Err(ExchangeError::Connection(ConnectionError::CloseFailed { .. }))
        ));
        assert!(!handle.is_open());
    }

    #[tokio::test]
    async fn test_dropped_handle_closes_in_background() {
        let (transport, handle) = open(Script::default(), Role::Sender).await;

        drop(handle);
        tokio::task::yield_now().await;

        assert!(transport.script.calls().contains(&"close".to_string()));
    }
}

// ============================================================================
// Transaction Unit Tests
// ============================================================================

mod transaction_units {
    use super::*;

    #[tokio::test]
    async fn test_commit_resolves_unit() {
        let (transport, mut handle) = open(Script::default(), Role::Sender).await;

        let mut unit = handle.begin_transaction().await.unwrap();
        assert!(unit.is_open());
        handle
            .enqueue(&OutboundMessage::from_text("a"), Some(&unit))
            .await
            .unwrap();
        handle.commit(&mut unit).await.unwrap();

        assert_eq!(unit.state(), TransactionState::Committed);
        assert_eq!(
            transport.script.calls(),
            vec!["create", "enqueue-in-txn", "commit"]
        );
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_resolved_unit_cannot_be_reused() {
        let (_, mut handle) = open(Script::default(), Role::Sender).await;
        let mut unit = handle.begin_transaction().await.unwrap();
        handle.abort(&mut unit).await.unwrap();
        assert_eq!(unit.state(), TransactionState::Aborted);

        let commit = handle.commit(&mut unit).await;
        let enqueue = handle
            .enqueue(&OutboundMessage::from_text("late"), Some(&unit))
            .await;

        assert!(matches!(
            commit,
            Err(ExchangeError::Transaction(TransactionError::NotOpen { .. }))
        ));
        assert!(matches!(
            enqueue,
            Err(ExchangeError::Transaction(TransactionError::NotOpen { .. }))
        ));
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_commit_is_indeterminate() {
        let script = Script {
            fail_commit: true,
            ..Script::default()
        };
        let (_, mut handle) = open(script, Role::Sender).await;
        let mut unit = handle.begin_transaction().await.unwrap();

        let result = handle.commit(&mut unit).await;

        assert!(result.is_err());
        assert_eq!(unit.state(), TransactionState::Indeterminate);
        assert!(!unit.is_open());
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_abort_is_indeterminate() {
        let script = Script {
            fail_rollback: true,
            ..Script::default()
        };
        let (_, mut handle) = open(script, Role::Sender).await;
        let mut unit = handle.begin_transaction().await.unwrap();

        let result = handle.abort(&mut unit).await;

        match result {
            Err(ref e @ ExchangeError::Transaction(TransactionError::RollbackFailed {
                ref message,
                ..
            })) => {
                assert!(message.contains("scripted failure"));
                assert!(!e.is_transient());
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(unit.state(), TransactionState::Indeterminate);
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_detached_commit_is_not_retryable() {
        let script = Script {
            detach_on_commit: true,
            ..Script::default()
        };
        let (_, mut handle) = open(script, Role::Sender).await;
        let mut unit = handle.begin_transaction().await.unwrap();

        let result = handle.commit(&mut unit).await;

        match result {
            Err(ref e @ ExchangeError::Transaction(TransactionError::CommitFailed {
                ref transaction_id,
                ref message,
            })) => {
                assert_eq!(transaction_id, "txn-1");
                assert!(message.contains("scripted failure"));
                assert!(!e.is_transient());
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(unit.state(), TransactionState::Indeterminate);
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_send_surfaces_detached_commit() {
        let script = Script {
            detach_on_commit: true,
            ..Script::default()
        };
        let (transport, handle) = open(script, Role::Sender).await;

        let result =
            crate::sender::send_batch(handle, &[OutboundMessage::from_text("a")]).await;

        let error = result.unwrap_err();
        assert!(matches!(
            error,
            ExchangeError::Transaction(TransactionError::CommitFailed { .. })
        ));
        assert!(!error.should_retry());
        assert_eq!(
            transport.script.calls(),
            vec!["create", "enqueue-in-txn", "commit", "close"]
        );
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TransactionState::Open.to_string(), "open");
        assert_eq!(TransactionState::Indeterminate.to_string(), "indeterminate");
    }
}
