//! Relay Client Integration Tests
//!
//! End-to-end tests of the relay client against the in-memory relay: name
//! binding publish and lookup, replaceable retention, concurrent correlation,
//! timeouts, size limits and connection loss.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use futures::StreamExt;
use nametag_core::{
    build_binding_event_at, ClientMessage, EventBuilder, Filter, Keys, NametagError,
    TransportError,
};
use nametag_harness::{init_test_tracing, MockRelay, MockRelayConfig, ReconnectConfig};
use nametag_relay::{
    ConnectionListener, ConnectionNotice, ConnectionState, HexCodec, PublishOutcome,
    RejectionKind, RelayClient, RelayConfig, SubscriptionItem,
};
use tokio::sync::broadcast;
use tokio::time::timeout;

// ----------------------------------------------------------------------------
// Test Configuration
// ----------------------------------------------------------------------------

const TEST_TIMEOUT: Duration = Duration::from_secs(5);
const RELAY_URL: &str = "ws://mock.relay";

fn test_config() -> RelayConfig {
    RelayConfig::default_with_relay(RELAY_URL)
}

async fn connect(relay: &MockRelay, keys: Keys) -> RelayClient {
    connect_with(relay, keys, test_config()).await
}

async fn connect_with(relay: &MockRelay, keys: Keys, config: RelayConfig) -> RelayClient {
    init_test_tracing();
    RelayClient::builder(keys)
        .config(config)
        .connector(relay.connector())
        .connect()
        .await
        .expect("client should connect to the mock relay")
}

async fn next_notice(notices: &mut broadcast::Receiver<ConnectionNotice>) -> ConnectionNotice {
    timeout(TEST_TIMEOUT, notices.recv())
        .await
        .expect("notice within timeout")
        .expect("notice channel open")
}

async fn wait_for_state(client: &RelayClient, expected: ConnectionState) {
    timeout(TEST_TIMEOUT, async {
        while client.state() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("state reached within timeout");
}

// ----------------------------------------------------------------------------
// Name Bindings
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_name_binding_roundtrip() {
    let relay = MockRelay::new();
    let client = connect(&relay, Keys::generate()).await;

    let receipt = client
        .publish_name_binding("alice", "DIRECT://addr1")
        .await
        .unwrap();
    assert_eq!(receipt.outcome, PublishOutcome::Accepted);

    let key = client.query_key_by_name("alice").await.unwrap();
    assert_eq!(key, Some(client.public_key()));

    let name = client.query_name_by_key(&client.public_key()).await.unwrap();
    assert_eq!(name.as_deref(), Some("alice"));

    let binding = client
        .query_binding_by_key(&client.public_key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(binding.address, "DIRECT://addr1");
    assert_eq!(binding.pubkey, client.public_key());
}

#[tokio::test]
async fn test_missing_name_is_none_not_error() {
    let relay = MockRelay::new();
    let client = connect(&relay, Keys::generate()).await;

    assert_eq!(client.query_key_by_name("nobody").await.unwrap(), None);
    let stranger = Keys::generate().public_key_hex();
    assert_eq!(client.query_name_by_key(&stranger).await.unwrap(), None);
    assert_eq!(client.connection().coordinator().pending_count(), 0);
}

#[tokio::test]
async fn test_newer_binding_replaces_older() {
    let relay = MockRelay::new();
    let keys = Keys::generate();
    let client = connect(&relay, keys.clone()).await;

    let newer = build_binding_event_at(&keys, "alicia", "addr2", 2_000).unwrap();
    let older = build_binding_event_at(&keys, "alice", "addr1", 1_000).unwrap();
    assert!(client.publish(&newer).await.unwrap().is_accepted());
    // A stale rebind is acknowledged but must not win
    client.publish(&older).await.unwrap();

    let name = client.query_name_by_key(&keys.public_key_hex()).await.unwrap();
    assert_eq!(name.as_deref(), Some("alicia"));
    assert_eq!(client.query_key_by_name("alice").await.unwrap(), None);
    assert_eq!(relay.stored_events().await, vec![newer]);
}

#[tokio::test]
async fn test_republishing_identical_binding_is_idempotent() {
    let relay = MockRelay::new();
    let keys = Keys::generate();
    let client = connect(&relay, keys.clone()).await;

    let first = build_binding_event_at(&keys, "bob", "addr", 1_700_000_000).unwrap();
    let second = build_binding_event_at(&keys, "bob", "addr", 1_700_000_000).unwrap();
    assert_eq!(first.id, second.id);

    tokio_test::assert_ok!(client.publish(&first).await);
    assert_eq!(client.publish(&second).await.unwrap(), PublishOutcome::Accepted);
    assert_eq!(relay.stored_events().await.len(), 1);
}

#[tokio::test]
async fn test_invalid_name_rejected_before_sending() {
    let relay = MockRelay::new();
    let client = connect(&relay, Keys::generate()).await;

    let err = client.publish_name_binding("two words", "addr").await.unwrap_err();
    assert!(matches!(err, NametagError::InvalidInput(_)));
    assert!(relay.received_frames().await.is_empty());
}

// ----------------------------------------------------------------------------
// Correlation
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_concurrent_queries_never_cross_deliver() {
    const N: usize = 8;
    let relay = MockRelay::new();
    let owners: Vec<Keys> = (0..N).map(|_| Keys::generate()).collect();
    for (i, keys) in owners.iter().enumerate() {
        let event = build_binding_event_at(keys, &format!("user{i}"), "addr", 1_000).unwrap();
        relay.seed(event).await;
    }
    // Answer only once all queries are in flight, round-robin interleaved
    relay.hold_responses(Some(N)).await;

    let client = connect(&relay, Keys::generate()).await;
    let names: Vec<String> = (0..N).map(|i| format!("user{i}")).collect();
    let results = join_all(names.iter().map(|name| client.query_key_by_name(name))).await;

    for (keys, result) in owners.iter().zip(results) {
        assert_eq!(result.unwrap(), Some(keys.public_key_hex()));
    }
    assert_eq!(client.connection().coordinator().pending_count(), 0);
}

#[tokio::test]
async fn test_query_all_collects_until_eose() {
    let relay = MockRelay::new();
    let author = Keys::generate();
    for i in 0..3u64 {
        let note = EventBuilder::new(1, format!("note {i}"))
            .created_at(100 + i)
            .sign(&author)
            .unwrap();
        relay.seed(note).await;
    }
    let client = connect(&relay, Keys::generate()).await;

    let events = client
        .query_all(vec![Filter::new().kind(1).author(author.public_key_hex())])
        .await
        .unwrap();
    let contents: Vec<&str> = events.iter().map(|e| e.content.as_str()).collect();
    assert_eq!(contents, vec!["note 2", "note 1", "note 0"]);
}

#[tokio::test]
async fn test_query_timeout_sends_close() {
    let relay = MockRelay::new();
    let config = RelayConfig {
        query_timeout: Duration::from_millis(150),
        ..test_config()
    };
    let client = connect_with(&relay, Keys::generate(), config).await;
    relay.set_silent(true).await;

    let err = client.query_key_by_name("alice").await.unwrap_err();
    assert!(matches!(err, NametagError::Timeout { operation: "query", .. }));
    assert!(err.is_retryable());
    assert_eq!(client.connection().coordinator().pending_count(), 0);

    timeout(TEST_TIMEOUT, async {
        loop {
            let frames = relay.received_frames().await;
            let closed = frames
                .iter()
                .filter_map(|f| ClientMessage::from_json(f).ok())
                .any(|m| matches!(m, ClientMessage::Close(_)));
            if closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("CLOSE sent after timeout");
}

#[tokio::test]
async fn test_publish_timeout_when_relay_silent() {
    let relay = MockRelay::new();
    let config = RelayConfig {
        publish_timeout: Duration::from_millis(150),
        ..test_config()
    };
    let client = connect_with(&relay, Keys::generate(), config).await;
    relay.set_silent(true).await;

    let event = EventBuilder::new(1, "unheard").sign(client.keys()).unwrap();
    let err = client.publish(&event).await.unwrap_err();
    assert!(matches!(err, NametagError::Timeout { operation: "publish", .. }));
}

// ----------------------------------------------------------------------------
// Size Limits
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_two_mebibyte_publish_is_rejected_locally() {
    let relay = MockRelay::new();
    let client = connect(&relay, Keys::generate()).await;

    let event = EventBuilder::new(1, "x".repeat(2 * 1024 * 1024))
        .sign(client.keys())
        .unwrap();
    match client.publish(&event).await.unwrap() {
        PublishOutcome::Rejected(rejection) => assert_eq!(rejection.kind, RejectionKind::TooLarge),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(relay.received_frames().await.is_empty());
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_relay_size_rejection_is_classified() {
    let relay = MockRelay::with_config(MockRelayConfig {
        max_frame_size: Some(1024 * 1024),
        verify_events: true,
    });
    let config = RelayConfig {
        max_frame_size: 8 * 1024 * 1024,
        ..test_config()
    };
    let client = connect_with(&relay, Keys::generate(), config).await;

    let event = EventBuilder::new(1, "x".repeat(2 * 1024 * 1024))
        .sign(client.keys())
        .unwrap();
    match client.publish(&event).await.unwrap() {
        PublishOutcome::Rejected(rejection) => {
            assert_eq!(rejection.kind, RejectionKind::TooLarge);
            assert!(rejection.message.contains("too large"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(relay.stored_events().await.is_empty());
}

// ----------------------------------------------------------------------------
// Connection Lifecycle
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_noise_frames_do_not_break_connection() {
    let relay = MockRelay::new();
    let client = connect(&relay, Keys::generate()).await;

    relay.send_notice("maintenance at midnight").await;
    relay.send_raw("not json at all").await;
    relay.send_raw(r#"["EVENT"]"#).await;
    relay.send_raw(r#"["OK","unknown-id",true,""]"#).await;
    relay.send_raw(r#"["AUTH","challenge"]"#).await;

    client.publish_name_binding("carol", "addr").await.unwrap();
    assert_eq!(
        client.query_key_by_name("carol").await.unwrap(),
        Some(client.public_key())
    );
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_connection_loss_fails_waiters_and_reconnects() {
    let relay = MockRelay::new();
    let client = connect(&relay, Keys::generate()).await;
    let mut notices = client.notices();
    let mut subscription = client.subscribe(vec![Filter::new().kind(1)]).unwrap();
    assert_eq!(
        timeout(TEST_TIMEOUT, subscription.next()).await.unwrap(),
        Some(SubscriptionItem::EndOfStoredEvents)
    );

    relay.disconnect_all().await;

    match timeout(TEST_TIMEOUT, subscription.next()).await.unwrap() {
        Some(SubscriptionItem::ConnectionLost { .. }) => {}
        other => panic!("unexpected item {other:?}"),
    }
    assert_eq!(timeout(TEST_TIMEOUT, subscription.next()).await.unwrap(), None);

    assert!(matches!(
        next_notice(&mut notices).await,
        ConnectionNotice::Disconnected { .. }
    ));
    assert_eq!(
        next_notice(&mut notices).await,
        ConnectionNotice::Reconnecting {
            url: RELAY_URL.to_string(),
            attempt: 1
        }
    );
    assert_eq!(
        next_notice(&mut notices).await,
        ConnectionNotice::Reconnected {
            url: RELAY_URL.to_string()
        }
    );
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(relay.connections_opened().await, 2);

    // Subscriptions are not restored, new work goes over the new link
    assert_eq!(relay.subscription_count().await, 0);
    client.publish_name_binding("dave", "addr").await.unwrap();
    assert_eq!(
        client.query_key_by_name("dave").await.unwrap(),
        Some(client.public_key())
    );
}

#[tokio::test]
async fn test_publish_lost_with_link_is_not_replayed() {
    let relay = MockRelay::new();
    let client = connect(&relay, Keys::generate()).await;
    let event = EventBuilder::new(1, "token payload")
        .sign(client.keys())
        .unwrap();

    relay.disconnect_all().await;
    let err = client.publish(&event).await.unwrap_err();
    assert!(matches!(err, NametagError::ConnectionLost { .. }), "{err:?}");

    wait_for_state(&client, ConnectionState::Connected).await;
    // Round trip on the new link so anything queued before it has drained
    client.publish_name_binding("erin", "addr").await.unwrap();
    let stored = relay.stored_events().await;
    assert!(stored.iter().all(|e| e.id != event.id));
    assert_eq!(relay.connections_opened().await, 2);
}

#[tokio::test]
async fn test_query_lost_with_link_leaves_no_relay_subscription() {
    let relay = MockRelay::new();
    let client = connect(&relay, Keys::generate()).await;
    client.publish_name_binding("alice", "addr").await.unwrap();

    relay.disconnect_all().await;
    let err = client.query_key_by_name("alice").await.unwrap_err();
    assert!(matches!(err, NametagError::ConnectionLost { .. }), "{err:?}");

    wait_for_state(&client, ConnectionState::Connected).await;
    client.publish_name_binding("frank", "addr").await.unwrap();
    assert_eq!(relay.subscription_count().await, 0);
    assert_eq!(client.connection().coordinator().pending_count(), 0);
}

#[tokio::test]
async fn test_backoff_restarts_after_each_reconnect() {
    let relay = MockRelay::new();
    let client = connect(&relay, Keys::generate()).await;
    let mut notices = client.notices();

    for _ in 0..2 {
        relay.disconnect_all().await;
        assert!(matches!(
            next_notice(&mut notices).await,
            ConnectionNotice::Disconnected { .. }
        ));
        assert_eq!(
            next_notice(&mut notices).await,
            ConnectionNotice::Reconnecting {
                url: RELAY_URL.to_string(),
                attempt: 1
            }
        );
        assert!(matches!(
            next_notice(&mut notices).await,
            ConnectionNotice::Reconnected { .. }
        ));
    }
    assert_eq!(relay.connections_opened().await, 3);
}

#[tokio::test]
async fn test_reconnect_gives_up_when_relay_refuses() {
    let relay = MockRelay::new();
    let config = RelayConfig {
        reconnect: ReconnectConfig::immediate(2),
        ..test_config()
    };
    let client = connect_with(&relay, Keys::generate(), config).await;
    let mut notices = client.notices();

    relay.set_accepting(false).await;
    relay.disconnect_all().await;

    let mut seen = Vec::new();
    loop {
        let notice = next_notice(&mut notices).await;
        let done = matches!(&notice, ConnectionNotice::Disconnected { reason, .. } if reason.contains("gave up"));
        seen.push(notice);
        if done {
            break;
        }
    }
    let attempts: Vec<u32> = seen
        .iter()
        .filter_map(|n| match n {
            ConnectionNotice::Reconnecting { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2]);
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let err = client.query_key_by_name("anyone").await.unwrap_err();
    assert!(matches!(
        err,
        NametagError::Transport(TransportError::NotConnected { .. })
    ));
}

#[tokio::test]
async fn test_loss_without_auto_reconnect_disconnects() {
    let relay = MockRelay::new();
    let config = RelayConfig {
        auto_reconnect: false,
        ..test_config()
    };
    let client = connect_with(&relay, Keys::generate(), config).await;

    relay.disconnect_all().await;
    wait_for_state(&client, ConnectionState::Disconnected).await;
    assert_eq!(relay.connections_opened().await, 1);
}

#[tokio::test]
async fn test_explicit_disconnect() {
    let relay = MockRelay::new();
    let client = connect(&relay, Keys::generate()).await;
    let mut notices = client.notices();

    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(matches!(
        next_notice(&mut notices).await,
        ConnectionNotice::Disconnected { .. }
    ));

    let err = client.publish_name_binding("erin", "addr").await.unwrap_err();
    assert!(matches!(
        err,
        NametagError::Transport(TransportError::NotConnected { .. })
    ));
    // Second call is a no-op
    client.disconnect().await;
}

#[tokio::test]
async fn test_handshake_failure_is_transport_error() {
    let relay = MockRelay::new();
    relay.set_accepting(false).await;

    let result = RelayClient::builder(Keys::generate())
        .config(test_config())
        .connector(relay.connector())
        .connect()
        .await;
    assert!(matches!(
        result,
        Err(NametagError::Transport(TransportError::ConnectFailed { .. }))
    ));
}

#[derive(Default, Clone)]
struct RecordingListener {
    events: Arc<Mutex<Vec<String>>>,
}

impl ConnectionListener for RecordingListener {
    fn on_connect(&self, url: &str) {
        self.events.lock().unwrap().push(format!("connect {url}"));
    }

    fn on_disconnect(&self, _url: &str, _reason: &str) {
        self.events.lock().unwrap().push("disconnect".to_string());
    }
}

#[tokio::test]
async fn test_builder_listener_sees_first_connect() {
    let relay = MockRelay::new();
    let listener = RecordingListener::default();
    let client = RelayClient::builder(Keys::generate())
        .config(test_config())
        .connector(relay.connector())
        .listener(listener.clone())
        .connect()
        .await
        .unwrap();

    client.disconnect().await;
    timeout(TEST_TIMEOUT, async {
        while listener.events.lock().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("listener saw both notices");
    assert_eq!(
        *listener.events.lock().unwrap(),
        vec![format!("connect {RELAY_URL}"), "disconnect".to_string()]
    );
}

// ----------------------------------------------------------------------------
// Messages
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_encrypted_message_delivery() {
    let relay = MockRelay::new();
    let alice = connect(&relay, Keys::generate()).await;
    let bob = connect(&relay, Keys::generate()).await;

    let mut inbox = bob.subscribe_messages(None).unwrap();
    let receipt = alice
        .publish_message(&bob.public_key(), "{\"token\":\"abc\"}")
        .await
        .unwrap();
    assert!(receipt.outcome.is_accepted());

    let message = timeout(TEST_TIMEOUT, inbox.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(message.event_id, receipt.event_id);
    assert_eq!(message.sender, alice.public_key());
    assert_eq!(message.payload, "{\"token\":\"abc\"}");

    // Content on the relay is not the plaintext
    let stored = relay.stored_events().await;
    assert!(stored.iter().all(|e| !e.content.contains("token")));
}

#[tokio::test]
async fn test_messages_are_not_collapsed() {
    let relay = MockRelay::new();
    let alice = connect(&relay, Keys::generate()).await;
    let bob_keys = Keys::generate();

    let large = "coin".repeat(4096);
    for payload in ["first", "second", large.as_str()] {
        alice
            .publish_message(&bob_keys.public_key_hex(), payload)
            .await
            .unwrap();
    }

    // Bob comes online later and reads the stored backlog
    let bob = connect(&relay, bob_keys).await;
    let mut inbox = bob.subscribe_messages(None).unwrap();
    let mut payloads = Vec::new();
    for _ in 0..3 {
        let message = timeout(TEST_TIMEOUT, inbox.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        payloads.push(message.payload);
    }
    payloads.sort();
    let mut expected = vec![large.clone(), "first".to_string(), "second".to_string()];
    expected.sort();
    assert_eq!(payloads, expected);
}

#[tokio::test]
async fn test_legacy_hex_codec_interop() {
    let relay = MockRelay::new();
    let old_peer = RelayClient::builder(Keys::generate())
        .config(test_config())
        .connector(relay.connector())
        .cipher(HexCodec)
        .connect()
        .await
        .unwrap();
    let receiver_keys = Keys::generate();
    let receiver = RelayClient::builder(receiver_keys)
        .config(test_config())
        .connector(relay.connector())
        .cipher(HexCodec)
        .connect()
        .await
        .unwrap();

    old_peer
        .publish_message(&receiver.public_key(), "hi")
        .await
        .unwrap();
    let stored = relay.stored_events().await;
    assert_eq!(stored[0].content, "6869");

    let mut inbox = receiver.subscribe_messages(None).unwrap();
    let message = timeout(TEST_TIMEOUT, inbox.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(message.payload, "hi");
}
