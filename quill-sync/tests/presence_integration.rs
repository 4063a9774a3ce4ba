//! Integration tests for presence synchronization.
//!
//! These tests start a real server and connect `SyncClient`s, verifying
//! that presence records are announced, cleared, removed on disconnect,
//! and expired when their owner stops renewing them.

use futures_util::SinkExt;
use quill_sync::client::{SyncClient, SyncEvent};
use quill_sync::presence::{ClientId, PresenceEntry, PresenceUpdate};
use quill_sync::protocol::Frame;
use quill_sync::server::{HubServer, ServerConfig};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc::Receiver;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

/// Start a server on an ephemeral port, return the document URL.
async fn start_test_server(config: ServerConfig) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HubServer::new(ServerConfig {
        bind_addr: addr.to_string(),
        ..config
    });
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    format!("ws://{addr}/doc-abc123")
}

/// Connect a client, waiting until its first handshake completes.
async fn connect_client(url: &str) -> (SyncClient, Receiver<SyncEvent>) {
    let mut client = SyncClient::new(url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    next_matching(&mut events, |e| *e == SyncEvent::Synced).await;
    (client, events)
}

/// Wait for the first event satisfying `pred`, skipping the rest.
async fn next_matching(events: &mut Receiver<SyncEvent>, pred: impl Fn(&SyncEvent) -> bool) -> SyncEvent {
    timeout(Duration::from_secs(2), async {
        while let Some(event) = events.recv().await {
            if pred(&event) {
                return event;
            }
        }
        panic!("event stream ended");
    })
    .await
    .expect("event within 2s")
}

fn added(id: ClientId) -> impl Fn(&SyncEvent) -> bool {
    move |e: &SyncEvent| matches!(e, SyncEvent::Presence(change) if change.added.contains(&id))
}

fn removed(id: ClientId) -> impl Fn(&SyncEvent) -> bool {
    move |e: &SyncEvent| matches!(e, SyncEvent::Presence(change) if change.removed.contains(&id))
}

// ─── Presence Protocol Tests ─────────────────────────────────────

#[tokio::test]
async fn test_presence_join_broadcast() {
    let url = start_test_server(ServerConfig::default()).await;
    let (alice, mut alice_events) = connect_client(&url).await;
    let (bob, _bob_events) = connect_client(&url).await;

    let bea = json!({"name": "Bea", "color": "#70CFF8"});
    bob.set_presence(bea.clone()).await.unwrap();

    next_matching(&mut alice_events, added(bob.client_id())).await;
    let records = alice.presence_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].client_id, bob.client_id());
    assert_eq!(records[0].state, bea);
    assert!(!records[0].is_local);
}

#[tokio::test]
async fn test_presence_update_carries_new_state() {
    let url = start_test_server(ServerConfig::default()).await;
    let (alice, mut alice_events) = connect_client(&url).await;
    let (bob, _bob_events) = connect_client(&url).await;

    bob.set_presence(json!({"name": "Bea", "cursor": 0})).await.unwrap();
    next_matching(&mut alice_events, added(bob.client_id())).await;

    bob.set_presence(json!({"name": "Bea", "cursor": 12})).await.unwrap();
    let id = bob.client_id();
    next_matching(&mut alice_events, move |e| {
        matches!(e, SyncEvent::Presence(change) if change.updated.contains(&id))
    })
    .await;
    assert_eq!(alice.presence_records()[0].state["cursor"], 12);
}

#[tokio::test]
async fn test_presence_cleared_explicitly() {
    let url = start_test_server(ServerConfig::default()).await;
    let (alice, mut alice_events) = connect_client(&url).await;
    let (bob, _bob_events) = connect_client(&url).await;

    bob.set_presence(json!({"name": "Bea"})).await.unwrap();
    next_matching(&mut alice_events, added(bob.client_id())).await;

    bob.clear_presence().await.unwrap();
    next_matching(&mut alice_events, removed(bob.client_id())).await;
    assert!(alice.presence_records().is_empty());
}

#[tokio::test]
async fn test_presence_removed_when_client_closes() {
    let url = start_test_server(ServerConfig::default()).await;
    let (alice, mut alice_events) = connect_client(&url).await;
    let (mut bob, _bob_events) = connect_client(&url).await;

    bob.set_presence(json!({"name": "Bea"})).await.unwrap();
    next_matching(&mut alice_events, added(bob.client_id())).await;

    // Bob leaves without clearing first
    bob.close().await;
    next_matching(&mut alice_events, removed(bob.client_id())).await;
    assert!(alice.presence_records().is_empty());
}

#[tokio::test]
async fn test_presence_restored_when_client_reconnects() {
    let url = start_test_server(ServerConfig::default()).await;
    let (alice, mut alice_events) = connect_client(&url).await;
    let (mut bob, mut bob_events) = connect_client(&url).await;

    bob.set_presence(json!({"name": "Bea"})).await.unwrap();
    next_matching(&mut alice_events, added(bob.client_id())).await;

    bob.close().await;
    next_matching(&mut alice_events, removed(bob.client_id())).await;

    // Same client, same id: its record must come back without waiting for a renewal
    bob.connect().await.unwrap();
    next_matching(&mut bob_events, |e| *e == SyncEvent::Synced).await;
    next_matching(&mut alice_events, added(bob.client_id())).await;

    let records = alice.presence_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].client_id, bob.client_id());
    assert_eq!(records[0].state, json!({"name": "Bea"}));
}

#[tokio::test]
async fn test_late_joiner_receives_presence_table() {
    let url = start_test_server(ServerConfig::default()).await;
    let (alice, _alice_events) = connect_client(&url).await;
    alice.set_presence(json!({"name": "Ari"})).await.unwrap();

    let mut carol = SyncClient::new(&url);
    let mut carol_events = carol.take_event_rx().unwrap();
    carol.connect().await.unwrap();

    next_matching(&mut carol_events, added(alice.client_id())).await;
    let records = carol.presence_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, json!({"name": "Ari"}));
}

#[tokio::test]
async fn test_presence_set_before_connect_is_announced() {
    let url = start_test_server(ServerConfig::default()).await;
    let (_alice, mut alice_events) = connect_client(&url).await;

    let mut bob = SyncClient::new(&url);
    bob.set_presence(json!({"name": "Bea"})).await.unwrap();
    bob.connect().await.unwrap();

    next_matching(&mut alice_events, added(bob.client_id())).await;
}

#[tokio::test]
async fn test_stale_presence_expires() {
    let url = start_test_server(ServerConfig {
        presence_timeout: Duration::from_millis(100),
        presence_sweep_interval: Duration::from_millis(50),
        ..ServerConfig::default()
    })
    .await;
    let (_alice, mut alice_events) = connect_client(&url).await;

    // A peer announces itself once and never renews
    let (mut quiet, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let update = PresenceUpdate {
        entries: vec![PresenceEntry {
            client_id: 7,
            clock: 1,
            state: Some(json!({"name": "Bea"})),
        }],
    };
    quiet
        .send(Message::Binary(Frame::awareness(update.encode()).encode().into()))
        .await
        .unwrap();

    next_matching(&mut alice_events, added(7)).await;
    next_matching(&mut alice_events, removed(7)).await;
}
