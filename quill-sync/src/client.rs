//! WebSocket sync client for connecting to the hub.
//!
//! Provides:
//! - Connection lifecycle (connect, close)
//! - The two-step sync handshake, answered from a local Yrs replica
//! - Text edits applied locally and sent as updates
//! - Presence publishing, renewed while connected
//!
//! Edits made before `connect` are not lost: the handshake carries them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::doc::{ReplicatedState, StateError, YrsState};
use crate::presence::{ClientId, PresenceChange, PresenceRecord, PresenceTable, PresenceUpdate};
use crate::protocol::{Frame, SyncMessage};

/// How often our presence is re-published so the hub does not expire it.
const PRESENCE_RENEW_INTERVAL: Duration = Duration::from_secs(15);

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("Not connected")]
    NotConnected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// The hub answered our state vector; the replica has caught up
    Synced,
    /// A peer's delta changed the replica
    RemoteUpdate(Vec<u8>),
    /// The presence table changed
    Presence(PresenceChange),
    /// Connection lost
    Disconnected,
}

/// The sync client.
pub struct SyncClient {
    url: String,
    client_id: ClientId,
    doc: Arc<Mutex<YrsState>>,
    presence: Arc<Mutex<PresenceTable>>,
    connected: Arc<AtomicBool>,
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncClient {
    /// Client for the document served at `url`, e.g. `ws://host:5000/doc-abc123`.
    pub fn new(url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        // Presence ids are 32-bit so they stay exact in JavaScript peers.
        let client_id = ClientId::from(Uuid::new_v4().as_u128() as u32);
        Self {
            url: url.into(),
            client_id,
            doc: Arc::new(Mutex::new(YrsState::new())),
            presence: Arc::new(Mutex::new(PresenceTable::new(client_id))),
            connected: Arc::new(AtomicBool::new(false)),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
            tasks: Vec::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Our presence client id.
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and start the handshake.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        let (mut ws_writer, ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx.clone());
        self.connected.store(true, Ordering::SeqCst);

        // Writer task: forward outgoing channel to WebSocket
        self.tasks.push(tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    return;
                }
            }
            let _ = ws_writer.close().await;
        }));

        // Ask for what we are missing and announce ourselves
        let state_vector = self.doc.lock().encode_state_vector();
        self.send_frame(Frame::sync_step1(state_vector).encode()).await?;
        if let Some(frame) = self.reannounce_frame() {
            self.send_frame(frame).await?;
        }
        emit(&self.event_tx, SyncEvent::Connected);

        // Reader task: process incoming WebSocket messages
        let reader = Reader {
            doc: self.doc.clone(),
            presence: self.presence.clone(),
            connected: self.connected.clone(),
            event_tx: self.event_tx.clone(),
            reply_tx: out_tx.clone(),
        };
        self.tasks.push(tokio::spawn(reader.run(ws_reader)));

        // Presence renewal
        let presence = self.presence.clone();
        let client_id = self.client_id;
        self.tasks.push(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + PRESENCE_RENEW_INTERVAL;
            let mut interval = tokio::time::interval_at(start, PRESENCE_RENEW_INTERVAL);
            loop {
                interval.tick().await;
                let frame = {
                    let mut table = presence.lock();
                    match table.local_state().cloned() {
                        Some(state) => {
                            table.set_local_state(Some(state));
                            encode_local(&table, client_id)
                        }
                        None => continue,
                    }
                };
                if out_tx.send(Message::Binary(frame.into())).await.is_err() {
                    return;
                }
            }
        }));

        log::info!("Connected to {}", self.url);
        Ok(())
    }

    /// Insert `chunk` into the shared text `name` and send the delta.
    pub async fn insert_text(&self, name: &str, index: u32, chunk: &str) -> Result<(), ClientError> {
        let delta = self.doc.lock().insert_text(name, index, chunk);
        self.send_if_connected(Frame::update(delta).encode()).await
    }

    /// Remove `len` characters from the shared text `name` and send the delta.
    pub async fn remove_text(&self, name: &str, index: u32, len: u32) -> Result<(), ClientError> {
        let delta = self.doc.lock().remove_text(name, index, len);
        self.send_if_connected(Frame::update(delta).encode()).await
    }

    /// Merge an externally produced delta and forward it to the hub.
    pub async fn send_update(&self, delta: &[u8]) -> Result<(), ClientError> {
        self.doc.lock().apply_update(delta)?;
        self.send_if_connected(Frame::update(delta.to_vec()).encode()).await
    }

    /// Publish our presence state.
    pub async fn set_presence(&self, state: Value) -> Result<(), ClientError> {
        self.publish_presence(Some(state)).await
    }

    /// Withdraw our presence.
    pub async fn clear_presence(&self) -> Result<(), ClientError> {
        self.publish_presence(None).await
    }

    async fn publish_presence(&self, state: Option<Value>) -> Result<(), ClientError> {
        let frame = {
            let mut table = self.presence.lock();
            if table.set_local_state(state).is_empty() {
                return Ok(());
            }
            encode_local(&table, self.client_id)
        };
        self.send_if_connected(frame).await
    }

    /// Our record with a fresh clock. The hub may still hold our previous
    /// clock from before a disconnect, so a plain resend would be stale.
    fn reannounce_frame(&self) -> Option<Vec<u8>> {
        let mut table = self.presence.lock();
        let state = table.local_state()?.clone();
        table.set_local_state(Some(state));
        Some(encode_local(&table, self.client_id))
    }

    /// Send a raw frame to the hub.
    pub async fn send_frame(&self, frame: Vec<u8>) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(Message::Binary(frame.into()))
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    /// Local-only edits are fine offline; the next handshake carries them.
    async fn send_if_connected(&self, frame: Vec<u8>) -> Result<(), ClientError> {
        if self.outgoing_tx.is_none() {
            return Ok(());
        }
        self.send_frame(frame).await
    }

    /// Current contents of the shared text `name`.
    pub fn text(&self, name: &str) -> String {
        self.doc.lock().text(name)
    }

    /// Full local state as a single delta.
    pub fn snapshot(&self) -> Vec<u8> {
        self.doc.lock().encode_update()
    }

    /// Every presence record we know of, ours included.
    pub fn presence_records(&self) -> Vec<PresenceRecord> {
        self.presence.lock().records()
    }

    /// Send a close frame and wait for the socket to shut down. The reader
    /// reports `Disconnected`.
    pub async fn close(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        let mut tasks = std::mem::take(&mut self.tasks);
        if let Some(renewal) = tasks.pop() {
            renewal.abort();
        }
        for task in tasks {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Events are dropped rather than stalling the reader when nobody drains them.
fn emit(tx: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event) {
        log::debug!("Event queue full, dropping {event:?}");
    }
}

fn encode_local(table: &PresenceTable, client_id: ClientId) -> Vec<u8> {
    let update = table.encode_update(&[client_id]);
    Frame::awareness(update.encode()).encode()
}

/// State shared between the client handle and its reader task.
struct Reader {
    doc: Arc<Mutex<YrsState>>,
    presence: Arc<Mutex<PresenceTable>>,
    connected: Arc<AtomicBool>,
    event_tx: mpsc::Sender<SyncEvent>,
    reply_tx: mpsc::Sender<Message>,
}

impl Reader {
    /// Apply hub frames until the socket closes or the writer is gone, then
    /// report `Disconnected`.
    async fn run<S>(self, mut ws_reader: S)
    where
        S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let mut synced = false;
        while let Some(msg) = ws_reader.next().await {
            let data = match msg {
                Ok(Message::Binary(data)) => data,
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            let frame = match Frame::decode(&data) {
                Ok(frame) => frame,
                Err(e) => {
                    log::warn!("Dropping frame from hub: {e}");
                    continue;
                }
            };

            match frame {
                Frame::Sync(SyncMessage::SyncStep1(state_vector)) => {
                    let diff = self.doc.lock().diff(&state_vector);
                    match diff {
                        Ok(diff) => {
                            let reply = Frame::sync_step2(diff).encode();
                            if self.reply_tx.send(Message::Binary(reply.into())).await.is_err() {
                                log::debug!("Writer closed, stopping reader");
                                break;
                            }
                        }
                        Err(e) => log::warn!("Bad state vector from hub: {e}"),
                    }
                }
                Frame::Sync(SyncMessage::SyncStep2(diff)) => {
                    let applied = self.doc.lock().apply_update(&diff);
                    if let Err(e) = applied {
                        log::warn!("Bad sync reply from hub: {e}");
                    } else if !synced {
                        synced = true;
                        emit(&self.event_tx, SyncEvent::Synced);
                    }
                }
                Frame::Sync(SyncMessage::Update(delta)) => {
                    let applied = self.doc.lock().apply_update(&delta);
                    match applied {
                        Ok(Some(effective)) => {
                            emit(&self.event_tx, SyncEvent::RemoteUpdate(effective));
                        }
                        Ok(None) => {}
                        Err(e) => log::warn!("Bad update from hub: {e}"),
                    }
                }
                Frame::Awareness(payload) => match PresenceUpdate::decode(&payload) {
                    Ok(update) => {
                        let change = self.presence.lock().apply_update(&update);
                        if !change.is_empty() {
                            emit(&self.event_tx, SyncEvent::Presence(change));
                        }
                    }
                    Err(e) => log::warn!("Bad presence from hub: {e}"),
                },
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        emit(&self.event_tx, SyncEvent::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_creation() {
        let client = SyncClient::new("ws://localhost:5000/doc-abc123");
        assert_eq!(client.url(), "ws://localhost:5000/doc-abc123");
        assert!(!client.is_connected());
        assert!(client.client_id() <= u64::from(u32::MAX));
    }

    #[tokio::test]
    async fn test_offline_edits_apply_locally() {
        let client = SyncClient::new("ws://localhost:5000/doc");
        client.insert_text("content", 0, "hello world").await.unwrap();
        client.remove_text("content", 5, 6).await.unwrap();
        assert_eq!(client.text("content"), "hello");

        let replica = YrsState::from_update(&client.snapshot()).unwrap();
        assert_eq!(replica.text("content"), "hello");
    }

    #[tokio::test]
    async fn test_send_frame_offline_fails() {
        let client = SyncClient::new("ws://localhost:5000/doc");
        let result = client.send_frame(vec![0, 0, 0]).await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn test_presence_offline_recorded() {
        let client = SyncClient::new("ws://localhost:5000/doc");
        client.set_presence(json!({"name": "Bea", "color": "#70CFF8"})).await.unwrap();

        let records = client.presence_records();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_local);
        assert_eq!(records[0].client_id, client.client_id());

        client.clear_presence().await.unwrap();
        assert!(client.presence_records().is_empty());
        assert!(client.reannounce_frame().is_none());
    }

    #[tokio::test]
    async fn test_reannounce_bumps_clock() {
        let client = SyncClient::new("ws://localhost:5000/doc");
        client.set_presence(json!({"name": "Bea"})).await.unwrap();
        let before = client.presence_records()[0].clock;

        let frame = client.reannounce_frame().expect("record to announce");
        let Frame::Awareness(payload) = Frame::decode(&frame).unwrap() else {
            panic!("expected presence frame");
        };
        let update = PresenceUpdate::decode(&payload).unwrap();
        assert_eq!(update.entries[0].client_id, client.client_id());
        assert_eq!(update.entries[0].clock, before + 1);
        assert_eq!(update.entries[0].state, Some(json!({"name": "Bea"})));
    }

    fn reader_for_test() -> (Reader, Arc<Mutex<YrsState>>, mpsc::Receiver<SyncEvent>, mpsc::Receiver<Message>) {
        let doc = Arc::new(Mutex::new(YrsState::new()));
        let (event_tx, event_rx) = mpsc::channel(16);
        let (reply_tx, reply_rx) = mpsc::channel(16);
        let reader = Reader {
            doc: doc.clone(),
            presence: Arc::new(Mutex::new(PresenceTable::new(1))),
            connected: Arc::new(AtomicBool::new(true)),
            event_tx,
            reply_tx,
        };
        (reader, doc, event_rx, reply_rx)
    }

    fn binary(frame: Frame) -> Result<Message, tokio_tungstenite::tungstenite::Error> {
        Ok(Message::Binary(frame.encode().into()))
    }

    #[tokio::test]
    async fn test_reader_answers_step1() {
        let (reader, _doc, mut events, mut replies) = reader_for_test();
        let step1 = binary(Frame::sync_step1(YrsState::new().encode_state_vector()));
        reader.run(futures_util::stream::iter(vec![step1])).await;

        let reply = replies.recv().await.expect("step 2 reply");
        let Message::Binary(data) = reply else {
            panic!("expected binary reply");
        };
        assert!(matches!(Frame::decode(&data).unwrap(), Frame::Sync(SyncMessage::SyncStep2(_))));
        assert_eq!(events.recv().await, Some(SyncEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_reader_stops_when_writer_gone() {
        let (reader, doc, mut events, replies) = reader_for_test();
        let connected = reader.connected.clone();
        drop(replies);

        let mut writer = YrsState::new();
        let delta = writer.insert_text("content", 0, "late");
        let frames = vec![
            binary(Frame::sync_step1(YrsState::new().encode_state_vector())),
            binary(Frame::update(delta)),
        ];
        // The socket itself never ends
        let stream = futures_util::stream::iter(frames).chain(futures_util::stream::pending());

        tokio::time::timeout(Duration::from_secs(2), reader.run(stream))
            .await
            .expect("reader stops once replies cannot be sent");
        assert_eq!(events.recv().await, Some(SyncEvent::Disconnected));
        assert!(!connected.load(Ordering::SeqCst));
        assert_eq!(doc.lock().text("content"), "");
    }

    #[tokio::test]
    async fn test_send_update_rejects_garbage() {
        let client = SyncClient::new("ws://localhost:5000/doc");
        let result = client.send_update(&[0xFF, 0xFF]).await;
        assert!(matches!(result, Err(ClientError::State(_))));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = SyncClient::new(format!("ws://127.0.0.1:{port}/doc"));
        assert!(matches!(client.connect().await, Err(ClientError::WebSocket(_))));
        assert!(!client.is_connected());
    }

    #[test]
    fn test_take_event_rx() {
        let mut client = SyncClient::new("ws://localhost:5000/doc");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}
