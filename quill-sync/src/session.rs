//! Document sessions: one live document and everyone attached to it.
//!
//! ```text
//! Connection A ──┐                      ┌──► Connection A
//!                ├──► Session (name) ───┤
//! Connection B ──┘     │  Mutex         └──► Connection B
//!                      ├── ReplicatedState
//!                      ├── PresenceTable
//!                      └── connections (id → controlled presence ids)
//! ```
//!
//! All mutation happens under the session mutex, and the resulting frames are
//! queued on the session's [`BroadcastGroup`] before the mutex is released, so
//! every subscriber observes deltas in merge order. Queueing never blocks;
//! network writes happen later, on each connection's own task.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, BroadcastStats, ConnectionId, Outbound};
use crate::doc::{ReplicatedState, StateError};
use crate::presence::{ClientId, PresenceChange, PresenceRecord, PresenceTable, PresenceUpdate};
use crate::protocol::{Frame, ProtocolError, SyncMessage};
use crate::registry::Registry;

struct SessionState {
    doc: Box<dyn ReplicatedState>,
    presence: PresenceTable,
    /// Attached connections and the presence client ids each one introduced.
    connections: HashMap<ConnectionId, HashSet<ClientId>>,
}

/// The in-memory unit binding one document name to its state, presence table,
/// and attached connections.
pub struct Session {
    name: String,
    state: Mutex<SessionState>,
    broadcast: BroadcastGroup,
    /// Deferred teardown scheduled by the registry while the session is empty.
    pending_reap: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub(crate) fn new(name: &str, doc: Box<dyn ReplicatedState>, broadcast_capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(SessionState {
                doc,
                presence: PresenceTable::remote_only(),
                connections: HashMap::new(),
            }),
            broadcast: BroadcastGroup::new(broadcast_capacity),
            pending_reap: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach a new connection.
    ///
    /// The returned [`Attachment`] carries the frames the peer needs first:
    /// our state vector, and the full presence table if it is not empty.
    pub(crate) fn attach(self: &Arc<Self>, registry: &Registry) -> Attachment {
        self.cancel_reap();

        let id = Uuid::new_v4();
        let (receiver, initial, total) = {
            let mut state = self.state.lock();
            // Subscribe under the lock: nothing merged after the snapshot below
            // can be missed, and nothing before it is delivered twice.
            let receiver = self.broadcast.subscribe();
            state.connections.insert(id, HashSet::new());

            let mut initial = vec![Frame::sync_step1(state.doc.encode_state_vector()).encode()];
            if !state.presence.is_empty() {
                let all = state.presence.encode_all();
                initial.push(Frame::awareness(all.encode()).encode());
            }
            (receiver, initial, state.connections.len())
        };

        log::info!("Client connected to: {} ({} total)", self.name, total);

        Attachment {
            id,
            session: self.clone(),
            registry: registry.clone(),
            receiver,
            initial,
            pending: VecDeque::new(),
            detached: false,
        }
    }

    /// Remove a connection and every presence record it controlled.
    ///
    /// Returns the remaining connection count, or `None` if `id` was not
    /// attached.
    fn detach(&self, id: ConnectionId) -> Option<usize> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let controlled = state.connections.remove(&id)?;

        let ids: Vec<ClientId> = controlled.into_iter().collect();
        let change = state.presence.remove_states(&ids);
        if !change.is_empty() {
            log::trace!("Removing {} presence record(s) of {id} in {}", change.removed.len(), self.name);
        }
        self.publish_presence(&state.presence, &change);

        Some(state.connections.len())
    }

    /// Handle one sync message from `origin`.
    ///
    /// A state-vector request yields a `SyncStep2` reply frame. Deltas are
    /// merged; whatever actually changed is broadcast to every other
    /// connection, and nothing is returned.
    pub fn handle_sync(&self, origin: ConnectionId, msg: SyncMessage) -> Result<Option<Vec<u8>>, StateError> {
        let mut state = self.state.lock();
        match msg {
            SyncMessage::SyncStep1(state_vector) => {
                let diff = state.doc.diff(&state_vector)?;
                Ok(Some(Frame::sync_step2(diff).encode()))
            }
            SyncMessage::SyncStep2(update) | SyncMessage::Update(update) => {
                if let Some(delta) = state.doc.apply_update(&update)? {
                    let receivers = self.broadcast.send(Some(origin), Frame::update(delta).encode());
                    log::debug!("Update from {origin} on {} queued for {receivers} subscriber(s)", self.name);
                }
                Ok(None)
            }
        }
    }

    /// Apply an encoded presence delta sent by `origin` and re-announce the
    /// changed records to every connection, `origin` included.
    pub fn handle_presence(&self, origin: ConnectionId, payload: &[u8]) -> Result<PresenceChange, ProtocolError> {
        let update = PresenceUpdate::decode(payload)?;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let change = state.presence.apply_update(&update);

        if let Some(controlled) = state.connections.get_mut(&origin) {
            controlled.extend(change.added.iter().chain(&change.updated));
            for id in &change.removed {
                controlled.remove(id);
            }
        }
        self.publish_presence(&state.presence, &change);

        Ok(change)
    }

    /// Expire presence records that were not renewed within `timeout`.
    pub fn expire_presence(&self, timeout: std::time::Duration) -> PresenceChange {
        let mut state = self.state.lock();
        let change = state.presence.expire_stale(timeout);
        if !change.is_empty() {
            log::debug!("Expired {} stale presence record(s) in {}", change.removed.len(), self.name);
        }
        self.publish_presence(&state.presence, &change);
        change
    }

    /// Broadcast the changed subset of the presence table to everyone.
    fn publish_presence(&self, presence: &PresenceTable, change: &PresenceChange) {
        if change.is_empty() {
            return;
        }
        let update = presence.encode_update(&change.changed());
        self.broadcast.send(None, Frame::awareness(update.encode()).encode());
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().connections.is_empty()
    }

    pub fn presence_records(&self) -> Vec<PresenceRecord> {
        self.state.lock().presence.records()
    }

    /// Full document state as a single delta.
    pub fn snapshot(&self) -> Vec<u8> {
        self.state.lock().doc.encode_update()
    }

    /// Frames that bring a peer which missed broadcasts back in step: the
    /// whole document, then every known presence record.
    fn resync_frames(&self) -> Vec<Vec<u8>> {
        let state = self.state.lock();
        let mut frames = vec![Frame::update(state.doc.encode_update()).encode()];
        let known = state.presence.encode_known();
        if !known.is_empty() {
            frames.push(Frame::awareness(known.encode()).encode());
        }
        frames
    }

    pub fn state_vector(&self) -> Vec<u8> {
        self.state.lock().doc.encode_state_vector()
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.broadcast.stats()
    }

    pub(crate) fn set_pending_reap(&self, task: JoinHandle<()>) {
        if let Some(previous) = self.pending_reap.lock().replace(task) {
            previous.abort();
        }
    }

    pub(crate) fn cancel_reap(&self) {
        if let Some(task) = self.pending_reap.lock().take() {
            task.abort();
            log::debug!("Cancelled pending cleanup of {}", self.name);
        }
    }
}

/// A connection's membership in a session.
///
/// Dropping (or [`detach`](Attachment::detach)ing) it removes the connection
/// and its presence records from the session and, if the session became empty,
/// asks the registry to schedule its teardown. Detaching twice is a no-op.
pub struct Attachment {
    id: ConnectionId,
    session: Arc<Session>,
    registry: Registry,
    receiver: broadcast::Receiver<Outbound>,
    initial: Vec<Vec<u8>>,
    /// Resync frames queued after the receiver lagged.
    pending: VecDeque<Arc<Vec<u8>>>,
    detached: bool,
}

impl Attachment {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Frames to send before anything from [`recv`](Self::recv). Empty after
    /// the first call.
    pub fn take_initial_frames(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.initial)
    }

    /// Next frame addressed to this connection; own document deltas are
    /// skipped. `None` once detached.
    pub async fn recv(&mut self) -> Option<Arc<Vec<u8>>> {
        if self.detached {
            return None;
        }
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(frame);
            }
            match self.receiver.recv().await {
                Ok(out) if out.is_for(self.id) => return Some(out.frame),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => self.resync(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Arc<Vec<u8>>> {
        if self.detached {
            return None;
        }
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(frame);
            }
            match self.receiver.try_recv() {
                Ok(out) if out.is_for(self.id) => return Some(out.frame),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(skipped)) => self.resync(skipped),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Queue the full document and presence table after dropped frames.
    ///
    /// Merging is idempotent, so frames still buffered behind the gap are
    /// harmless duplicates.
    fn resync(&mut self, skipped: u64) {
        log::warn!(
            "Connection {} on {} lagged by {skipped} frames, resending full state",
            self.id,
            self.session.name
        );
        self.session.broadcast.record_lag(skipped);
        self.pending.extend(self.session.resync_frames().into_iter().map(Arc::new));
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;

        if let Some(remaining) = self.session.detach(self.id) {
            log::info!("Client disconnected from: {} ({} remaining)", self.session.name, remaining);
            if remaining == 0 {
                self.registry.schedule_reap(&self.session);
            }
        }
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.detach();
    }
}
