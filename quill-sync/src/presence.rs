//! Presence (awareness) table: who is in the document, and where.
//!
//! Each participant publishes a small JSON object (name, color, cursor) under
//! a numeric client id. Records are never merged into the document and never
//! persisted; they live in memory for as long as their owner keeps them
//! fresh.
//!
//! ## Ordering
//!
//! Every record carries a Lamport-style clock owned by its publisher. An
//! incoming entry replaces the stored one only if its clock is newer, or if it
//! is a removal carrying the same clock. Removed records keep their clock so
//! a delayed, older "add" cannot resurrect them.
//!
//! Clocks are 64-bit on our side; JavaScript peers stay within 53 bits.
//! Removing a record on behalf of its departed owner keeps the owner's clock,
//! so the owner's next publish (clock + 1) is accepted when it returns.
//!
//! ## Wire format
//!
//! ```text
//! varuint count
//! count × ┌──────────────┬───────────────┬──────────────────────┐
//!         │ client_id    │ clock         │ state                │
//!         │ varuint      │ varuint       │ varString (JSON)     │
//!         └──────────────┴───────────────┴──────────────────────┘
//! ```
//!
//! A state of `null` means "removed".

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

use crate::protocol::ProtocolError;

/// Numeric presence identity chosen by each client.
pub type ClientId = u64;

/// One entry of an encoded presence delta.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub client_id: ClientId,
    pub clock: u64,
    /// `None` marks an explicit removal.
    pub state: Option<Value>,
}

/// A decoded presence delta: a batch of added, updated, or removed entries.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PresenceUpdate {
    pub entries: Vec<PresenceEntry>,
}

impl PresenceUpdate {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_var(self.entries.len());
        for entry in &self.entries {
            buf.write_var(entry.client_id);
            buf.write_var(entry.clock);
            let json = match &entry.state {
                Some(state) => state.to_string(),
                None => "null".to_string(),
            };
            buf.write_string(&json);
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(bytes);
        let len: usize = cursor.read_var()?;
        let mut entries = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            let client_id: ClientId = cursor.read_var()?;
            let clock: u64 = cursor.read_var()?;
            let state: Value = serde_json::from_str(cursor.read_string()?)?;
            entries.push(PresenceEntry {
                client_id,
                clock,
                state: if state.is_null() { None } else { Some(state) },
            });
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.entries.iter().map(|e| e.client_id).collect()
    }
}

/// Which records an operation touched.
///
/// `updated` includes renewals whose state did not change: peers rely on
/// seeing them to keep the record alive.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PresenceChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl PresenceChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// All touched client ids, in added/updated/removed order.
    pub fn changed(&self) -> Vec<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }
}

/// Read-only view of one live record.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRecord {
    pub client_id: ClientId,
    pub clock: u64,
    pub state: Value,
    /// Owned by this table's holder rather than a remote peer.
    pub is_local: bool,
}

#[derive(Debug, Clone, Copy)]
struct Meta {
    clock: u64,
    last_updated: Instant,
}

/// Presence records for one document.
pub struct PresenceTable {
    local_id: Option<ClientId>,
    states: HashMap<ClientId, Value>,
    meta: HashMap<ClientId, Meta>,
}

impl PresenceTable {
    /// Create a table whose own records are published as `local_id`.
    pub fn new(local_id: ClientId) -> Self {
        Self {
            local_id: Some(local_id),
            states: HashMap::new(),
            meta: HashMap::new(),
        }
    }

    /// Create a table that only mirrors remote records. Every record in it
    /// can be removed or expired.
    pub fn remote_only() -> Self {
        Self {
            local_id: None,
            states: HashMap::new(),
            meta: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> Option<ClientId> {
        self.local_id
    }

    fn is_local(&self, client_id: ClientId) -> bool {
        self.local_id == Some(client_id)
    }

    pub fn local_state(&self) -> Option<&Value> {
        self.states.get(&self.local_id?)
    }

    /// Publish (or clear, with `None`) this table's own record.
    ///
    /// A no-op on a [`remote_only`](Self::remote_only) table.
    pub fn set_local_state(&mut self, state: Option<Value>) -> PresenceChange {
        let Some(id) = self.local_id else {
            return PresenceChange::default();
        };
        let clock = self.meta.get(&id).map_or(0, |m| m.clock.saturating_add(1));
        let prev = match state {
            Some(state) => self.states.insert(id, state),
            None => self.states.remove(&id),
        };
        self.meta.insert(
            id,
            Meta {
                clock,
                last_updated: Instant::now(),
            },
        );

        let mut change = PresenceChange::default();
        match (prev.is_some(), self.states.contains_key(&id)) {
            (false, true) => change.added.push(id),
            (true, true) => change.updated.push(id),
            (true, false) => change.removed.push(id),
            (false, false) => {}
        }
        change
    }

    pub fn get(&self, client_id: ClientId) -> Option<&Value> {
        self.states.get(&client_id)
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.states.contains_key(&client_id)
    }

    pub fn clock(&self, client_id: ClientId) -> Option<u64> {
        self.meta.get(&client_id).map(|m| m.clock)
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Ids of live records, ascending.
    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.states.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Live records, ascending by client id.
    pub fn records(&self) -> Vec<PresenceRecord> {
        self.client_ids()
            .into_iter()
            .filter_map(|id| {
                let state = self.states.get(&id)?.clone();
                let clock = self.meta.get(&id).map_or(0, |m| m.clock);
                Some(PresenceRecord {
                    client_id: id,
                    clock,
                    state,
                    is_local: self.is_local(id),
                })
            })
            .collect()
    }

    /// Merge a remote delta into the table.
    pub fn apply_update(&mut self, update: &PresenceUpdate) -> PresenceChange {
        self.apply_update_at(update, Instant::now())
    }

    fn apply_update_at(&mut self, update: &PresenceUpdate, now: Instant) -> PresenceChange {
        let mut change = PresenceChange::default();

        for entry in &update.entries {
            let id = entry.client_id;
            let current_clock = self.meta.get(&id).map_or(0, |m| m.clock);
            let had_state = self.states.contains_key(&id);
            let newer = current_clock < entry.clock;
            let same_clock_removal = current_clock == entry.clock && entry.state.is_none() && had_state;
            if !newer && !same_clock_removal {
                continue;
            }

            let mut clock = entry.clock;
            match &entry.state {
                None if self.is_local(id) && had_state => {
                    // A peer cannot remove our own record: bump past it instead.
                    clock = clock.saturating_add(1);
                }
                None => {
                    self.states.remove(&id);
                }
                Some(state) => {
                    self.states.insert(id, state.clone());
                }
            }
            self.meta.insert(
                id,
                Meta {
                    clock,
                    last_updated: now,
                },
            );

            match (had_state, self.states.contains_key(&id)) {
                (false, true) => change.added.push(id),
                (true, true) => change.updated.push(id),
                (true, false) => change.removed.push(id),
                (false, false) => {}
            }
        }

        change
    }

    /// Encode the current entries for `clients` (unknown ids are skipped).
    pub fn encode_update(&self, clients: &[ClientId]) -> PresenceUpdate {
        let entries = clients
            .iter()
            .filter_map(|&id| {
                let meta = self.meta.get(&id)?;
                Some(PresenceEntry {
                    client_id: id,
                    clock: meta.clock,
                    state: self.states.get(&id).cloned(),
                })
            })
            .collect();
        PresenceUpdate { entries }
    }

    /// Encode every live record, for a late joiner.
    pub fn encode_all(&self) -> PresenceUpdate {
        self.encode_update(&self.client_ids())
    }

    /// Encode every record this table has seen, removals included, for a
    /// peer that may have missed some deltas.
    pub fn encode_known(&self) -> PresenceUpdate {
        let mut ids: Vec<ClientId> = self.meta.keys().copied().collect();
        ids.sort_unstable();
        self.encode_update(&ids)
    }

    /// Remove remote records on behalf of their departed owner.
    ///
    /// The owner's clock is kept: peers accept a removal at the same clock,
    /// and the owner's next publish still wins over the removal.
    pub fn remove_states(&mut self, clients: &[ClientId]) -> PresenceChange {
        let mut change = PresenceChange::default();
        for &id in clients {
            // The local record is only cleared through set_local_state.
            if self.is_local(id) || self.states.remove(&id).is_none() {
                continue;
            }
            if let Some(meta) = self.meta.get_mut(&id) {
                meta.last_updated = Instant::now();
            }
            change.removed.push(id);
        }
        change
    }

    /// Drop remote records not renewed within `timeout`.
    pub fn expire_stale(&mut self, timeout: Duration) -> PresenceChange {
        self.expire_stale_at(Instant::now(), timeout)
    }

    fn expire_stale_at(&mut self, now: Instant, timeout: Duration) -> PresenceChange {
        let stale: Vec<ClientId> = self
            .states
            .keys()
            .copied()
            .filter(|&id| !self.is_local(id))
            .filter(|id| {
                self.meta
                    .get(id)
                    .is_some_and(|m| now.saturating_duration_since(m.last_updated) >= timeout)
            })
            .collect();
        self.remove_states(&stale)
    }
}
