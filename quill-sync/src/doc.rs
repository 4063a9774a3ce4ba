//! Replicated document state.
//!
//! The hub never looks inside a document. It only needs four primitives from
//! the CRDT: merge a delta, encode the full state, summarize what it has seen
//! (state vector), and compute the delta a peer is missing. [`ReplicatedState`]
//! is that seam; [`YrsState`] implements it over a Yrs `Doc`.

use std::sync::Arc;

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

/// A v1 update with no structs and an empty delete set.
const EMPTY_UPDATE: [u8; 2] = [0, 0];

/// Errors raised by the replicated-state primitive.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StateError {
    #[error("Invalid update: {0}")]
    InvalidUpdate(String),
    #[error("Invalid state vector: {0}")]
    InvalidStateVector(String),
    #[error("Update rejected: {0}")]
    Rejected(String),
}

/// Mergeable document content owned by a session.
///
/// Implementations must make `apply_update` commutative and idempotent:
/// any order of any multiset of the same deltas yields the same state.
pub trait ReplicatedState: Send {
    /// Merge an encoded delta.
    ///
    /// Returns the delta describing what actually changed, or `None` when the
    /// update contributed nothing new (duplicate, or still waiting on missing
    /// dependencies).
    fn apply_update(&mut self, update: &[u8]) -> Result<Option<Vec<u8>>, StateError>;

    /// Encode the complete state as a single delta.
    fn encode_update(&self) -> Vec<u8>;

    /// Encode a summary of everything this replica has integrated.
    fn encode_state_vector(&self) -> Vec<u8>;

    /// Compute the delta a peer with `state_vector` is missing.
    fn diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, StateError>;
}

/// Builds the replicated state for a newly created session.
pub type StateFactory = Arc<dyn Fn(&str) -> Box<dyn ReplicatedState> + Send + Sync>;

/// Factory producing empty [`YrsState`] documents.
pub fn yrs_factory() -> StateFactory {
    Arc::new(|_name: &str| Box::new(YrsState::new()) as Box<dyn ReplicatedState>)
}

/// [`ReplicatedState`] backed by a Yrs document (Yjs v1 encoding).
pub struct YrsState {
    doc: Doc,
}

impl YrsState {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Rebuild a replica from a full-state update.
    pub fn from_update(update: &[u8]) -> Result<Self, StateError> {
        let mut state = Self::new();
        state.apply_update(update)?;
        Ok(state)
    }

    /// Underlying Yrs document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Insert `chunk` into the shared text `name`, returning the local delta.
    pub fn insert_text(&mut self, name: &str, index: u32, chunk: &str) -> Vec<u8> {
        let text = self.doc.get_or_insert_text(name);
        let mut txn = self.doc.transact_mut();
        text.insert(&mut txn, index, chunk);
        txn.encode_update_v1()
    }

    /// Remove `len` characters from the shared text `name`, returning the local delta.
    pub fn remove_text(&mut self, name: &str, index: u32, len: u32) -> Vec<u8> {
        let text = self.doc.get_or_insert_text(name);
        let mut txn = self.doc.transact_mut();
        text.remove_range(&mut txn, index, len);
        txn.encode_update_v1()
    }

    /// Current contents of the shared text `name`.
    pub fn text(&self, name: &str) -> String {
        let text = self.doc.get_or_insert_text(name);
        let txn = self.doc.transact();
        text.get_string(&txn)
    }
}

impl Default for YrsState {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicatedState for YrsState {
    fn apply_update(&mut self, update: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        let update = Update::decode_v1(update)
            .map_err(|e| StateError::InvalidUpdate(e.to_string()))?;

        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| StateError::Rejected(e.to_string()))?;

        let delta = txn.encode_update_v1();
        if delta.as_slice() == EMPTY_UPDATE {
            Ok(None)
        } else {
            Ok(Some(delta))
        }
    }

    fn encode_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    fn diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, StateError> {
        let remote_sv = StateVector::decode_v1(state_vector)
            .map_err(|e| StateError::InvalidStateVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote_sv))
    }
}
