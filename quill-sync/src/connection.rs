//! Per-connection protocol state machine.
//!
//! ```text
//! Attaching ──initial_frames()──► Synced ──close()──► Closed
//!                                   │  ▲
//!                     handle_frame()│  │next_outbound()
//!                                   ▼  │
//!                                 Session
//! ```
//!
//! The handler is transport-agnostic: it consumes raw inbound frames and
//! yields raw outbound frames. The server drives it from a WebSocket; tests
//! drive it directly.

use std::sync::Arc;

use thiserror::Error;

use crate::broadcast::ConnectionId;
use crate::doc::StateError;
use crate::protocol::{Frame, ProtocolError};
use crate::registry::Registry;
use crate::session::{Attachment, Session};

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registered with the session; initial frames not yet taken
    Attaching,
    /// Handshake frames handed out; exchanging messages
    Synced,
    /// Detached from the session
    Closed,
}

/// Why an inbound frame was dropped. Never fatal to the connection.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrameError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("Connection closed")]
    Closed,
}

/// Protocol handler for one connection.
pub struct Connection {
    id: ConnectionId,
    document: String,
    attachment: Option<Attachment>,
    state: ConnectionState,
}

impl Connection {
    /// Attach to the session for `document`, creating it if needed.
    pub async fn open(registry: &Registry, document: &str) -> Self {
        let attachment = registry.attach(document).await;
        Self {
            id: attachment.id(),
            document: document.to_string(),
            attachment: Some(attachment),
            state: ConnectionState::Attaching,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn document(&self) -> &str {
        &self.document
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        self.attachment.as_ref().map(Attachment::session)
    }

    /// Frames to send right after the transport opens: the server's state
    /// vector, then the presence table if anyone is present.
    pub fn initial_frames(&mut self) -> Vec<Vec<u8>> {
        if self.state != ConnectionState::Attaching {
            return Vec::new();
        }
        self.state = ConnectionState::Synced;
        self.attachment
            .as_mut()
            .map(Attachment::take_initial_frames)
            .unwrap_or_default()
    }

    /// Decode and dispatch one inbound frame.
    ///
    /// Returns the reply to send back on this connection, if any. An error
    /// means the frame was dropped; the connection stays usable.
    pub fn handle_frame(&mut self, bytes: &[u8]) -> Result<Option<Vec<u8>>, FrameError> {
        let attachment = self.attachment.as_ref().ok_or(FrameError::Closed)?;
        let session = attachment.session();

        match Frame::decode(bytes)? {
            Frame::Sync(msg) => {
                log::debug!("{} from {} on {}", msg.kind(), self.id, self.document);
                Ok(session.handle_sync(self.id, msg)?)
            }
            Frame::Awareness(payload) => {
                let change = session.handle_presence(self.id, &payload)?;
                log::trace!(
                    "Presence from {} on {}: +{} ~{} -{}",
                    self.id,
                    self.document,
                    change.added.len(),
                    change.updated.len(),
                    change.removed.len()
                );
                Ok(None)
            }
        }
    }

    /// Wait for the next frame the session addressed to this connection.
    ///
    /// Returns `None` once the connection is closed.
    pub async fn next_outbound(&mut self) -> Option<Arc<Vec<u8>>> {
        match self.attachment.as_mut() {
            Some(attachment) => attachment.recv().await,
            None => None,
        }
    }

    /// Detach from the session. Safe to call any number of times.
    pub fn close(&mut self) {
        if let Some(mut attachment) = self.attachment.take() {
            attachment.detach();
        }
        self.state = ConnectionState::Closed;
    }
}
