//! Binary frame codec for the document sync protocol.
//!
//! Every frame starts with a lib0 variable-length unsigned integer naming the
//! message type, followed by a type-specific body:
//!
//! ```text
//! ┌──────────────┬───────────────┬─────────────────────────┐
//! │ msg_type     │ sync_type     │ payload                 │
//! │ varuint (0)  │ varuint 0..=2 │ varUint8Array           │
//! ├──────────────┼───────────────┴─────────────────────────┤
//! │ varuint (1)  │ varUint8Array (encoded presence delta)  │
//! └──────────────┴─────────────────────────────────────────┘
//! ```
//!
//! The layout matches y-protocols, so stock Yjs providers can talk to the hub.
//! Payloads are opaque here: state vectors and updates are interpreted by the
//! replicated-state primitive, presence deltas by [`crate::presence`].

use thiserror::Error;
use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

/// Top-level message discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Document sync (state vectors and deltas)
    Sync = 0,
    /// Ephemeral presence / awareness delta
    Awareness = 1,
}

impl MessageType {
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(Self::Sync),
            1 => Some(Self::Awareness),
            _ => None,
        }
    }

    pub fn tag(self) -> u32 {
        self as u32
    }
}

const SYNC_STEP1: u32 = 0;
const SYNC_STEP2: u32 = 1;
const SYNC_UPDATE: u32 = 2;

/// Body of a [`MessageType::Sync`] frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Encoded state vector: "send me what I am missing"
    SyncStep1(Vec<u8>),
    /// Encoded delta answering a step 1
    SyncStep2(Vec<u8>),
    /// Encoded incremental delta
    Update(Vec<u8>),
}

impl SyncMessage {
    fn tag(&self) -> u32 {
        match self {
            Self::SyncStep1(_) => SYNC_STEP1,
            Self::SyncStep2(_) => SYNC_STEP2,
            Self::Update(_) => SYNC_UPDATE,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Self::SyncStep1(p) | Self::SyncStep2(p) | Self::Update(p) => p,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SyncStep1(_) => "SyncStep1",
            Self::SyncStep2(_) => "SyncStep2",
            Self::Update(_) => "Update",
        }
    }
}

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Sync(SyncMessage),
    /// Raw presence delta, decoded by [`crate::presence::PresenceUpdate`]
    Awareness(Vec<u8>),
}

impl Frame {
    pub fn sync_step1(state_vector: Vec<u8>) -> Self {
        Frame::Sync(SyncMessage::SyncStep1(state_vector))
    }

    pub fn sync_step2(diff: Vec<u8>) -> Self {
        Frame::Sync(SyncMessage::SyncStep2(diff))
    }

    pub fn update(delta: Vec<u8>) -> Self {
        Frame::Sync(SyncMessage::Update(delta))
    }

    pub fn awareness(presence_delta: Vec<u8>) -> Self {
        Frame::Awareness(presence_delta)
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Sync(_) => MessageType::Sync,
            Frame::Awareness(_) => MessageType::Awareness,
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_var(self.message_type().tag());
        match self {
            Frame::Sync(msg) => {
                buf.write_var(msg.tag());
                buf.write_buf(msg.payload());
            }
            Frame::Awareness(payload) => buf.write_buf(payload),
        }
        buf
    }

    /// Deserialize from the binary wire format.
    ///
    /// Unknown discriminators are reported as
    /// [`ProtocolError::UnknownMessageType`] so callers can drop them.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(bytes);
        let tag: u32 = cursor.read_var()?;
        match MessageType::from_tag(tag) {
            Some(MessageType::Sync) => {
                let sync_tag: u32 = cursor.read_var()?;
                let payload = cursor.read_buf()?.to_vec();
                let msg = match sync_tag {
                    SYNC_STEP1 => SyncMessage::SyncStep1(payload),
                    SYNC_STEP2 => SyncMessage::SyncStep2(payload),
                    SYNC_UPDATE => SyncMessage::Update(payload),
                    other => return Err(ProtocolError::UnknownSyncType(other)),
                };
                Ok(Frame::Sync(msg))
            }
            Some(MessageType::Awareness) => Ok(Frame::Awareness(cursor.read_buf()?.to_vec())),
            None => Err(ProtocolError::UnknownMessageType(tag)),
        }
    }
}

/// Protocol errors. None of these are fatal to a connection.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u32),
    #[error("Unknown sync message type: {0}")]
    UnknownSyncType(u32),
    #[error("Invalid presence state: {0}")]
    InvalidPresence(String),
}

impl From<yrs::encoding::read::Error> for ProtocolError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        ProtocolError::Malformed(e.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::InvalidPresence(e.to_string())
    }
}
