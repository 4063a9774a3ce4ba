//! # quill-sync — Document synchronization hub
//!
//! Keeps one live, mergeable copy of each document in memory and relays
//! edits and presence between everyone editing it over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ HubServer   │
//! │ (per user)  │   y-protocols wire  │ (front door)│
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │ path → name
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Yrs Doc     │                     │ Registry    │
//! │ (local)     │                     │ name→Session│
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ Session       │
//!                                    │ doc, presence,│
//!                                    │ BroadcastGroup│
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Frame codec (sync step 1/2, update, awareness)
//! - [`doc`] — Replicated document seam and its Yrs implementation
//! - [`presence`] — Clock-ordered presence table and delta codec
//! - [`broadcast`] — Per-session fan-out with origin tagging
//! - [`session`] — One live document and its attached connections
//! - [`registry`] — Name → session map with deferred teardown
//! - [`connection`] — Per-connection protocol state machine
//! - [`server`] — WebSocket front door, configuration, statistics
//! - [`client`] — WebSocket sync client

pub mod protocol;
pub mod doc;
pub mod presence;
pub mod broadcast;
pub mod session;
pub mod registry;
pub mod connection;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{Frame, MessageType, ProtocolError, SyncMessage};
pub use doc::{yrs_factory, ReplicatedState, StateError, StateFactory, YrsState};
pub use presence::{
    ClientId, PresenceChange, PresenceEntry, PresenceRecord, PresenceTable, PresenceUpdate,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, ConnectionId, Outbound};
pub use session::{Attachment, Session};
pub use registry::{Registry, RegistryConfig};
pub use connection::{Connection, ConnectionState, FrameError};
pub use server::{
    document_name_from_path, ConfigError, HubServer, HubStats, ServerConfig, ServerError,
};
pub use client::{ClientError, SyncClient, SyncEvent};
