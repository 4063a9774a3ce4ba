//! WebSocket front door.
//!
//! Architecture:
//! ```text
//! ws://host/doc-abc123 ──┐
//!                         ├── path → document name ── Registry::attach
//! ws://host/doc-abc123 ──┘                                  │
//!                                                     Session (doc-abc123)
//!                                                           │
//!                          ┌────────────────────────────────┼──────────┐
//!                          ▼                                ▼          ▼
//!                     Connection A                    Connection B   ...
//! ```
//!
//! Each accepted socket runs on its own task: inbound frames go to the
//! [`Connection`] handler, outbound frames come from the session's broadcast
//! channel, and a heartbeat ping keeps idle sockets alive. A background task
//! expires presence records whose owners stopped renewing them.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::connection::Connection;
use crate::registry::{Registry, RegistryConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Document used when the request path is empty
    pub default_document: String,
    /// How long an empty document stays in memory
    pub grace_period: Duration,
    /// Frames buffered per connection
    pub broadcast_capacity: usize,
    /// Interval between WebSocket pings
    pub heartbeat_interval: Duration,
    /// Presence records older than this are expired
    pub presence_timeout: Duration,
    /// How often stale presence is swept
    pub presence_sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            default_document: "default".to_string(),
            grace_period: Duration::from_secs(30),
            broadcast_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
            presence_timeout: Duration::from_secs(30),
            presence_sweep_interval: Duration::from_secs(15),
        }
    }
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("{0} must be non-zero")]
    Zero(&'static str),
}

impl ServerConfig {
    /// Defaults overlaid with `PORT` and `QUILL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(port) = lookup("PORT") {
            let port: u16 = parse("PORT", &port)?;
            config.bind_addr = format!("0.0.0.0:{port}");
        }
        if let Some(addr) = lookup("QUILL_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(name) = lookup("QUILL_DEFAULT_DOCUMENT") {
            config.default_document = name;
        }
        if let Some(secs) = lookup("QUILL_GRACE_SECS") {
            config.grace_period = Duration::from_secs(parse("QUILL_GRACE_SECS", &secs)?);
        }
        if let Some(capacity) = lookup("QUILL_BROADCAST_CAPACITY") {
            config.broadcast_capacity = parse_nonzero("QUILL_BROADCAST_CAPACITY", &capacity)?;
        }
        if let Some(secs) = lookup("QUILL_HEARTBEAT_SECS") {
            config.heartbeat_interval = Duration::from_secs(parse_nonzero("QUILL_HEARTBEAT_SECS", &secs)?);
        }
        if let Some(secs) = lookup("QUILL_PRESENCE_TIMEOUT_SECS") {
            config.presence_timeout =
                Duration::from_secs(parse_nonzero("QUILL_PRESENCE_TIMEOUT_SECS", &secs)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the values the server cannot run with. Timers and the broadcast
    /// channel all need a non-zero setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Zero("heartbeat_interval"));
        }
        if self.presence_timeout.is_zero() {
            return Err(ConfigError::Zero("presence_timeout"));
        }
        if self.presence_sweep_interval.is_zero() {
            return Err(ConfigError::Zero("presence_sweep_interval"));
        }
        if self.broadcast_capacity == 0 {
            return Err(ConfigError::Zero("broadcast_capacity"));
        }
        Ok(())
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            grace_period: self.grace_period,
            broadcast_capacity: self.broadcast_capacity,
        }
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn parse_nonzero<T: std::str::FromStr + Default + PartialEq>(
    key: &'static str,
    value: &str,
) -> Result<T, ConfigError> {
    let parsed: T = parse(key, value)?;
    if parsed == T::default() {
        return Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        });
    }
    Ok(parsed)
}

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Map a request path to a document name.
///
/// The leading `/` is dropped and the query string ignored; an empty result
/// falls back to `default`.
pub fn document_name_from_path(path: &str, default: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let name = path.strip_prefix('/').unwrap_or(path);
    if name.is_empty() {
        default.to_string()
    } else {
        name.to_string()
    }
}

/// Snapshot of server counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub malformed_frames: u64,
    pub active_documents: usize,
}

#[derive(Default)]
struct AtomicHubStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
    malformed_frames: AtomicU64,
}

/// The document sync hub server.
pub struct HubServer {
    config: ServerConfig,
    registry: Registry,
    stats: Arc<AtomicHubStats>,
}

impl HubServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Registry::new(config.registry_config());
        Self::with_registry(config, registry)
    }

    /// Serve sessions from an existing registry.
    pub fn with_registry(config: ServerConfig, registry: Registry) -> Self {
        Self {
            config,
            registry,
            stats: Arc::new(AtomicHubStats::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Shared handle to the document registry.
    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    /// Bind to the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync hub listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.config.validate()?;
        let sweeper = self.spawn_presence_sweeper();

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(ServerError::Io(e)),
            };
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats, config).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        };

        sweeper.abort();
        result
    }

    fn spawn_presence_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let registry = self.registry.clone();
        let every = self.config.presence_sweep_interval;
        let timeout = self.config.presence_timeout;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                interval.tick().await;
                let removed = registry.sweep_presence(timeout).await;
                if removed > 0 {
                    log::debug!("Presence sweep removed {removed} stale record(s)");
                }
            }
        })
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Registry,
        stats: Arc<AtomicHubStats>,
        config: ServerConfig,
    ) -> Result<(), ServerError> {
        let mut path = String::new();
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            path = request.uri().path().to_string();
            Ok(response)
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let document = document_name_from_path(&path, &config.default_document);
        log::info!("Client {addr} connected to document: {document}");

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let mut connection = Connection::open(&registry, &document).await;
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + config.heartbeat_interval,
            config.heartbeat_interval,
        );

        let mut healthy = true;
        for frame in connection.initial_frames() {
            if let Err(e) = ws_sender.send(Message::Binary(frame.into())).await {
                log::debug!("Initial sync to {addr} failed: {e}");
                healthy = false;
                break;
            }
        }

        while healthy {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            stats.frames_received.fetch_add(1, Ordering::Relaxed);
                            stats.bytes_received.fetch_add(data.len() as u64, Ordering::Relaxed);

                            match connection.handle_frame(&data) {
                                Ok(Some(reply)) => {
                                    if let Err(e) = ws_sender.send(Message::Binary(reply.into())).await {
                                        log::debug!("Reply to {addr} failed: {e}");
                                        break;
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    stats.malformed_frames.fetch_add(1, Ordering::Relaxed);
                                    log::warn!("Dropping frame from {addr} on {document}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if ws_sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Connection closed from {addr}");
                            break;
                        }

                        Some(Err(e)) => {
                            log::warn!("WebSocket error on {document} from {addr}: {e}");
                            break;
                        }

                        // Text and pong frames carry nothing for us
                        Some(Ok(_)) => {}
                    }
                }

                frame = connection.next_outbound() => {
                    match frame {
                        Some(frame) => {
                            if let Err(e) = ws_sender.send(Message::Binary(frame.to_vec().into())).await {
                                log::debug!("Send to {addr} failed: {e}");
                                break;
                            }
                        }
                        None => break,
                    }
                }

                _ = heartbeat.tick() => {
                    log::debug!("Heartbeat to {addr}");
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }

        connection.close();
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        let _ = ws_sender.close().await;

        Ok(())
    }

    /// Current counters.
    pub async fn stats(&self) -> HubStats {
        HubStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            malformed_frames: self.stats.malformed_frames.load(Ordering::Relaxed),
            active_documents: self.registry.session_count().await,
        }
    }
}
