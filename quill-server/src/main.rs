//! Quill sync hub: serves live documents over WebSocket.
//!
//! Connect to `ws://<host>:<port>/<document-name>`; the bare path `/`
//! opens the default document. Configuration comes from `PORT` and the
//! `QUILL_*` environment variables, logging from `RUST_LOG`.

use log::info;
use quill_sync::{HubServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;
    info!(
        "Starting Quill sync hub (grace period {:?}, default document {:?})",
        config.grace_period, config.default_document
    );

    HubServer::new(config).run().await?;
    Ok(())
}
