//! Taskboard board server.
//!
//! An axum WebSocket server hosting collaborative kanban boards. Clients
//! authenticate with a bearer token, subscribe to a board and receive every
//! change made to it as an ordered event stream.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9100 with one user
//! cargo run --bin taskboard-server -- --user alice:secret
//!
//! # Run on custom address
//! cargo run --bin taskboard-server -- --bind 127.0.0.1:8080
//!
//! # Or via environment variable
//! TASKBOARD_ADDR=127.0.0.1:8080 cargo run --bin taskboard-server
//! ```

use std::sync::Arc;

use clap::Parser;
use taskboard_server::config::{ServerCliArgs, ServerConfig};
use taskboard_server::server::{self, ServerState};

#[tokio::main]
async fn main() {
    let cli = ServerCliArgs::parse();

    let config = match ServerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    if config.users.is_empty() {
        tracing::warn!("no users configured; every connection will be rejected");
    }
    tracing::info!(
        addr = %config.bind_addr,
        users = config.users.len(),
        "starting taskboard server"
    );

    let state = Arc::new(ServerState::from_config(&config));

    match server::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "board server listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "board server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start board server");
            std::process::exit(1);
        }
    }
}
