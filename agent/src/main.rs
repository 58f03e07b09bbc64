//! # Reverse HTTP Tunnel Remote Agent
//!
//! Headless counterpart to the edge server: dials the tunnel control
//! channel, registers, and re-issues every inbound request against a
//! local origin bound to a loopback port. See spec §4.5.
//!
//! ## Modules
//!
//! - [`config`]     — environment-derived runtime configuration
//! - [`connection`] — the reconnect loop and inbound frame demux (C5)
//! - [`dispatch`]   — turns a request frame into a local HTTP call
//! - [`error`]      — error taxonomy (protocol/origin) for the above

mod config;
mod connection;
mod dispatch;
mod error;

use crate::config::Config;
use std::process::ExitCode;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_agent=info".into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    connection::run(config).await;
    ExitCode::SUCCESS
}
