//! Binary entry point: wires [`Config`] → `PgStore` → [`AppState`], builds
//! the three routers from `tunnel_server`'s library surface, and serves
//! each either plain or behind TLS. See `tunnel_server::*` for the actual
//! module breakdown.

use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

use tunnel_server::config::Config;
use tunnel_server::state::AppState;
use tunnel_server::storage::postgres::PgStore;
use tunnel_server::{dashboard, edge_router, observer_router, tls, tunnel_router};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_server=info".into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let store = match PgStore::connect(&config.database_dsn()).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "storage unreachable at startup");
            return ExitCode::FAILURE;
        }
    };

    let tls_cfg = if config.tls_enabled() {
        match tls::load(&config).await {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                error!(error = %e, "TLS material unreadable");
                return ExitCode::FAILURE;
            }
        }
    } else {
        None
    };

    let http_addr = config.http_addr;
    let tunnel_addr = config.tunnel_addr;
    let observer_addr = config.observer_addr;

    let state = AppState::new(Arc::new(store), config);

    let edge_app = edge_router(state.clone());
    let tunnel_app = tunnel_router(state.clone());
    let observer_app = observer_router(state.clone());

    info!(%http_addr, %tunnel_addr, %observer_addr, tls = tls_cfg.is_some(), "starting tunnel server");
    info!("request log's port field is read from x-forwarded-port; without a proxy setting it, it will always log as 0");

    tokio::spawn(dashboard::run_ticker(state.clone()));

    let result = match tls_cfg {
        Some(tls_cfg) => {
            tokio::try_join!(
                serve_tls(http_addr, edge_app, tls_cfg.clone()),
                serve_tls(tunnel_addr, tunnel_app, tls_cfg.clone()),
                serve_tls(observer_addr, observer_app, tls_cfg),
            )
        }
        None => {
            tokio::try_join!(
                serve_plain(http_addr, edge_app),
                serve_plain(tunnel_addr, tunnel_app),
                serve_plain(observer_addr, observer_app),
            )
        }
    };

    if let Err(e) = result {
        error!(error = %e, "listener terminated unexpectedly");
        return ExitCode::FAILURE;
    }

    info!("all tunnels closed, storage pool drained, shutting down");
    ExitCode::SUCCESS
}

async fn serve_plain(addr: std::net::SocketAddr, app: axum::Router) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn serve_tls(
    addr: std::net::SocketAddr,
    app: axum::Router,
    tls_config: axum_server::tls_rustls::RustlsConfig,
) -> std::io::Result<()> {
    let handle = axum_server::Handle::new();
    tokio::spawn({
        let handle = handle.clone();
        async move {
            shutdown_signal().await;
            handle.graceful_shutdown(None);
        }
    });
    axum_server::bind_rustls(addr, tls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("interrupt received, closing tunnels and draining storage");
}
