//! # Reverse HTTP Tunnel Edge Server
//!
//! Exposes three routers:
//!
//! - the public HTTP edge ([`edge`]) that resolves a subdomain/custom
//!   domain to a tunnel and dispatches requests over it,
//! - the tunnel control channel ([`tunnel`]) that agents dial into,
//! - the dashboard observer channel ([`dashboard`]) that fans out the
//!   live-tunnel snapshot.
//!
//! Split into a library and a thin `main.rs` binary so the full request
//! path (tunnel registration through edge dispatch) can be exercised by
//! integration tests without a live Postgres instance, using
//! [`state::AppState::new`] with an in-memory [`storage::Store`].
//!
//! ## Modules
//!
//! - [`config`]   — environment-derived runtime configuration
//! - [`error`]     — error taxonomy and their public-facing HTTP mapping
//! - [`storage`]   — the `users`/`user_aliases`/`api_requests` store
//! - [`alias`]     — the alias allocator (C1)
//! - [`registry`]  — the live tunnel registry (C2)
//! - [`tunnel`]    — the agent-facing control channel (C3)
//! - [`edge`]      — the public HTTP dispatcher (C4)
//! - [`dashboard`] — the observer fan-out (C6)
//! - [`api`]       — a small operator-facing REST surface
//! - [`state`]     — shared application state
//! - [`tls`]       — TLS configuration for all three listeners

pub mod alias;
pub mod api;
pub mod config;
pub mod dashboard;
pub mod edge;
pub mod error;
pub mod registry;
pub mod state;
pub mod storage;
pub mod tls;
pub mod tunnel;

use axum::routing::{any, get};
use axum::Router;
use state::AppState;
use tower_http::cors::CorsLayer;

/// Builds the public edge router: the catch-all dispatcher for every
/// method/path, and nothing else. Every path on this listener selects a
/// tunnel (spec §6), so no operator-facing route can be mounted here
/// without either shadowing a legitimate public request for that path
/// or leaking cross-tenant data to anonymous visitors.
pub fn edge_router(state: AppState) -> Router {
    Router::new()
        .fallback(any(edge::dispatch))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Builds the agent-facing tunnel router: `GET /tunnel` (websocket upgrade).
pub fn tunnel_router(state: AppState) -> Router {
    Router::new()
        .route("/tunnel", get(tunnel::tunnel_handler))
        .with_state(state)
}

/// Builds the dashboard observer router: `GET /observe` (websocket
/// upgrade) plus the operator-facing `GET /api/tunnels` snapshot. Both
/// live on the observer listener, not the public edge listener, since
/// both are only meant for operators/dashboards, never anonymous
/// internet visitors.
pub fn observer_router(state: AppState) -> Router {
    Router::new()
        .route("/observe", get(dashboard::observer_handler))
        .route("/api/tunnels", get(api::list_tunnels))
        .with_state(state)
}
