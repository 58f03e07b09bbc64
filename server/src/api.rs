//! # REST API Endpoints
//!
//! Small operator-facing HTTP surface mounted on the dashboard observer
//! listener, alongside the `/observe` websocket: a plain JSON snapshot
//! of who's currently tunneled in, for tooling that doesn't want to
//! hold a websocket open. Never mounted on the public edge listener —
//! every path there selects a tunnel (spec §6), so an operator route
//! would either shadow a legitimate public request or leak cross-tenant
//! alias/user data to anonymous visitors.

use crate::state::AppState;
use axum::{extract::State, Json};
use serde::Serialize;

/// Response item representing one live tunnel.
#[derive(Serialize)]
pub struct TunnelListItem {
    pub alias: String,
    pub user: String,
    pub url: String,
}

/// `GET /api/tunnels` — returns every alias with a currently live tunnel.
pub async fn list_tunnels(State(state): State<AppState>) -> Json<Vec<TunnelListItem>> {
    let base_domain = &state.config.base_domain;
    let snapshot = state.registry.snapshot_live_urls(base_domain);
    let tunnels = snapshot
        .into_iter()
        .flat_map(|(user, urls)| {
            urls.into_iter().map(move |url| {
                let alias = url
                    .trim_start_matches("https://")
                    .split('.')
                    .next()
                    .unwrap_or_default()
                    .to_string();
                TunnelListItem {
                    alias,
                    user: user.clone(),
                    url,
                }
            })
        })
        .collect();
    Json(tunnels)
}
