//! # Dashboard Fan-out (C6)
//!
//! A separate listener for observer connections. Each observer gets an
//! immediate snapshot on connect, then rides the single process-wide 5s
//! broadcast (driven by [`run_ticker`], spawned once from `main`) for as
//! long as it stays OPEN. Disconnects are noticed on the next send
//! attempt and the observer is dropped silently — observers never send
//! anything back (spec §4.6).

use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tracing::debug;
use tunnel_protocol::ObserverFrame;

const BROADCAST_INTERVAL: Duration = Duration::from_secs(5);

/// The process-wide 5s ticker: computes one snapshot and publishes it to
/// every currently-subscribed observer at once, so all observers see the
/// same tick rather than one timer per connection (spec §4.6 "a
/// process-wide timer ... broadcasts the same frame to every OPEN
/// observer"). Runs for the lifetime of the process; `main` spawns this
/// exactly once.
pub async fn run_ticker(state: AppState) {
    let mut ticker = tokio::time::interval(BROADCAST_INTERVAL);
    loop {
        ticker.tick().await;
        if state.dashboard_tick.receiver_count() == 0 {
            continue;
        }
        let text = snapshot_text(&state);
        let _ = state.dashboard_tick.send(text);
    }
}

pub async fn observer_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_observer(socket, state))
}

async fn run_observer(mut socket: WebSocket, state: AppState) {
    let snapshot = snapshot_text(&state);
    if socket.send(Message::Text(snapshot.into())).await.is_err() {
        return;
    }

    let mut ticks = state.dashboard_tick.subscribe();

    loop {
        tokio::select! {
            tick = ticks.recv() => {
                match tick {
                    Ok(text) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            debug!("observer disconnected, evicting");
                            return;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Err(_)) => return,
                    _ => {} // observers never send meaningful frames; ignore
                }
            }
        }
    }
}

fn snapshot_text(state: &AppState) -> String {
    let data = state.registry.snapshot_live_urls(&state.config.base_domain);
    let frame = ObserverFrame::ActiveUrls { data };
    serde_json::to_string(&frame).unwrap_or_default()
}
