//! # Tunnel Endpoint (C3)
//!
//! Each agent connection progresses through the small state machine
//! from spec §4.3: CONNECTED → REGISTERING → ACTIVE → CLOSED. This
//! module owns the websocket upgrade, the registration handshake
//! (talking to the alias allocator and registry), and teardown —
//! aborting every pending request on disconnect so waiting edge
//! handlers observe a bad-gateway result rather than hanging forever.

use crate::alias::{self, ANONYMOUS_USER};
use crate::error::RegistrationError;
use crate::registry::{PendingRequest, Tunnel};
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tunnel_protocol::{AgentToServer, ControlFrame, RegisterFrame, ServerToAgent};
use uuid::Uuid;

/// `GET /tunnel` — upgrades an agent's HTTP connection to a WebSocket
/// and hands it off to [`run_tunnel`].
pub async fn tunnel_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_tunnel(socket, state))
}

/// Drives one agent connection end to end: registration, then the
/// ACTIVE state's inbound response demux, then teardown.
async fn run_tunnel(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // CONNECTED: wait for the first frame, which must be a register frame.
    let register = match wait_for_register(&mut ws_stream).await {
        Some(frame) => frame,
        None => return, // timeout or bad frame — close silently, per §4.3
    };

    // REGISTERING: run the allocator and build the tunnel record.
    let tunnel_id = Uuid::new_v4().to_string();
    let user_token = register.user.clone().unwrap_or_else(|| ANONYMOUS_USER.to_string());
    let port = register.port.unwrap_or(0);

    let user_for_store = register.user.as_deref();
    let registry = state.registry.clone();
    let allocation = {
        let registry = registry.clone();
        alias::allocate(
            state.store.as_ref(),
            move |candidate| {
                let registry = registry.clone();
                async move { registry.alias_live(&candidate) }
            },
            user_for_store,
            port,
            state.config.max_aliases_per_user,
        )
        .await
    };

    let allocation = match allocation {
        Ok(a) => a,
        Err(e) => {
            warn!(error = %e, "registration failed during alias allocation");
            let msg = match e {
                alias::AllocError::Storage(_) => RegistrationError::StorageUnreachable.wire_message(),
                alias::AllocError::Exhausted(_) => RegistrationError::AliasExhausted.wire_message(),
            };
            let _ = ws_sink
                .send(Message::Text(
                    serde_json::to_string(&ControlFrame::Error { message: msg }).unwrap_or_default().into(),
                ))
                .await;
            let _ = ws_sink.close().await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerToAgent>();
    let tunnel = Arc::new(Tunnel {
        tunnel_id: tunnel_id.clone(),
        alias: allocation.alias.clone(),
        user_token: user_token.clone(),
        port,
        tx: tx.clone(),
        pending: DashMap::new(),
        bytes_in: AtomicU64::new(0),
        bytes_out: AtomicU64::new(0),
    });

    if let Err(e) = registry.insert(tunnel.clone()) {
        error!(alias = %e.0, "alias collision at insert time, rejecting registration");
        let _ = ws_sink
            .send(Message::Text(
                serde_json::to_string(&ControlFrame::Error {
                    message: "alias collision, please retry".into(),
                })
                .unwrap_or_default()
                .into(),
            ))
            .await;
        let _ = ws_sink.close().await;
        return;
    }

    info!(tunnel_id = %tunnel_id, alias = %allocation.alias, user = %user_token, port, "tunnel registered");

    let ack = ControlFrame::Registered {
        uuid: tunnel_id.clone(),
        alias: allocation.alias.clone(),
    };
    if tx.send(ServerToAgent::Control(ack)).is_err() {
        registry.remove(&tunnel_id);
        return;
    }

    // ACTIVE: outbound sender task drains `rx` onto the websocket sink,
    // serializing writes so frames never interleave on the wire.
    let outbound = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(t) => t,
                Err(e) => {
                    error!(error = %e, "failed to serialize outbound frame");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Inbound loop: response frames are routed to their pending slot.
    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                dispatch_inbound(&tunnel, &text);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // CLOSED: teardown.
    outbound.abort();
    registry.remove(&tunnel_id);
    // Dropping each pending oneshot sender wakes its waiter with a RecvError,
    // which the edge dispatcher maps to a 503 (spec §4.3 "Teardown").
    tunnel.pending.clear();
    info!(tunnel_id = %tunnel_id, alias = %tunnel.alias, "tunnel disconnected");
}

/// Waits (with a short grace period) for the first inbound frame and
/// requires it to be a register frame — any other shape or a timeout
/// closes the connection per the CONNECTED row of spec §4.3's table.
async fn wait_for_register(
    ws_stream: &mut futures::stream::SplitStream<WebSocket>,
) -> Option<RegisterFrame> {
    let first = tokio::time::timeout(std::time::Duration::from_secs(10), ws_stream.next())
        .await
        .ok()??;
    let Message::Text(text) = first.ok()? else {
        return None;
    };
    match serde_json::from_str::<AgentToServer>(&text) {
        Ok(AgentToServer::Register(frame)) => Some(frame),
        _ => None,
    }
}

/// Routes one inbound text frame from an ACTIVE tunnel: only response
/// frames are expected here. A response whose `id` has no matching
/// pending slot is silently dropped (spec §4.4 step 4) — filtered
/// *before* any logging happens, per the resolution in SPEC_FULL.md.
fn dispatch_inbound(tunnel: &Arc<Tunnel>, text: &str) {
    let parsed = match serde_json::from_str::<AgentToServer>(text) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "ignoring malformed frame from agent");
            return;
        }
    };
    match parsed {
        AgentToServer::Response(response) => {
            if let Some((_, slot)) = tunnel.pending.remove(&response.id) {
                let PendingRequest { responder } = slot;
                let _ = responder.send(response);
            }
            // else: no matching waiter — drop, per §4.4 step 4.
        }
        AgentToServer::Register(_) => {
            warn!("ignoring unexpected register frame on an already-active tunnel");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_drops_response_with_no_matching_pending_slot() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let tunnel = Arc::new(Tunnel {
            tunnel_id: "t1".into(),
            alias: "client-aaa".into(),
            user_token: "anonymous".into(),
            port: 3000,
            tx,
            pending: DashMap::new(),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        });
        let text = r#"{"id":"unmatched","status":200,"headers":{},"body":"x"}"#;
        dispatch_inbound(&tunnel, text);
        assert!(tunnel.pending.is_empty());
    }

    #[test]
    fn dispatch_routes_response_to_matching_slot() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (responder, waiter) = tokio::sync::oneshot::channel();
        let tunnel = Arc::new(Tunnel {
            tunnel_id: "t1".into(),
            alias: "client-aaa".into(),
            user_token: "anonymous".into(),
            port: 3000,
            tx,
            pending: DashMap::new(),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        });
        tunnel.pending.insert("abc".into(), PendingRequest { responder });
        let text = r#"{"id":"abc","status":200,"headers":{},"body":"pong"}"#;
        dispatch_inbound(&tunnel, text);
        assert!(tunnel.pending.is_empty());
        assert!(waiter.try_recv().is_ok());
    }
}
