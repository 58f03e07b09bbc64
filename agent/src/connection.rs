//! # Agent Connection Loop (C5)
//!
//! Dials the edge server, registers, and processes inbound request
//! frames until the channel closes, then backs off and redials. Grounded
//! in the teacher's own `agent::run_agent_loop` — same connect/register/
//! outbound-task/inbound-loop/cleanup shape, adapted from a TCP-relay
//! session model to this system's request/response correlation.

use crate::config::Config;
use crate::dispatch;
use crate::error::AgentError;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info, warn};
use tunnel_protocol::{AgentToServer, ControlFrame, RegisterFrame, ServerToAgent};

/// Runs the agent's connection loop forever: connect, register, serve
/// inbound requests, and on disconnect wait `reconnect_delay` before
/// trying again. Exactly one reconnect timer is ever armed at a time —
/// this loop's own structure guarantees that, since the sleep only
/// happens after the previous connection has fully torn down.
pub async fn run(config: Config) {
    let http_client = reqwest::Client::new();
    let anon_deadline_hit = Arc::new(AtomicBool::new(false));

    if config.user_token.is_none() {
        let flag = anon_deadline_hit.clone();
        let timeout = config.anon_session_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            warn!("anonymous session timeout elapsed, terminating");
            flag.store(true, Ordering::SeqCst);
            std::process::exit(0);
        });
    }

    loop {
        if anon_deadline_hit.load(Ordering::SeqCst) {
            return;
        }

        info!(server = %config.server_url, "connecting to tunnel server");
        match connect_async(&config.server_url).await {
            Ok((ws_stream, _)) => {
                info!("connected, registering");
                run_session(&config, &http_client, ws_stream).await;
                warn!("disconnected from tunnel server");
            }
            Err(e) => {
                error!(error = %e, "connection attempt failed");
            }
        }

        tokio::time::sleep(config.reconnect_delay).await;
    }
}

async fn run_session(
    config: &Config,
    http_client: &reqwest::Client,
    ws_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) {
    let (ws_sink, mut ws_stream_rx) = ws_stream.split();
    let ws_sink = Arc::new(tokio::sync::Mutex::new(ws_sink));

    let (tx, mut rx) = mpsc::unbounded_channel::<AgentToServer>();

    let register = RegisterFrame::new(config.user_token.clone(), Some(config.local_port));
    if tx.send(AgentToServer::Register(register)).is_err() {
        return;
    }

    let outbound_sink = ws_sink.clone();
    let outbound = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(t) => t,
                Err(e) => {
                    error!(error = %e, "failed to serialize outbound frame");
                    continue;
                }
            };
            let mut sink = outbound_sink.lock().await;
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let keepalive_sink = ws_sink.clone();
    let keepalive_interval = config.keepalive;
    let keepalive = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(keepalive_interval);
        loop {
            ticker.tick().await;
            let mut sink = keepalive_sink.lock().await;
            if sink.send(Message::Ping(bytes::Bytes::new())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_stream_rx.next().await {
        match msg {
            Message::Text(text) => {
                handle_inbound(config, http_client, &tx, &text).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    outbound.abort();
    keepalive.abort();
}

async fn handle_inbound(
    config: &Config,
    http_client: &reqwest::Client,
    tx: &mpsc::UnboundedSender<AgentToServer>,
    text: &str,
) {
    let parsed = match serde_json::from_str::<ServerToAgent>(text).map_err(AgentError::from) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "ignoring malformed frame from server");
            return;
        }
    };

    match parsed {
        ServerToAgent::Control(ControlFrame::Registered { uuid, alias }) => {
            info!(tunnel_id = %uuid, %alias, "registered");
        }
        ServerToAgent::Control(ControlFrame::Error { message }) => {
            error!(%message, "registration rejected by server");
        }
        ServerToAgent::Request(frame) => {
            let tx = tx.clone();
            let client = http_client.clone();
            let local_port = config.local_port;
            let timeout = config.local_request_timeout;
            tokio::spawn(async move {
                let response = dispatch::handle_request(&client, local_port, timeout, frame).await;
                let _ = tx.send(AgentToServer::Response(response));
            });
        }
    }
}
