//! End-to-end exercise of the full request path: an agent registers
//! over the tunnel websocket, a public HTTP request arrives on the edge
//! listener, and the response travels back through the tunnel to the
//! waiting edge handler. Covers the "Concrete scenarios" spec §8 names
//! (anonymous round-trip, JSON POST, binary GET) without a live
//! Postgres instance, using the in-memory `Store`.

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tunnel_protocol::{AgentToServer, ControlFrame, RegisterFrame, ResponseFrame, ServerToAgent};
use tunnel_server::config::Config;
use tunnel_server::state::AppState;
use tunnel_server::storage::memory::MemoryStore;
use tunnel_server::{edge_router, tunnel_router};

fn test_config() -> Config {
    Config {
        base_domain: "example.com".into(),
        http_addr: "127.0.0.1:0".parse().unwrap(),
        tunnel_addr: "127.0.0.1:0".parse().unwrap(),
        observer_addr: "127.0.0.1:0".parse().unwrap(),
        tls_cert_path: None,
        tls_key_path: None,
        database_url: "postgres://unused/unused".into(),
        database_password: String::new(),
        max_aliases_per_user: 5,
        custom_domains: std::collections::HashMap::new(),
        request_timeout_secs: 5,
    }
}

/// Boots the tunnel and edge routers on ephemeral ports, both sharing
/// one `AppState` backed by a fresh `MemoryStore`.
async fn spawn_server() -> (std::net::SocketAddr, std::net::SocketAddr) {
    let state = AppState::new(Arc::new(MemoryStore::new()), test_config());

    let tunnel_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tunnel_addr = tunnel_listener.local_addr().unwrap();
    let tunnel_app = tunnel_router(state.clone());
    tokio::spawn(async move {
        axum::serve(tunnel_listener, tunnel_app).await.unwrap();
    });

    let edge_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let edge_addr = edge_listener.local_addr().unwrap();
    let edge_app = edge_router(state.clone());
    tokio::spawn(async move {
        axum::serve(edge_listener, edge_app).await.unwrap();
    });

    (tunnel_addr, edge_addr)
}

/// Connects an anonymous agent to the tunnel endpoint and returns the
/// websocket stream plus the alias the server assigned it.
async fn connect_anonymous_agent(
    tunnel_addr: std::net::SocketAddr,
) -> (
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    String,
) {
    let url = format!("ws://{tunnel_addr}/tunnel");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let register = AgentToServer::Register(RegisterFrame::new(None, Some(3000)));
    ws.send(Message::Text(serde_json::to_string(&register).unwrap().into()))
        .await
        .unwrap();

    let ack = ws.next().await.unwrap().unwrap();
    let Message::Text(text) = ack else {
        panic!("expected text frame for registration ack");
    };
    let parsed: ServerToAgent = serde_json::from_str(&text).unwrap();
    let alias = match parsed {
        ServerToAgent::Control(ControlFrame::Registered { alias, .. }) => alias,
        other => panic!("expected Registered, got {other:?}"),
    };
    (ws, alias)
}

#[tokio::test]
async fn anonymous_round_trip_get() {
    let (tunnel_addr, edge_addr) = spawn_server().await;
    let (mut ws, alias) = connect_anonymous_agent(tunnel_addr).await;

    let responder = tokio::spawn(async move {
        let msg = ws.next().await.unwrap().unwrap();
        let Message::Text(text) = msg else { panic!("expected request frame") };
        let frame: tunnel_protocol::RequestFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(frame.method, "GET");
        assert_eq!(frame.path, "/ping");

        let response = ResponseFrame {
            id: frame.id,
            status: Some(200),
            headers: std::collections::HashMap::from([(
                "content-type".to_string(),
                "text/plain".to_string(),
            )]),
            body: serde_json::Value::String("pong".to_string()),
        };
        ws.send(Message::Text(
            serde_json::to_string(&AgentToServer::Response(response)).unwrap().into(),
        ))
        .await
        .unwrap();
        ws
    });

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{edge_addr}/ping"))
        .header(reqwest::header::HOST, format!("{alias}.example.com"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "pong");
    responder.await.unwrap();
}

#[tokio::test]
async fn json_post_is_framed_and_echoed_back() {
    let (tunnel_addr, edge_addr) = spawn_server().await;
    let (mut ws, alias) = connect_anonymous_agent(tunnel_addr).await;

    tokio::spawn(async move {
        let msg = ws.next().await.unwrap().unwrap();
        let Message::Text(text) = msg else { panic!("expected request frame") };
        let frame: tunnel_protocol::RequestFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(frame.method, "POST");
        assert_eq!(frame.body, serde_json::json!({"x": 1}));

        let response = ResponseFrame {
            id: frame.id,
            status: Some(200),
            headers: std::collections::HashMap::from([(
                "content-type".to_string(),
                "application/json".to_string(),
            )]),
            body: serde_json::json!({"y": 2}),
        };
        ws.send(Message::Text(
            serde_json::to_string(&AgentToServer::Response(response)).unwrap().into(),
        ))
        .await
        .unwrap();
    });

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{edge_addr}/api/echo"))
        .header(reqwest::header::HOST, format!("{alias}.example.com"))
        .json(&serde_json::json!({"x": 1}))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body, serde_json::json!({"y": 2}));
}

#[tokio::test]
async fn binary_response_round_trips_exactly() {
    let (tunnel_addr, edge_addr) = spawn_server().await;
    let (mut ws, alias) = connect_anonymous_agent(tunnel_addr).await;

    let png_bytes: Vec<u8> = vec![0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a];
    let expected = png_bytes.clone();

    tokio::spawn(async move {
        let msg = ws.next().await.unwrap().unwrap();
        let Message::Text(text) = msg else { panic!("expected request frame") };
        let frame: tunnel_protocol::RequestFrame = serde_json::from_str(&text).unwrap();

        let response = ResponseFrame {
            id: frame.id,
            status: Some(200),
            headers: std::collections::HashMap::from([(
                "content-type".to_string(),
                "image/png".to_string(),
            )]),
            body: tunnel_protocol::encode_binary(&png_bytes),
        };
        ws.send(Message::Text(
            serde_json::to_string(&AgentToServer::Response(response)).unwrap().into(),
        ))
        .await
        .unwrap();
    });

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{edge_addr}/logo.png"))
        .header(reqwest::header::HOST, format!("{alias}.example.com"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "image/png"
    );
    let bytes = resp.bytes().await.unwrap();
    assert_eq!(bytes.as_ref(), expected.as_slice());
}

#[tokio::test]
async fn unknown_alias_returns_400() {
    let (_tunnel_addr, edge_addr) = spawn_server().await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{edge_addr}/anything"))
        .header(reqwest::header::HOST, "no-such-alias.example.com")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn alias_stops_resolving_once_the_agent_disconnects() {
    // Registry invariant 4 (spec §3): a tunnel id never appears in the
    // registry after its channel has closed, so a disconnected alias is
    // fully removed rather than left resolvable-but-unreachable — the
    // edge dispatcher sees this exactly like an alias that never existed.
    let (tunnel_addr, edge_addr) = spawn_server().await;
    let (ws, alias) = connect_anonymous_agent(tunnel_addr).await;
    drop(ws); // simulate the agent disconnecting

    // Give the server a moment to observe the close and clean up the registry.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{edge_addr}/ping"))
        .header(reqwest::header::HOST, format!("{alias}.example.com"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
}
