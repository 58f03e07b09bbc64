//! # Local Dispatch (C5 half)
//!
//! Turns an inbound [`RequestFrame`] into a real HTTP call against the
//! local origin (`http://localhost:<port><path>`) and turns the origin's
//! response back into a [`ResponseFrame`], per spec §4.5.

use crate::error::AgentError;
use std::collections::HashMap;
use std::time::Duration;
use tunnel_protocol::{RequestFrame, ResponseFrame};

/// Re-issues `frame` against the local origin listening on `local_port`,
/// honoring `timeout` as the local HTTP client's own deadline (spec
/// §4.4 "Deadlines": the agent's local client MUST impose its own 30s
/// timeout, independent of the dispatcher's).
pub async fn handle_request(
    client: &reqwest::Client,
    local_port: u16,
    timeout: Duration,
    frame: RequestFrame,
) -> ResponseFrame {
    match issue_local_request(client, local_port, timeout, &frame).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(id = %frame.id, error = %e, "local origin call failed");
            ResponseFrame {
                id: frame.id,
                status: Some(500),
                headers: HashMap::from([("content-type".to_string(), "application/json".to_string())]),
                body: serde_json::json!({"error": "Internal server error"}),
            }
        }
    }
}

async fn issue_local_request(
    client: &reqwest::Client,
    local_port: u16,
    timeout: Duration,
    frame: &RequestFrame,
) -> Result<ResponseFrame, AgentError> {
    let url = format!("http://localhost:{}{}", local_port, frame.path);
    let method = reqwest::Method::from_bytes(frame.method.as_bytes()).unwrap_or(reqwest::Method::GET);

    let mut builder = client.request(method, &url).timeout(timeout);
    for (name, value) in &frame.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        builder = builder.header(name, value);
    }

    builder = if !frame.files.is_empty() {
        builder.multipart(build_multipart(frame))
    } else {
        apply_body(builder, &frame.body)
    };

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let bytes = response.bytes().await?;

    let body = classify_body(&content_type, &bytes);

    Ok(ResponseFrame {
        id: frame.id.clone(),
        status: Some(status),
        headers: HashMap::from([("content-type".to_string(), content_type)]),
        body,
    })
}

/// Headers the agent must not forward verbatim to the local origin —
/// connection-scoped framing headers that only make sense on the hop
/// that produced them.
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection" | "keep-alive" | "transfer-encoding" | "upgrade" | "host" | "content-length"
    )
}

fn apply_body(builder: reqwest::RequestBuilder, body: &serde_json::Value) -> reqwest::RequestBuilder {
    if let Some(bytes) = tunnel_protocol::decode_binary(body) {
        return builder.body(bytes);
    }
    match body {
        serde_json::Value::Null => builder,
        serde_json::Value::String(s) => builder.body(s.clone()),
        other => builder.json(other),
    }
}

/// Rebuilds a `multipart/form-data` body from the frame's non-file
/// `body` fields and its `files` list (spec §4.5 step 2).
fn build_multipart(frame: &RequestFrame) -> reqwest::multipart::Form {
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    let mut form = reqwest::multipart::Form::new();

    if let Some(obj) = frame.body.as_object() {
        for (key, value) in obj {
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            form = form.text(key.clone(), text);
        }
    }

    for file in &frame.files {
        if let Ok(bytes) = STANDARD.decode(&file.data) {
            let part = reqwest::multipart::Part::bytes(bytes)
                .file_name(file.filename.clone())
                .mime_str(&file.mime)
                .unwrap_or_else(|_| reqwest::multipart::Part::bytes(Vec::new()));
            form = form.part(file.field.clone(), part);
        }
    }

    form
}

/// Classifies a raw origin response body per spec §4.4/§4.5: binary
/// content types travel as the tagged envelope, JSON is parsed to a
/// document when possible, everything else is a UTF-8 string.
fn classify_body(content_type: &str, bytes: &[u8]) -> serde_json::Value {
    if tunnel_protocol::is_binary_content_type(content_type) {
        return tunnel_protocol::encode_binary(bytes);
    }
    if content_type.contains("application/json") {
        if let Ok(v) = serde_json::from_slice(bytes) {
            return v;
        }
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => serde_json::Value::String(text.to_string()),
        Err(_) => tunnel_protocol::encode_binary(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_body_parses_json_document() {
        let body = classify_body("application/json", br#"{"ok":true}"#);
        assert_eq!(body, serde_json::json!({"ok": true}));
    }

    #[test]
    fn classify_body_wraps_image_bytes_as_binary_envelope() {
        let body = classify_body("image/png", &[0x89, 0x50, 0x4e, 0x47]);
        assert!(tunnel_protocol::decode_binary(&body).is_some());
    }

    #[test]
    fn classify_body_falls_back_to_string_for_text_content() {
        let body = classify_body("text/plain", b"pong");
        assert_eq!(body, serde_json::Value::String("pong".to_string()));
    }

    #[test]
    fn is_hop_by_hop_filters_framing_headers() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("host"));
        assert!(!is_hop_by_hop("x-request-id"));
    }
}
