//! # Edge Dispatcher (C4)
//!
//! The busiest path in the server: resolves the public Host header to a
//! tunnel, frames the incoming request, waits for the matching response
//! over the tunnel's correlator, and emits it back to the public client.
//! See spec §4.4 for the six numbered steps this module implements.

use crate::error::EdgeError;
use crate::registry::PendingRequest;
use crate::state::AppState;
use crate::storage::RequestLogRecord;
use axum::body::{Body, Bytes};
use axum::extract::{FromRequest, Multipart, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::warn;
use tunnel_protocol::{RequestFrame, ResponseFrame, ServerToAgent, UploadedFile};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Generates a request id unique within the process lifetime — more
/// than sufficient for "unique within the tunnel's lifetime" (spec
/// §4.4 step 3), and simpler than the source's `now_ms + random`.
fn next_request_id() -> String {
    format!("r{}", NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

/// Resolves the public alias for a request: the custom-domain map is
/// consulted first (exact host match), falling back to the first label
/// of the subdomain (spec §4.4 step 1).
fn resolve_alias(host: &str, custom_domains: &HashMap<String, String>) -> Option<String> {
    if let Some(alias) = custom_domains.get(host) {
        return Some(alias.clone());
    }
    host.split('.').next().map(str::to_string).filter(|s| !s.is_empty())
}

fn host_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(':').next().unwrap_or(s).to_string())
}

/// Catch-all public HTTP handler, mounted for every method and path.
pub async fn dispatch(State(state): State<AppState>, req: Request<Body>) -> Response {
    match dispatch_inner(state, req).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

async fn dispatch_inner(state: AppState, req: Request<Body>) -> Result<Response, EdgeError> {
    let headers = req.headers().clone();
    let host = host_header(&headers).ok_or(EdgeError::UnknownAlias)?;
    let alias = resolve_alias(&host, &state.config.custom_domains).ok_or(EdgeError::UnknownAlias)?;

    let tunnel = state.registry.lookup_by_alias(&alias).ok_or(EdgeError::UnknownAlias)?;

    let method = req.method().to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let header_map = flatten_headers(&headers);
    let port = header_map
        .get("x-forwarded-port")
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(0);

    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let (body, files) = if content_type.starts_with("multipart/form-data") {
        read_multipart(req).await?
    } else {
        let bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
            .await
            .map_err(|_| EdgeError::Internal)?;
        (parse_body(&content_type, &bytes), Vec::new())
    };

    let request_id = next_request_id();
    let bytes_in = serialized_header_len(&header_map) + body.to_string().len() as u64;
    let frame = RequestFrame {
        id: request_id.clone(),
        method: method.clone(),
        path: path.clone(),
        headers: header_map,
        body,
        files,
    };
    tunnel.record_in(bytes_in);

    let (responder, waiter) = oneshot::channel();
    tunnel
        .pending
        .insert(request_id.clone(), PendingRequest { responder });

    if tunnel.tx.send(ServerToAgent::Request(frame)).is_err() {
        tunnel.pending.remove(&request_id);
        return Err(EdgeError::AgentDisconnected);
    }

    let deadline = Duration::from_secs(state.config.request_timeout_secs);
    let response = match tokio::time::timeout(deadline, waiter).await {
        Ok(Ok(response)) => response,
        Ok(Err(_)) => return Err(EdgeError::AgentDisconnected), // tunnel closed, sender dropped
        Err(_) => {
            tunnel.pending.remove(&request_id);
            return Err(EdgeError::Timeout);
        }
    };

    let bytes_out = emitted_len(&response);
    tunnel.record_out(bytes_out);

    let http_response = build_response(response, &method, &path, &alias, port, bytes_in, &state).await;
    Ok(http_response)
}

fn flatten_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
        .collect()
}

/// Approximates the serialized size of the outgoing request's headers,
/// for the `bytes_in` field of the request-log record (spec §3).
fn serialized_header_len(headers: &HashMap<String, String>) -> u64 {
    headers
        .iter()
        .map(|(k, v)| (k.len() + v.len() + 2) as u64)
        .sum()
}

/// Parses a non-multipart body per spec §4.4 step 3: a parsed form, a
/// parsed JSON document, or raw bytes represented via the binary envelope.
fn parse_body(content_type: &str, bytes: &Bytes) -> serde_json::Value {
    if bytes.is_empty() {
        return serde_json::Value::Null;
    }
    if content_type.starts_with("application/x-www-form-urlencoded") {
        let pairs: HashMap<String, String> = url::form_urlencoded::parse(bytes)
            .into_owned()
            .collect();
        return serde_json::to_value(pairs).unwrap_or(serde_json::Value::Null);
    }
    if content_type.starts_with("application/json") {
        if let Ok(v) = serde_json::from_slice(bytes) {
            return v;
        }
    }
    if let Ok(text) = std::str::from_utf8(bytes) {
        return serde_json::Value::String(text.to_string());
    }
    tunnel_protocol::encode_binary(bytes)
}

/// Reconstructs `(body, files)` from an incoming multipart request so
/// the agent can rebuild the exact same multipart shape against the
/// local origin (spec §4.4 step 3's `files` description).
async fn read_multipart(req: Request<Body>) -> Result<(serde_json::Value, Vec<UploadedFile>), EdgeError> {
    let mut multipart = Multipart::from_request(req, &())
        .await
        .map_err(|_| EdgeError::Internal)?;

    let mut fields = serde_json::Map::new();
    let mut files = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|_| EdgeError::Internal)? {
        let name = field.name().unwrap_or("").to_string();
        let filename = field.file_name().map(str::to_string);
        let mime = field.content_type().unwrap_or("application/octet-stream").to_string();
        let data = field.bytes().await.map_err(|_| EdgeError::Internal)?;

        match filename {
            Some(filename) => {
                use base64::{engine::general_purpose::STANDARD, Engine as _};
                files.push(UploadedFile {
                    field: name,
                    filename,
                    mime,
                    data: STANDARD.encode(&data),
                });
            }
            None => {
                let value = std::str::from_utf8(&data).unwrap_or("").to_string();
                fields.insert(name, serde_json::Value::String(value));
            }
        }
    }

    Ok((serde_json::Value::Object(fields), files))
}

fn emitted_len(response: &ResponseFrame) -> u64 {
    match &response.body {
        serde_json::Value::String(s) => s.len() as u64,
        other => other.to_string().len() as u64,
    }
}

/// Builds the public HTTP response from an agent's response frame
/// (spec §4.4 step 5) and writes the best-effort request log row
/// (step 6).
async fn build_response(
    response: ResponseFrame,
    method: &str,
    path: &str,
    alias: &str,
    port: u16,
    bytes_in: u64,
    state: &AppState,
) -> Response {
    let status = response.status.unwrap_or(200);
    let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);

    let content_type = response
        .headers
        .get("content-type")
        .cloned()
        .unwrap_or_else(|| "application/json".to_string());

    let body = if let Some(bytes) = tunnel_protocol::decode_binary(&response.body) {
        axum::body::Bytes::from(bytes)
    } else if content_type.contains("application/json") {
        axum::body::Bytes::from(serde_json::to_vec(&response.body).unwrap_or_default())
    } else {
        let text = match &response.body {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        axum::body::Bytes::from(text.into_bytes())
    };

    let bytes_out = body.len() as u64;

    let record = RequestLogRecord {
        alias: alias.to_string(),
        port,
        method: method.to_string(),
        path: path.to_string(),
        status_code: status,
        bytes_in,
        bytes_out,
        created_at: chrono::Utc::now(),
    };
    if let Err(e) = state.store.log_request(record).await {
        warn!(error = %e, "failed to log request, continuing anyway");
    }

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, content_type)],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_alias_prefers_custom_domain_exact_match() {
        let mut custom = HashMap::new();
        custom.insert("api.example.com".to_string(), "client-aaa".to_string());
        assert_eq!(
            resolve_alias("api.example.com", &custom),
            Some("client-aaa".to_string())
        );
    }

    #[test]
    fn resolve_alias_falls_back_to_first_subdomain_label() {
        let custom = HashMap::new();
        assert_eq!(
            resolve_alias("client-aaa.tunnel.example.com", &custom),
            Some("client-aaa".to_string())
        );
    }

    #[test]
    fn parse_body_reads_json_document() {
        let body = parse_body("application/json", &Bytes::from_static(br#"{"a":1}"#));
        assert_eq!(body, serde_json::json!({"a": 1}));
    }

    #[test]
    fn parse_body_falls_back_to_string_for_unknown_content_type() {
        let body = parse_body("text/plain", &Bytes::from_static(b"hello"));
        assert_eq!(body, serde_json::Value::String("hello".to_string()));
    }

    #[test]
    fn parse_body_wraps_non_utf8_bytes_as_binary_envelope() {
        let raw = Bytes::from_static(&[0xff, 0xfe, 0x00, 0x10]);
        let body = parse_body("application/octet-stream", &raw);
        assert!(tunnel_protocol::decode_binary(&body).is_some());
    }

    #[test]
    fn emitted_len_measures_the_response_body_not_the_request() {
        let short = ResponseFrame {
            id: "r1".into(),
            status: Some(200),
            headers: HashMap::new(),
            body: serde_json::Value::String("pong".into()),
        };
        let long = ResponseFrame {
            id: "r2".into(),
            status: Some(200),
            headers: HashMap::new(),
            body: serde_json::json!({"a": "much longer payload than pong"}),
        };
        assert_eq!(emitted_len(&short), 4);
        assert!(emitted_len(&long) > emitted_len(&short));
    }

    #[test]
    fn serialized_header_len_sums_key_and_value_bytes() {
        let mut headers = HashMap::new();
        headers.insert("host".to_string(), "client-aaa.example.com".to_string());
        // "host" (4) + value (22) + 2 separator bytes per entry.
        assert_eq!(serialized_header_len(&headers), 4 + 22 + 2);
    }
}
