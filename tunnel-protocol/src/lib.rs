//! # Tunnel Wire Protocol
//!
//! Defines the JSON frame types exchanged between the edge server and a
//! connected agent over the control channel, plus the small set of
//! content-type rules both sides use to decide when a response body
//! must travel as a base64 binary envelope instead of inline text/JSON.
//!
//! Unlike a single internally-tagged enum, the wire mixes tagged control
//! frames (`{"type": "...", ...}`) with untagged data frames (request and
//! response frames carry no `"type"` field at all — they are identified
//! by the presence of `id`). [`ServerToAgent`] and [`AgentToServer`] model
//! this with `#[serde(untagged)]` wrappers around a tagged control enum.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ─── Registration ────────────────────────────────────────────────

/// Marker type so `RegisterFrame` can require a literal `"type": "register"`
/// key without folding registration into the same tagged enum as the
/// other control frames (which would force `user`/`port` to be required
/// on every control variant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterTag {
    #[serde(rename = "register")]
    Register,
}

/// Sent by an agent to request registration.
///
/// The source ships two shapes for this frame: a stricter one carrying
/// `user` and `port`, and a simpler anonymous one with neither field set.
/// Both are accepted here — `user`/`port` are optional and default to
/// `None`, so a bare `{"type":"register"}` parses just as well as the
/// fully-populated form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterFrame {
    #[serde(rename = "type")]
    pub kind: RegisterTag,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl RegisterFrame {
    pub fn new(user: Option<String>, port: Option<u16>) -> Self {
        Self {
            kind: RegisterTag::Register,
            user,
            port,
        }
    }
}

// ─── Control frames (server → agent) ─────────────────────────────

/// Tagged control messages sent from the server down to an agent.
/// Request frames are *not* part of this enum — see [`ServerToAgent`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Registration succeeded; the agent is now live under `alias`.
    Registered { uuid: String, alias: String },
    /// Registration failed; the connection is closed immediately after.
    Error { message: String },
}

/// A file part of a `multipart/form-data` request, reconstructed by the
/// agent before re-issuing the request against the local origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedFile {
    pub field: String,
    pub filename: String,
    pub mime: String,
    /// Base64-encoded file contents.
    pub data: String,
}

/// A request frame forwarded from the edge dispatcher to an agent.
///
/// `body` is a loosely-typed JSON value: an object for a parsed form or
/// JSON document, a string for raw text, or the binary envelope object
/// (see [`encode_binary`]) for raw bytes. `files` is only non-empty for
/// `multipart/form-data` requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: serde_json::Value,
    #[serde(default)]
    pub files: Vec<UploadedFile>,
}

/// Anything the server can send down the control channel to an agent:
/// either a tagged control frame, or an untagged request frame.
///
/// Declaration order matters for `#[serde(untagged)]`: `Control` is
/// tried first since its variants require a `"type"` key that a request
/// frame never carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerToAgent {
    Control(ControlFrame),
    Request(RequestFrame),
}

// ─── Data frames (agent → server) ────────────────────────────────

/// A response frame sent back by an agent after re-issuing a request
/// against its local origin. `status` defaults to 200 when absent, per
/// spec. `body` follows the same JSON/string/binary-envelope shape as
/// [`RequestFrame::body`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: serde_json::Value,
}

/// Anything an agent can send up the control channel: a registration
/// request, or a response to a previously-dispatched request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AgentToServer {
    Register(RegisterFrame),
    Response(ResponseFrame),
}

// ─── Dashboard observer frames ────────────────────────────────────

/// Sent from the server to a connected dashboard observer: the current
/// set of live public URLs, grouped by owning user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverFrame {
    ActiveUrls { data: HashMap<String, Vec<String>> },
}

// ─── Binary envelope ──────────────────────────────────────────────

/// Tag value used by the binary envelope object: `{"type":"binary","data":"<base64>"}`.
pub const BINARY_ENVELOPE_TYPE: &str = "binary";

/// Content-type prefixes and exact substrings the agent uses to decide
/// whether a local origin's response should travel as a binary envelope
/// rather than inline JSON/text. The dispatcher never re-classifies —
/// it trusts whichever shape the agent chose.
pub const BINARY_PREFIXES: &[&str] = &["image/", "video/", "audio/"];
pub const BINARY_SUBSTRINGS: &[&str] = &["application/octet-stream", "application/pdf"];

/// True if `content_type` should be sent as a binary envelope rather
/// than text/JSON, per spec.md §4.4/§4.5's classification rules.
pub fn is_binary_content_type(content_type: &str) -> bool {
    let lower = content_type.to_ascii_lowercase();
    BINARY_PREFIXES.iter().any(|p| lower.starts_with(p))
        || BINARY_SUBSTRINGS.iter().any(|s| lower.contains(s))
}

/// Encode raw bytes into the tagged binary envelope JSON value.
pub fn encode_binary(bytes: &[u8]) -> serde_json::Value {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    serde_json::json!({
        "type": BINARY_ENVELOPE_TYPE,
        "data": STANDARD.encode(bytes),
    })
}

/// If `value` is a binary envelope object, decode and return its bytes.
pub fn decode_binary(value: &serde_json::Value) -> Option<Vec<u8>> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    let obj = value.as_object()?;
    if obj.get("type")?.as_str()? != BINARY_ENVELOPE_TYPE {
        return None;
    }
    let data = obj.get("data")?.as_str()?;
    STANDARD.decode(data).ok()
}
