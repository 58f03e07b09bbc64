//! # Error Taxonomy
//!
//! Mirrors spec §7: configuration errors are fatal at startup; storage,
//! routing, protocol, origin, and lifecycle errors are handled locally
//! and never leak internal identifiers to a public client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Errors raised while serving a public edge request.
#[derive(Debug, thiserror::Error)]
pub enum EdgeError {
    #[error("no tunnel registered for this host")]
    UnknownAlias,

    #[error("tunnel is not connected")]
    AgentDisconnected,

    #[error("request timed out waiting for agent response")]
    Timeout,

    #[error("internal dispatcher error")]
    Internal,
}

impl IntoResponse for EdgeError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            EdgeError::UnknownAlias => (StatusCode::BAD_REQUEST, "Invalid URL"),
            EdgeError::AgentDisconnected => (StatusCode::SERVICE_UNAVAILABLE, "Client not connected"),
            EdgeError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "Gateway timeout"),
            EdgeError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "Internal error"),
        };
        (status, body).into_response()
    }
}

/// Errors raised while registering an agent's tunnel.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("storage unreachable")]
    StorageUnreachable,

    #[error("alias space exhausted retry budget")]
    AliasExhausted,
}

impl RegistrationError {
    /// Message sent back in the `error` control frame before closing.
    pub fn wire_message(&self) -> String {
        match self {
            RegistrationError::StorageUnreachable => "registration storage unavailable".into(),
            RegistrationError::AliasExhausted => "could not allocate a unique alias".into(),
        }
    }
}
