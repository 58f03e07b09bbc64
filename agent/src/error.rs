//! # Error Taxonomy
//!
//! Mirrors the half of spec §7's taxonomy the agent owns: configuration
//! errors are fatal at startup (see [`crate::config::ConfigError`]);
//! protocol errors (a malformed control frame from the server) are
//! logged and the frame ignored; origin errors (the local HTTP call
//! itself failing or the local server returning garbage) are caught and
//! turned into the synthesized 500 response spec §4.5 names, never
//! propagated up to crash the connection loop.

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("local origin call failed: {0}")]
    Origin(#[from] reqwest::Error),

    #[error("malformed frame: {0}")]
    Protocol(#[from] serde_json::Error),
}
