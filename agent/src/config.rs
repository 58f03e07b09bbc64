//! # Agent Configuration
//!
//! Environment-derived configuration, loaded the same way the server
//! loads its own (optional `.env` file, then `env::var`). There is no
//! CLI flag parser — see spec §1.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Websocket URL of the edge server's tunnel endpoint, e.g.
    /// `wss://tunnel.example.com/tunnel`.
    pub server_url: String,

    /// Optional user token; when absent the agent registers anonymously.
    pub user_token: Option<String>,

    /// Loopback port the local origin server is bound to.
    pub local_port: u16,

    pub keepalive: Duration,
    pub reconnect_delay: Duration,
    pub anon_session_timeout: Duration,
    pub local_request_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value:?} ({source})")]
    Invalid {
        name: &'static str,
        value: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let server_url = env::var("TUNNEL_SERVER_URL")
            .unwrap_or_else(|_| "ws://localhost:7070/tunnel".to_string());
        let user_token = env::var("TUNNEL_USER_TOKEN").ok();

        let local_port_raw = env::var("TUNNEL_LOCAL_PORT")
            .map_err(|_| ConfigError::Missing("TUNNEL_LOCAL_PORT"))?;
        let local_port: u16 = local_port_raw.parse().map_err(|e| ConfigError::Invalid {
            name: "TUNNEL_LOCAL_PORT",
            value: local_port_raw,
            source: Box::new(e),
        })?;

        Ok(Config {
            server_url,
            user_token,
            local_port,
            keepalive: Duration::from_secs(env_secs("TUNNEL_KEEPALIVE_SECS", 20)?),
            reconnect_delay: Duration::from_secs(env_secs("TUNNEL_RECONNECT_SECS", 5)?),
            anon_session_timeout: Duration::from_secs(env_secs("TUNNEL_ANON_SESSION_SECS", 3600)?),
            local_request_timeout: Duration::from_secs(env_secs("TUNNEL_LOCAL_TIMEOUT_SECS", 30)?),
        })
    }
}

fn env_secs(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|e| ConfigError::Invalid {
            name: key,
            value: raw,
            source: Box::new(e),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_secs_falls_back_to_default_when_unset() {
        assert_eq!(env_secs("TUNNEL_DEFINITELY_UNSET_VAR", 42).unwrap(), 42);
    }
}
