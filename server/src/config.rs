//! # Server Configuration
//!
//! Loads runtime configuration from environment variables (optionally
//! pre-populated from a `.env` file). There is no CLI flag parser here —
//! argument parsing is an external collaborator, not part of the core
//! (see spec §1) — but every knob spec §6 names is still configurable.
//!
//! Missing required configuration (the storage password, chiefly) is a
//! fatal startup error: the process exits non-zero before binding any
//! listener, per spec §6's exit code policy.

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base domain used to format public tunnel URLs, e.g. `tunnel.example.com`.
    pub base_domain: String,

    /// Bind address for the public HTTPS/HTTP listener (edge dispatcher).
    pub http_addr: SocketAddr,

    /// Bind address for the agent control-channel listener.
    pub tunnel_addr: SocketAddr,

    /// Bind address for the dashboard observer listener.
    pub observer_addr: SocketAddr,

    /// Optional TLS certificate/key paths. When both are set, all three
    /// listeners terminate TLS directly instead of relying on an
    /// upstream reverse proxy.
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,

    /// Postgres connection string, e.g. `postgres://user@host/db`.
    /// The password is supplied separately (required) and appended.
    pub database_url: String,
    pub database_password: String,

    /// Per-user quota of persisted aliases.
    pub max_aliases_per_user: u32,

    /// Exact host → alias overrides, bypassing subdomain parsing.
    pub custom_domains: HashMap<String, String>,

    /// Dispatcher-side deadline for a dispatched request awaiting a response.
    pub request_timeout_secs: u64,
}

/// Errors that prevent the server from starting at all.
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
    /// Loads configuration from the process environment, falling back
    /// to a `.env` file in the working directory if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let base_domain = env_or("TUNNEL_BASE_DOMAIN", "localhost");
        let http_addr = env_addr("TUNNEL_HTTP_ADDR", "0.0.0.0:8080")?;
        let tunnel_addr = env_addr("TUNNEL_TUNNEL_ADDR", "0.0.0.0:7070")?;
        let observer_addr = env_addr("TUNNEL_OBSERVER_ADDR", "0.0.0.0:7071")?;

        let tls_cert_path = env::var("TUNNEL_TLS_CERT").ok();
        let tls_key_path = env::var("TUNNEL_TLS_KEY").ok();

        let database_url = env_or("TUNNEL_DATABASE_URL", "postgres://localhost/tunnel");
        let database_password = env::var("TUNNEL_DATABASE_PASSWORD")
            .map_err(|_| ConfigError::Missing("TUNNEL_DATABASE_PASSWORD"))?;

        let max_aliases_per_user = env_parsed("TUNNEL_MAX_ALIASES_PER_USER", 5u32)?;
        let request_timeout_secs = env_parsed("TUNNEL_REQUEST_TIMEOUT_SECS", 60u64)?;

        let custom_domains = env::var("TUNNEL_CUSTOM_DOMAINS")
            .ok()
            .map(parse_custom_domains)
            .unwrap_or_default();

        Ok(Config {
            base_domain,
            http_addr,
            tunnel_addr,
            observer_addr,
            tls_cert_path,
            tls_key_path,
            database_url,
            database_password,
            max_aliases_per_user,
            custom_domains,
            request_timeout_secs,
        })
    }

    /// True when both TLS cert and key paths are configured.
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert_path.is_some() && self.tls_key_path.is_some()
    }

    /// The full Postgres connection string with the required password folded in.
    pub fn database_dsn(&self) -> String {
        if self.database_url.contains('@') || self.database_password.is_empty() {
            self.database_url.clone()
        } else if let Some(rest) = self.database_url.strip_prefix("postgres://") {
            format!("postgres://{}@{}", self.database_password, rest)
        } else {
            self.database_url.clone()
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_addr(key: &str, default: &str) -> Result<SocketAddr, ConfigError> {
    let raw = env_or(key, default);
    raw.parse().map_err(|e| ConfigError::Invalid {
        name: Box::leak(key.to_string().into_boxed_str()),
        value: raw,
        source: Box::new(e),
    })
}

fn env_parsed<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|e| ConfigError::Invalid {
            name: key,
            value: raw,
            source: Box::new(e),
        }),
        Err(_) => Ok(default),
    }
}

/// Parses `host=alias,host=alias` into a lookup map.
fn parse_custom_domains(raw: String) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(host, alias)| (host.trim().to_string(), alias.trim().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_custom_domain_list() {
        let map = parse_custom_domains("a.example.com=client-aaa,b.example.com=client-bbb".into());
        assert_eq!(map.get("a.example.com").map(String::as_str), Some("client-aaa"));
        assert_eq!(map.get("b.example.com").map(String::as_str), Some("client-bbb"));
    }

    #[test]
    fn database_dsn_folds_in_password() {
        let cfg = Config {
            base_domain: "x".into(),
            http_addr: "0.0.0.0:8080".parse().unwrap(),
            tunnel_addr: "0.0.0.0:7070".parse().unwrap(),
            observer_addr: "0.0.0.0:7071".parse().unwrap(),
            tls_cert_path: None,
            tls_key_path: None,
            database_url: "postgres://db.internal/tunnel".into(),
            database_password: "hunter2".into(),
            max_aliases_per_user: 5,
            custom_domains: HashMap::new(),
            request_timeout_secs: 60,
        };
        assert_eq!(cfg.database_dsn(), "postgres://hunter2@db.internal/tunnel");
    }
}
