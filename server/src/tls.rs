//! # TLS Termination
//!
//! Loads the cert/key pair named by [`crate::config::Config`] into an
//! `axum-server` rustls config, shared by all three listeners when TLS
//! is enabled. Grounded in the same PEM-loading shape the pack's own
//! TLS-terminating proxy uses, adapted to hand the result to axum
//! instead of a bare `tokio_rustls::TlsAcceptor`.

use crate::config::Config;
use axum_server::tls_rustls::RustlsConfig;

/// Loads the configured cert/key pair. Only called when
/// [`Config::tls_enabled`] is true, so both paths are guaranteed `Some`.
pub async fn load(config: &Config) -> Result<RustlsConfig, std::io::Error> {
    let cert_path = config
        .tls_cert_path
        .as_deref()
        .expect("tls_enabled() guarantees tls_cert_path is set");
    let key_path = config
        .tls_key_path
        .as_deref()
        .expect("tls_enabled() guarantees tls_key_path is set");
    RustlsConfig::from_pem_file(cert_path, key_path).await
}
