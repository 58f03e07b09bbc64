//! # Persistent Store
//!
//! Abstracts the three tables spec §6 names exactly (`users`,
//! `user_aliases`, `api_requests`) behind a [`Store`] trait so the
//! alias allocator (§4.1) and request logger are testable without a
//! live Postgres instance. [`postgres::PgStore`] is the production
//! implementation; [`memory::MemoryStore`] backs unit tests.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// One row written to `api_requests` after a completed public request.
#[derive(Debug, Clone)]
pub struct RequestLogRecord {
    pub alias: String,
    pub port: u16,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage unreachable: {0}")]
    Unreachable(String),
}

/// Persistence operations the alias allocator (§4.1) and request logger
/// need. Implementations must treat every method as best-effort from
/// the request logger's perspective and required from the allocator's —
/// that policy lives in the caller, not here.
#[async_trait]
pub trait Store: Send + Sync {
    /// True iff a row exists in `users` for this token.
    async fn is_known_user(&self, user_token: &str) -> Result<bool, StoreError>;

    /// Looks up a previously persisted `(user, port) -> alias` mapping.
    async fn find_persisted_alias(
        &self,
        user_token: &str,
        port: u16,
    ) -> Result<Option<String>, StoreError>;

    /// Count of currently persisted aliases for a user (for quota checks).
    async fn persisted_alias_count(&self, user_token: &str) -> Result<u32, StoreError>;

    /// Persists a new `(user, alias, port)` row. `alias` must be globally unique.
    async fn persist_alias(
        &self,
        user_token: &str,
        alias: &str,
        port: u16,
    ) -> Result<(), StoreError>;

    /// True if `alias` has ever been persisted for any user (used by the
    /// allocator's collision check alongside the live registry).
    async fn alias_taken(&self, alias: &str) -> Result<bool, StoreError>;

    /// Appends one row to `api_requests`. Callers treat failure here as
    /// non-fatal (log and continue), per spec §4.4 step 6.
    async fn log_request(&self, record: RequestLogRecord) -> Result<(), StoreError>;
}
