//! In-memory [`Store`] implementation used by unit tests so the alias
//! allocator and request logger can be exercised without a live
//! Postgres instance.

use super::{RequestLogRecord, Store, StoreError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

#[derive(Default)]
struct Inner {
    users: HashSet<String>,
    /// (user, port) -> alias
    aliases: HashMap<(String, u16), String>,
    taken: HashSet<String>,
    requests: Vec<RequestLogRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a known user so `is_known_user` returns true for it.
    pub async fn add_user(&self, user_token: &str) {
        self.inner.lock().await.users.insert(user_token.to_string());
    }

    /// Returns every row logged so far, for assertions in tests.
    pub async fn logged_requests(&self) -> Vec<RequestLogRecord> {
        self.inner.lock().await.requests.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn is_known_user(&self, user_token: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().await.users.contains(user_token))
    }

    async fn find_persisted_alias(
        &self,
        user_token: &str,
        port: u16,
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .aliases
            .get(&(user_token.to_string(), port))
            .cloned())
    }

    async fn persisted_alias_count(&self, user_token: &str) -> Result<u32, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .aliases
            .keys()
            .filter(|(u, _)| u == user_token)
            .count() as u32)
    }

    async fn persist_alias(
        &self,
        user_token: &str,
        alias: &str,
        port: u16,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .aliases
            .insert((user_token.to_string(), port), alias.to_string());
        inner.taken.insert(alias.to_string());
        Ok(())
    }

    async fn alias_taken(&self, alias: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().await.taken.contains(alias))
    }

    async fn log_request(&self, record: RequestLogRecord) -> Result<(), StoreError> {
        self.inner.lock().await.requests.push(record);
        Ok(())
    }
}
