//! Postgres-backed [`Store`]. Owns a bounded connection pool shared by
//! the alias allocator and the request logger (spec §5's "Shared
//! resources" item (c)) and bootstraps the three tables spec §6 names
//! (`users`, `user_aliases`, `api_requests`) on startup.

use super::{RequestLogRecord, Store, StoreError};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects a bounded pool and ensures the schema exists.
    pub async fn connect(dsn: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(dsn)
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id BIGSERIAL PRIMARY KEY,
                user_token TEXT NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Unreachable(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_aliases (
                id BIGSERIAL PRIMARY KEY,
                user_id BIGINT NOT NULL REFERENCES users(id),
                alias TEXT NOT NULL UNIQUE,
                port INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Unreachable(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS api_requests (
                id BIGSERIAL PRIMARY KEY,
                alias TEXT NOT NULL,
                port INTEGER NOT NULL,
                method TEXT NOT NULL,
                path TEXT NOT NULL,
                status_code INTEGER NOT NULL,
                bytes_in BIGINT NOT NULL,
                bytes_out BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Unreachable(e.to_string()))?;

        Ok(())
    }

    async fn user_id(&self, user_token: &str) -> Result<Option<i64>, StoreError> {
        sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE user_token = $1")
            .bind(user_token)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))
    }
}

#[async_trait]
impl Store for PgStore {
    async fn is_known_user(&self, user_token: &str) -> Result<bool, StoreError> {
        Ok(self.user_id(user_token).await?.is_some())
    }

    async fn find_persisted_alias(
        &self,
        user_token: &str,
        port: u16,
    ) -> Result<Option<String>, StoreError> {
        let Some(user_id) = self.user_id(user_token).await? else {
            return Ok(None);
        };
        sqlx::query_scalar::<_, String>(
            "SELECT alias FROM user_aliases WHERE user_id = $1 AND port = $2",
        )
        .bind(user_id)
        .bind(port as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Unreachable(e.to_string()))
    }

    async fn persisted_alias_count(&self, user_token: &str) -> Result<u32, StoreError> {
        let Some(user_id) = self.user_id(user_token).await? else {
            return Ok(0);
        };
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM user_aliases WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;
        Ok(count as u32)
    }

    async fn persist_alias(
        &self,
        user_token: &str,
        alias: &str,
        port: u16,
    ) -> Result<(), StoreError> {
        let user_id = match self.user_id(user_token).await? {
            Some(id) => id,
            None => sqlx::query_scalar::<_, i64>(
                "INSERT INTO users (user_token) VALUES ($1) RETURNING id",
            )
            .bind(user_token)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?,
        };

        sqlx::query("INSERT INTO user_aliases (user_id, alias, port) VALUES ($1, $2, $3)")
            .bind(user_id)
            .bind(alias)
            .bind(port as i32)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;
        Ok(())
    }

    async fn alias_taken(&self, alias: &str) -> Result<bool, StoreError> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM user_aliases WHERE alias = $1")
                .bind(alias)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::Unreachable(e.to_string()))?;
        Ok(found.is_some())
    }

    async fn log_request(&self, record: RequestLogRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO api_requests
                (alias, port, method, path, status_code, bytes_in, bytes_out, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&record.alias)
        .bind(record.port as i32)
        .bind(&record.method)
        .bind(&record.path)
        .bind(record.status_code as i32)
        .bind(record.bytes_in as i64)
        .bind(record.bytes_out as i64)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Unreachable(e.to_string()))?;
        Ok(())
    }
}
