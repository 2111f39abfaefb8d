//! API tokens mapping a bearer credential to an owner identity.

use crate::errors::{IngestError, IngestResult};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct TokenService {
    pub db: Arc<SqlitePool>,
}

impl TokenService {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Create and store a fresh token for `owner`.
    pub async fn issue(&self, owner: &str) -> IngestResult<String> {
        let owner = owner.trim();
        if owner.is_empty() {
            return Err(IngestError::BadRequest("owner must not be empty".into()));
        }

        let mut raw = Vec::with_capacity(32);
        raw.extend_from_slice(Uuid::new_v4().as_bytes());
        raw.extend_from_slice(Uuid::new_v4().as_bytes());
        let token = URL_SAFE_NO_PAD.encode(raw);

        sqlx::query("INSERT INTO api_tokens (token, owner, created_at) VALUES (?, ?, ?)")
            .bind(&token)
            .bind(owner)
            .bind(Utc::now())
            .execute(&*self.db)
            .await?;

        tracing::info!(owner, "issued api token");
        Ok(token)
    }

    /// Owner of `token`, or `None` if it is unknown.
    pub async fn resolve(&self, token: &str) -> IngestResult<Option<String>> {
        let owner = sqlx::query_scalar("SELECT owner FROM api_tokens WHERE token = ?")
            .bind(token)
            .fetch_optional(&*self.db)
            .await?;
        Ok(owner)
    }
}
