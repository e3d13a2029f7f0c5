use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use tracing::debug;

use crate::db::interval_secs;
use crate::error::LockError;

/// Result of lock operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockResult {
    Acquired,
    AlreadyHeld(String), // current owner
    Released,
    NotFound,
}

/// Expiring mutual-exclusion locks shared between pipeline processes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LockClient: Send + Sync {
    /// Take `key` for `owner` if it is free or its previous holder's lock expired.
    async fn acquire(&self, key: &str, owner: &str, expiry: Duration) -> Result<LockResult, LockError>;

    /// Release `key` if it is held by `owner`.
    async fn release(&self, key: &str, owner: &str) -> Result<LockResult, LockError>;
}

pub struct PgLockClient {
    pool: Arc<PgPool>,
}

impl PgLockClient {
    pub fn new(pool: Arc<PgPool>) -> Self {
        PgLockClient { pool }
    }
}

#[async_trait]
impl LockClient for PgLockClient {
    async fn acquire(&self, key: &str, owner: &str, expiry: Duration) -> Result<LockResult, LockError> {
        let acquired: Option<String> = sqlx::query_scalar(
            "INSERT INTO finalization_locks (key, owner, expires_at) \
            VALUES ($1, $2, now() + make_interval(secs => $3)) \
            ON CONFLICT (key) DO UPDATE \
                SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at \
                WHERE finalization_locks.expires_at < now() \
            RETURNING owner",
        )
        .bind(key)
        .bind(owner)
        .bind(interval_secs(expiry))
        .fetch_optional(&*self.pool)
        .await?;

        if acquired.is_some() {
            debug!(message = "Lock acquired", key, owner);
            return Ok(LockResult::Acquired);
        }

        let holder: Option<String> = sqlx::query_scalar("SELECT owner FROM finalization_locks WHERE key = $1")
            .bind(key)
            .fetch_optional(&*self.pool)
            .await?;

        // The holder may have released between the two statements.
        Ok(LockResult::AlreadyHeld(holder.unwrap_or_default()))
    }

    async fn release(&self, key: &str, owner: &str) -> Result<LockResult, LockError> {
        let result = sqlx::query("DELETE FROM finalization_locks WHERE key = $1 AND owner = $2")
            .bind(key)
            .bind(owner)
            .execute(&*self.pool)
            .await?;

        if result.rows_affected() == 1 {
            Ok(LockResult::Released)
        } else {
            Ok(LockResult::NotFound)
        }
    }
}
