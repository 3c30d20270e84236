use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;

use super::store::{LockRecord, LockStore};
use crate::error::Result;

/// Lock store backed by the `locks` table
///
/// Expiry is judged by the database clock so that nodes with skewed clocks
/// still agree on who holds a lock.
#[derive(Clone)]
pub struct PgLockStore {
    pool: PgPool,
}

impl PgLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockStore for PgLockStore {
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let acquired: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO locks (name, holder, acquired_at, expires_at)
            VALUES ($1, $2, NOW(), NOW() + make_interval(secs => $3))
            ON CONFLICT (name) DO UPDATE
            SET holder = EXCLUDED.holder,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
            WHERE locks.expires_at <= NOW()
            RETURNING holder
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(acquired.is_some())
    }

    async fn release(&self, name: &str, holder: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM locks WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn extend(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE locks
            SET expires_at = NOW() + make_interval(secs => $3)
            WHERE name = $1
              AND holder = $2
              AND expires_at > NOW()
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, name: &str) -> Result<Option<LockRecord>> {
        let record = sqlx::query_as::<_, LockRecord>(
            r#"
            SELECT name, holder, acquired_at, expires_at
            FROM locks
            WHERE name = $1 AND expires_at > NOW()
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM locks WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
