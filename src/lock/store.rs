use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;

/// A held lock as the store sees it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, sqlx::FromRow)]
pub struct LockRecord {
    pub name: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Atomic backing store for named TTL locks
///
/// Implementations must make `try_acquire` a single set-if-absent step: an
/// expired record counts as absent, an unexpired one is never overwritten.
#[async_trait]
pub trait LockStore: Send + Sync {
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Delete the record only if `holder` still owns it
    async fn release(&self, name: &str, holder: &str) -> Result<bool>;

    /// Push the expiry out to `now + ttl` only if `holder` still owns an unexpired record
    async fn extend(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// The unexpired record for `name`, if any
    async fn get(&self, name: &str) -> Result<Option<LockRecord>>;

    async fn purge_expired(&self) -> Result<u64>;
}
