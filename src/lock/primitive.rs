use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::store::{LockRecord, LockStore};
use crate::error::{Error, Result};

/// Named TTL mutual exclusion over a [`LockStore`]
///
/// Contention is not an error: `acquire` returns `false`. Store failures and
/// round-trips slower than the store timeout surface as `StoreUnavailable`,
/// never as "not held".
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn LockStore>,
    store_timeout: Duration,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn LockStore>, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
        }
    }

    /// A fresh holder token, unique per acquisition attempt
    pub fn new_token(prefix: &str) -> String {
        format!("{}:{}", prefix, uuid::Uuid::new_v4())
    }

    pub async fn acquire(&self, name: &str, token: &str, ttl: Duration) -> Result<bool> {
        let acquired = self
            .bounded("acquire", name, self.store.try_acquire(name, token, ttl))
            .await?;
        debug!(lock = name, holder = token, acquired, "Lock acquire attempt");
        Ok(acquired)
    }

    pub async fn release(&self, name: &str, token: &str) -> Result<bool> {
        let released = self
            .bounded("release", name, self.store.release(name, token))
            .await?;
        if !released {
            warn!(lock = name, holder = token, "Lock was no longer held at release");
        }
        Ok(released)
    }

    pub async fn is_held(&self, name: &str) -> Result<bool> {
        Ok(self.holder(name).await?.is_some())
    }

    pub async fn extend(&self, name: &str, token: &str, ttl: Duration) -> Result<bool> {
        self.bounded("extend", name, self.store.extend(name, token, ttl))
            .await
    }

    pub async fn holder(&self, name: &str) -> Result<Option<LockRecord>> {
        self.bounded("get", name, self.store.get(name)).await
    }

    pub async fn purge_expired(&self) -> Result<u64> {
        self.bounded("purge", "*", self.store.purge_expired()).await
    }

    async fn bounded<T>(
        &self,
        op: &str,
        name: &str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::StoreUnavailable(format!(
                "lock store {} on '{}' exceeded {}ms",
                op,
                name,
                self.store_timeout.as_millis()
            ))),
        }
    }
}
