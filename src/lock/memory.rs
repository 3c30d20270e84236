use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::store::{LockRecord, LockStore};
use crate::clock::{chrono_duration, Clock, SystemClock};
use crate::error::{Error, Result};

/// Process-local lock store
///
/// Clones share the same records, so several simulated nodes can contend on one
/// store. Expiry is read from the injected [`Clock`]. Outages and latency can be
/// injected to exercise store-failure paths.
#[derive(Clone)]
pub struct InMemoryLockStore {
    inner: Arc<Inner>,
}

struct Inner {
    records: Mutex<HashMap<String, LockRecord>>,
    clock: Arc<dyn Clock>,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
    acquisitions: AtomicU64,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                records: Mutex::new(HashMap::new()),
                clock,
                unavailable: AtomicBool::new(false),
                latency_ms: AtomicU64::new(0),
                acquisitions: AtomicU64::new(0),
            }),
        }
    }

    /// Make every call fail with `StoreUnavailable` until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of successful acquisitions since creation
    pub fn acquisitions(&self) -> u64 {
        self.inner.acquisitions.load(Ordering::SeqCst)
    }

    async fn round_trip(&self) -> Result<()> {
        let latency = self.inner.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("in-memory lock store offline".to_string()));
        }
        Ok(())
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, LockRecord>> {
        self.inner
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for InMemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        self.round_trip().await?;
        let now = self.inner.clock.now();
        let mut records = self.records();

        if let Some(existing) = records.get(name) {
            if !existing.is_expired(now) {
                return Ok(false);
            }
        }

        records.insert(
            name.to_string(),
            LockRecord {
                name: name.to_string(),
                holder: holder.to_string(),
                acquired_at: now,
                expires_at: now + chrono_duration(ttl),
            },
        );
        self.inner.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn release(&self, name: &str, holder: &str) -> Result<bool> {
        self.round_trip().await?;
        let mut records = self.records();
        match records.get(name) {
            Some(existing) if existing.holder == holder => {
                records.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        self.round_trip().await?;
        let now = self.inner.clock.now();
        let mut records = self.records();
        match records.get_mut(name) {
            Some(existing) if existing.holder == holder && !existing.is_expired(now) => {
                existing.expires_at = now + chrono_duration(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, name: &str) -> Result<Option<LockRecord>> {
        self.round_trip().await?;
        let now = self.inner.clock.now();
        Ok(self
            .records()
            .get(name)
            .filter(|record| !record.is_expired(now))
            .cloned())
    }

    async fn purge_expired(&self) -> Result<u64> {
        self.round_trip().await?;
        let now = self.inner.clock.now();
        let mut records = self.records();
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        Ok((before - records.len()) as u64)
    }
}
