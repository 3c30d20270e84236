use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, warn};

use super::primitive::DistributedLock;
use crate::error::{Error, Result};

/// Heartbeats give up after this many consecutive store failures
const MAX_HEARTBEAT_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    None,
    Fixed(Duration),
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    /// Delay to sleep after the `failed_attempts`-th failed attempt (1-based)
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial, max } => {
                let shift = failed_attempts.saturating_sub(1).min(20);
                initial.saturating_mul(1u32 << shift).min(max)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockOptions {
    pub name: String,
    /// Extra attempts after the first; 0 means a single attempt
    pub max_retries: u32,
    pub backoff: Backoff,
    pub ttl: Duration,
    /// Overrides `max_retries` with a single attempt
    pub fail_fast: bool,
    /// Extend the TTL at this interval while the action runs
    pub heartbeat: Option<Duration>,
    /// Heartbeats stop once the lock has been held this long
    pub max_duration: Option<Duration>,
}

impl LockOptions {
    pub fn new(name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            max_retries: 0,
            backoff: Backoff::None,
            ttl,
            fail_fast: false,
            heartbeat: None,
            max_duration: None,
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn heartbeat(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat = interval;
        self
    }

    pub fn max_duration(mut self, max_duration: Option<Duration>) -> Self {
        self.max_duration = max_duration;
        self
    }

    pub fn attempts(&self) -> u32 {
        if self.fail_fast {
            1
        } else {
            self.max_retries.saturating_add(1)
        }
    }
}

/// Runs actions while holding a [`DistributedLock`], retrying acquisition
#[derive(Clone)]
pub struct RetriableLock {
    lock: DistributedLock,
    holder_prefix: String,
}

impl RetriableLock {
    pub fn new(lock: DistributedLock, holder_prefix: impl Into<String>) -> Self {
        Self {
            lock,
            holder_prefix: holder_prefix.into(),
        }
    }

    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    /// Acquire `options.name`, run `action`, then release
    ///
    /// Release runs whether the action succeeded or not, and the action's result
    /// is returned unchanged. If the action panics or this future is dropped
    /// while the lock is held, release is spawned onto the runtime. When every attempt meets contention the result is
    /// `FailedToAcquireLock`; when the last attempt hit a store failure that
    /// failure is returned instead.
    pub async fn run_under_lock<T, F, Fut>(&self, options: &LockOptions, action: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = options.attempts();
        let mut last_store_error = None;

        for attempt in 1..=attempts {
            let token = DistributedLock::new_token(&self.holder_prefix);

            match self.lock.acquire(&options.name, &token, options.ttl).await {
                Ok(true) => {
                    let held = HeldLock {
                        lock: self.lock.clone(),
                        name: options.name.clone(),
                        token: token.clone(),
                        released: false,
                    };
                    let heartbeat = options.heartbeat.map(|interval| {
                        self.spawn_heartbeat(&options.name, &token, options.ttl, interval, options.max_duration)
                    });

                    let result = action().await;

                    if let Some(heartbeat) = heartbeat {
                        heartbeat.stop().await;
                    }
                    held.release().await;
                    return result;
                }
                Ok(false) => {
                    debug!(lock = %options.name, attempt, attempts, "Lock contended");
                    last_store_error = None;
                }
                Err(e) => {
                    warn!(lock = %options.name, attempt, attempts, error = %e, "Lock store error during acquire");
                    last_store_error = Some(e);
                }
            }

            if attempt < attempts {
                let delay = options.backoff.delay(attempt);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(last_store_error.unwrap_or_else(|| Error::FailedToAcquireLock {
            name: options.name.clone(),
            attempts,
        }))
    }

    fn spawn_heartbeat(
        &self,
        name: &str,
        token: &str,
        ttl: Duration,
        interval: Duration,
        max_duration: Option<Duration>,
    ) -> Heartbeat {
        let cancel = CancellationToken::new();
        let lock = self.lock.clone();
        let name = name.to_string();
        let token = token.to_string();
        let stop = cancel.clone();
        let deadline = max_duration.map(|max| Instant::now() + max);

        let handle = tokio::spawn(async move {
            let mut failures = 0;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    warn!(lock = %name, "Lock reached its maximum duration; no longer extending");
                    break;
                }
                match lock.extend(&name, &token, ttl).await {
                    Ok(true) => failures = 0,
                    Ok(false) => {
                        error!(lock = %name, "Lock lost while its critical section was running");
                        break;
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(lock = %name, failures, error = %e, "Lock heartbeat failed");
                        if failures >= MAX_HEARTBEAT_FAILURES {
                            error!(lock = %name, "Giving up on lock heartbeat");
                            break;
                        }
                    }
                }
            }
        });

        Heartbeat {
            _stop: cancel.drop_guard(),
            handle,
        }
    }
}

/// Stops extending when dropped
struct Heartbeat {
    _stop: DropGuard,
    handle: tokio::task::JoinHandle<()>,
}

impl Heartbeat {
    async fn stop(self) {
        let Heartbeat { _stop: stop, handle } = self;
        drop(stop);
        let _ = handle.await;
    }
}

/// A held lock that is released even when the critical section unwinds
struct HeldLock {
    lock: DistributedLock,
    name: String,
    token: String,
    released: bool,
}

impl HeldLock {
    async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.lock.release(&self.name, &self.token).await {
            warn!(lock = %self.name, error = %e, "Failed to release lock; it will expire");
        }
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let lock = self.lock.clone();
        let name = std::mem::take(&mut self.name);
        let token = std::mem::take(&mut self.token);
        runtime.spawn(async move {
            match lock.release(&name, &token).await {
                Ok(_) => warn!(lock = %name, "Lock released after its critical section was abandoned"),
                Err(e) => warn!(lock = %name, error = %e, "Failed to release abandoned lock; it will expire"),
            }
        });
    }
}
