//! Cluster-wide leader lock for periodic work
//!
//! Every node runs the same pollers; whichever node takes the notification
//! lock for a poll name does the work for that window. The lock is left to
//! expire rather than released, so the other nodes stay out until the window
//! ends even if the winner finishes early.

use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::primitive::DistributedLock;
use crate::error::Result;

#[derive(Clone)]
pub struct NotificationClusterLock {
    lock: DistributedLock,
    node_id: String,
    enabled: bool,
}

impl NotificationClusterLock {
    pub fn new(lock: DistributedLock, node_id: impl Into<String>, enabled: bool) -> Self {
        Self {
            lock,
            node_id: node_id.into(),
            enabled,
        }
    }

    pub fn lock_name(poll_name: &str) -> String {
        format!("notification:{}", poll_name)
    }

    /// One attempt at leadership of `poll_name` for `lock_timeout_seconds`
    ///
    /// Always `true` when cluster locking is disabled (single-node deployments).
    pub async fn try_acquire_lock(&self, poll_name: &str, lock_timeout_seconds: u64) -> Result<bool> {
        if !self.enabled {
            return Ok(true);
        }

        let token = DistributedLock::new_token(&self.node_id);
        let acquired = self
            .lock
            .acquire(
                &Self::lock_name(poll_name),
                &token,
                Duration::from_secs(lock_timeout_seconds),
            )
            .await?;

        if acquired {
            debug!(poll = poll_name, node = %self.node_id, "Won notification lock");
        }
        Ok(acquired)
    }
}

/// Runs a job at most once per interval across the cluster
pub struct LeaderPoller {
    cluster_lock: NotificationClusterLock,
    poll_name: String,
    interval: Duration,
    lock_timeout_seconds: u64,
}

impl LeaderPoller {
    pub fn new(
        cluster_lock: NotificationClusterLock,
        poll_name: impl Into<String>,
        interval: Duration,
        lock_timeout_seconds: u64,
    ) -> Self {
        Self {
            cluster_lock,
            poll_name: poll_name.into(),
            interval,
            lock_timeout_seconds,
        }
    }

    /// Run `job` if this node wins the current window; returns whether it ran
    pub async fn poll_once<F, Fut>(&self, job: &mut F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        match self
            .cluster_lock
            .try_acquire_lock(&self.poll_name, self.lock_timeout_seconds)
            .await
        {
            Ok(true) => {
                if let Err(e) = job().await {
                    warn!(poll = %self.poll_name, error = %e, "Leader job failed");
                }
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(poll = %self.poll_name, error = %e, "Could not reach lock store; skipping window");
                false
            }
        }
    }

    pub async fn run<F, Fut>(self, shutdown: CancellationToken, mut job: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        info!(poll = %self.poll_name, interval_ms = self.interval.as_millis() as u64, "Leader poller started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll_once(&mut job).await;
                }
            }
        }

        info!(poll = %self.poll_name, "Leader poller stopped");
    }
}
