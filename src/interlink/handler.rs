use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::event::{Fingerprinter, InterlinkEvent};
use super::flagger::EventFlagger;
use super::transport::InterlinkTransport;
use crate::engine::{ControlOutcome, Engine};
use crate::error::{Error, Result};

/// What happened to one delivered event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    Applied,
    /// Owned here, but the execution was already in the requested state
    Unchanged,
    NotOwner,
    Duplicate,
    Stale,
    /// The engine refused the operation (invalid for the current state, unknown target)
    Rejected,
    Malformed,
    FlaggerUnavailable,
    /// Lock or store failures outlasted the local retries
    Failed,
}

#[derive(Debug, Default)]
pub struct InterlinkStats {
    received: AtomicU64,
    applied: AtomicU64,
    unchanged: AtomicU64,
    not_owner: AtomicU64,
    duplicates: AtomicU64,
    stale: AtomicU64,
    rejected: AtomicU64,
    malformed: AtomicU64,
    flagger_errors: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterlinkStatsSnapshot {
    pub received: u64,
    pub applied: u64,
    pub unchanged: u64,
    pub not_owner: u64,
    pub duplicates: u64,
    pub stale: u64,
    pub rejected: u64,
    pub malformed: u64,
    pub flagger_errors: u64,
    pub failed: u64,
}

impl InterlinkStats {
    fn record(&self, outcome: HandleOutcome) {
        let counter = match outcome {
            HandleOutcome::Applied => &self.applied,
            HandleOutcome::Unchanged => &self.unchanged,
            HandleOutcome::NotOwner => &self.not_owner,
            HandleOutcome::Duplicate => &self.duplicates,
            HandleOutcome::Stale => &self.stale,
            HandleOutcome::Rejected => &self.rejected,
            HandleOutcome::Malformed => &self.malformed,
            HandleOutcome::FlaggerUnavailable => &self.flagger_errors,
            HandleOutcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> InterlinkStatsSnapshot {
        InterlinkStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            not_owner: self.not_owner.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            flagger_errors: self.flagger_errors.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Consumes interlink events on every node and applies those this node owns
pub struct InterlinkMessageHandler {
    engine: Arc<Engine>,
    flagger: Arc<dyn EventFlagger>,
    fingerprinter: Arc<dyn Fingerprinter>,
    max_apply_attempts: u32,
    retry_delay: Duration,
    stats: InterlinkStats,
}

impl InterlinkMessageHandler {
    pub fn new(
        engine: Arc<Engine>,
        flagger: Arc<dyn EventFlagger>,
        fingerprinter: Arc<dyn Fingerprinter>,
        max_apply_attempts: u32,
    ) -> Self {
        Self {
            engine,
            flagger,
            fingerprinter,
            max_apply_attempts: max_apply_attempts.max(1),
            retry_delay: Duration::from_millis(100),
            stats: InterlinkStats::default(),
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn stats(&self) -> InterlinkStatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn handle(&self, event: &InterlinkEvent) -> HandleOutcome {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let outcome = self.process(event).await;
        self.stats.record(outcome);
        outcome
    }

    async fn process(&self, event: &InterlinkEvent) -> HandleOutcome {
        let Some(partition) = event.partition.as_deref() else {
            warn!(execution_id = %event.execution_id, "Interlink event without a partition dropped");
            return HandleOutcome::Malformed;
        };
        if !self.engine.repository().handles_partition(partition) {
            return HandleOutcome::NotOwner;
        }

        let expected = self.fingerprinter.fingerprint(event);
        if expected != event.fingerprint {
            warn!(
                execution_id = %event.execution_id,
                carried = %event.fingerprint,
                expected = %expected,
                "Interlink event fingerprint mismatch"
            );
            return HandleOutcome::Malformed;
        }

        for attempt in 1..=self.max_apply_attempts {
            match self.flagger.check_and_flag(&event.fingerprint).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(execution_id = %event.execution_id, kind = event.kind.tag(), "Duplicate interlink event suppressed");
                    return HandleOutcome::Duplicate;
                }
                Err(e) => {
                    error!(
                        execution_id = %event.execution_id,
                        kind = event.kind.tag(),
                        error = %e,
                        "Event flagger unavailable; dropping event"
                    );
                    return HandleOutcome::FlaggerUnavailable;
                }
            }

            match self.engine.apply_event(event).await {
                Ok(ControlOutcome::Unchanged) => return HandleOutcome::Unchanged,
                Ok(_) => return HandleOutcome::Applied,
                Err(Error::StaleEvent { reason, .. }) => {
                    info!(execution_id = %event.execution_id, kind = event.kind.tag(), reason = %reason, "Stale interlink event dropped");
                    return HandleOutcome::Stale;
                }
                Err(Error::ForeignExecution { .. }) => {
                    self.unflag(event).await;
                    return HandleOutcome::NotOwner;
                }
                Err(e) if e.is_retryable() => {
                    self.unflag(event).await;
                    if attempt == self.max_apply_attempts {
                        error!(
                            execution_id = %event.execution_id,
                            kind = event.kind.tag(),
                            attempts = attempt,
                            error = %e,
                            "Giving up on interlink event"
                        );
                        return HandleOutcome::Failed;
                    }
                    warn!(execution_id = %event.execution_id, attempt, error = %e, "Retrying interlink event");
                    tokio::time::sleep(self.retry_delay * attempt).await;
                }
                Err(e) => {
                    warn!(execution_id = %event.execution_id, kind = event.kind.tag(), error = %e, "Interlink event rejected");
                    return HandleOutcome::Rejected;
                }
            }
        }

        HandleOutcome::Failed
    }

    async fn unflag(&self, event: &InterlinkEvent) {
        if let Err(e) = self.flagger.unflag(&event.fingerprint).await {
            warn!(execution_id = %event.execution_id, error = %e, "Failed to unflag interlink event");
        }
    }

    /// Subscribe and handle events until `shutdown` fires
    pub async fn run(
        self: Arc<Self>,
        transport: Arc<dyn InterlinkTransport>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut events = transport.subscribe().await?;
        info!(partition = ?self.engine.repository().partition(), "Interlink consumer started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = events.recv() => {
                    let Some(event) = received else {
                        warn!("Interlink subscription closed");
                        break;
                    };
                    let handler = self.clone();
                    tokio::spawn(async move {
                        handler.handle(&event).await;
                    });
                }
            }
        }

        info!(stats = ?self.stats(), "Interlink consumer stopped");
        Ok(())
    }
}
