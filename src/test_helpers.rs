//! Multi-node harness over the in-memory stores
//!
//! A [`Cluster`] owns what nodes share in production (lock store, execution
//! storage, interlink bus) plus a manual clock. Each [`Node`] gets its own
//! engine, run queue and interlink consumer serving one partition.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::mpsc;

use crate::clock::{Clock, ManualClock};
use crate::engine::state::RunKey;
use crate::engine::{Engine, EngineSettings, TaskRegistry, TaskRun};
use crate::interlink::{
    EventFlagger, HandleOutcome, InMemoryInterlink, InterlinkEvent, InterlinkMessageHandler,
    InterlinkTransport, MessageFlagger, Sha256Fingerprinter,
};
use crate::lock::{Backoff, DistributedLock, InMemoryLockStore, RetriableLock};
use crate::repository::{ExecutionRepository, InMemoryExecutionRepository};
use crate::types::Execution;

pub(crate) const SUPPRESSION_WINDOW: StdDuration = StdDuration::from_secs(60);
pub(crate) const FINGERPRINT_BUCKET: StdDuration = StdDuration::from_secs(10);

pub(crate) fn epoch() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub(crate) fn fast_settings() -> EngineSettings {
    EngineSettings {
        lock_ttl: StdDuration::from_secs(30),
        lock_max_retries: 3,
        lock_backoff: Backoff::Fixed(StdDuration::from_millis(1)),
        lock_heartbeat: None,
        lock_max_duration: None,
    }
}

pub(crate) struct Cluster {
    pub clock: ManualClock,
    pub locks: InMemoryLockStore,
    pub storage: InMemoryExecutionRepository,
    pub bus: InMemoryInterlink,
    pub registry: Arc<TaskRegistry>,
    pub fingerprinter: Arc<Sha256Fingerprinter>,
}

impl Cluster {
    pub fn new(registry: TaskRegistry) -> Self {
        let clock = ManualClock::new(epoch());
        Self {
            locks: InMemoryLockStore::with_clock(Arc::new(clock.clone())),
            clock,
            storage: InMemoryExecutionRepository::new(None),
            bus: InMemoryInterlink::new(),
            registry: Arc::new(registry),
            fingerprinter: Arc::new(Sha256Fingerprinter::new(FINGERPRINT_BUCKET)),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Store an execution directly, bypassing partition ownership
    pub async fn seed(&self, execution: &Execution) {
        self.storage.save(execution).await.unwrap();
    }

    pub async fn load(&self, execution_id: &str) -> Execution {
        self.storage.load(execution_id).await.unwrap()
    }

    pub fn retriable_lock(&self, node_id: &str) -> RetriableLock {
        let lock = DistributedLock::new(Arc::new(self.locks.clone()), StdDuration::from_secs(2));
        RetriableLock::new(lock, node_id)
    }

    /// A node serving `partition` with the default in-memory flagger
    pub async fn node(&self, partition: Option<&str>) -> Node {
        let flagger = Arc::new(MessageFlagger::new(
            Arc::new(self.clock.clone()),
            SUPPRESSION_WINDOW,
            10_000,
            1,
        ));
        self.node_with_flagger(partition, flagger).await
    }

    pub async fn node_with_flagger(
        &self,
        partition: Option<&str>,
        flagger: Arc<dyn EventFlagger>,
    ) -> Node {
        let node_id = partition.unwrap_or("all").to_string();
        let repository = Arc::new(self.storage.for_partition(partition.map(str::to_string)));
        let (sink, runs) = mpsc::unbounded_channel();

        let engine = Arc::new(
            Engine::builder(repository, self.retriable_lock(&node_id), self.registry.clone())
                .clock(Arc::new(self.clock.clone()))
                .interlink(Arc::new(self.bus.clone()), self.fingerprinter.clone())
                .settings(fast_settings())
                .run_sink(sink)
                .build(),
        );
        let handler = Arc::new(
            InterlinkMessageHandler::new(engine.clone(), flagger, self.fingerprinter.clone(), 3)
                .with_retry_delay(StdDuration::from_millis(1)),
        );
        let events = self.bus.subscribe().await.unwrap();

        Node {
            engine,
            handler,
            clock: self.clock.clone(),
            runs,
            events,
            pending: HashMap::new(),
            invoked: Vec::new(),
        }
    }
}

pub(crate) struct Node {
    pub engine: Arc<Engine>,
    pub handler: Arc<InterlinkMessageHandler>,
    clock: ManualClock,
    runs: mpsc::UnboundedReceiver<TaskRun>,
    events: mpsc::Receiver<InterlinkEvent>,
    pending: HashMap<RunKey, TaskRun>,
    /// Every run handed to `run_task`, in order
    pub invoked: Vec<TaskRun>,
}

impl Node {
    fn collect(&mut self) {
        while let Ok(run) = self.runs.try_recv() {
            match self.pending.get(&run.key()) {
                Some(queued) if queued.not_before <= run.not_before => {}
                _ => {
                    self.pending.insert(run.key(), run);
                }
            }
        }
    }

    pub fn pending(&mut self) -> Vec<TaskRun> {
        self.collect();
        let mut runs: Vec<TaskRun> = self.pending.values().cloned().collect();
        runs.sort_by_key(|run| run.not_before);
        runs
    }

    /// Run the earliest queued run, moving the clock forward to it if needed
    ///
    /// Returns `false` when nothing is queued.
    pub async fn step(&mut self) -> bool {
        let Some(next) = self.pending().into_iter().next() else {
            return false;
        };
        self.pending.remove(&next.key());
        if next.not_before > self.clock.now() {
            self.clock.set(next.not_before);
        }
        self.invoked.push(next.clone());
        self.engine.run_task(&next).await.unwrap();
        true
    }

    /// Step until the queue is empty or `limit` runs have executed
    pub async fn run_until_idle(&mut self, limit: usize) -> usize {
        let mut steps = 0;
        while steps < limit && self.step().await {
            steps += 1;
        }
        steps
    }

    /// Forget queued runs, as a crashed node would
    pub fn drop_pending(&mut self) {
        self.collect();
        self.pending.clear();
    }

    /// Handle the next delivered interlink event
    pub async fn deliver(&mut self) -> Option<HandleOutcome> {
        let event = tokio::time::timeout(StdDuration::from_millis(200), self.events.recv())
            .await
            .ok()??;
        Some(self.handler.handle(&event).await)
    }

    /// Next delivered event without handling it
    pub async fn receive(&mut self) -> Option<InterlinkEvent> {
        tokio::time::timeout(StdDuration::from_millis(200), self.events.recv())
            .await
            .ok()?
    }
}
