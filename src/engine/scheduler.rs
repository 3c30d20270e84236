//! Timer-driven task re-invocation
//!
//! Runs arrive on an unbounded channel (the engine's run sink), wait in a
//! `DelayQueue` until due, and execute on spawned tasks bounded by a
//! semaphore. A run whose lock could not be acquired is put back with a delay
//! instead of failing the execution. At most one run per task executes at a
//! time; a run that comes due while its task is still executing waits.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, error, info, warn};

use super::state::{RunKey, TaskRun};
use super::Engine;
use crate::clock::chrono_duration;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_concurrency: usize,
    pub recovery_interval: Duration,
    /// Delay before retrying a run that hit lock contention or a store outage
    pub retry_delay: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 32,
            recovery_interval: Duration::from_secs(30),
            retry_delay: Duration::from_millis(500),
        }
    }
}

pub struct Scheduler {
    engine: Arc<Engine>,
    inbox: mpsc::UnboundedReceiver<TaskRun>,
    requeue: mpsc::UnboundedSender<TaskRun>,
    settings: SchedulerSettings,
}

impl Scheduler {
    /// `requeue` must feed `inbox`; it is normally the engine's run sink
    pub fn new(
        engine: Arc<Engine>,
        inbox: mpsc::UnboundedReceiver<TaskRun>,
        requeue: mpsc::UnboundedSender<TaskRun>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            engine,
            inbox,
            requeue,
            settings,
        }
    }

    /// Process runs until `shutdown` fires, then wait for in-flight runs
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            max_concurrency = self.settings.max_concurrency,
            "Scheduler started"
        );

        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrency.max(1)));
        let mut queue: DelayQueue<TaskRun> = DelayQueue::new();
        let mut pending: HashMap<RunKey, delay_queue::Key> = HashMap::new();
        let executing: Executing = Arc::new(Mutex::new(HashSet::new()));
        let mut workers = JoinSet::new();

        let mut recovery = tokio::time::interval(self.settings.recovery_interval);
        recovery.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                Some(run) = self.inbox.recv() => {
                    self.enqueue(&mut queue, &mut pending, run);
                }

                Some(expired) = std::future::poll_fn(|cx| queue.poll_expired(cx)),
                    if !queue.is_empty() && semaphore.available_permits() > 0 =>
                {
                    let run = expired.into_inner();
                    pending.remove(&run.key());

                    let Some(slot) = ExecutingSlot::claim(&executing, run.key()) else {
                        debug!(execution_id = %run.execution_id, task_id = %run.task_id, "Task still executing; run deferred");
                        let at = self.engine.clock().now() + chrono_duration(self.settings.retry_delay);
                        self.enqueue(&mut queue, &mut pending, run.at(at));
                        continue;
                    };
                    let permit = match semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            drop(slot);
                            self.enqueue(&mut queue, &mut pending, run);
                            continue;
                        }
                    };
                    let engine = self.engine.clone();
                    let requeue = self.requeue.clone();
                    let retry_delay = self.settings.retry_delay;

                    workers.spawn(async move {
                        let _permit = permit;
                        let _slot = slot;
                        if let Err(e) = engine.run_task(&run).await {
                            if e.is_retryable() {
                                warn!(execution_id = %run.execution_id, task_id = %run.task_id, error = %e, "Run deferred");
                                let at = engine.clock().now() + chrono_duration(retry_delay);
                                let _ = requeue.send(run.at(at));
                            } else {
                                error!(execution_id = %run.execution_id, task_id = %run.task_id, error = %e, "Run failed");
                            }
                        }
                    });
                }

                Some(_) = workers.join_next(), if !workers.is_empty() => {}

                _ = recovery.tick() => {
                    match self.engine.running_task_runs().await {
                        Ok(runs) => {
                            let busy = executing.lock().unwrap_or_else(|e| e.into_inner()).clone();
                            let recovered: Vec<TaskRun> = runs
                                .into_iter()
                                .filter(|run| !busy.contains(&run.key()))
                                .collect();
                            if !recovered.is_empty() {
                                info!(runs = recovered.len(), executing = busy.len(), "Recovered running tasks");
                            }
                            for run in recovered {
                                self.enqueue(&mut queue, &mut pending, run);
                            }
                        }
                        Err(e) => warn!(error = %e, "Recovery pass failed"),
                    }
                }
            }
        }

        info!(in_flight = workers.len(), "Scheduler stopping");
        while workers.join_next().await.is_some() {}
        info!("Scheduler stopped");
    }

    /// Queue a run, keeping only the earliest pending run per task
    fn enqueue(
        &self,
        queue: &mut DelayQueue<TaskRun>,
        pending: &mut HashMap<RunKey, delay_queue::Key>,
        run: TaskRun,
    ) {
        let delay = (run.not_before - self.engine.clock().now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let key = run.key();

        if let Some(existing) = pending.get(&key) {
            if queue.deadline(existing) <= tokio::time::Instant::now() + delay {
                debug!(execution_id = %run.execution_id, task_id = %run.task_id, "Run already queued");
                return;
            }
            queue.remove(existing);
        }

        let queued = queue.insert(run, delay);
        pending.insert(key, queued);
    }
}

type Executing = Arc<Mutex<HashSet<RunKey>>>;

/// Marks a task as executing until dropped, including when the worker panics
struct ExecutingSlot {
    executing: Executing,
    key: RunKey,
}

impl ExecutingSlot {
    fn claim(executing: &Executing, key: RunKey) -> Option<Self> {
        let inserted = executing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone());
        inserted.then(|| Self {
            executing: executing.clone(),
            key,
        })
    }
}

impl Drop for ExecutingSlot {
    fn drop(&mut self) {
        self.executing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}
