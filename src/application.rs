//! Node bootstrap
//!
//! Turns a [`Config`] into a wired node: stores for the configured backend,
//! the engine, the interlink consumer and the cluster housekeeping poller.
//! [`Application::run_worker`] drives all of them until shutdown.

use anyhow::{bail, Context, Result};
use sqlx::PgPool;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::clock::SystemClock;
use crate::config::{Config, StoreBackend};
use crate::db;
use crate::engine::scheduler::{Scheduler, SchedulerSettings};
use crate::engine::{Engine, EngineSettings, TaskRegistry, TaskResult, TaskRun};
use crate::interlink::{
    InMemoryInterlink, InterlinkMessageHandler, InterlinkTransport, MessageFlagger, PgInterlink,
    Sha256Fingerprinter,
};
use crate::lock::{
    DistributedLock, InMemoryLockStore, LeaderPoller, LockStore, NotificationClusterLock,
    PgLockStore, RetriableLock,
};
use crate::repository::{ExecutionRepository, InMemoryExecutionRepository, PgExecutionRepository};

pub const HOUSEKEEPING_POLL: &str = "housekeeping";

/// Handlers every node ships with
pub fn builtin_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register_fn("noop", |_| async { Ok::<_, anyhow::Error>(TaskResult::succeeded()) });
    registry
}

/// A wired node
pub struct Application {
    pub config: Config,
    pub node_id: String,
    pool: Option<PgPool>,
    engine: Arc<Engine>,
    lock: DistributedLock,
    repository: Arc<dyn ExecutionRepository>,
    interlink: Option<Interlink>,
    run_sink: mpsc::UnboundedSender<TaskRun>,
    run_inbox: Mutex<Option<mpsc::UnboundedReceiver<TaskRun>>>,
}

struct Interlink {
    transport: Arc<dyn InterlinkTransport>,
    handler: Arc<InterlinkMessageHandler>,
    pg: Option<PgInterlink>,
}

struct Stores {
    locks: Arc<dyn LockStore>,
    repository: Arc<dyn ExecutionRepository>,
    transport: Arc<dyn InterlinkTransport>,
    pg_interlink: Option<PgInterlink>,
}

impl Application {
    /// Wire a node from `config`; no I/O beyond what the stores need
    pub fn new(config: Config, pool: Option<PgPool>, registry: TaskRegistry) -> Result<Self> {
        config.validate()?;

        let node_id = config
            .node
            .node_id
            .clone()
            .unwrap_or_else(|| format!("node-{}", uuid::Uuid::new_v4().simple()));
        let stores = Self::stores(&config, pool.clone())?;

        let lock = DistributedLock::new(stores.locks, config.locks.store_timeout());
        let fingerprinter = Arc::new(Sha256Fingerprinter::new(config.interlink.fingerprint_bucket()));
        let (run_sink, run_inbox) = mpsc::unbounded_channel();

        let mut builder = Engine::builder(
            stores.repository.clone(),
            RetriableLock::new(lock.clone(), node_id.clone()),
            Arc::new(registry),
        )
        .settings(EngineSettings::from_config(&config))
        .run_sink(run_sink.clone());
        if config.interlink.enabled {
            builder = builder.interlink(stores.transport.clone(), fingerprinter.clone());
        }
        let engine = Arc::new(builder.build());

        let interlink = config.interlink.enabled.then(|| {
            let flagger = Arc::new(MessageFlagger::new(
                Arc::new(SystemClock),
                config.interlink.suppression_window(),
                config.interlink.flagger_capacity,
                config.interlink.flagger_threshold,
            ));
            Interlink {
                transport: stores.transport,
                handler: Arc::new(InterlinkMessageHandler::new(
                    engine.clone(),
                    flagger,
                    fingerprinter,
                    config.interlink.max_apply_attempts,
                )),
                pg: stores.pg_interlink,
            }
        });

        info!(
            node_id = %node_id,
            backend = ?config.backend,
            partition = ?config.node.partition,
            interlink = config.interlink.enabled,
            "Node wired"
        );

        Ok(Self {
            config,
            node_id,
            pool,
            engine,
            lock,
            repository: stores.repository,
            interlink,
            run_sink,
            run_inbox: Mutex::new(Some(run_inbox)),
        })
    }

    fn stores(config: &Config, pool: Option<PgPool>) -> Result<Stores> {
        let partition = config.node.partition.clone();
        match config.backend {
            StoreBackend::Memory => Ok(Stores {
                locks: Arc::new(InMemoryLockStore::new()),
                repository: Arc::new(InMemoryExecutionRepository::new(partition)),
                transport: Arc::new(InMemoryInterlink::new()),
                pg_interlink: None,
            }),
            StoreBackend::Postgres => {
                let pool = pool.context("the postgres backend needs a connection pool")?;
                let interlink = PgInterlink::new(pool.clone(), config.interlink.poll_interval());
                Ok(Stores {
                    locks: Arc::new(PgLockStore::new(pool.clone())),
                    repository: Arc::new(PgExecutionRepository::new(pool, partition)),
                    transport: Arc::new(interlink.clone()),
                    pg_interlink: Some(interlink),
                })
            }
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn repository(&self) -> &Arc<dyn ExecutionRepository> {
        &self.repository
    }

    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    pub fn pool(&self) -> Option<&PgPool> {
        self.pool.as_ref()
    }

    pub fn interlink_handler(&self) -> Option<&Arc<InterlinkMessageHandler>> {
        self.interlink.as_ref().map(|interlink| &interlink.handler)
    }

    /// Run the scheduler, interlink consumer and housekeeping until `shutdown`
    ///
    /// Can be called once per application. If any service stops on its own
    /// the others are shut down and an error is returned.
    pub async fn run_worker(&self, shutdown: CancellationToken) -> Result<()> {
        let stop = shutdown.child_token();
        let inbox = self
            .run_inbox
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .context("worker is already running")?;

        let mut services = JoinSet::new();

        let scheduler = Scheduler::new(
            self.engine.clone(),
            inbox,
            self.run_sink.clone(),
            SchedulerSettings {
                max_concurrency: self.config.engine.max_concurrency,
                recovery_interval: Duration::from_secs(self.config.engine.recovery_interval_secs),
                ..SchedulerSettings::default()
            },
        );
        services.spawn(scheduler.run(stop.clone()));

        if let Some(interlink) = &self.interlink {
            let handler = interlink.handler.clone();
            let transport = interlink.transport.clone();
            let token = stop.clone();
            services.spawn(async move {
                if let Err(e) = handler.run(transport, token).await {
                    error!(error = %e, "Interlink consumer failed");
                }
            });
        }

        // purge expired lock rows and prune delivered interlink events
        let lock = self.lock.clone();
        let pg_interlink = self.interlink.as_ref().and_then(|i| i.pg.clone());
        let retention = Duration::from_secs(self.config.interlink.retention_secs);
        let housekeeping = self.housekeeping().run(stop.clone(), move || {
            let lock = lock.clone();
            let pg_interlink = pg_interlink.clone();
            async move {
                let purged = lock.purge_expired().await?;
                let pruned = match &pg_interlink {
                    Some(interlink) => interlink.prune(retention).await?,
                    None => 0,
                };
                info!(purged_locks = purged, pruned_events = pruned, "Housekeeping done");
                Ok::<_, anyhow::Error>(())
            }
        });
        services.spawn(housekeeping);

        info!(node_id = %self.node_id, "Worker running");
        let failure = tokio::select! {
            _ = stop.cancelled() => None,
            Some(joined) = services.join_next() => Some(match joined {
                Ok(()) => "a worker service stopped unexpectedly".to_string(),
                Err(e) => format!("a worker service panicked: {}", e),
            }),
        };
        if let Some(reason) = &failure {
            error!(node_id = %self.node_id, reason = %reason, "Stopping worker");
            stop.cancel();
        }

        while let Some(joined) = services.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker service panicked");
            }
        }
        info!(node_id = %self.node_id, "Worker stopped");

        if let Some(reason) = failure {
            bail!(reason);
        }
        Ok(())
    }

    fn housekeeping(&self) -> LeaderPoller {
        let cluster_lock = NotificationClusterLock::new(
            self.lock.clone(),
            self.node_id.clone(),
            self.config.polling.cluster_lock_enabled,
        );
        LeaderPoller::new(
            cluster_lock,
            HOUSEKEEPING_POLL,
            Duration::from_secs(self.config.polling.housekeeping_interval_secs),
            self.config.polling.housekeeping_lock_secs,
        )
    }
}

/// Options for bringing a node up
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Database URL (overrides config file and env vars)
    pub database_url: Option<String>,

    /// Config file path (overrides default search)
    pub config_path: Option<PathBuf>,

    pub backend: Option<StoreBackend>,
    pub partition: Option<String>,
    pub node_id: Option<String>,

    /// Whether to run migrations after connecting
    pub auto_migrate: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            database_url: None,
            config_path: None,
            backend: None,
            partition: None,
            node_id: None,
            auto_migrate: true,
        }
    }
}

/// Builder for constructing an [`Application`]
pub struct InitBuilder {
    options: InitOptions,
    registry: TaskRegistry,
}

impl InitBuilder {
    pub fn new() -> Self {
        Self {
            options: InitOptions::default(),
            registry: builtin_registry(),
        }
    }

    pub fn options(mut self, options: InitOptions) -> Self {
        self.options = options;
        self
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.options.database_url = Some(url.into());
        self
    }

    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn backend(mut self, backend: StoreBackend) -> Self {
        self.options.backend = Some(backend);
        self
    }

    pub fn partition(mut self, partition: impl Into<String>) -> Self {
        self.options.partition = Some(partition.into());
        self
    }

    pub fn auto_migrate(mut self, auto: bool) -> Self {
        self.options.auto_migrate = auto;
        self
    }

    /// Task handlers available to this node, replacing the built-in set
    pub fn registry(mut self, registry: TaskRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub async fn init(self) -> Result<Application> {
        initialize(self.options, self.registry).await
    }
}

impl Default for InitBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Load config, connect when the backend needs it, and wire the node
pub async fn initialize(options: InitOptions, registry: TaskRegistry) -> Result<Application> {
    let config = Config::builder()
        .database_url(options.database_url)
        .config_path(options.config_path)
        .backend(options.backend)
        .partition(options.partition)
        .node_id(options.node_id)
        .build()
        .context("Failed to load configuration")?;

    let pool = match config.backend {
        StoreBackend::Memory => None,
        StoreBackend::Postgres => {
            let pool = db::create_pool(&config.database).await?;
            if options.auto_migrate {
                db::migrate(&pool).await?;
            }
            Some(pool)
        }
    };

    Application::new(config, pool, registry)
}
