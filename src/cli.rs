use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::application::{Application, InitBuilder, InitOptions};
use crate::config::{Config, StoreBackend};
use crate::db;
use crate::engine::ControlOutcome;
use crate::repository::ExecutionRepository;
use crate::types::Execution;

#[derive(Parser)]
#[command(name = "tempo")]
#[command(about = "Tempo - distributed execution coordination", long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default search)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database URL (overrides config file and env vars)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Store backend (overrides config file and env vars)
    #[arg(long, global = true, value_enum)]
    pub backend: Option<StoreBackend>,

    /// Partition served by this node
    #[arg(long, global = true)]
    pub partition: Option<String>,

    /// Node identity used in lock holder tokens
    #[arg(long, global = true)]
    pub node_id: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a worker node until interrupted
    Worker,

    /// Run database migrations
    Migrate,

    /// Print the effective configuration
    Config,

    /// Get the status of an execution
    Status {
        /// Execution ID to query
        execution_id: String,
    },

    /// Start a NOT_STARTED execution
    Start { execution_id: String },

    /// Cancel an execution
    Cancel {
        /// Execution ID to cancel
        execution_id: String,

        /// Skip confirmation prompt
        #[arg(short = 'y', long = "yes")]
        yes: bool,

        #[arg(long)]
        reason: Option<String>,

        #[arg(long)]
        user: Option<String>,
    },

    /// Pause a running execution
    Pause {
        execution_id: String,

        #[arg(long)]
        user: Option<String>,
    },

    /// Resume a paused execution
    Resume {
        execution_id: String,

        #[arg(long)]
        user: Option<String>,

        /// Resume even if the execution is not paused
        #[arg(long)]
        force: bool,
    },

    /// Re-run a completed stage and everything downstream of it
    RestartStage {
        execution_id: String,
        stage_id: String,
    },

    /// Show who holds a lock
    Lock {
        /// Lock name, e.g. execution:<id> or notification:<poll>
        name: String,
    },
}

/// Run the CLI by parsing process arguments
pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    run_cli_with_args(cli).await
}

impl Cli {
    fn init_options(&self, auto_migrate: bool) -> InitOptions {
        InitOptions {
            database_url: self.database_url.clone(),
            config_path: self.config.clone(),
            backend: self.backend,
            partition: self.partition.clone(),
            node_id: self.node_id.clone(),
            auto_migrate,
        }
    }

    fn load_config(&self) -> Result<Config> {
        let config = Config::builder()
            .database_url(self.database_url.clone())
            .config_path(self.config.clone())
            .backend(self.backend)
            .partition(self.partition.clone())
            .node_id(self.node_id.clone())
            .build()?;
        Ok(config)
    }

    async fn application(&self, auto_migrate: bool) -> Result<Application> {
        InitBuilder::new()
            .options(self.init_options(auto_migrate))
            .init()
            .await
    }
}

async fn run_cli_with_args(cli: Cli) -> Result<()> {
    // Eagerly load and validate configuration before executing any command
    let config = cli.load_config()?;

    match &cli.command {
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }

        Commands::Migrate => {
            if config.backend != StoreBackend::Postgres {
                bail!("migrations only apply to the postgres backend");
            }
            println!("Running migrations...");
            let pool = db::create_pool(&config.database).await?;
            db::migrate(&pool).await?;
            println!("Migrations complete!");
        }

        Commands::Worker => {
            let app = cli.application(true).await?;
            let shutdown = CancellationToken::new();
            let token = shutdown.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("Shutdown requested");
                        token.cancel();
                    }
                    Err(e) => warn!(error = %e, "Could not listen for Ctrl-C"),
                }
            });
            app.run_worker(shutdown).await?;
        }

        Commands::Status { execution_id } => {
            let app = cli.application(false).await?;
            let execution = app
                .repository()
                .load(execution_id)
                .await
                .with_context(|| format!("Execution {} not found", execution_id))?;
            print_execution(&execution);
        }

        Commands::Start { execution_id } => {
            let app = cli.application(false).await?;
            let outcome = app.engine().start(execution_id).await?;
            report("started", execution_id, &outcome);
        }

        Commands::Cancel {
            execution_id,
            yes,
            reason,
            user,
        } => {
            if !yes {
                bail!("Confirmation required. Use --yes flag to confirm cancellation.");
            }
            let app = cli.application(false).await?;
            let outcome = app
                .engine()
                .cancel(execution_id, user.clone(), reason.clone())
                .await?;
            report("cancelled", execution_id, &outcome);
        }

        Commands::Pause { execution_id, user } => {
            let app = cli.application(false).await?;
            let outcome = app.engine().pause(execution_id, user.clone()).await?;
            report("paused", execution_id, &outcome);
        }

        Commands::Resume {
            execution_id,
            user,
            force,
        } => {
            let app = cli.application(false).await?;
            let outcome = app
                .engine()
                .resume(execution_id, user.clone(), *force)
                .await?;
            report("resumed", execution_id, &outcome);
        }

        Commands::RestartStage {
            execution_id,
            stage_id,
        } => {
            let app = cli.application(false).await?;
            let outcome = app.engine().restart_stage(execution_id, stage_id).await?;
            report("restarted", execution_id, &outcome);
        }

        Commands::Lock { name } => {
            let app = cli.application(false).await?;
            match app.lock().holder(name).await? {
                Some(record) => {
                    println!("Lock: {}", record.name);
                    println!("Holder: {}", record.holder);
                    println!("Acquired: {}", record.acquired_at);
                    println!("Expires: {}", record.expires_at);
                }
                None => println!("Lock {} is free", name),
            }
        }
    }

    Ok(())
}

fn report(verb: &str, execution_id: &str, outcome: &ControlOutcome) {
    match outcome {
        ControlOutcome::Applied(runs) => {
            println!("✓ Execution {} {} ({} task run(s) queued)", execution_id, verb, runs.len())
        }
        ControlOutcome::Unchanged => {
            println!("Execution {} already in the requested state", execution_id)
        }
        ControlOutcome::Forwarded { fingerprint } => println!(
            "✓ Forwarded to the owning partition (fingerprint {})",
            fingerprint
        ),
    }
}

fn print_execution(execution: &Execution) {
    println!("Execution: {}", execution.id);
    println!("Type: {:?}", execution.execution_type);
    println!("Application: {}", execution.application);
    println!("Partition: {}", execution.partition);
    println!("Status: {}", execution.status);
    println!("Created: {}", execution.created_at);
    if let Some(start_time) = execution.start_time {
        println!("Started: {}", start_time);
    }
    if let Some(end_time) = execution.end_time {
        println!("Ended: {}", end_time);
    }
    if execution.canceled {
        println!(
            "Canceled by: {} ({})",
            execution.canceled_by.as_deref().unwrap_or("unknown"),
            execution.cancellation_reason.as_deref().unwrap_or("no reason given")
        );
    }

    println!("\nStages:");
    for stage in &execution.stages {
        println!(
            "  {} [{}] {} (attempt {})",
            stage.id, stage.stage_type, stage.status, stage.attempt
        );
        for task in &stage.tasks {
            println!(
                "    {} {} attempts={}{}",
                task.id,
                task.status,
                task.attempts,
                task.error
                    .as_deref()
                    .map(|e| format!(" error={}", e))
                    .unwrap_or_default()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "tempo",
            "cancel",
            "e1",
            "--yes",
            "--reason",
            "bad deploy",
            "--partition",
            "eu",
            "--backend",
            "memory",
        ])
        .unwrap();

        assert_eq!(cli.partition.as_deref(), Some("eu"));
        assert_eq!(cli.backend, Some(StoreBackend::Memory));
        let Commands::Cancel {
            execution_id,
            yes,
            reason,
            ..
        } = cli.command
        else {
            panic!("expected cancel");
        };
        assert_eq!(execution_id, "e1");
        assert!(yes);
        assert_eq!(reason.as_deref(), Some("bad deploy"));
    }

    #[test]
    fn test_restart_stage_takes_two_ids() {
        let cli = Cli::try_parse_from(["tempo", "restart-stage", "e1", "s2"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::RestartStage { ref execution_id, ref stage_id }
                if execution_id == "e1" && stage_id == "s2"
        ));
        assert!(Cli::try_parse_from(["tempo", "restart-stage", "e1"]).is_err());
    }

    #[tokio::test]
    async fn test_cancel_requires_confirmation() {
        let cli = Cli::try_parse_from(["tempo", "--backend", "memory", "cancel", "e1"]).unwrap();
        let err = run_cli_with_args(cli).await.unwrap_err();
        assert!(err.to_string().contains("--yes"));
    }
}
