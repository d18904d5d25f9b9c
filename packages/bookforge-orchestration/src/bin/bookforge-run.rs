//! Bookforge pipeline runner
//!
//! # Usage
//!
//! ```bash
//! # Start a run (stage programs come from the config file)
//! bookforge-run --config bookforge.yaml run --topic "Sourdough at altitude"
//!
//! # Resume an interrupted or aborted run
//! bookforge-run --config bookforge.yaml resume --run-id run-3f2a...
//!
//! # Inspect
//! bookforge-run status run-3f2a...
//! bookforge-run costs --format csv
//! bookforge-run dead-letters
//! ```
//!
//! Exit status: 0 when the run is final, 1 when it aborted, 2 on error.
//!
//! With the `metrics` feature, engine gauges are written to
//! `<data-dir>/metrics.prom` in the Prometheus text format on exit.

use anyhow::Context;
use bookforge_orchestration::{
    registry_from_commands, AutoScaler, CostLedger, Dispatch, EngineConfig, ExportFormat,
    HealthMonitor, JobQueue, PipelineOrchestrator, RateLimiter, RunOptions, RunOutcome, RunResult,
    StageJobHandler, WorkerPool,
};
use bookforge_storage::{JsonFileManifestStore, ManifestStore, SqliteDatabase};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "bookforge-run")]
#[command(about = "Resumable content pipeline runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine configuration (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory for manifests and the engine database
    #[arg(long, default_value = "data", global = true)]
    data_dir: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new run
    Run {
        /// Topic of the run
        #[arg(long)]
        topic: String,

        /// Explicit run id (generated when omitted)
        #[arg(long)]
        run_id: Option<String>,

        /// Override the per-state attempt ceiling
        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// Resume a run from its manifest
    Resume {
        #[arg(long)]
        run_id: String,

        /// Override the per-state attempt ceiling
        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// Print a run's manifest
    Status { run_id: String },

    /// List known runs
    Runs,

    /// Export the cost ledger
    Costs {
        #[arg(long, value_enum, default_value = "json")]
        format: Format,
    },

    /// List dead-lettered jobs
    DeadLetters {
        #[arg(long, default_value = "stages")]
        queue: String,
    },

    /// Move a dead-lettered job back to waiting
    Replay { job_id: Uuid },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Csv,
}

impl From<Format> for ExportFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Json => ExportFormat::Json,
            Format::Csv => ExportFormat::Csv,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => EngineConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Run {
            topic,
            run_id,
            max_attempts,
        } => {
            let engine = Engine::start(&config, &cli.data_dir).await?;
            let result = engine
                .orchestrator
                .start(
                    &topic,
                    RunOptions {
                        run_id,
                        max_attempts_per_state: max_attempts,
                    },
                )
                .await;
            engine.shutdown(&config, &cli.data_dir).await;
            report(result?)
        }
        Commands::Resume {
            run_id,
            max_attempts,
        } => {
            let engine = Engine::start(&config, &cli.data_dir).await?;
            let result = engine
                .orchestrator
                .resume_with(&run_id, max_attempts)
                .await;
            engine.shutdown(&config, &cli.data_dir).await;
            report(result?)
        }
        Commands::Status { run_id } => {
            let store = JsonFileManifestStore::new(cli.data_dir.join("manifests"))?;
            let manifest = store
                .load(&run_id)
                .await?
                .with_context(|| format!("run {} not found", run_id))?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Runs => {
            let store = JsonFileManifestStore::new(cli.data_dir.join("manifests"))?;
            for run_id in store.list_runs().await? {
                println!("{}", run_id);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Costs { format } => {
            let db = open_database(&cli.data_dir)?;
            let ledger = CostLedger::new(Arc::new(db.ledger()), config.budgets());
            ledger.init().await?;
            println!("{}", ledger.export_ledger(format.into()).await?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::DeadLetters { queue } => {
            let db = open_database(&cli.data_dir)?;
            let jobs = JobQueue::new(Arc::new(db.queue()), config.queue_settings());
            let dead = jobs.dead_letters(&queue).await?;
            println!("{}", serde_json::to_string_pretty(&dead)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Replay { job_id } => {
            let db = open_database(&cli.data_dir)?;
            let jobs = JobQueue::new(Arc::new(db.queue()), config.queue_settings());
            let job = jobs.replay(job_id).await?;
            info!(job_id = %job.id, queue = %job.queue, "Job requeued");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn open_database(data_dir: &Path) -> anyhow::Result<SqliteDatabase> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;
    Ok(SqliteDatabase::open(data_dir.join("engine.db"))?)
}

fn report(result: RunResult) -> anyhow::Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(&result.manifest)?);
    match &result.outcome {
        RunOutcome::Completed => Ok(ExitCode::SUCCESS),
        RunOutcome::Aborted { stage, error } => {
            warn!(run_id = %result.run_id, stage = %stage, "Run aborted: {}", error);
            Ok(ExitCode::from(1))
        }
    }
}

/// Running components, stopped in reverse start order
struct Engine {
    orchestrator: PipelineOrchestrator,
    queue: Arc<JobQueue>,
    limiter: Arc<RateLimiter>,
    ledger: Arc<CostLedger>,
    pool: Option<Arc<WorkerPool>>,
    scaler: Option<Arc<AutoScaler>>,
    health: Arc<HealthMonitor>,
    #[cfg(feature = "metrics")]
    registry: prometheus::Registry,
}

impl Engine {
    async fn start(config: &EngineConfig, data_dir: &Path) -> anyhow::Result<Self> {
        let db = open_database(data_dir)?;
        let manifests = Arc::new(JsonFileManifestStore::new(data_dir.join("manifests"))?);

        let queue = Arc::new(JobQueue::new(Arc::new(db.queue()), config.queue_settings()));
        queue.init().await?;

        let limiter = Arc::new(RateLimiter::new(config.service_limits()));
        limiter.init();

        let ledger = Arc::new(CostLedger::new(Arc::new(db.ledger()), config.budgets()));
        ledger.init().await?;

        let registry = registry_from_commands(&config.stages)?;
        let settings = config.orchestrator_settings()?;
        let queued = matches!(settings.dispatch, Dispatch::Queued { .. });

        let (pool, scaler) = if queued {
            let mut pool = WorkerPool::new(
                Arc::clone(&queue),
                Arc::clone(&limiter),
                Arc::clone(&ledger),
                config.pool_settings(),
            );
            pool.register_handler(
                config.orchestrator.stage_queue.clone(),
                Arc::new(StageJobHandler::new(registry.clone())),
            );
            let pool = Arc::new(pool);
            pool.start()?;

            let scaler = config.autoscale_settings().map(|settings| {
                let scaler = Arc::new(AutoScaler::new(Arc::clone(&pool), Arc::clone(&queue), settings));
                scaler.start();
                scaler
            });
            (Some(pool), scaler)
        } else {
            (None, None)
        };

        let mut health = HealthMonitor::new(
            Arc::clone(&queue),
            Arc::clone(&limiter),
            Arc::clone(&ledger),
            config.health_thresholds(),
        );
        if let Some(pool) = &pool {
            health = health.with_pool(Arc::clone(pool));
        }
        #[cfg(feature = "metrics")]
        let registry = prometheus::Registry::new();
        #[cfg(feature = "metrics")]
        {
            let metrics = bookforge_orchestration::EngineMetrics::new(&registry)?;
            health = health.with_metrics(Arc::new(metrics));
        }
        let health = Arc::new(health);
        health.start();

        let orchestrator = PipelineOrchestrator::new(
            registry,
            manifests,
            Arc::clone(&limiter),
            Arc::clone(&ledger),
            settings,
        )
        .with_queue(Arc::clone(&queue));

        Ok(Self {
            orchestrator,
            queue,
            limiter,
            ledger,
            pool,
            scaler,
            health,
            #[cfg(feature = "metrics")]
            registry,
        })
    }

    async fn shutdown(self, config: &EngineConfig, data_dir: &Path) {
        #[cfg(feature = "metrics")]
        {
            // Final sample so the snapshot reflects the end of the run
            self.health.check().await;
            if let Err(e) = write_metrics(&self.registry, &data_dir.join("metrics.prom")) {
                warn!("Writing metrics failed: {:#}", e);
            }
        }
        #[cfg(not(feature = "metrics"))]
        let _ = data_dir;

        self.health.shutdown().await;
        if let Some(scaler) = &self.scaler {
            scaler.shutdown().await;
        }
        if let Some(pool) = &self.pool {
            let report = pool.shutdown(config.pool_settings().drain_timeout).await;
            if !report.drained {
                warn!(abandoned = report.abandoned, "Worker pool did not drain");
            }
        }
        self.ledger.shutdown().await;
        self.limiter.shutdown();
        self.queue.shutdown().await;
    }
}

#[cfg(feature = "metrics")]
fn write_metrics(registry: &prometheus::Registry, path: &Path) -> anyhow::Result<()> {
    use prometheus::Encoder;

    let mut buffer = Vec::new();
    prometheus::TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    std::fs::write(path, buffer).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
