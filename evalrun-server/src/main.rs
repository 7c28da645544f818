//! # evalrun-server
//!
//! Long-running orchestrator process for evaluation runs.
//!
//! - **Queue workers**: one probe queue per provider, sized to that
//!   provider's parallelism, plus the shared summarize queue
//! - **Recovery**: periodic orphan sweeps that re-enqueue lost work
//! - **Expiry**: jobs whose worker died mid-flight return to their queue
//!
//! State lives in PostgreSQL; probe and summarize work is delegated to
//! external worker commands.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use evalrun_server::infra::{
    config::{Config, ConfigLoad, ConfigLoader, ConfigLoaderOptions},
    startup::{self, WorkerMode},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "evalrun-server")]
#[command(about = "Evaluation run orchestrator: provider-limited queues, progress tracking, and recovery")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct ServeArgs {
    /// Path to the TOML configuration file
    #[arg(long, env = "EVALRUN_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Path to a .env file (defaults to ./.env when present)
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Skip applying migrations on startup
    #[arg(long, env = "EVALRUN_SKIP_MIGRATIONS", default_value_t = false, global = true)]
    skip_migrations: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the orchestrator until interrupted (default)
    Serve,
    /// Run one orphan recovery sweep, print the summary as JSON, and exit
    Recover,
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => run_server(&cli.serve).await,
        Some(Command::Recover) => run_recovery_once(&cli.serve).await,
        Some(Command::Db(DbCommand::Migrate)) => run_db_migrate(&cli.serve).await,
    }
}

fn load_runtime_config(args: &ServeArgs) -> anyhow::Result<Config> {
    let ConfigLoad { config, warnings } = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: args.config.clone(),
        env_file: args.env_file.clone(),
    })
    .load()
    .context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Quiet defaults; override via RUST_LOG.
                "info,evalrun::limiter=warn,sqlx=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "configuration file loaded");
    }

    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => {
                warn!(message = %warning.message, "configuration warning")
            }
        }
    }

    let recovery = &config.orchestrator.recovery;
    info!(
        recovery.interval_secs = recovery.interval_secs,
        recovery.stale_threshold_secs = recovery.stale_threshold_secs,
        limiter.default_max_parallel = config.orchestrator.limiter.default_max_parallel,
        limiter.default_requests_per_minute =
            config.orchestrator.limiter.default_requests_per_minute,
        providers = config.orchestrator.providers.len(),
        "orchestrator configuration in effect"
    );

    Ok(config)
}

async fn run_db_migrate(args: &ServeArgs) -> anyhow::Result<()> {
    let config = load_runtime_config(args)?;
    let pool = startup::connect(&config.database).await?;
    startup::migrate(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(())
}

async fn run_recovery_once(args: &ServeArgs) -> anyhow::Result<()> {
    let config = load_runtime_config(args)?;
    let pool = startup::connect(&config.database).await?;
    let runtime = startup::build_runtime(&config, pool, WorkerMode::Detached)?;

    runtime
        .orchestrator
        .register_handlers()
        .await
        .context("failed to provision queues")?;
    let summary = runtime
        .orchestrator
        .trigger_recovery()
        .await
        .context("recovery sweep did not complete")?;

    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("failed to encode recovery summary")?
    );
    runtime.orchestrator.shutdown().await;
    Ok(())
}

async fn run_server(args: &ServeArgs) -> anyhow::Result<()> {
    let config = load_runtime_config(args)?;
    let pool = startup::connect(&config.database).await?;

    if args.skip_migrations {
        info!("skipping migrations");
    } else {
        startup::migrate(&pool).await?;
    }
    let seeded = startup::seed_provider_limits(&config, &pool).await?;
    if seeded > 0 {
        info!(providers = seeded, "provider limits stored");
    }

    let runtime = startup::build_runtime(&config, pool, WorkerMode::Attach)?;
    let report = runtime
        .orchestrator
        .register_handlers()
        .await
        .context("failed to register queue handlers")?;
    info!(
        created = report.created.len(),
        attached = ?report.attached,
        skipped = ?report.skipped,
        "queue topology ready"
    );

    runtime.orchestrator.start_recovery_scheduler().await;

    let cancel = CancellationToken::new();
    let scanner = startup::spawn_expiry_scanner(
        runtime.queue.clone(),
        Arc::clone(&runtime.orchestrator),
        cancel.clone(),
    );

    info!("orchestrator running; press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    cancel.cancel();
    runtime.orchestrator.shutdown().await;
    if let Err(err) = scanner.await {
        warn!("expiry scanner ended abnormally: {err}");
    }
    Ok(())
}
