//! Test-run daemon
//!
//! Hosts the orchestrator: polls the database for pending runs and stop
//! requests, or executes a single run in the foreground.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use testrun_common::Database;
use testrun_orchestrator::{
    AllureCli, Collaborators, Coordinator, PlaywrightEngine, ReqwestTransport,
};

mod config;
mod poller;

use config::DaemonConfig;

/// How long cancelled runs get to record their terminal state at shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "testrund")]
#[command(about = "Test-run orchestrator daemon - API and browser test execution")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "testrund.toml")]
    config: PathBuf,

    /// Database path (overrides the configuration file)
    #[arg(long, env = "TESTRUN_DB")]
    db: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll for pending runs and stop requests until interrupted
    Serve,

    /// Execute one pending run in the foreground
    Execute {
        /// Run id
        #[arg(long)]
        run: i64,

        /// Restrict the run to these case ids
        #[arg(long = "case")]
        cases: Vec<i64>,
    },

    /// Ask a serving daemon to stop a run
    Stop {
        /// Run id
        #[arg(long)]
        run: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let mut config = DaemonConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    let db = Database::open(&config.db_path)?;

    match cli.command {
        Commands::Serve => serve(config, db).await,
        Commands::Execute { run, cases } => execute(config, db, run, cases).await,
        Commands::Stop { run } => {
            db.request_stop(run)?;
            println!("Stop requested for run {}", run);
            Ok(())
        }
    }
}

fn coordinator(config: &DaemonConfig, db: Database) -> anyhow::Result<Arc<Coordinator>> {
    let orchestrator = &config.orchestrator;
    let transport = ReqwestTransport::new().context("building HTTP client")?;

    Ok(Arc::new(Coordinator::new(
        orchestrator,
        Collaborators {
            store: Arc::new(db),
            transport: Arc::new(transport),
            browser: Arc::new(PlaywrightEngine::new(orchestrator.playwright.clone())),
            report_tool: Arc::new(AllureCli::new(
                &orchestrator.report,
                orchestrator.report_timeout(),
            )),
        },
    )))
}

async fn serve(config: DaemonConfig, db: Database) -> anyhow::Result<()> {
    info!("testrund v{}", testrun_common::VERSION);

    let coordinator = coordinator(&config, db.clone())?;
    let poller = Arc::new(poller::Poller::new(
        db,
        coordinator,
        config.orchestrator.max_concurrent_runs,
        config.poll_interval(),
    ));

    let mut poll_handle = {
        let poller = poller.clone();
        tokio::spawn(async move { poller.run().await })
    };

    info!(
        "Serving {} (up to {} concurrent runs)",
        config.db_path.display(),
        config.orchestrator.max_concurrent_runs
    );

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut poll_handle => {
            if let Err(e) = result {
                tracing::error!("Poller error: {}", e);
            }
        }
    }

    // No new dispatches while draining
    poll_handle.abort();

    let in_flight = poller.drain(SHUTDOWN_GRACE).await;
    if in_flight > 0 {
        warn!("{} run(s) still in flight at shutdown", in_flight);
    }

    info!("Daemon shutdown complete");
    Ok(())
}

async fn execute(config: DaemonConfig, db: Database, run_id: i64, cases: Vec<i64>) -> anyhow::Result<()> {
    let coordinator = coordinator(&config, db)?;
    let filter = if cases.is_empty() { None } else { Some(cases) };

    let mut handle = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.execute(run_id, filter.as_deref()).await })
    };

    let run = tokio::select! {
        joined = &mut handle => joined??,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted; cancelling run {}", run_id);
            coordinator.registry().cancel(run_id);
            handle.await??
        }
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "run": run.id,
            "status": run.status,
            "summary": run.result.as_ref().map(|r| r.summary),
            "cancelled": run.result.as_ref().map(|r| r.cancelled).unwrap_or(false),
            "report_path": run.report_path,
        }))?
    );
    Ok(())
}
