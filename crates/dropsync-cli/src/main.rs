use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dropsync_storage::PgStore;
use dropsync_sync::{build_runner, build_scheduler, database_url_from_env, SyncConfig};
use tracing::{error, info};
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "dropsync")]
#[command(about = "Sync free-game deals and notify interested users")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass and exit.
    Run,
    /// Apply database migrations.
    Migrate,
    /// Run sync passes on SYNC_CRON until interrupted.
    Schedule,
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing("dropsync=info")?;

    let cli = Cli::parse();
    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run().await,
        Commands::Migrate => migrate().await,
        Commands::Schedule => schedule().await,
    };

    if let Err(err) = &result {
        error!(error = ?err, "dropsync exited with an error");
    }
    result
}

async fn run() -> Result<()> {
    let summary = dropsync_sync::run_sync_once_from_env().await?;
    println!(
        "sync complete: run_id={} current={} new={} matched_users={} messages={} stale_deleted={}",
        summary.run_id,
        summary.current_deals,
        summary.new_deals,
        summary.matched_users,
        summary.dispatch.messages_sent,
        summary.cleanup.notifications_deleted
    );
    Ok(())
}

async fn migrate() -> Result<()> {
    let database_url = database_url_from_env()?;
    let store = PgStore::connect(&database_url)
        .await
        .context("connecting to database")?;
    store.migrate().await?;
    info!("migrations applied");
    Ok(())
}

async fn schedule() -> Result<()> {
    let config = SyncConfig::from_env()?;
    let runner = Arc::new(build_runner(&config).await?);
    let mut sched = build_scheduler(runner, &config.sync_cron).await?;

    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.sync_cron, "scheduler started");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
