use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use seatwatch_storage::SeatStore;
use seatwatch_sync::{SyncConfig, SyncService};
use seatwatch_web::AppState;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "seatwatch")]
#[command(about = "Library seat availability watcher")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the web API together with the scheduled ingest jobs.
    Serve,
    /// Run a single ingest cycle and exit.
    Sync,
    /// Run the history retention sweep and exit.
    Sweep,
    /// Wipe snapshots and history and reseed from the sample dataset.
    ResetDb,
}

async fn build_service() -> Result<SyncService> {
    let config = SyncConfig::from_env();
    let store = SeatStore::connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;
    store.migrate().await.context("running schema migration")?;
    SyncService::new(config, store)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let service = build_service().await?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let scheduler = service.build_scheduler().await?;
            scheduler.start().await.context("starting scheduler")?;
            info!(
                scheduler_enabled = service.ingest.is_enabled(),
                port = service.config.web_port,
                "seatwatch starting"
            );
            let port = service.config.web_port;
            seatwatch_web::serve(AppState::new(Arc::new(service)), port).await?;
        }
        Commands::Sync => {
            let report = service.ingest.ingest_now(service.config.local_now()).await?;
            println!(
                "ingest complete: source={:?} records={}",
                report.source,
                report.records.len()
            );
        }
        Commands::Sweep => {
            let report = service.sweeper.sweep(service.config.local_now()).await?;
            println!(
                "sweep complete: candidates={} deleted={}",
                report.candidates, report.deleted
            );
        }
        Commands::ResetDb => {
            let now = service.config.local_now();
            let seed = seatwatch_upstream::normalize(seatwatch_upstream::FALLBACK_PAYLOAD, now)
                .context("parsing sample dataset")?;
            service.store.reset_and_seed(&seed).await?;
            println!("database reset: seeded {} areas", seed.len());
        }
    }

    Ok(())
}
