use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tpa_sync::{JobKind, JobRunner, RunSummary, SyncConfig};
use tracing::error;

#[derive(Debug, Parser)]
#[command(name = "tpa-cli")]
#[command(about = "Themepark assistant background jobs")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check wait times of subscribed parks and notify subscribers.
    Waittimes,
    /// Import new attractions for the current hour's slice of parks.
    ImportAttractions {
        /// Invocation time (RFC 3339); defaults to now.
        #[arg(long, value_parser = parse_timestamp)]
        at: Option<DateTime<Utc>>,
        /// Cron descriptor the window is sized from; defaults to TPA_ATTRACTION_IMPORT_CRON.
        #[arg(long)]
        cron: Option<String>,
    },
    /// Add parks listed upstream that are not in the catalog yet.
    RefreshParks,
    /// Run whichever job is scheduled under the given cron descriptor.
    Trigger {
        #[arg(long)]
        cron: String,
        #[arg(long, value_parser = parse_timestamp)]
        at: Option<DateTime<Utc>>,
    },
    /// Run all jobs on their cron schedules until interrupted.
    Schedule,
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| format!("expected an RFC 3339 timestamp: {e}"))
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
    let runner = JobRunner::from_config(SyncConfig::from_env())
        .await
        .context("initialising job runner")?;

    let outcome = match cli.command.unwrap_or(Commands::Waittimes) {
        Commands::Waittimes => runner.run(JobKind::Waittimes, Utc::now()).await.map(Some),
        Commands::ImportAttractions { at, cron } => {
            let cron = cron.unwrap_or_else(|| runner.config().attraction_import_cron.clone());
            runner
                .run_with_cron(JobKind::AttractionImport, at.unwrap_or_else(Utc::now), &cron)
                .await
                .map(Some)
        }
        Commands::RefreshParks => runner.run(JobKind::ParkRefresh, Utc::now()).await.map(Some),
        Commands::Trigger { cron, at } => {
            runner.run_routed(&cron, at.unwrap_or_else(Utc::now)).await
        }
        Commands::Schedule => {
            tpa_sync::run_scheduler(Arc::new(runner)).await?;
            return Ok(());
        }
    };

    match outcome {
        Ok(Some(summary)) => report(&summary),
        Ok(None) => {}
        Err(err) => {
            error!(error = %format!("{err:#}"), "job failed");
            return Err(err);
        }
    }
    Ok(())
}

fn report(summary: &RunSummary) {
    for failure in summary.failures() {
        eprintln!("skipped {} ({}): {}", failure.park, failure.kind, failure.message);
    }
    println!("job complete: {}", summary.describe());
}
