use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use gridpulse_feed::{persist_copy, RawTable};
use gridpulse_sync::{SyncConfig, SyncPipeline};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gridpulse")]
#[command(about = "Fetch the outage feed and reconcile it into Postgres")]
struct Cli {
    /// Print the run summary as JSON instead of a single line.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One fetch, transform and reconcile cycle.
    Sync,
    /// Transform a feed without touching the database.
    Transform(TransformArgs),
}

#[derive(Debug, Args)]
struct TransformArgs {
    /// Read this CSV instead of fetching the live feed.
    #[arg(long)]
    input: Option<PathBuf>,
    /// Also write the raw feed bytes here.
    #[arg(long)]
    save: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => sync(cli.json).await,
        Commands::Transform(args) => transform(args, cli.json).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = format!("{err:#}"), "gridpulse failed");
            ExitCode::FAILURE
        }
    }
}

async fn sync(json: bool) -> Result<()> {
    let summary = gridpulse_sync::run_sync_once_from_env().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "sync complete: run_id={} feed={} fetched_at={} rows={} outages={} postcodes={} links={} marked_historical={} new_postcodes={} new_links={} unknown_categories={}",
            summary.run_id,
            summary.feed_url,
            summary.fetched_at.to_rfc3339(),
            summary.feed_rows,
            summary.counts.outage,
            summary.counts.postcode,
            summary.counts.outage_postcode_link,
            summary.counts.marked_historical,
            summary.counts.new_postcodes,
            summary.counts.new_links,
            summary.unknown_categories.len(),
        );
    }
    Ok(())
}

async fn transform(args: TransformArgs, json: bool) -> Result<()> {
    let pipeline = SyncPipeline::new(SyncConfig::from_env()?)?;
    let table = match &args.input {
        Some(path) => read_local_feed(path, args.save.as_deref()).await?,
        None => pipeline.fetch(args.save.as_deref()).await?.table,
    };

    let preview = pipeline.preview(&table).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&preview)?);
    } else {
        println!(
            "transform complete: rows={} outages={} current={} historical={} postcodes={} links={} unknown_categories={:?}",
            preview.feed_rows,
            preview.counts.outage,
            preview.current,
            preview.historical,
            preview.counts.postcode,
            preview.counts.outage_postcode_link,
            preview.unknown_categories,
        );
    }
    Ok(())
}

async fn read_local_feed(path: &Path, save: Option<&Path>) -> Result<RawTable> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let table = RawTable::from_csv_bytes(&bytes)
        .with_context(|| format!("parsing {}", path.display()))?;
    info!(path = %path.display(), rows = table.len(), "read local feed");

    if let Some(save) = save {
        if let Err(err) = persist_copy(save, &bytes).await {
            warn!(path = %save.display(), error = %err, "could not save feed copy; continuing");
        }
    }
    Ok(table)
}
