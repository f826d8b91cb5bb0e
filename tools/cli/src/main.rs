//! Offgrid CLI - Command line interface for the offline worker.
//!
//! This tool runs the worker as an offline-first HTTP front end and
//! exposes its queue, record log and cache operations one command at a
//! time.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use offgrid_cache::{Fetcher, HttpFetcher, Request};
use offgrid_storage::create_default_registry;
use offgrid_sync::{SimulatedDeliverer, SyncSource, SyncTriggerHandle};
use offgrid_worker::{router, FetchOutcome, OfflineWorker, WorkerConfig};

#[derive(Parser)]
#[command(name = "offgrid")]
#[command(about = "Offgrid - Offline-first request interception and alert delivery")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding the store (default: platform data dir).
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Store backend: "local" or "memory".
    #[arg(long, global = true, default_value = "local")]
    store: String,

    /// JSON worker configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker as an HTTP server.
    Serve {
        /// Address to listen on.
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        addr: String,

        /// Precache the manifest before serving.
        #[arg(long)]
        install: bool,
    },

    /// Precache the configured manifest.
    Install,

    /// Resolve a URL through the worker.
    Fetch {
        /// Absolute URL.
        url: String,
    },

    /// Queue an emergency alert.
    Alert {
        /// JSON payload.
        payload: String,
    },

    /// Append a background record.
    Record {
        /// JSON payload.
        payload: String,
    },

    /// Show the delivery queue.
    Queue,

    /// Show the background record log.
    Records,

    /// Empty the background record log.
    ClearRecords,

    /// Run one drain pass now.
    Drain,

    /// Remove alerts that reached the retry ceiling.
    PurgeAbandoned,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let (worker, handle) = open_worker(&cli)?;

    match cli.command {
        Commands::Serve { addr, install } => cmd_serve(worker, handle, &addr, install).await,
        Commands::Install => cmd_install(&worker).await,
        Commands::Fetch { url } => cmd_fetch(&worker, &url).await,
        Commands::Alert { payload } => cmd_alert(&worker, &payload).await,
        Commands::Record { payload } => cmd_record(&worker, &payload).await,
        Commands::Queue => cmd_queue(&worker).await,
        Commands::Records => cmd_records(&worker).await,
        Commands::ClearRecords => cmd_clear_records(&worker).await,
        Commands::Drain => cmd_drain(&worker).await,
        Commands::PurgeAbandoned => cmd_purge_abandoned(&worker).await,
    }
}

/// Build a worker from the command line options.
fn open_worker(cli: &Cli) -> Result<(OfflineWorker, SyncTriggerHandle)> {
    let config = match &cli.config {
        Some(path) => WorkerConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => WorkerConfig::default(),
    };

    let data_dir = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => dirs::data_dir()
            .context("No platform data directory; pass --data-dir")?
            .join("offgrid"),
    };

    let store = create_default_registry()
        .resolve(&cli.store, serde_json::json!({ "root": data_dir.to_string_lossy() }))
        .with_context(|| format!("Failed to open {} store", cli.store))?;
    let fetcher = Arc::new(
        HttpFetcher::new(config.fetch_timeout()).context("Failed to create HTTP client")?,
    );
    let deliverer = Arc::new(SimulatedDeliverer::new(
        config.delivery_latency(),
        config.delivery_failure_rate,
    ));

    OfflineWorker::new(config, store, fetcher, deliverer).context("Failed to create worker")
}

fn parse_payload(payload: &str) -> Result<Value> {
    serde_json::from_str(payload).context("Payload must be valid JSON")
}

/// Serve until Ctrl-C.
async fn cmd_serve(
    worker: OfflineWorker,
    handle: SyncTriggerHandle,
    addr: &str,
    install: bool,
) -> Result<()> {
    let worker = Arc::new(worker);
    let scheduler = tokio::spawn(handle.run(worker.coordinator()));

    if install {
        let stored = worker.install().await.context("Install failed")?;
        println!("Precached {} resources.", stored);
    }
    worker.activate().await.context("Activation failed")?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Serving {} on {}", worker.config().origin, addr);

    axum::serve(listener, router(worker.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("Server error")?;

    worker.trigger().shutdown().await;
    let _ = scheduler.await;
    worker.strategy().settle().await;
    Ok(())
}

async fn cmd_install(worker: &OfflineWorker) -> Result<()> {
    let stored = worker.install().await.context("Install failed")?;
    let removed = worker.activate().await.context("Activation failed")?;

    println!("Installed {} resources into {}", stored, worker.static_generation());
    if removed > 0 {
        println!("Removed {} entries from outdated caches", removed);
    }
    Ok(())
}

async fn cmd_fetch(worker: &OfflineWorker, url: &str) -> Result<()> {
    let request = Request::get(url).context("Invalid URL")?;

    let response = match worker.handle_fetch(&request).await {
        FetchOutcome::Response(response) => response,
        FetchOutcome::Passthrough => {
            println!("(not intercepted, fetching directly)");
            worker
                .fetcher()
                .fetch(&request)
                .await
                .context("Fetch failed")?
        }
        FetchOutcome::Unavailable => anyhow::bail!("Unavailable: offline and not cached"),
    };
    worker.strategy().settle().await;

    println!("Status: {}", response.status);
    for (name, value) in &response.headers {
        println!("  {}: {}", name, value);
    }
    println!();
    println!("{}", String::from_utf8_lossy(&response.body));
    Ok(())
}

async fn cmd_alert(worker: &OfflineWorker, payload: &str) -> Result<()> {
    let id = worker
        .queue_emergency_alert(parse_payload(payload)?)
        .await
        .context("Failed to queue alert")?;
    println!("Alert queued: {}", id);
    println!("Run `offgrid drain` or `offgrid serve` to deliver it.");
    Ok(())
}

async fn cmd_record(worker: &OfflineWorker, payload: &str) -> Result<()> {
    let id = worker
        .store_background_data(parse_payload(payload)?)
        .await
        .context("Failed to store record")?;
    println!("Record stored: {}", id);
    Ok(())
}

async fn cmd_queue(worker: &OfflineWorker) -> Result<()> {
    let items = worker.queue().list().await;
    if items.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    let ceiling = worker.config().max_attempts;
    println!("{} queued alerts:", items.len());
    for item in items {
        let state = if item.attempts >= ceiling {
            "abandoned"
        } else {
            "pending"
        };
        println!(
            "  {} [{}] {} attempts={} queued={}",
            item.id,
            state,
            item.alert_type().unwrap_or("-"),
            item.attempts,
            item.queued_at.to_rfc3339()
        );
    }
    Ok(())
}

async fn cmd_records(worker: &OfflineWorker) -> Result<()> {
    let records = worker.background_data().await;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

async fn cmd_clear_records(worker: &OfflineWorker) -> Result<()> {
    worker
        .clear_background_data()
        .await
        .context("Failed to clear records")?;
    println!("Background records cleared.");
    Ok(())
}

async fn cmd_drain(worker: &OfflineWorker) -> Result<()> {
    let report = worker
        .coordinator()
        .on_sync(SyncSource::OnDemand)
        .await
        .context("Drain failed")?;

    println!("Drain complete:");
    println!("  Delivered: {}", report.delivered);
    println!("  Failed:    {}", report.failed);
    println!("  Abandoned: {}", report.abandoned);
    println!("  Remaining: {}", report.remaining);
    Ok(())
}

async fn cmd_purge_abandoned(worker: &OfflineWorker) -> Result<()> {
    let purged = worker
        .queue()
        .purge_abandoned(worker.config().max_attempts)
        .await
        .context("Failed to purge queue")?;
    println!("Purged {} abandoned alerts.", purged.len());
    Ok(())
}
