use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use atomsink::clock;
use atomsink::config::Config;
use atomsink::export::health::HealthMetrics;
use atomsink::filter::EventFilter;
use atomsink::processor::{Broadcasters, LogEventProcessor};
use atomsink::pullers::PullerManager;
use atomsink::state::StateManager;
use atomsink::stats::ProcessorStats;
use atomsink::storage::restricted::DiskRestrictedStore;
use atomsink::storage::Storage;
use atomsink::uid::UidMap;
use atomsink::{DumpLatency, DumpReportReason};

/// Device-side telemetry aggregation daemon.
#[derive(Parser)]
#[command(name = "atomsink", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("atomsink {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting atomsink");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let storage = Arc::new(Storage::open(&cfg.storage.root).context("opening storage")?);
    let restricted_store = Arc::new(
        DiskRestrictedStore::open(storage.restricted_dir()).context("opening restricted store")?,
    );

    let uid_map = Arc::new(UidMap::new());
    let stats = Arc::new(ProcessorStats::new(clock::wall_clock_sec()));
    let pullers = Arc::new(PullerManager::new(
        cfg.guardrails.puller_cache_clear_interval_sec() * clock::NS_PER_SEC,
    ));
    let anomaly_monitor = Arc::new(atomsink::clock::AlarmMonitor::unbacked());
    let periodic_monitor = Arc::new(atomsink::clock::AlarmMonitor::unbacked());
    let event_filter = Arc::new(EventFilter::new());
    let state_manager = Arc::new(StateManager::new());

    // The RPC surface that delivers these broadcasts lives outside this
    // daemon; log them until it attaches.
    let broadcasters = Broadcasters {
        send_broadcast: Box::new(|key| {
            tracing::debug!(key = %key, "data-fetch broadcast requested");
            false
        }),
        send_activation_broadcast: Box::new(|uid, ids| {
            tracing::debug!(uid, configs = ids.len(), "activation broadcast requested");
            false
        }),
        send_restricted_metrics_broadcast: Box::new(|key, delegate, ids| {
            tracing::debug!(key = %key, delegate, metrics = ids.len(), "restricted metrics broadcast");
        }),
        check_train_permission: Box::new(|_, _| true),
    };

    let processor = Arc::new(LogEventProcessor::new(
        Arc::clone(&uid_map),
        pullers,
        anomaly_monitor,
        periodic_monitor,
        Arc::clone(&stats),
        state_manager,
        storage,
        restricted_store,
        event_filter,
        clock::elapsed_ns(),
        cfg.guardrails.clone(),
        cfg.restricted_metrics_enabled,
        broadcasters,
    ));

    // Restore the previous boot's state before any events flow.
    processor.load_active_configs_from_disk();
    processor.load_metadata_from_disk(clock::wall_clock_ns(), clock::elapsed_ns());
    processor.on_statsd_init_completed(clock::elapsed_ns());

    let health = Arc::new(
        HealthMetrics::new(&cfg.health.addr, Arc::clone(&stats)).context("building health metrics")?,
    );
    Arc::clone(&health).start().await?;

    // Periodic persistence so a hard power cut loses little.
    let persist_processor = Arc::clone(&processor);
    let persist_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            persist_processor.save_active_configs_to_disk(clock::elapsed_ns());
            persist_processor.save_metadata_to_disk(clock::wall_clock_ns(), clock::elapsed_ns());
        }
    });

    // Wait for shutdown.
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    persist_task.abort();

    // Persist everything the next boot needs.
    processor.write_data_to_disk(
        DumpReportReason::TerminationSignal,
        DumpLatency::NoTimeConstraints,
        clock::elapsed_ns(),
        clock::wall_clock_ns(),
    );
    processor.save_active_configs_to_disk(clock::elapsed_ns());
    processor.save_metadata_to_disk(clock::wall_clock_ns(), clock::elapsed_ns());

    health.stop();
    tracing::info!("atomsink stopped");

    Ok(())
}
