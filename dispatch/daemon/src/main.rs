//! Dispatch Daemon - Load Driver for the Dispatch Core
//!
//! Wires a [`Dispatcher`] to a set of simulated providers and feeds it a
//! steady stream of requests, logging what happens. Useful for watching
//! queueing, pooling, retries and health tracking behave under load without
//! a real model backend.
//!
//! # Usage
//!
//! ```bash
//! # Two providers, 5 requests/s, until Ctrl-C
//! dispatch-daemon
//!
//! # 200 requests across 3 providers, with a transient failure every 10th
//! dispatch-daemon --providers 3 --requests 200 --fail-every 10
//!
//! # With config file, events as JSON lines on stdout
//! dispatch-daemon --config ./dispatch.toml --json
//!
//! # Verbose logging
//! RUST_LOG=debug dispatch-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: stop submitting, shut the dispatcher down, print
//!   the summary

mod load;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use dispatch_core::{
    load_config, load_config_from_path, DispatchEvent, Dispatcher, SimulatedBehavior,
    SimulatedProviderFactory,
};

use load::{LoadGenerator, LoadPlan};

/// Dispatch Daemon - drive the dispatch core with simulated providers
#[derive(Parser, Debug)]
#[command(name = "dispatch-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "DISPATCH_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of simulated providers to register
    #[arg(short = 'p', long, default_value_t = 2)]
    providers: usize,

    /// Requests to submit before exiting (0 runs until a signal)
    #[arg(short = 'n', long, default_value_t = 0)]
    requests: u64,

    /// Requests submitted per second
    #[arg(short = 'r', long, default_value_t = 5.0)]
    rate: f64,

    /// Simulated completion latency in milliseconds
    #[arg(long, default_value_t = 250)]
    latency_ms: u64,

    /// Script a transient provider failure before every Nth request (0 disables)
    #[arg(long, default_value_t = 0)]
    fail_every: u64,

    /// Print dispatch events and the final summary as JSON lines on stdout
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "DISPATCH_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Initialize logging with the specified level
///
/// Logs go to stderr so JSON output on stdout stays machine-readable.
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "dispatch_daemon={level},dispatch_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Resolve once SIGTERM or SIGINT arrives
async fn wait_for_signal() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

/// Forward dispatch events to stdout (JSON) or the debug log
async fn print_events(mut events: broadcast::Receiver<DispatchEvent>, json: bool) {
    loop {
        match events.recv().await {
            Ok(event) if json => match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, event = event.name(), "Failed to encode event"),
            },
            Ok(event) => debug!(
                event = event.name(),
                request_id = ?event.request_id(),
                provider = ?event.provider_id(),
                "Dispatch event"
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event printer fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Dispatch Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match args.config.as_deref() {
        Some(path) => load_config_from_path(Some(path)),
        None => load_config(),
    }
    .context("Failed to load configuration")?;
    info!(source = %config.source(), path = ?config.config_file_path, "Configuration loaded");

    if args.providers == 0 {
        anyhow::bail!("--providers must be at least 1");
    }
    if args.rate.is_nan() || args.rate <= 0.0 {
        anyhow::bail!("--rate must be positive");
    }

    let dispatcher = Dispatcher::new(config);
    let printer = tokio::spawn(print_events(dispatcher.subscribe(), args.json));

    let behavior = SimulatedBehavior::default().with_latency(Duration::from_millis(args.latency_ms));
    let mut scripts = Vec::with_capacity(args.providers);
    for i in 1..=args.providers {
        let factory = SimulatedProviderFactory::new(behavior.clone());
        scripts.push(Arc::clone(factory.script()));
        dispatcher
            .add_provider(factory.spec(format!("sim-{i}")), Arc::new(factory))
            .with_context(|| format!("Failed to register provider sim-{i}"))?;
    }
    info!(providers = args.providers, latency_ms = args.latency_ms, "Simulated providers registered");

    dispatcher.start();

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(name) => info!("Received {name}, initiating shutdown"),
            Err(e) => error!(error = %e, "Signal handling unavailable, stopping"),
        }
        let _ = stop_tx.send(true);
    });

    let plan = LoadPlan {
        requests: (args.requests > 0).then_some(args.requests),
        rate: args.rate,
        fail_every: (args.fail_every > 0).then_some(args.fail_every),
    };
    let generator = LoadGenerator::new(Arc::clone(&dispatcher), scripts, plan);
    let summary = generator.run(stop_rx).await;

    info!("Shutting down...");
    dispatcher.shutdown().await;
    printer.abort();

    let snapshots = dispatcher.metrics().all_snapshots();
    if args.json {
        println!("{}", serde_json::to_string(&summary)?);
        for snapshot in &snapshots {
            println!("{}", serde_json::to_string(snapshot)?);
        }
    } else {
        for snapshot in &snapshots {
            info!(
                provider = %snapshot.provider_id,
                requests = snapshot.request_count,
                errors = snapshot.error_count,
                avg_latency_ms = snapshot.avg_latency_ms,
                p99_latency_ms = snapshot.p99_latency_ms,
                health = snapshot.health.label(),
                "Provider metrics"
            );
        }
        print!("{}", dispatcher.metrics().to_prometheus());
    }

    info!("Dispatch daemon stopped cleanly");
    Ok(())
}
