//! enrollment-daemon: runs a simulated DIF and enrolls its members.
//!
//! Every configured process gets its own enrollment engine. They talk over an
//! in-memory flow fabric, so the whole enrollment exchange, the watchdog and
//! the background enroller can be watched in the logs.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use enrollment_daemon::{DaemonConfig, Simulation};

#[derive(Parser, Debug)]
#[command(name = "enrollment-daemon")]
#[command(about = "Simulated DIF enrollment daemon")]
struct Args {
    /// Directory holding enrollment.json
    #[arg(short, long, default_value = ".")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Stop after this many seconds instead of waiting for Ctrl+C
    #[arg(long)]
    run_for: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "info,enrollment_daemon=debug,enrollment_core=debug"
    } else {
        "info,enrollment_daemon=info,enrollment_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting enrollment-daemon");
    info!("Config directory: {:?}", args.config);

    let config = DaemonConfig::load_or_init(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    let mut simulation = Simulation::start(config)?;

    // Log every node's events
    let mut loggers = Vec::new();
    for node in simulation.nodes() {
        let name = node.name().to_string();
        let mut events = node.subscribe();
        loggers.push(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match serde_json::to_string(&event) {
                    Ok(json) => info!("[{}] {}", name, json),
                    Err(e) => error!("[{}] unserializable event: {}", name, e),
                }
            }
        }));
    }

    let requested = simulation.enroll_configured_neighbors()?;
    info!("Requested {} enrollment(s)", requested);

    let deadline = async {
        match args.run_for {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };

    info!("Daemon running. Press Ctrl+C to stop.");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        _ = deadline => info!("Run time elapsed"),
    }

    info!("Shutting down");
    for logger in &loggers {
        logger.abort();
    }
    simulation.shutdown().await;
    Ok(())
}
