//! Vessel Supervisor - container runtime supervisor daemon
//!
//! Owns the authoritative model of all containers on this host, serialises
//! every state change through one event loop, and journals every observable
//! event for subscribers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};

use vessel_supervisor::config::Configuration;
use vessel_supervisor::monitor::OomNotifier;
use vessel_supervisor::runtime::bundle::BundleRuntime;
use vessel_supervisor::supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "vessel-supervisor")]
#[command(about = "Vessel container supervisor daemon")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the state directory
    #[arg(short, long)]
    state_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("vessel_supervisor={}", log_level).into()),
        )
        .init();

    info!("Starting Vessel supervisor v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &cli.config {
        Some(path) => Configuration::load(path)?,
        None => Configuration::default(),
    };
    if let Some(state_dir) = cli.state_dir {
        config.state_dir = state_dir;
    }
    config.ensure_directories()?;

    if let Err(e) = run(config).await {
        error!("Supervisor error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(config: Configuration) -> Result<()> {
    info!("  State directory: {}", config.state_dir.display());
    info!("  Task queue capacity: {}", config.task_capacity);

    let runtime = Arc::new(BundleRuntime::new(config.state_dir.clone()));
    let (mut supervisor, handle) = Supervisor::new(&config, runtime)?;

    // Rebuild state before accepting any external task
    supervisor.restore().await?;

    let mut oom_notifications = None;
    let oom_notifier = if config.oom.enabled {
        let notifier = OomNotifier::new(config.state_dir.clone(), config.oom.poll_interval());
        oom_notifications = notifier.notifications();
        Some(notifier)
    } else {
        None
    };

    let mut event_loop = supervisor.start(oom_notifications);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("Received shutdown signal, stopping supervisor...");
            handle.stop();
            if let Some(notifier) = oom_notifier {
                notifier.shutdown();
            }
            event_loop.await?;
        }
        result = &mut event_loop => {
            // A handler panic is fatal; the daemon restarts under its
            // service manager
            result?;
            anyhow::bail!("event loop exited unexpectedly");
        }
    }

    let snapshot = handle.metrics();
    info!(
        "Shutdown complete: {} tasks dispatched, {} events journalled",
        snapshot.tasks, snapshot.events
    );
    Ok(())
}
