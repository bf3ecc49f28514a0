//! procsyncd - replication daemon
//!
//! Usage:
//!   procsyncd --config sync.json
//!   procsyncd --config sync.json --quiet
//!   procsyncd --config sync.json --check

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use procsync::prelude::*;

#[derive(Parser)]
#[command(name = "procsyncd")]
#[command(version, about = "Incremental stored-procedure replication between SQL databases")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Suppress per-run sync statistics
    #[arg(short, long)]
    quiet: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging();

    let settings = Settings::from_file(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    let jobs = bind_jobs(&settings).context("invalid configuration")?;

    if cli.check {
        println!("configuration valid: {} job(s)", jobs.len());
        for job in &jobs {
            let pair = job.pair.lock().await;
            println!(
                "  {} ({} -> {}) every {}, {} destination(s)",
                job.origin,
                pair.source.db_type,
                pair.target.db_type,
                humantime::format_duration(job.period),
                pair.dest.len()
            );
        }
        return Ok(());
    }

    if jobs.is_empty() {
        warn!("no jobs configured, nothing to do");
        return Ok(());
    }

    let factory: Arc<dyn ConnectionFactory> = Arc::new(DriverConnectionFactory);
    let cancel = CancellationToken::new();

    // load persisted resume values; a missing or unreachable sync table
    // leaves the configured start values in place
    for job in &jobs {
        let mut pair = job.pair.lock().await;
        if let Err(e) = engine::init(&mut pair, factory.as_ref(), &cancel).await {
            warn!(origin = %job.origin, "resume value load failed: {}", e);
        }
    }

    let scheduler = Scheduler::new(jobs, factory, cancel.clone(), cli.quiet);

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received, cancelling in-flight runs");
        cancel.cancel();
    });

    scheduler.run().await?;
    info!("terminated");
    Ok(())
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
