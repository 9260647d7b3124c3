use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mender_daemon::config::MenderConfig;
use mender_engine::BackgroundSweeper;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Mender remediation daemon.
#[derive(Parser, Debug)]
#[command(name = "mender-daemon", about = "Runs Mender's periodic remediation sweeps")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "MENDER_CONFIG", default_value = "mender.toml")]
    config: PathBuf,

    /// Run every sweep once and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = MenderConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    mender_daemon::telemetry::init(&config.logging);
    if !cli.config.exists() {
        info!(path = %cli.config.display(), "config file not found, using defaults");
    }

    let engine = Arc::new(mender_daemon::build_engine(&config).context("building engine")?);
    let sweep_config = config.background.sweep_config();
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let mut sweeper = BackgroundSweeper::new(Arc::clone(&engine), sweep_config, shutdown_rx);

    if cli.once {
        let report = sweeper.run_once().await;
        info!(
            expired = report.expired,
            escalated = report.escalated,
            retried = report.retried,
            "sweeps complete"
        );
        println!("{}", serde_json::to_string(&report)?);
        return Ok(());
    }

    let handle = tokio::spawn(async move { sweeper.run().await });

    shutdown_signal().await?;
    // The receiver is gone only if the sweeper already stopped.
    let _ = shutdown_tx.send(()).await;
    handle.await.context("sweeper task panicked")?;
    if let Err(e) = engine.flush_audit_backlog().await {
        warn!(backlog = engine.audit_backlog_len(), error = %e, "audit entries lost on shutdown");
    }
    info!(metrics = ?engine.metrics(), "mender-daemon stopped");
    Ok(())
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("installing SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("installing Ctrl+C handler")?;
                info!("received SIGINT");
            }
            _ = terminate.recv() => info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("installing Ctrl+C handler")?;
        info!("received SIGINT");
    }
    Ok(())
}
