//! aclctld - worker daemon
//!
//! Pulls build and deploy jobs from the shared queue until interrupted.
//! Any number of daemons may run against the same database; claims,
//! device leases and ledger appends are arbitrated by the store.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn, Level};

use aclctl_core::config::AclctlConfig;
use aclctl_core::coordinator::Coordinator;
use aclctl_core::worker::{WorkerPool, WorkerSettings};
use aclctl_core::{EnvCredentialStore, SshCommandSessionFactory};
use aclctl_state::{Stores, SurrealStore};

#[derive(Parser)]
#[command(name = "aclctld")]
#[command(about = "aclctl worker daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "ACLCTL_CONFIG")]
    config: Option<PathBuf>,

    /// Override worker.concurrency
    #[arg(short, long, env = "ACLCTL_WORKERS")]
    workers: Option<usize>,

    /// Log level
    #[arg(long, env = "ACLCTL_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, env = "ACLCTL_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    aclctl_core::init_tracing(cli.json, parse_level(&cli.log_level));

    let config = AclctlConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let mut settings = WorkerSettings::from_config(&config.worker);
    if let Some(n) = cli.workers {
        settings.concurrency = n.max(1);
    }

    let store = SurrealStore::from_env()
        .await
        .context("failed to connect to aclctl database")?;
    let stores = Stores::from_backend(Arc::new(store));

    let sessions = Arc::new(SshCommandSessionFactory::new(
        config.session.to_settings(),
        Arc::new(EnvCredentialStore::from_env()),
    ));
    let compiler = Arc::new(config.compiler.to_compiler());
    let coordinator = Arc::new(Coordinator::from_config(&config, stores, compiler, sessions));

    info!(
        version = aclctl_core::VERSION,
        workers = settings.concurrency,
        min_coverage = config.gate.min_coverage,
        "aclctld starting"
    );

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = tx.send(true);
    });

    WorkerPool::new(coordinator, settings).run(rx).await?;
    info!("aclctld stopped");
    Ok(())
}

fn parse_level(level: &str) -> Level {
    level.parse().unwrap_or(Level::INFO)
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, finishing jobs in flight"),
        _ = terminate => info!("Received terminate signal, finishing jobs in flight"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_falls_back_to_info() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("WARN"), Level::WARN);
        assert_eq!(parse_level("chatty"), Level::INFO);
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from(["aclctld", "--workers", "3", "--json", "-c", "lab.toml"])
            .unwrap();
        assert_eq!(cli.workers, Some(3));
        assert!(cli.json);
        assert_eq!(cli.config, Some(PathBuf::from("lab.toml")));
    }
}
