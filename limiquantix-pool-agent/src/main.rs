//! # limiquantix Pool Agent
//!
//! Keeps a cluster's VM power state table in step with a hypervisor pool.
//! Connects through the pool master (following redirects), rebuilds the
//! table with a full sync, then reports changes with periodic delta syncs.
//!
//! ## Usage
//! ```bash
//! limiquantix-pool-agent --config /etc/limiquantix/pool.yaml
//! limiquantix-pool-agent --dev --once
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use limiquantix_pool::{
    ClusterReconciler, JsonRpcTransport, PoolTransport, SessionPool, VmStateTable,
};

mod cli;
mod config;
mod dev;
mod watcher;

use cli::Args;
use config::Config;
use watcher::PoolWatcher;

const DEFAULT_CONFIG_PATH: &str = "/etc/limiquantix/pool.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration before logging so the file can pick the format
    let (config, source) = match &args.config {
        Some(path) => (Config::load(path)?, Some(path.clone())),
        None => match Config::load(DEFAULT_CONFIG_PATH) {
            Ok(cfg) => (cfg, Some(DEFAULT_CONFIG_PATH.to_string())),
            Err(_) => (Config::default(), None),
        },
    };
    let mut config = config.with_cli_overrides(&args);

    limiquantix_common::init_logging(&config.logging.level, config.logging.format)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting limiquantix Pool Agent"
    );
    match &source {
        Some(path) => info!(config_path = %path, "Configuration loaded"),
        None => info!("No configuration file found, using defaults"),
    }

    // Build the transport
    let mut drift = None;
    let transport: Arc<dyn PoolTransport> = if config.dev_mode {
        warn!("Development mode: using in-memory mock pool");
        let mock = dev::seeded_pool(&mut config.pool);
        drift = Some(dev::spawn_drift(mock.clone(), config.cluster.sync_interval()));
        mock
    } else {
        let transport = JsonRpcTransport::new(
            config.connection.request_timeout(),
            config.pool.accept_invalid_certs,
        )
        .context("Failed to create pool transport")?;
        Arc::new(transport)
    };

    if config.pool.passwords.is_empty() {
        anyhow::bail!("No pool passwords configured (pool.passwords)");
    }

    let pool = Arc::new(SessionPool::new(transport, config.connection.clone()));
    let reconciler = ClusterReconciler::new(Arc::new(VmStateTable::new()), config.reconcile.clone());
    let watcher = PoolWatcher::new(
        pool.clone(),
        reconciler,
        config.pool.clone(),
        config.cluster.clone(),
    );

    let vm_count = match watcher.initial_sync().await {
        Ok(count) => count,
        Err(e) => {
            error!(error = %e, "Initial sync failed");
            pool.shutdown().await;
            return Err(e);
        }
    };
    info!(vm_count, cluster = %config.cluster.id, "Initial sync completed");

    if args.once {
        if let Some(changes) = watcher.sync_once().await {
            info!(change_count = changes.len(), "Single delta sync completed");
        }
    } else {
        watcher
            .run(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "Failed to listen for shutdown signal");
                    std::future::pending::<()>().await;
                }
                info!("Shutdown signal received");
            })
            .await;
    }

    if let Some(drift) = drift {
        drift.abort();
    }
    pool.shutdown().await;
    info!("Pool agent stopped");
    Ok(())
}
