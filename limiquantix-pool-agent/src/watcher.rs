//! Pool Watcher - periodic reconciliation of one pool into one cluster.
//!
//! Runs a full sync on start, then a delta sync every `sync_interval`.
//! Each delta's change set is logged; a pass that could not read the pool
//! is skipped and the next tick starts from a fresh connection.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use limiquantix_pool::{
    ClusterReconciler, Credentials, RemoteConnection, SessionPool, VmStateChange,
};

use crate::config::{ClusterConfig, PoolConfig};

pub struct PoolWatcher {
    pool: Arc<SessionPool>,
    reconciler: ClusterReconciler,
    pool_config: PoolConfig,
    cluster: ClusterConfig,
    credentials: Credentials,
}

impl PoolWatcher {
    pub fn new(
        pool: Arc<SessionPool>,
        reconciler: ClusterReconciler,
        pool_config: PoolConfig,
        cluster: ClusterConfig,
    ) -> Self {
        let credentials = pool_config.credentials();
        Self {
            pool,
            reconciler,
            pool_config,
            cluster,
            credentials,
        }
    }

    async fn connect(&self) -> limiquantix_pool::Result<Arc<RemoteConnection>> {
        self.pool
            .get_connection(&self.pool_config.id, &self.pool_config.address, &self.credentials)
            .await
    }

    /// Connect, check mastership and rebuild the cluster table.
    ///
    /// The full sync belongs to the pool master. When `master_host_uuid` is
    /// configured and names another host, the table is left as it is and
    /// the first delta pass fills it in. Returns the number of VMs loaded.
    #[instrument(skip(self), fields(pool_id = %self.pool_config.id, cluster = %self.cluster.id))]
    pub async fn initial_sync(&self) -> Result<usize> {
        let conn = self.connect().await.context("Failed to connect to pool")?;

        if let Some(expected) = &self.pool_config.master_host_uuid {
            let is_master = self
                .reconciler
                .is_pool_master(&conn, expected)
                .await
                .context("Failed to query pool master")?;
            if !is_master {
                warn!(
                    host = %expected,
                    master = %conn.master_address(),
                    "Configured host is not pool master, skipping full sync"
                );
                return Ok(0);
            }
            info!(host = %expected, "Configured host is pool master");
        }

        let table = self
            .reconciler
            .full_sync(&self.cluster.id, &conn)
            .await
            .context("Full sync failed")?;
        Ok(table.len())
    }

    /// One delta pass. `None` when the pool could not be read.
    pub async fn sync_once(&self) -> Option<Vec<VmStateChange>> {
        let conn = match self.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(pool_id = %self.pool_config.id, error = %e, "Cannot connect to pool, skipping sync");
                return None;
            }
        };

        let changes = self.reconciler.delta_sync(&self.cluster.id, &conn).await?;
        for change in &changes {
            info!(
                cluster = %self.cluster.id,
                vm = %change.vm,
                host = change.host.as_deref().unwrap_or("-"),
                state = %change.state,
                "VM state changed"
            );
        }
        Some(changes)
    }

    /// Delta-sync on every tick until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let period = self.cluster.sync_interval();
        info!(
            pool_id = %self.pool_config.id,
            cluster = %self.cluster.id,
            interval_secs = period.as_secs(),
            "Starting pool watcher"
        );

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the initial sync already covered the first tick
        ticker.tick().await;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sync_once().await {
                        Some(changes) => debug!(change_count = changes.len(), "Delta sync pass finished"),
                        None => debug!("Delta sync pass skipped"),
                    }
                }
                _ = &mut shutdown => {
                    info!("Pool watcher stopping");
                    break;
                }
            }
        }
    }
}
