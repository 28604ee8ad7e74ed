//! In-memory `(cluster, vm) -> (host, power state)` table.
//!
//! Written optimistically by command handlers and authoritatively by the
//! reconciler. Every cluster has its own mutex, so work on one cluster never
//! contends with another. Nothing here talks to the pool and nothing is
//! persisted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tracing::trace;

use crate::error::{PoolError, Result};
use crate::types::{PowerState, VmStateEntry};

/// Point-in-time copy of one cluster's entries, keyed by VM name.
pub type ClusterSnapshot = HashMap<String, VmStateEntry>;

/// Entries of one cluster. Only reachable while holding that cluster's lock.
#[derive(Debug, Default)]
pub struct ClusterEntries {
    entries: HashMap<String, VmStateEntry>,
}

impl ClusterEntries {
    pub fn get(&self, vm: &str) -> Option<&VmStateEntry> {
        self.entries.get(vm)
    }

    /// Insert or overwrite, bumping the entry version. Returns the previous entry.
    pub fn put(&mut self, vm: &str, host: Option<String>, state: PowerState) -> Option<VmStateEntry> {
        let version = self.entries.get(vm).map(|e| e.version + 1).unwrap_or(1);
        self.entries.insert(vm.to_string(), VmStateEntry {
            host,
            state,
            version,
            last_seen: Utc::now(),
        })
    }

    pub fn remove(&mut self, vm: &str) -> Option<VmStateEntry> {
        self.entries.remove(vm)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &VmStateEntry)> {
        self.entries.iter()
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        self.entries.clone()
    }
}

/// Process-wide VM state table, locked per cluster.
#[derive(Default)]
pub struct VmStateTable {
    clusters: RwLock<HashMap<String, Arc<Mutex<ClusterEntries>>>>,
}

impl VmStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn cluster(&self, cluster: &str) -> Result<Arc<Mutex<ClusterEntries>>> {
        {
            let clusters = self
                .clusters
                .read()
                .map_err(|_| PoolError::Internal("Lock poisoned".to_string()))?;
            if let Some(entries) = clusters.get(cluster) {
                return Ok(entries.clone());
            }
        }
        let mut clusters = self
            .clusters
            .write()
            .map_err(|_| PoolError::Internal("Lock poisoned".to_string()))?;
        Ok(clusters.entry(cluster.to_string()).or_default().clone())
    }

    /// Run `f` with exclusive access to one cluster's entries.
    pub fn with_cluster<R>(&self, cluster: &str, f: impl FnOnce(&mut ClusterEntries) -> R) -> Result<R> {
        let entries = self.cluster(cluster)?;
        let mut guard = entries
            .lock()
            .map_err(|_| PoolError::Internal("Lock poisoned".to_string()))?;
        Ok(f(&mut *guard))
    }

    pub fn get(&self, cluster: &str, vm: &str) -> Result<Option<VmStateEntry>> {
        self.with_cluster(cluster, |entries| entries.get(vm).cloned())
    }

    /// Record `vm` on `host` in `state`. Returns the previous entry.
    pub fn put(
        &self,
        cluster: &str,
        host: Option<&str>,
        vm: &str,
        state: PowerState,
    ) -> Result<Option<VmStateEntry>> {
        trace!(cluster = %cluster, vm = %vm, host = ?host, state = %state, "VM state written");
        self.with_cluster(cluster, |entries| entries.put(vm, host.map(str::to_string), state))
    }

    pub fn remove(&self, cluster: &str, vm: &str) -> Result<Option<VmStateEntry>> {
        self.with_cluster(cluster, |entries| entries.remove(vm))
    }

    pub fn snapshot(&self, cluster: &str) -> Result<ClusterSnapshot> {
        self.with_cluster(cluster, |entries| entries.snapshot())
    }

    pub fn clear(&self, cluster: &str) -> Result<()> {
        self.with_cluster(cluster, ClusterEntries::clear)
    }

    /// Atomically replace a cluster's contents.
    pub fn replace<I>(&self, cluster: &str, vms: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, Option<String>, PowerState)>,
    {
        self.with_cluster(cluster, |entries| {
            entries.clear();
            for (vm, host, state) in vms {
                entries.put(&vm, host, state);
            }
        })
    }

    /// Clusters with a table, in no particular order.
    pub fn clusters(&self) -> Vec<String> {
        self.clusters
            .read()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }
}
