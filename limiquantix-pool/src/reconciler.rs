//! Cluster VM state reconciliation.
//!
//! Two passes against the pool:
//! - **full sync**: rebuild a cluster's table from one scan, no diff;
//! - **delta sync**: diff a fresh scan against the table and return only
//!   the changes, resolving races with optimistic writes from command
//!   handlers through [`decide`].
//!
//! Remote queries run without the cluster lock held. The diff is then
//! applied under the lock against whatever the table holds at that moment,
//! so a command that wrote in between is judged on its own write.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::config::ReconcileSettings;
use crate::connection::RemoteConnection;
use crate::error::Result;
use crate::state_table::{ClusterSnapshot, VmStateTable};
use crate::types::{ObservedVm, PowerState, VmStateChange, VmStateEntry};

/// Reference value the pool uses for "no object".
const NULL_REF: &str = "OpaqueRef:NULL";

#[derive(Debug, Deserialize)]
struct VmRecord {
    name_label: String,
    power_state: String,
    #[serde(default)]
    resident_on: Option<String>,
    #[serde(default)]
    is_a_template: bool,
    #[serde(default)]
    is_a_snapshot: bool,
    #[serde(default)]
    is_control_domain: bool,
}

#[derive(Debug, Deserialize)]
struct HostRecord {
    uuid: String,
}

/// What delta sync does with one observed VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Cached entry already matches.
    Unchanged,
    /// Take the observed state and report it.
    Adopt,
    /// Keep the cached transitional state; the scan is lagging.
    Suppress,
    /// Observed halted; only adopt after a point query agrees.
    ConfirmStop,
}

/// Transition policy for an observed VM against its cached entry.
pub fn decide(cached: Option<&VmStateEntry>, observed: &ObservedVm) -> Decision {
    use PowerState::*;

    let Some(cached) = cached else {
        return Decision::Adopt;
    };

    match (cached.state, observed.state) {
        (Starting, Running) => return Decision::Adopt,
        (Starting, Stopped) => return Decision::Suppress,
        (Migrating, Running) => return Decision::Adopt,
        (Stopping, Stopped) => return Decision::Adopt,
        (Stopping, Running) => return Decision::Suppress,
        _ => {}
    }

    if cached.host != observed.host && !observed.state.is_stopped_or_stopping() {
        return Decision::Adopt;
    }
    if observed.state == Stopped && !cached.state.is_stopped_or_stopping() {
        return Decision::ConfirmStop;
    }
    if cached.state != observed.state {
        return Decision::Adopt;
    }
    Decision::Unchanged
}

/// What delta sync does with a cached VM missing from the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Vanished {
    /// Not visible yet; leave the entry alone.
    Keep,
    /// Expected to disappear; remove without reporting.
    Drop,
    /// Disappeared unexpectedly; remove and report as stopped.
    ReportStopped,
}

fn vanished(state: PowerState) -> Vanished {
    match state {
        PowerState::Starting => Vanished::Keep,
        PowerState::Stopping | PowerState::Stopped => Vanished::Drop,
        _ => Vanished::ReportStopped,
    }
}

/// Reconciles the pool's view of VMs into a [`VmStateTable`].
pub struct ClusterReconciler {
    table: Arc<VmStateTable>,
    settings: ReconcileSettings,
}

impl ClusterReconciler {
    pub fn new(table: Arc<VmStateTable>, settings: ReconcileSettings) -> Self {
        Self { table, settings }
    }

    pub fn table(&self) -> &Arc<VmStateTable> {
        &self.table
    }

    /// Scan every real VM with its host and power state. Templates,
    /// snapshots and control domains are skipped.
    pub async fn observe(&self, conn: &RemoteConnection) -> Result<Vec<ObservedVm>> {
        let hosts: HashMap<String, HostRecord> = conn.call_as("host.get_all_records", vec![]).await?;
        let records: BTreeMap<String, VmRecord> = conn.call_as("VM.get_all_records", vec![]).await?;

        let observed = real_vms(records, &hosts);
        debug!(vm_count = observed.len(), "Scanned pool VMs");
        Ok(observed)
    }

    /// Whether `host_uuid` is currently the pool master.
    pub async fn is_pool_master(&self, conn: &RemoteConnection, host_uuid: &str) -> Result<bool> {
        Ok(conn.pool_master_uuid().await? == host_uuid)
    }

    /// Rebuild `cluster` from a single scan and return the new table.
    #[instrument(skip(self, conn), fields(pool_id = %conn.pool_id()))]
    pub async fn full_sync(&self, cluster: &str, conn: &RemoteConnection) -> Result<ClusterSnapshot> {
        let observed = self.observe(conn).await?;
        let count = observed.len();

        self.table
            .replace(cluster, observed.into_iter().map(|vm| (vm.name, vm.host, vm.state)))?;

        info!(cluster = %cluster, vm_count = count, "Full cluster sync completed");
        self.table.snapshot(cluster)
    }

    /// Diff a fresh scan against the table and return only what changed.
    ///
    /// Returns `None` when the pool could not be read; the table is left
    /// untouched in that case.
    #[instrument(skip(self, conn), fields(pool_id = %conn.pool_id()))]
    pub async fn delta_sync(&self, cluster: &str, conn: &RemoteConnection) -> Option<Vec<VmStateChange>> {
        let observed: BTreeMap<String, ObservedVm> = match self.observe(conn).await {
            Ok(vms) => vms.into_iter().map(|vm| (vm.name.clone(), vm)).collect(),
            Err(e) => {
                warn!(cluster = %cluster, error = %e, "Cluster scan failed, keeping cached state");
                return None;
            }
        };

        let cached = match self.table.snapshot(cluster) {
            Ok(cached) => cached,
            Err(e) => {
                warn!(cluster = %cluster, error = %e, "Cannot read cached cluster state");
                return None;
            }
        };

        // Point queries happen before taking the lock.
        let mut confirmations: HashMap<String, bool> = HashMap::new();
        for (name, vm) in &observed {
            if decide(cached.get(name), vm) == Decision::ConfirmStop {
                let confirmed = self.confirm_stopped(conn, name).await;
                confirmations.insert(name.clone(), confirmed);
            }
        }

        let applied = self.table.with_cluster(cluster, |entries| {
            let mut changes = Vec::new();

            for (name, vm) in &observed {
                let adopt = match decide(entries.get(name), vm) {
                    Decision::Unchanged => false,
                    Decision::Suppress => {
                        debug!(vm = %name, observed = %vm.state, "Ignoring lagging state report");
                        false
                    }
                    Decision::Adopt => true,
                    Decision::ConfirmStop => match confirmations.get(name) {
                        Some(true) => true,
                        Some(false) => {
                            debug!(vm = %name, "Halted report not confirmed, skipping");
                            false
                        }
                        None => {
                            debug!(vm = %name, "Cached state changed during scan, skipping");
                            false
                        }
                    },
                };

                if adopt {
                    entries.put(name, vm.host.clone(), vm.state);
                    changes.push(VmStateChange::new(name.clone(), vm.host.clone(), vm.state));
                }
            }

            let missing: Vec<(String, VmStateEntry)> = entries
                .iter()
                .filter(|(name, _)| !observed.contains_key(*name))
                .map(|(name, entry)| (name.clone(), entry.clone()))
                .collect();

            for (name, entry) in missing {
                match vanished(entry.state) {
                    Vanished::Keep => {
                        debug!(vm = %name, "Starting VM not visible yet");
                    }
                    Vanished::Drop => {
                        debug!(vm = %name, state = %entry.state, "VM gone after stop, removing");
                        entries.remove(&name);
                    }
                    Vanished::ReportStopped => {
                        info!(vm = %name, state = %entry.state, "VM vanished from pool, reporting stopped");
                        entries.remove(&name);
                        changes.push(VmStateChange::new(name, entry.host, PowerState::Stopped));
                    }
                }
            }

            changes
        });

        match applied {
            Ok(changes) => {
                if !changes.is_empty() {
                    info!(cluster = %cluster, change_count = changes.len(), "Delta sync detected changes");
                }
                Some(changes)
            }
            Err(e) => {
                warn!(cluster = %cluster, error = %e, "Failed to apply delta sync");
                None
            }
        }
    }

    /// Re-query a VM the scan reported halted. Confirmed only if every point
    /// query agrees (or the VM no longer exists); any running answer or
    /// query error means the halted report is not trusted this pass.
    pub async fn confirm_stopped(&self, conn: &RemoteConnection, vm: &str) -> bool {
        let attempts = self.settings.stop_recheck_attempts.max(1);

        for attempt in 1..=attempts {
            match point_power_state(conn, vm).await {
                Ok(None) | Ok(Some(PowerState::Stopped)) => {}
                Ok(Some(state)) => {
                    debug!(vm = %vm, attempt, state = %state, "Point query disagrees with halted scan");
                    return false;
                }
                Err(e) => {
                    warn!(vm = %vm, error = %e, "Point query failed");
                    return false;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.settings.stop_recheck_interval()).await;
            }
        }
        true
    }
}

/// Filter pseudo-VMs and resolve hosts. Names are not unique on the pool
/// side; for a shared name the record with the lowest reference wins.
fn real_vms(records: BTreeMap<String, VmRecord>, hosts: &HashMap<String, HostRecord>) -> Vec<ObservedVm> {
    let mut names = HashSet::new();
    let mut observed = Vec::new();

    for (reference, vm) in records {
        if vm.is_a_template || vm.is_a_snapshot || vm.is_control_domain {
            continue;
        }
        if !names.insert(vm.name_label.clone()) {
            warn!(vm = %vm.name_label, reference = %reference, "Duplicate VM name, ignoring record");
            continue;
        }
        let host = vm
            .resident_on
            .as_deref()
            .filter(|r| *r != NULL_REF)
            .and_then(|r| hosts.get(r))
            .map(|h| h.uuid.clone());
        observed.push(ObservedVm {
            state: PowerState::from_remote(&vm.power_state),
            name: vm.name_label,
            host,
        });
    }
    observed
}

/// Current power state of `vm` by name; `None` if no such VM exists.
async fn point_power_state(conn: &RemoteConnection, vm: &str) -> Result<Option<PowerState>> {
    let refs: Vec<String> = conn.call_as("VM.get_by_name_label", vec![json!(vm)]).await?;
    let Some(reference) = refs.into_iter().next() else {
        return Ok(None);
    };
    let state: String = conn.call_as("VM.get_power_state", vec![json!(reference)]).await?;
    Ok(Some(PowerState::from_remote(&state)))
}
