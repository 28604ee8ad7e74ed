//! Development mode: an in-memory pool with a few hosts and VMs.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{debug, info};

use limiquantix_pool::MockPoolTransport;

use crate::config::PoolConfig;

const DEV_MASTER: &str = "dev-host-1";
const DEV_USER: &str = "root";
const DEV_PASSWORD: &str = "limiquantix";

/// VM whose power state the drift task flips.
const FLAPPING_VM: &str = "dev-web-2";

/// Build a seeded mock pool and point `pool` at it.
pub fn seeded_pool(pool: &mut PoolConfig) -> Arc<MockPoolTransport> {
    let mock = Arc::new(MockPoolTransport::new(DEV_MASTER, DEV_USER, DEV_PASSWORD));
    let master = mock.host_uuid(DEV_MASTER).unwrap_or_default();
    let member = mock.add_host("dev-host-2");

    mock.add_vm("dev-web-1", Some(master.as_str()), "Running");
    mock.add_vm(FLAPPING_VM, Some(member.as_str()), "Running");
    mock.add_vm("dev-db-1", Some(member.as_str()), "Paused");
    mock.add_vm("dev-batch-1", None, "Halted");
    mock.add_template("dev-debian-12");
    mock.add_control_domain("Control domain on dev-host-1", &master);

    // enter through the member so the master redirect is exercised
    pool.address = "dev-host-2".to_string();
    pool.username = DEV_USER.to_string();
    pool.passwords = vec!["wrong".to_string(), DEV_PASSWORD.to_string()];
    pool.master_host_uuid = Some(master);

    info!(master = %DEV_MASTER, vms = 4, "Development pool seeded");
    mock
}

/// Toggle one VM between running and halted every `period` so delta syncs
/// have something to report.
pub fn spawn_drift(mock: Arc<MockPoolTransport>, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        // first tick fires immediately
        ticker.tick().await;
        let mut running = true;
        loop {
            ticker.tick().await;
            running = !running;
            let state = if running { "Running" } else { "Halted" };
            mock.set_vm_power_state(FLAPPING_VM, state);
            debug!(vm = %FLAPPING_VM, state = %state, "Development VM drifted");
        }
    })
}
