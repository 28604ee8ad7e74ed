//! Registry of at most one live connection per pool.
//!
//! Each pool id owns a slot with two locks:
//! - an async `connect_lock`, held only while deciding whether the cached
//!   connection is usable and, if not, while logging in a replacement;
//! - a short std mutex around the cached `Arc<RemoteConnection>` itself, so
//!   eviction from inside a failing call never waits on a login.
//!
//! Callers clone the `Arc` and use it concurrently; no pool lock is held
//! around individual calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::ConnectionSettings;
use crate::connection::RemoteConnection;
use crate::error::{PoolError, Result};
use crate::transport::PoolTransport;
use crate::types::Credentials;

#[derive(Default)]
struct PoolSlot {
    connect_lock: tokio::sync::Mutex<()>,
    current: Mutex<Option<Arc<RemoteConnection>>>,
}

impl PoolSlot {
    fn cached(&self) -> Result<Option<Arc<RemoteConnection>>> {
        let current = self
            .current
            .lock()
            .map_err(|_| PoolError::Internal("Lock poisoned".to_string()))?;
        Ok(current.clone())
    }

    fn store(&self, conn: Arc<RemoteConnection>) -> Result<()> {
        let mut current = self
            .current
            .lock()
            .map_err(|_| PoolError::Internal("Lock poisoned".to_string()))?;
        *current = Some(conn);
        Ok(())
    }

    fn take(&self) -> Option<Arc<RemoteConnection>> {
        self.current.lock().ok().and_then(|mut c| c.take())
    }
}

/// Shared between the pool and the connections it created, so a connection
/// can evict itself.
#[derive(Default)]
pub(crate) struct PoolRegistry {
    slots: Mutex<HashMap<String, Arc<PoolSlot>>>,
}

impl PoolRegistry {
    fn slot(&self, pool_id: &str) -> Result<Arc<PoolSlot>> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| PoolError::Internal("Lock poisoned".to_string()))?;
        Ok(slots.entry(pool_id.to_string()).or_default().clone())
    }

    fn existing_slot(&self, pool_id: &str) -> Option<Arc<PoolSlot>> {
        self.slots.lock().ok().and_then(|slots| slots.get(pool_id).cloned())
    }

    /// Remove the cached connection for `pool_id` only if it is `generation`.
    pub(crate) fn remove_generation(&self, pool_id: &str, generation: Uuid) -> bool {
        let Some(slot) = self.existing_slot(pool_id) else {
            return false;
        };
        let Ok(mut current) = slot.current.lock() else {
            return false;
        };
        match current.as_ref() {
            Some(conn) if conn.generation() == generation => {
                *current = None;
                debug!(pool_id = %pool_id, "Connection removed from pool");
                true
            }
            _ => false,
        }
    }
}

/// Process-wide connection pool, keyed by pool id.
pub struct SessionPool {
    registry: Arc<PoolRegistry>,
    transport: Arc<dyn PoolTransport>,
    settings: ConnectionSettings,
}

impl SessionPool {
    pub fn new(transport: Arc<dyn PoolTransport>, settings: ConnectionSettings) -> Self {
        Self {
            registry: Arc::new(PoolRegistry::default()),
            transport,
            settings,
        }
    }

    /// Return a live connection for `pool_id`, reusing the cached one if it
    /// passes a liveness check, otherwise logging in afresh.
    ///
    /// Nothing is cached when login fails.
    #[instrument(skip(self, credentials), fields(pool_id = %pool_id, endpoint = %endpoint))]
    pub async fn get_connection(
        &self,
        pool_id: &str,
        endpoint: &str,
        credentials: &Credentials,
    ) -> Result<Arc<RemoteConnection>> {
        let slot = self.registry.slot(pool_id)?;
        let _connecting = slot.connect_lock.lock().await;

        if let Some(conn) = slot.cached()? {
            if !conn.is_evicted() {
                match conn.check_alive().await {
                    Ok(()) => return Ok(conn),
                    Err(e) => {
                        warn!(error = %e, "Cached connection failed liveness check");
                        conn.evict("liveness check failed");
                    }
                }
            }
            // evict() already cleared the slot if it still held this generation
            self.registry.remove_generation(pool_id, conn.generation());
        }

        let conn = Arc::new(RemoteConnection::with_registry(
            pool_id,
            endpoint,
            credentials.clone(),
            self.transport.clone(),
            self.settings.clone(),
            Arc::downgrade(&self.registry),
        ));
        conn.login().await?;
        slot.store(conn.clone())?;

        info!(master = %conn.master_address(), "Pool connection established");
        Ok(conn)
    }

    /// The cached connection, without probing it.
    pub fn cached(&self, pool_id: &str) -> Option<Arc<RemoteConnection>> {
        self.registry
            .existing_slot(pool_id)
            .and_then(|slot| slot.cached().ok().flatten())
    }

    /// Drop the cached connection for `pool_id`.
    pub fn evict(&self, pool_id: &str) {
        if let Some(conn) = self.cached(pool_id) {
            conn.evict("evicted by caller");
        }
    }

    /// Log out and drop every cached connection.
    pub async fn shutdown(&self) {
        let slots: Vec<Arc<PoolSlot>> = match self.registry.slots.lock() {
            Ok(slots) => slots.values().cloned().collect(),
            Err(_) => return,
        };
        for slot in slots {
            if let Some(conn) = slot.take() {
                conn.logout().await;
            }
        }
        info!("Session pool shut down");
    }
}
