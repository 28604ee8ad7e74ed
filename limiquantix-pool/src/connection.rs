//! One logical session to one pool endpoint.
//!
//! [`RemoteConnection::call`] wraps every remote call in a bounded retry loop:
//!
//! | Fault              | Action                                                   |
//! |--------------------|----------------------------------------------------------|
//! | `SessionInvalid`   | reauthenticate, retry immediately (consumes one attempt) |
//! | `HostIsSlave(m)`   | retarget to `m`, log in again, retry (once per call)     |
//! | `Transient`        | sleep `retry_interval`, retry; exhaustion evicts         |
//! | `Client`           | evict, propagate                                         |
//! | `Api`              | propagate typed, connection stays cached                 |
//!
//! Login walks the credential list front-to-back. The cursor only advances
//! on rejection, so a later reauthentication starts from the password that
//! last worked.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::ConnectionSettings;
use crate::error::{PoolError, Result, RpcFault};
use crate::pool::PoolRegistry;
use crate::transport::PoolTransport;
use crate::types::{Credentials, SessionRef, TaskHandle};

const LOGIN_METHOD: &str = "session.login_with_password";

/// Credential list plus the index of the candidate currently in use.
struct CredentialCursor {
    credentials: Credentials,
    cursor: usize,
}

impl CredentialCursor {
    fn current(&self) -> Option<&str> {
        self.credentials.passwords.get(self.cursor).map(String::as_str)
    }
}

/// A session-holding connection to one pool.
pub struct RemoteConnection {
    /// Distinguishes this connection from a later replacement for the same pool
    generation: Uuid,
    pool_id: String,
    /// Current target; follows master redirects
    address: RwLock<String>,
    session: RwLock<Option<SessionRef>>,
    /// Serializes (re)login and guards the credential cursor
    credentials: Mutex<CredentialCursor>,
    transport: Arc<dyn PoolTransport>,
    settings: ConnectionSettings,
    registry: Option<Weak<PoolRegistry>>,
    evicted: AtomicBool,
}

impl RemoteConnection {
    /// Create a standalone connection. No login is performed until the first
    /// call or an explicit [`login`](Self::login).
    pub fn new(
        pool_id: impl Into<String>,
        address: impl Into<String>,
        credentials: Credentials,
        transport: Arc<dyn PoolTransport>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            generation: Uuid::new_v4(),
            pool_id: pool_id.into(),
            address: RwLock::new(address.into()),
            session: RwLock::new(None),
            credentials: Mutex::new(CredentialCursor { credentials, cursor: 0 }),
            transport,
            settings,
            registry: None,
            evicted: AtomicBool::new(false),
        }
    }

    /// Create a connection that removes itself from `registry` on fatal faults.
    pub(crate) fn with_registry(
        pool_id: impl Into<String>,
        address: impl Into<String>,
        credentials: Credentials,
        transport: Arc<dyn PoolTransport>,
        settings: ConnectionSettings,
        registry: Weak<PoolRegistry>,
    ) -> Self {
        let mut conn = Self::new(pool_id, address, credentials, transport, settings);
        conn.registry = Some(registry);
        conn
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    pub(crate) fn generation(&self) -> Uuid {
        self.generation
    }

    /// Address calls are currently sent to (the master, once learned).
    pub fn master_address(&self) -> String {
        self.address.read().map(|a| a.clone()).unwrap_or_default()
    }

    /// True once a fatal fault has evicted this connection.
    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }

    fn set_address(&self, address: &str) {
        if let Ok(mut current) = self.address.write() {
            *current = address.to_string();
        }
    }

    fn current_session(&self) -> Option<SessionRef> {
        self.session.read().ok().and_then(|s| s.clone())
    }

    fn store_session(&self, session: Option<SessionRef>) {
        if let Ok(mut current) = self.session.write() {
            *current = session;
        }
    }

    fn take_session(&self) -> Option<SessionRef> {
        self.session.write().ok().and_then(|mut current| current.take())
    }

    // =========================================================================
    // Login
    // =========================================================================

    /// Log in (again), following a master redirect and walking the credential
    /// list on rejection.
    #[instrument(skip(self), fields(pool_id = %self.pool_id))]
    pub async fn login(&self) -> Result<SessionRef> {
        let mut creds = self.credentials.lock().await;
        self.login_locked(&mut creds).await
    }

    /// Reauthenticate after `stale` was rejected. If another caller already
    /// replaced `stale`, the fresh session is returned without logging in.
    async fn reauthenticate(&self, stale: Option<&SessionRef>) -> Result<SessionRef> {
        let mut creds = self.credentials.lock().await;
        if let Some(current) = self.current_session() {
            if Some(&current) != stale {
                debug!(pool_id = %self.pool_id, "Session already refreshed by another caller");
                return Ok(current);
            }
        }
        self.login_locked(&mut creds).await
    }

    async fn login_locked(&self, creds: &mut CredentialCursor) -> Result<SessionRef> {
        if self.is_evicted() {
            return Err(PoolError::SessionLost(self.pool_id.clone()));
        }
        let outcome = self.open_session(creds).await;
        match outcome {
            Ok(session) if self.is_evicted() => {
                // evicted while the login was in flight
                self.release(session);
                Err(PoolError::SessionLost(self.pool_id.clone()))
            }
            Ok(session) => {
                self.store_session(Some(session.clone()));
                Ok(session)
            }
            Err(e) => {
                self.store_session(None);
                Err(e)
            }
        }
    }

    /// Walk the credential list at the current address without touching the
    /// stored session.
    async fn open_session(&self, creds: &mut CredentialCursor) -> Result<SessionRef> {
        let mut address = self.master_address();
        let mut redirected = false;
        let mut rejected = 0usize;

        while let Some(password) = creds.current() {
            let username = creds.credentials.username.as_str();
            let outcome = self
                .transport
                .login(&address, username, password, &self.settings.api_version)
                .await;

            match outcome {
                Ok(session) => {
                    info!(pool_id = %self.pool_id, address = %address, "Logged in to pool");
                    return Ok(session);
                }
                Err(RpcFault::HostIsSlave(master)) => {
                    if redirected {
                        return Err(PoolError::RedirectLoop {
                            pool_id: self.pool_id.clone(),
                            address: master,
                        });
                    }
                    info!(
                        pool_id = %self.pool_id,
                        contacted = %address,
                        master = %master,
                        "Host is not the pool master, following redirect"
                    );
                    self.set_address(&master);
                    address = master;
                    redirected = true;
                }
                Err(RpcFault::AuthenticationFailed) => {
                    rejected += 1;
                    creds.cursor += 1;
                    warn!(
                        pool_id = %self.pool_id,
                        remaining = creds.credentials.passwords.len().saturating_sub(creds.cursor),
                        "Login rejected, trying next credential"
                    );
                }
                Err(RpcFault::Transient(reason)) => {
                    return Err(PoolError::Unreachable { address, reason });
                }
                Err(RpcFault::Client(reason)) => {
                    return Err(PoolError::ClientFault { method: LOGIN_METHOD.to_string(), reason });
                }
                Err(fault) => {
                    return Err(PoolError::Api { method: LOGIN_METHOD.to_string(), fault });
                }
            }
        }

        Err(PoolError::AuthenticationFailure {
            pool_id: self.pool_id.clone(),
            attempts: rejected,
        })
    }

    /// Release the session. Best effort, never retried.
    pub async fn logout(&self) {
        if let Some(session) = self.take_session() {
            if let Err(e) = self.transport.logout(&self.master_address(), &session).await {
                debug!(pool_id = %self.pool_id, error = %e, "Logout failed");
            }
        }
    }

    /// Cheap liveness check, used by the pool before handing out a cached
    /// connection. No retries, no reauthentication.
    pub async fn check_alive(&self) -> Result<()> {
        let session = self.current_session().ok_or_else(|| PoolError::SessionLost(self.pool_id.clone()))?;
        self.transport
            .call(
                &self.master_address(),
                &session,
                "session.get_this_host",
                vec![json!(session.as_str())],
            )
            .await
            .map(|_| ())
            .map_err(|fault| PoolError::Api { method: "session.get_this_host".to_string(), fault })
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Invoke `Class.method` with retry, redirect and reauthentication.
    #[instrument(skip(self, args), fields(pool_id = %self.pool_id, method = %method))]
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let limit = self.settings.retry_count.max(1);
        let mut attempt = 0u32;
        let mut redirected = false;

        loop {
            if self.is_evicted() {
                return Err(PoolError::SessionLost(self.pool_id.clone()));
            }
            attempt += 1;

            let session = match self.current_session() {
                Some(session) => session,
                None => self.reauthenticate(None).await.map_err(|e| self.fail(e))?,
            };
            let address = self.master_address();

            match self.transport.call(&address, &session, method, args.clone()).await {
                Ok(value) => return Ok(value),

                Err(RpcFault::SessionInvalid) => {
                    if attempt >= limit {
                        return Err(self.fail(PoolError::SessionLost(self.pool_id.clone())));
                    }
                    debug!(attempt, "Session invalid, reauthenticating");
                    self.reauthenticate(Some(&session)).await.map_err(|e| self.fail(e))?;
                }

                Err(RpcFault::HostIsSlave(master)) => {
                    if redirected {
                        return Err(self.fail(PoolError::RedirectLoop {
                            pool_id: self.pool_id.clone(),
                            address: master,
                        }));
                    }
                    redirected = true;
                    info!(master = %master, "Pool master moved, reconnecting");
                    self.set_address(&master);
                    self.store_session(None);
                    self.reauthenticate(None).await.map_err(|e| self.fail(e))?;
                    // following a redirect is not a retry
                    attempt -= 1;
                }

                Err(RpcFault::Transient(reason)) => {
                    if attempt >= limit {
                        return Err(self.fail(PoolError::RetriesExhausted {
                            method: method.to_string(),
                            attempts: attempt,
                            reason,
                        }));
                    }
                    warn!(attempt, limit, reason = %reason, "Transient failure, retrying");
                    tokio::time::sleep(self.settings.retry_interval()).await;
                }

                Err(RpcFault::Client(reason)) => {
                    return Err(self.fail(PoolError::ClientFault { method: method.to_string(), reason }));
                }

                Err(RpcFault::AuthenticationFailed) => {
                    return Err(self.fail(PoolError::SessionLost(self.pool_id.clone())));
                }

                Err(fault @ RpcFault::Api { .. }) => {
                    return Err(PoolError::Api { method: method.to_string(), fault });
                }
            }
        }
    }

    /// One call on a short-lived session of its own, logged out afterwards.
    ///
    /// Used for cleanup that must still reach the pool after this connection
    /// has been evicted. No retries.
    pub(crate) async fn call_detached(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let session = {
            let mut creds = self.credentials.lock().await;
            self.open_session(&mut creds).await?
        };
        let address = self.master_address();
        let outcome = self.transport.call(&address, &session, method, args).await;
        if let Err(e) = self.transport.logout(&address, &session).await {
            debug!(pool_id = %self.pool_id, error = %e, "Logout of detached session failed");
        }
        outcome.map_err(|fault| PoolError::Api { method: method.to_string(), fault })
    }

    /// [`call`](Self::call) and deserialize the result.
    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> Result<T> {
        let value = self.call(method, args).await?;
        serde_json::from_value(value).map_err(|e| PoolError::UnexpectedResponse {
            method: method.to_string(),
            reason: e.to_string(),
        })
    }

    /// Submit `Async.{method}` and return the task handle.
    pub async fn submit_async(&self, method: &str, args: Vec<Value>) -> Result<TaskHandle> {
        let async_method = format!("Async.{}", method);
        let handle: String = self.call_as(&async_method, args).await?;
        debug!(pool_id = %self.pool_id, method = %method, task = %handle, "Submitted async task");
        Ok(TaskHandle(handle))
    }

    /// Run a host-side plugin function. Only the session/retry handling lives
    /// here; the plugin's semantics belong to the caller.
    pub async fn call_plugin(
        &self,
        host_ref: &str,
        plugin: &str,
        function: &str,
        args: &BTreeMap<String, String>,
    ) -> Result<String> {
        self.call_as(
            "host.call_plugin",
            vec![json!(host_ref), json!(plugin), json!(function), json!(args)],
        )
        .await
    }

    /// UUID of the pool's current master host.
    pub async fn pool_master_uuid(&self) -> Result<String> {
        let pools: Vec<String> = self.call_as("pool.get_all", vec![]).await?;
        let pool = pools.into_iter().next().ok_or_else(|| PoolError::UnexpectedResponse {
            method: "pool.get_all".to_string(),
            reason: "no pool object".to_string(),
        })?;
        let master: String = self.call_as("pool.get_master", vec![json!(pool)]).await?;
        self.call_as("host.get_uuid", vec![json!(master)]).await
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    /// Evict on a fatal error and hand the error back for propagation.
    fn fail(&self, error: PoolError) -> PoolError {
        self.evict(&error.to_string());
        error
    }

    /// Drop this connection from the pool. Idempotent; never evicts a
    /// replacement connection for the same pool.
    pub fn evict(&self, reason: &str) {
        if self.evicted.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(pool_id = %self.pool_id, reason = %reason, "Evicting pool connection");
        if let Some(session) = self.take_session() {
            self.release(session);
        }
        if let Some(registry) = self.registry.as_ref().and_then(Weak::upgrade) {
            registry.remove_generation(&self.pool_id, self.generation);
        }
    }

    /// Log `session` out in the background. Best effort.
    fn release(&self, session: SessionRef) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let transport = self.transport.clone();
                let address = self.master_address();
                let pool_id = self.pool_id.clone();
                runtime.spawn(async move {
                    if let Err(e) = transport.logout(&address, &session).await {
                        debug!(pool_id = %pool_id, error = %e, "Logout of evicted session failed");
                    }
                });
            }
            Err(_) => {
                debug!(pool_id = %self.pool_id, "No runtime available, session left to expire");
            }
        }
    }
}

impl std::fmt::Debug for RemoteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnection")
            .field("pool_id", &self.pool_id)
            .field("address", &self.master_address())
            .field("evicted", &self.is_evicted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockPoolTransport;

    fn connection(mock: &Arc<MockPoolTransport>, passwords: &[&str]) -> RemoteConnection {
        let creds = Credentials::new("root", passwords.iter().map(|p| p.to_string()).collect());
        RemoteConnection::new("pool-1", "10.0.0.1", creds, mock.clone(), ConnectionSettings::default())
    }

    #[tokio::test]
    async fn test_first_call_logs_in_lazily() {
        let mock = Arc::new(MockPoolTransport::new("10.0.0.1", "root", "pw"));
        let conn = connection(&mock, &["pw"]);

        let pools: Vec<String> = conn.call_as("pool.get_all", vec![]).await.unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(mock.login_attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_credential_cursor_advances_on_rejection() {
        let mock = Arc::new(MockPoolTransport::new("10.0.0.1", "root", "third"));
        let conn = connection(&mock, &["first", "second", "third"]);

        conn.login().await.unwrap();
        let tried: Vec<String> = mock.login_attempts().into_iter().map(|a| a.password).collect();
        assert_eq!(tried, vec!["first", "second", "third"]);

        // reauthentication resumes from the working password
        mock.invalidate_sessions();
        conn.call("pool.get_all", vec![]).await.unwrap();
        assert_eq!(mock.login_attempts().last().unwrap().password, "third");
        assert_eq!(mock.login_attempts().len(), 4);
    }

    #[tokio::test]
    async fn test_credential_exhaustion() {
        let mock = Arc::new(MockPoolTransport::new("10.0.0.1", "root", "right"));
        let conn = connection(&mock, &["a", "b", "c"]);

        let err = conn.login().await.unwrap_err();
        assert!(matches!(err, PoolError::AuthenticationFailure { attempts: 3, .. }));
        assert_eq!(mock.login_attempts().len(), 3);
    }

    #[tokio::test]
    async fn test_redirect_followed_once() {
        let mock = Arc::new(MockPoolTransport::new("10.0.0.2", "root", "pw"));
        mock.add_host("10.0.0.1");
        let conn = connection(&mock, &["pw"]);

        conn.login().await.unwrap();
        let addresses: Vec<String> = mock.login_attempts().into_iter().map(|a| a.address).collect();
        assert_eq!(addresses, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(conn.master_address(), "10.0.0.2");
    }

    #[tokio::test]
    async fn test_double_redirect_is_an_error() {
        let mock = Arc::new(MockPoolTransport::new("10.0.0.1", "root", "pw"));
        mock.inject_login_fault(RpcFault::HostIsSlave("10.0.0.2".into()));
        mock.inject_login_fault(RpcFault::HostIsSlave("10.0.0.3".into()));
        let conn = connection(&mock, &["pw"]);

        let err = conn.login().await.unwrap_err();
        assert!(matches!(err, PoolError::RedirectLoop { .. }));
    }

    #[tokio::test]
    async fn test_call_follows_master_failover() {
        let mock = Arc::new(MockPoolTransport::new("10.0.0.1", "root", "pw"));
        mock.add_host("10.0.0.2");
        let conn = connection(&mock, &["pw"]);
        conn.login().await.unwrap();

        mock.set_master("10.0.0.2");
        conn.call("pool.get_all", vec![]).await.unwrap();

        assert_eq!(conn.master_address(), "10.0.0.2");
        assert_eq!(mock.login_attempts().last().unwrap().address, "10.0.0.2");
        assert!(!conn.is_evicted());
    }

    #[tokio::test]
    async fn test_session_invalid_below_limit_is_invisible() {
        let mock = Arc::new(MockPoolTransport::new("10.0.0.1", "root", "pw"));
        let conn = connection(&mock, &["pw"]);
        conn.login().await.unwrap();

        mock.inject_fault("pool.get_all", RpcFault::SessionInvalid);
        mock.inject_fault("pool.get_all", RpcFault::SessionInvalid);

        assert!(conn.call("pool.get_all", vec![]).await.is_ok());
        assert_eq!(mock.login_attempts().len(), 3);
        assert!(!conn.is_evicted());
    }

    #[tokio::test]
    async fn test_session_invalid_at_limit_evicts() {
        let mock = Arc::new(MockPoolTransport::new("10.0.0.1", "root", "pw"));
        let conn = connection(&mock, &["pw"]);
        conn.login().await.unwrap();

        for _ in 0..3 {
            mock.inject_fault("pool.get_all", RpcFault::SessionInvalid);
        }

        let err = conn.call("pool.get_all", vec![]).await.unwrap_err();
        assert!(matches!(err, PoolError::SessionLost(_)));
        assert!(conn.is_evicted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retried_then_succeeds() {
        let mock = Arc::new(MockPoolTransport::new("10.0.0.1", "root", "pw"));
        let conn = connection(&mock, &["pw"]);
        mock.inject_fault("pool.get_all", RpcFault::Transient("reset".into()));
        mock.inject_fault("pool.get_all", RpcFault::Transient("reset".into()));

        let started = tokio::time::Instant::now();
        conn.call("pool.get_all", vec![]).await.unwrap();

        assert_eq!(mock.call_count("pool.get_all"), 3);
        assert!(started.elapsed() >= std::time::Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_exhaustion_evicts() {
        let mock = Arc::new(MockPoolTransport::new("10.0.0.1", "root", "pw"));
        let conn = connection(&mock, &["pw"]);
        for _ in 0..3 {
            mock.inject_fault("pool.get_all", RpcFault::Transient("reset".into()));
        }

        let err = conn.call("pool.get_all", vec![]).await.unwrap_err();
        assert!(matches!(err, PoolError::RetriesExhausted { attempts: 3, .. }));
        assert!(err.is_infrastructure());
        assert!(conn.is_evicted());
    }

    #[tokio::test]
    async fn test_client_fault_not_retried() {
        let mock = Arc::new(MockPoolTransport::new("10.0.0.1", "root", "pw"));
        let conn = connection(&mock, &["pw"]);

        let err = conn.call("VM.no_such_method", vec![]).await.unwrap_err();
        assert!(matches!(err, PoolError::ClientFault { .. }));
        assert_eq!(mock.call_count("VM.no_such_method"), 1);
        assert!(conn.is_evicted());
    }

    #[tokio::test]
    async fn test_rotated_password_picked_up_on_reauthentication() {
        let mock = Arc::new(MockPoolTransport::new("10.0.0.1", "root", "old"));
        let conn = connection(&mock, &["old", "new"]);
        conn.login().await.unwrap();

        mock.set_password("new");
        mock.invalidate_sessions();
        conn.call("pool.get_all", vec![]).await.unwrap();

        let passwords: Vec<String> = mock.login_attempts().into_iter().map(|a| a.password).collect();
        assert_eq!(passwords, vec!["old", "old", "new"]);
        assert!(!conn.is_evicted());
    }

    #[tokio::test]
    async fn test_eviction_logs_session_out() {
        let mock = Arc::new(MockPoolTransport::new("10.0.0.1", "root", "pw"));
        let conn = connection(&mock, &["pw"]);
        conn.login().await.unwrap();
        assert_eq!(mock.active_session_count(), 1);

        mock.inject_fault("pool.get_all", RpcFault::Client("bad request".into()));
        assert!(conn.call("pool.get_all", vec![]).await.is_err());

        // the logout is handed to the runtime
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(mock.active_session_count(), 0);
    }

    #[tokio::test]
    async fn test_evicted_connection_refuses_calls() {
        let mock = Arc::new(MockPoolTransport::new("10.0.0.1", "root", "pw"));
        let conn = connection(&mock, &["pw"]);
        conn.login().await.unwrap();
        conn.evict("test");

        let err = conn.call("pool.get_all", vec![]).await.unwrap_err();
        assert!(matches!(err, PoolError::SessionLost(_)));
        assert!(conn.login().await.is_err());
        assert_eq!(mock.login_attempts().len(), 1);
        assert_eq!(mock.call_count("pool.get_all"), 0);

        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(mock.active_session_count(), 0);
    }

    #[tokio::test]
    async fn test_detached_call_cleans_up_its_session() {
        let mock = Arc::new(MockPoolTransport::new("10.0.0.1", "root", "pw"));
        let conn = connection(&mock, &["pw"]);
        conn.evict("test");

        let pools = conn.call_detached("pool.get_all", vec![]).await.unwrap();
        assert_eq!(pools.as_array().map(Vec::len), Some(1));
        assert_eq!(mock.active_session_count(), 0);
        assert!(conn.is_evicted());
    }

    #[tokio::test]
    async fn test_api_fault_keeps_connection() {
        let mock = Arc::new(MockPoolTransport::new("10.0.0.1", "root", "pw"));
        let conn = connection(&mock, &["pw"]);

        let err = conn.call("host.get_uuid", vec![json!("OpaqueRef:missing")]).await.unwrap_err();
        assert!(err.api_fault().map(|f| f.is_api("HANDLE_INVALID")).unwrap_or(false));
        assert!(!err.is_infrastructure());
        assert!(!conn.is_evicted());
    }

    #[tokio::test]
    async fn test_call_plugin() {
        let mock = Arc::new(MockPoolTransport::new("10.0.0.1", "root", "pw"));
        mock.set_plugin_response("vmops", "get_rrd", "<rrd/>");
        let conn = connection(&mock, &["pw"]);

        let host_ref: String = conn.call_as("pool.get_master", vec![json!("OpaqueRef:pool-0")]).await.unwrap();
        let mut args = BTreeMap::new();
        args.insert("vm".to_string(), "web-1".to_string());
        let out = conn.call_plugin(&host_ref, "vmops", "get_rrd", &args).await.unwrap();
        assert_eq!(out, "<rrd/>");
    }

    #[tokio::test]
    async fn test_pool_master_uuid() {
        let mock = Arc::new(MockPoolTransport::new("10.0.0.1", "root", "pw"));
        let conn = connection(&mock, &["pw"]);

        let uuid = conn.pool_master_uuid().await.unwrap();
        assert_eq!(Some(uuid), mock.host_uuid("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_logout_clears_session() {
        let mock = Arc::new(MockPoolTransport::new("10.0.0.1", "root", "pw"));
        let conn = connection(&mock, &["pw"]);
        conn.login().await.unwrap();
        assert_eq!(mock.active_session_count(), 1);

        conn.logout().await;
        assert_eq!(mock.active_session_count(), 0);
        assert!(conn.check_alive().await.is_err());
    }
}
