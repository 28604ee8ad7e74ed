//! Error types for the pool management layer.
//!
//! Two layers:
//! - [`RpcFault`] is what a single remote call produced. It is a tagged value
//!   so the retry loop in [`crate::connection`] can match on it directly.
//! - [`PoolError`] is what callers of the connection, task runner and
//!   reconciler see after retries, redirects and reauthentication have been
//!   applied.

use thiserror::Error;

/// Outcome of a failed remote call, before any retry policy is applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcFault {
    /// The session reference is no longer accepted by the pool.
    #[error("session invalid")]
    SessionInvalid,

    /// The contacted host is a pool member, not the master.
    #[error("host is not the pool master, master is {0}")]
    HostIsSlave(String),

    /// The username/password pair was rejected.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Network-level failure (reset, timeout, 5xx). Safe to retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The request itself was rejected as malformed.
    #[error("client fault: {0}")]
    Client(String),

    /// Well-formed application fault reported by the pool.
    #[error("{code} {params:?}")]
    Api { code: String, params: Vec<String> },
}

impl RpcFault {
    /// Build an application fault.
    pub fn api(code: impl Into<String>, params: Vec<String>) -> Self {
        Self::Api { code: code.into(), params }
    }

    /// True for an application fault with the given code.
    pub fn is_api(&self, expected: &str) -> bool {
        matches!(self, Self::Api { code, .. } if code == expected)
    }
}

/// Application fault code for a task or object reference that no longer exists.
pub const HANDLE_INVALID: &str = "HANDLE_INVALID";

/// Errors surfaced by the connection pool, task runner and reconciler.
#[derive(Error, Debug, Clone)]
pub enum PoolError {
    /// Every candidate password was rejected.
    #[error("authentication failed for pool {pool_id} after {attempts} attempt(s)")]
    AuthenticationFailure { pool_id: String, attempts: usize },

    /// The endpoint could not be reached at all.
    #[error("pool endpoint unreachable: {address}: {reason}")]
    Unreachable { address: String, reason: String },

    /// The session was invalidated and could not be re-established.
    #[error("session for pool {0} could not be re-established")]
    SessionLost(String),

    /// A redirect pointed at another non-master host.
    #[error("redirect loop for pool {pool_id}: {address} is not the master either")]
    RedirectLoop { pool_id: String, address: String },

    /// Transient failures exceeded the retry bound.
    #[error("{method} failed after {attempts} attempt(s): {reason}")]
    RetriesExhausted { method: String, attempts: u32, reason: String },

    /// The pool rejected the call as malformed.
    #[error("{method} rejected: {reason}")]
    ClientFault { method: String, reason: String },

    /// The pool returned an application fault.
    #[error("{method} failed: {fault}")]
    Api { method: String, fault: RpcFault },

    /// An async task completed but reported failure.
    #[error("task {task} failed: {}", error_info.join(" "))]
    RemoteOperationFailure { task: String, error_info: Vec<String> },

    /// An async task was cancelled on the remote side.
    #[error("task {0} was cancelled")]
    TaskCancelled(String),

    /// An async task exceeded its deadline.
    #[error("task {task} timed out after {elapsed_ms}ms")]
    Timeout { task: String, elapsed_ms: u64 },

    /// The pool answered with something we could not interpret.
    #[error("unexpected response from {method}: {reason}")]
    UnexpectedResponse { method: String, reason: String },

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PoolError {
    /// True for connection-layer failures that may succeed on an immediate
    /// retry with a fresh connection. Task failures, timeouts and application
    /// faults are not infrastructure errors.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailure { .. }
                | Self::Unreachable { .. }
                | Self::SessionLost(_)
                | Self::RedirectLoop { .. }
                | Self::RetriesExhausted { .. }
                | Self::ClientFault { .. }
        )
    }

    /// The application fault carried by this error, if any.
    pub fn api_fault(&self) -> Option<&RpcFault> {
        match self {
            Self::Api { fault, .. } => Some(fault),
            _ => None,
        }
    }
}

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
