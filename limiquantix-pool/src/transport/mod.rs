//! Session-based RPC contract spoken by a hypervisor pool endpoint.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            PoolTransport trait          │
//! │     (login, logout, Class.method call)  │
//! └─────────────────────┬───────────────────┘
//!                       │
//!         ┌─────────────┴─────────────┐
//!         ▼                           ▼
//! ┌───────────────────┐     ┌───────────────────┐
//! │  JsonRpcTransport │     │ MockPoolTransport │
//! │   (HTTP/JSON-RPC) │     │    (in-memory)    │
//! └───────────────────┘     └───────────────────┘
//! ```
//!
//! Transports are stateless with respect to sessions: the caller passes the
//! target address and session reference on every call. Retry, redirect and
//! reauthentication policy lives in [`crate::connection::RemoteConnection`].

use async_trait::async_trait;
use serde_json::Value;

use crate::error::RpcFault;
use crate::types::SessionRef;

pub mod jsonrpc;
pub mod mock;

pub use jsonrpc::JsonRpcTransport;
pub use mock::MockPoolTransport;

/// Result of a single remote call.
pub type RpcResult<T> = std::result::Result<T, RpcFault>;

/// Raw RPC dispatch against a pool endpoint.
#[async_trait]
pub trait PoolTransport: Send + Sync {
    /// Authenticate and obtain a session.
    ///
    /// A non-master host answers with [`RpcFault::HostIsSlave`] carrying the
    /// master's address.
    async fn login(
        &self,
        address: &str,
        username: &str,
        password: &str,
        api_version: &str,
    ) -> RpcResult<SessionRef>;

    /// Release a session.
    async fn logout(&self, address: &str, session: &SessionRef) -> RpcResult<()>;

    /// Invoke `Class.method` with the session prepended to `args`.
    async fn call(
        &self,
        address: &str,
        session: &SessionRef,
        method: &str,
        args: Vec<Value>,
    ) -> RpcResult<Value>;
}
