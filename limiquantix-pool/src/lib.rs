//! # limiquantix Pool
//!
//! Client-side plumbing for hypervisor pools that expose a single
//! authenticated management endpoint on their master host.
//!
//! The crate is layered bottom-up:
//! - **transport**: the raw RPC seam ([`PoolTransport`]), a JSON-RPC client and
//!   an in-memory mock pool;
//! - **connection**: one authenticated session per pool, with redirect
//!   following, re-authentication and bounded retries;
//! - **pool**: at most one live connection per pool id, evicted on fatal faults;
//! - **task**: submit an async remote operation, poll it, always destroy the handle;
//! - **state_table** / **reconciler**: the per-cluster VM power state view and
//!   the full/delta sync that keeps it honest.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐     ┌────────────────────┐
//! │  ClusterReconciler │     │     TaskRunner     │
//! └─────────┬──────────┘     └─────────┬──────────┘
//!           │                          │
//!           ▼                          ▼
//! ┌─────────────────────────────────────────────┐
//! │      SessionPool  →  RemoteConnection       │
//! └─────────────────────┬───────────────────────┘
//!                       ▼
//!          ┌─────────────────────────┐
//!          │  PoolTransport (trait)  │
//!          └────────────┬────────────┘
//!             ┌─────────┴─────────┐
//!             ▼                   ▼
//!     JsonRpcTransport     MockPoolTransport
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use limiquantix_pool::{
//!     ConnectionSettings, Credentials, MockPoolTransport, SessionPool, TaskPolicy, TaskRunner,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = Arc::new(MockPoolTransport::new("10.0.0.1", "root", "secret"));
//!     let pool = SessionPool::new(transport, ConnectionSettings::default());
//!
//!     let conn = pool
//!         .get_connection("pool-1", "10.0.0.1", &Credentials::password("root", "secret"))
//!         .await
//!         .unwrap();
//!
//!     let output = TaskRunner::new(conn)
//!         .run_method("VM.start", vec![], TaskPolicy::default())
//!         .await
//!         .unwrap();
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod reconciler;
pub mod state_table;
pub mod task;
pub mod transport;
pub mod types;

pub use config::{ConnectionSettings, ReconcileSettings, TaskPolicy};
pub use connection::RemoteConnection;
pub use error::{PoolError, Result, RpcFault};
pub use pool::SessionPool;
pub use reconciler::{decide, ClusterReconciler, Decision};
pub use state_table::{ClusterEntries, ClusterSnapshot, VmStateTable};
pub use task::{TaskOutput, TaskRunner};
pub use transport::{JsonRpcTransport, MockPoolTransport, PoolTransport};
pub use types::*;
