//! # limiquantix Common
//!
//! Shared utilities for the limiquantix pool components.
//!
//! ## Logging
//!
//! ```rust
//! use limiquantix_common::{init_logging, LogFormat};
//!
//! init_logging("info", LogFormat::Pretty).unwrap();
//! tracing::info!(pool_id = "pool-1", "Connected");
//! ```

pub mod logging;

pub use logging::{init_logging, LogFormat};
