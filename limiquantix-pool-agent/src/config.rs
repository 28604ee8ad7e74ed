//! Configuration management for the Pool Agent.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use limiquantix_common::LogFormat;
use limiquantix_pool::{ConnectionSettings, Credentials, ReconcileSettings};

use crate::cli::Args;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Pool endpoint and credentials
    pub pool: PoolConfig,
    /// Cluster the pool's VMs are reconciled into
    pub cluster: ClusterConfig,
    /// Retry and login tunables
    pub connection: ConnectionSettings,
    /// Halted-report confirmation tunables
    pub reconcile: ReconcileSettings,
    /// Log output
    pub logging: LoggingConfig,
    /// Use the in-memory mock pool instead of a real endpoint
    pub dev_mode: bool,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).with_context(|| "Failed to parse config file")
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }

        if let Some(format) = args.log_format {
            self.logging.format = format;
        }

        if args.dev {
            self.dev_mode = true;
            self.pool.accept_invalid_certs = true;
        }

        self
    }
}

/// Pool endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Stable pool identifier used as the connection pool key
    pub id: String,
    /// Any member host; login follows the redirect to the master
    pub address: String,
    /// Login user
    pub username: String,
    /// Candidate passwords, tried in order
    pub passwords: Vec<String>,
    /// UUID of the host this agent expects to be master, if any
    pub master_host_uuid: Option<String>,
    /// Accept self-signed certificates on the management endpoint.
    /// Off unless enabled in the file or by `--dev`.
    pub accept_invalid_certs: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            address: "https://localhost".to_string(),
            username: "root".to_string(),
            passwords: Vec::new(),
            master_host_uuid: None,
            accept_invalid_certs: false,
        }
    }
}

impl PoolConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.username.clone(), self.passwords.clone())
    }
}

/// Cluster reconciliation configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster identifier in the state table
    pub id: String,
    /// Seconds between delta syncs
    pub sync_interval_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            sync_interval_secs: 60,
        }
    }
}

impl ClusterConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }
}

/// Log output configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (pretty, json)
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}
