//! Command-line argument parsing.

use clap::Parser;
use limiquantix_common::LogFormat;

/// limiquantix Pool Agent - VM state reconciliation for hypervisor pools
#[derive(Parser, Debug)]
#[command(name = "limiquantix-pool-agent")]
#[command(about = "limiquantix Pool Agent - VM state reconciliation for hypervisor pools")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, env = "LIMIQUANTIX_POOL_CONFIG")]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Log format (pretty, json); overrides the config file
    #[arg(long)]
    pub log_format: Option<LogFormat>,

    /// Enable development mode (in-memory mock pool)
    #[arg(long)]
    pub dev: bool,

    /// Run one full sync and one delta sync, then exit
    #[arg(long)]
    pub once: bool,
}
