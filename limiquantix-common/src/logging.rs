//! Logging initialization using tracing.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    fmt::{self as tracing_fmt, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, one event per line.
    #[default]
    Pretty,
    /// One JSON object per event, for log aggregation.
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(anyhow!("unknown log format: {}", other)),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG`, when set, takes precedence over `level`.
///
/// # Example
/// ```
/// limiquantix_common::init_logging("info", limiquantix_common::LogFormat::Pretty).unwrap();
/// ```
pub fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| anyhow!("invalid log level {:?}: {}", level, e))?;

    let registry = tracing_subscriber::registry().with(filter);

    let installed = match format {
        LogFormat::Pretty => registry
            .with(
                tracing_fmt::layer()
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_fmt::layer()
                    .json()
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_target(true)
                    .with_current_span(true),
            )
            .try_init(),
    };

    installed.map_err(|e| anyhow!("failed to install log subscriber: {}", e))
}
