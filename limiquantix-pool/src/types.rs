//! Type definitions shared by the connection, task and reconciliation layers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// SESSIONS & TASKS
// =============================================================================

/// Opaque session token returned by a successful login.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionRef(pub String);

impl SessionRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Session references are bearer tokens; keep them out of logs.
impl fmt::Debug for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let visible: String = self.0.chars().take(12).collect();
        write!(f, "SessionRef({}…)", visible)
    }
}

/// Handle to a remote asynchronous task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(pub String);

impl TaskHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status reported by `task.get_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Success,
    Failure,
    Cancelling,
    Cancelled,
}

impl TaskStatus {
    /// Parse the wire representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "cancelling" => Some(Self::Cancelling),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
        }
    }

    /// Still running on the remote side.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending | Self::Cancelling)
    }
}

/// How a task run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskTerminal {
    Success,
    Failure,
    TimedOut,
    Cancelled,
}

// =============================================================================
// CREDENTIALS
// =============================================================================

/// Login credentials for a pool.
///
/// `passwords` is an ordered list of candidates; the connection walks it
/// front-to-back whenever authentication is rejected.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub passwords: Vec<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, passwords: Vec<String>) -> Self {
        Self { username: username.into(), passwords }
    }

    /// Single-password credentials.
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::new(username, vec![password.into()])
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("passwords", &format_args!("[{} redacted]", self.passwords.len()))
            .finish()
    }
}

// =============================================================================
// VM STATE
// =============================================================================

/// Power state as tracked by the agent.
///
/// `Starting`, `Stopping` and `Migrating` are never reported by the pool;
/// they are written optimistically by command handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Migrating,
    Unknown,
}

impl Default for PowerState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl PowerState {
    /// Map the pool's `power_state` field.
    ///
    /// Paused and suspended domains still hold their host's resources, so
    /// they are tracked as running.
    pub fn from_remote(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "running" | "paused" | "suspended" => Self::Running,
            "halted" => Self::Stopped,
            _ => Self::Unknown,
        }
    }

    /// `Stopped` or `Stopping`.
    pub fn is_stopped_or_stopping(&self) -> bool {
        matches!(self, Self::Stopped | Self::Stopping)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Migrating => "Migrating",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Cached placement and power state of one VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmStateEntry {
    /// Host the VM is resident on (None = unplaced/unknown)
    pub host: Option<String>,
    /// Last known power state
    pub state: PowerState,
    /// Bumped on every write
    pub version: u64,
    /// When this entry was last written
    pub last_seen: DateTime<Utc>,
}

/// A VM as seen in one remote scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedVm {
    pub name: String,
    pub host: Option<String>,
    pub state: PowerState,
}

/// A change reported upstream by delta sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmStateChange {
    pub vm: String,
    pub host: Option<String>,
    pub state: PowerState,
}

impl VmStateChange {
    pub fn new(vm: impl Into<String>, host: Option<String>, state: PowerState) -> Self {
        Self { vm: vm.into(), host, state }
    }
}
