//! Shared types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, ErrorKind};

/// Requested unit type -> count. Ordered so iteration is deterministic.
pub type RequestedCounts = BTreeMap<String, u32>;

/// Kind of leasable unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Device,
    Pin,
}

impl UnitKind {
    /// Parse kind from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "device" => Some(Self::Device),
            "pin" => Some(Self::Pin),
            _ => None,
        }
    }

    /// Convert kind to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Pin => "pin",
        }
    }
}

/// Lease status of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Available,
    Leased,
}

impl UnitStatus {
    /// Parse status from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "available" => Some(Self::Available),
            "leased" => Some(Self::Leased),
            _ => None,
        }
    }

    /// Convert status to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Leased => "leased",
        }
    }
}

/// Reservation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Active,
    Released,
}

impl ReservationStatus {
    /// Parse status from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "released" => Some(Self::Released),
            _ => None,
        }
    }

    /// Convert status to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Released => "released",
        }
    }
}

/// Observable state of a remote-command task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Started,
    Retry,
    Success,
    Failure,
    Cancelled,
}

impl TaskState {
    /// Parse state from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "STARTED" => Some(Self::Started),
            "RETRY" => Some(Self::Retry),
            "SUCCESS" => Some(Self::Success),
            "FAILURE" => Some(Self::Failure),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Convert state to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Started => "STARTED",
            Self::Retry => "RETRY",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Cancelled)
    }

    /// States in which a queued job may still be picked up (or cancelled)
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending | Self::Retry)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport a task runs over; each kind has its own execution lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Shell,
    Serial,
}

impl TransportKind {
    /// Parse transport from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "shell" => Some(Self::Shell),
            "serial" => Some(Self::Serial),
            _ => None,
        }
    }

    /// Convert transport to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Serial => "serial",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single logical operation a task performs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    /// Run a command in a remote shell
    Exec { command: String },
    /// Drain the serial line until it goes quiet
    Read,
    /// Write text to the serial line
    Write { text: String },
    /// Write text, then immediately drain the line
    WriteThenRead { text: String },
}

impl Operation {
    /// Operation name as stored and reported
    pub fn name(&self) -> &'static str {
        match self {
            Self::Exec { .. } => "exec",
            Self::Read => "read",
            Self::Write { .. } => "write",
            Self::WriteThenRead { .. } => "write_then_read",
        }
    }

    /// Whether the given transport can carry this operation
    pub fn supported_by(&self, transport: TransportKind) -> bool {
        match transport {
            TransportKind::Shell => matches!(self, Self::Exec { .. }),
            TransportKind::Serial => !matches!(self, Self::Exec { .. }),
        }
    }

    /// Writes have side effects on the device and are not safe to repeat
    pub fn is_idempotent(&self) -> bool {
        matches!(self, Self::Exec { .. } | Self::Read)
    }
}

/// Context handed to the credential provider alongside the user name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialContext {
    /// Device model, e.g. `tedix-v1-02`
    pub unit_type: String,
    /// Kind of image installed on the device (`dev`, `release`, ...)
    pub image: Option<String>,
}

/// Network shell endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential_context: CredentialContext,
    /// Filled in by the worker right before connecting; never persisted
    #[serde(skip)]
    pub password: Option<String>,
}

/// Serial line parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialLine {
    pub baudrate: u32,
    pub data_bits: u8,
    /// `N`, `E` or `O`
    pub parity: char,
    pub stop_bits: u8,
}

impl Default for SerialLine {
    fn default() -> Self {
        Self {
            baudrate: 115_200,
            data_bits: 8,
            parity: 'N',
            stop_bits: 1,
        }
    }
}

/// Serial port endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialTarget {
    pub port: String,
    pub line: SerialLine,
}

/// Where a transport connects to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum Target {
    Shell(ShellTarget),
    Serial(SerialTarget),
}

impl Target {
    /// Transport kind for this target
    pub fn transport(&self) -> TransportKind {
        match self {
            Self::Shell(_) => TransportKind::Shell,
            Self::Serial(_) => TransportKind::Serial,
        }
    }

    /// Display string for logs
    pub fn display(&self) -> String {
        match self {
            Self::Shell(t) => format!("{}@{}:{}", t.username, t.host, t.port),
            Self::Serial(t) => format!(
                "{} ({}{}{}{})",
                t.port, t.line.baudrate, t.line.data_bits, t.line.parity, t.line.stop_bits
            ),
        }
    }
}

/// Untyped output of one transport operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// Typed payload of a successful task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum TaskOutput {
    Exec {
        stdout: String,
        stderr: String,
        exit_code: Option<i32>,
    },
    Read {
        output: String,
    },
    Write,
    WriteThenRead {
        output: String,
    },
}

impl TaskOutput {
    /// Shape raw transport output according to the operation that produced it
    pub fn from_raw(operation: &Operation, raw: RawOutput) -> Self {
        match operation {
            Operation::Exec { .. } => Self::Exec {
                stdout: raw.stdout,
                stderr: raw.stderr,
                exit_code: raw.exit_code,
            },
            Operation::Read => Self::Read { output: raw.stdout },
            Operation::Write { .. } => Self::Write,
            Operation::WriteThenRead { .. } => Self::WriteThenRead { output: raw.stdout },
        }
    }
}

/// Result stored with a SUCCESS task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(flatten)]
    pub output: TaskOutput,
    /// Wall time of connect + operation, in seconds
    pub elapsed_secs: f64,
}

/// Captured diagnostic of the last failed attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: ErrorKind,
    pub category: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&Error> for ErrorDescriptor {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            category: err.category().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}
