//! Job messages passed from the dispatcher to the lanes

use serde::{Deserialize, Serialize};
use standctl_core::{Operation, Target, TransportKind};
use std::time::Duration;

/// Immutable description of one queued task execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub task_id: String,
    pub unit_id: String,
    pub target: Target,
    pub operation: Operation,
    /// Attempts already made before this one
    pub attempt: u32,
    pub max_retries: u32,
    pub timeout_secs: u64,
    pub retry_delay_secs: u64,
}

impl Job {
    pub fn transport(&self) -> TransportKind {
        self.target.transport()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Submission request for a remote-command task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub target_unit: String,
    pub transport: TransportKind,
    pub operation: Operation,
    /// Shell user; defaults to the configured user
    pub username: Option<String>,
    /// Serial baudrate override
    pub baudrate: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_delay_secs: Option<u64>,
}

/// What a client gets back from a submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub task_id: String,
    pub status_location: String,
}
