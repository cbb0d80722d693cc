//! Lane and housekeeping settings

use serde::{Deserialize, Serialize};
use standctl_core::{SerialLine, TransportKind};
use std::time::Duration;

/// Settings of one execution lane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneConfig {
    /// Jobs executed concurrently on this lane
    pub workers: usize,
    /// Total attempts before a task fails for good
    pub max_retries: u32,
    /// Fixed delay before a failed attempt is re-queued
    pub retry_delay_secs: u64,
    /// Default timeout of one operation
    pub command_timeout_secs: u64,
}

impl LaneConfig {
    pub fn shell_default() -> Self {
        Self {
            workers: 4,
            max_retries: 3,
            retry_delay_secs: 5,
            command_timeout_secs: 5,
        }
    }

    pub fn serial_default() -> Self {
        Self {
            workers: 2,
            max_retries: 2,
            retry_delay_secs: 3,
            command_timeout_secs: 5,
        }
    }
}

fn default_shell_lane() -> LaneConfig {
    LaneConfig::shell_default()
}

fn default_serial_lane() -> LaneConfig {
    LaneConfig::serial_default()
}

/// Per-transport lanes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanesConfig {
    #[serde(default = "default_shell_lane")]
    pub shell: LaneConfig,
    #[serde(default = "default_serial_lane")]
    pub serial: LaneConfig,
}

impl Default for LanesConfig {
    fn default() -> Self {
        Self {
            shell: LaneConfig::shell_default(),
            serial: LaneConfig::serial_default(),
        }
    }
}

impl LanesConfig {
    pub fn get(&self, kind: TransportKind) -> &LaneConfig {
        match kind {
            TransportKind::Shell => &self.shell,
            TransportKind::Serial => &self.serial,
        }
    }
}

/// Everything the dispatcher needs to turn a submission into a job
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub lanes: LanesConfig,
    /// Line parameters used when a submission does not override them
    pub serial_line: SerialLine,
    /// Shell user used when a submission does not name one
    pub default_user: String,
    /// Path prefix under which task status is polled
    pub status_prefix: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            lanes: LanesConfig::default(),
            serial_line: SerialLine::default(),
            default_user: "root".to_string(),
            status_prefix: "/api/v1/tasks".to_string(),
        }
    }
}

/// Cron schedules of the housekeeping jobs (six fields, seconds first)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HousekeepingConfig {
    pub reservation_sweep: String,
    pub task_purge: String,
    /// How long finished tasks stay pollable
    pub task_result_ttl_secs: u64,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            reservation_sweep: "*/30 * * * * *".to_string(),
            task_purge: "0 */5 * * * *".to_string(),
            task_result_ttl_secs: 3600,
        }
    }
}

impl HousekeepingConfig {
    pub fn task_result_ttl(&self) -> Duration {
        Duration::from_secs(self.task_result_ttl_secs)
    }
}
