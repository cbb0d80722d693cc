use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use standctl_core::{ErrorDescriptor, TaskResult, TaskState, TransportKind};

/// Task row in the status store
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: String,
    pub unit_id: String,
    #[sqlx(rename = "transport")]
    pub transport_str: String,
    pub operation: String,
    /// Immutable job message as JSON
    #[serde(skip)]
    pub job: String,
    #[sqlx(rename = "state")]
    pub state_str: String,
    pub attempts: i64,
    pub max_retries: i64,
    pub result: Option<String>,
    pub last_error: Option<String>,
    pub elapsed_secs: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Get state as enum
    pub fn state(&self) -> Option<TaskState> {
        TaskState::from_str(&self.state_str)
    }

    /// Get transport as enum
    pub fn transport(&self) -> Option<TransportKind> {
        TransportKind::from_str(&self.transport_str)
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_some_and(|s| s.is_terminal())
    }

    /// Parse the stored result
    pub fn get_result(&self) -> Option<TaskResult> {
        self.result
            .as_ref()
            .and_then(|r| serde_json::from_str(r).ok())
    }

    /// Parse the stored error descriptor
    pub fn get_last_error(&self) -> Option<ErrorDescriptor> {
        self.last_error
            .as_ref()
            .and_then(|e| serde_json::from_str(e).ok())
    }
}

/// One entry of the transition log
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskTransition {
    #[serde(skip)]
    pub id: i64,
    #[serde(skip)]
    pub task_id: String,
    pub state: String,
    pub attempt: i64,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Polled view of a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: String,
    pub state: TaskState,
    pub transport: Option<TransportKind>,
    pub operation: String,
    pub unit_id: String,
    pub attempts: u32,
    pub max_retries: u32,
    pub last_error: Option<ErrorDescriptor>,
    pub result: Option<TaskResult>,
    pub history: Vec<TaskTransition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskStatus {
    pub fn from_task(task: Task, history: Vec<TaskTransition>) -> Option<Self> {
        Some(Self {
            state: task.state()?,
            transport: task.transport(),
            last_error: task.get_last_error(),
            result: task.get_result(),
            attempts: u32::try_from(task.attempts).unwrap_or(0),
            max_retries: u32::try_from(task.max_retries).unwrap_or(0),
            id: task.id,
            operation: task.operation,
            unit_id: task.unit_id,
            history,
            created_at: task.created_at,
            updated_at: task.updated_at,
            finished_at: task.finished_at,
        })
    }
}

/// Input for recording a submitted task
#[derive(Debug, Clone)]
pub struct CreateTask {
    pub id: String,
    pub unit_id: String,
    pub transport: TransportKind,
    pub operation: String,
    pub job: String,
    pub max_retries: u32,
}

/// State change applied by a compare-and-set
#[derive(Debug, Clone)]
pub struct TaskTransitionUpdate {
    pub to: TaskState,
    /// New attempt count; unchanged when `None`
    pub attempts: Option<u32>,
    pub error: Option<ErrorDescriptor>,
    pub result: Option<TaskResult>,
}

impl TaskTransitionUpdate {
    pub fn to(state: TaskState) -> Self {
        Self {
            to: state,
            attempts: None,
            error: None,
            result: None,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_error(mut self, error: ErrorDescriptor) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_result(mut self, result: TaskResult) -> Self {
        self.result = Some(result);
        self
    }
}

/// Filter for task listings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFilter {
    pub state: Option<TaskState>,
    pub unit: Option<String>,
    pub limit: Option<i64>,
}
