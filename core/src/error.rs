//! Error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Subsystem an error originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Inventory, reservation and task lookups
    Resource,
    /// Shell/serial transports and credential retrieval
    Transport,
    /// Invalid input or configuration
    Config,
    /// Storage and everything else
    Internal,
}

/// Main error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Reservation not found: {0}")]
    ReservationNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("Allocation conflict: {0}")]
    AllocationConflict(String),

    #[error("Resource not leased: {0}")]
    ResourceNotLeased(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Connection failed: {0}")]
    TransportConnect(String),

    #[error("Timed out: {0}")]
    TransportTimeout(String),

    #[error("Authentication failed: {0}")]
    TransportAuth(String),

    #[error("Credential error: {0}")]
    CredentialError(String),

    #[error("Max retries exceeded after {attempts} attempt(s)")]
    MaxRetriesExceeded { attempts: u32 },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Subsystem this error belongs to
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ResourceNotFound(_)
            | Self::ReservationNotFound(_)
            | Self::TaskNotFound(_)
            | Self::InsufficientResources(_)
            | Self::AllocationConflict(_)
            | Self::ResourceNotLeased(_)
            | Self::CapacityExceeded(_) => ErrorKind::Resource,
            Self::TransportConnect(_)
            | Self::TransportTimeout(_)
            | Self::TransportAuth(_)
            | Self::CredentialError(_)
            | Self::MaxRetriesExceeded { .. }
            | Self::IoError(_) => ErrorKind::Transport,
            Self::InvalidRequest(_) | Self::ConfigError(_) => ErrorKind::Config,
            Self::DatabaseError(_) | Self::SerializationError(_) | Self::Other(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether the operation that produced this error may be attempted again.
    ///
    /// Unclassified failures (`Other`, IO, storage) count as retryable so the
    /// worker keeps the diagnostic and re-runs within its bound.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::AllocationConflict(_)
            | Self::TransportConnect(_)
            | Self::TransportTimeout(_)
            | Self::TransportAuth(_)
            | Self::CredentialError(_)
            | Self::DatabaseError(_)
            | Self::IoError(_)
            | Self::Other(_) => true,
            Self::ResourceNotFound(_)
            | Self::ReservationNotFound(_)
            | Self::TaskNotFound(_)
            | Self::InsufficientResources(_)
            | Self::ResourceNotLeased(_)
            | Self::CapacityExceeded(_)
            | Self::InvalidRequest(_)
            | Self::MaxRetriesExceeded { .. }
            | Self::ConfigError(_)
            | Self::SerializationError(_) => false,
        }
    }

    /// Stable snake_case name recorded with failed tasks and returned by the API
    pub fn category(&self) -> &'static str {
        match self {
            Self::ResourceNotFound(_) => "resource_not_found",
            Self::ReservationNotFound(_) => "reservation_not_found",
            Self::TaskNotFound(_) => "task_not_found",
            Self::InsufficientResources(_) => "insufficient_resources",
            Self::AllocationConflict(_) => "allocation_conflict",
            Self::ResourceNotLeased(_) => "resource_not_leased",
            Self::CapacityExceeded(_) => "capacity_exceeded",
            Self::InvalidRequest(_) => "invalid_request",
            Self::TransportConnect(_) => "transport_connect_error",
            Self::TransportTimeout(_) => "transport_timeout",
            Self::TransportAuth(_) => "transport_auth_error",
            Self::CredentialError(_) => "credential_error",
            Self::MaxRetriesExceeded { .. } => "max_retries_exceeded",
            Self::ConfigError(_) => "config_error",
            Self::DatabaseError(_) => "database_error",
            Self::IoError(_) => "io_error",
            Self::SerializationError(_) => "serialization_error",
            Self::Other(_) => "other",
        }
    }

    /// True for the three lookup failures
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ResourceNotFound(_) | Self::ReservationNotFound(_) | Self::TaskNotFound(_)
        )
    }
}

// Convert anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}
