//! Core library for standctl
//!
//! This crate defines the shared types, the error taxonomy, the unit
//! allocation algorithm and the transports used to drive lab devices.

pub mod allocation;
pub mod credentials;
pub mod error;
pub mod transport;
pub mod types;

// Re-exports
pub use allocation::{select_units, Allocatable, GroupHeadroom};
pub use credentials::{ConfiguredCredentials, CredentialProvider, ReleaseHelper};
pub use error::{Error, ErrorKind, Result};
pub use transport::{run_once, Session, Transport};
pub use types::{
    CredentialContext, ErrorDescriptor, Operation, RawOutput, RequestedCounts,
    ReservationStatus, SerialLine, SerialTarget, ShellTarget, Target, TaskOutput, TaskResult,
    TaskState, TransportKind, UnitKind, UnitStatus,
};
