//! Database query modules

pub mod reservations;
pub mod tasks;
pub mod units;

// Re-export commonly used functions for convenience
pub use reservations::*;
pub use tasks::*;
pub use units::*;
