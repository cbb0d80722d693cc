// Database models

pub mod reservation;
pub mod task;
pub mod unit;

pub use reservation::*;
pub use task::*;
pub use unit::*;
