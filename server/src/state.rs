//! Application state

use std::sync::Arc;
use standctl_database::{Database, ReservationManager, SqlxPool, SqlxSqlite};
use standctl_scheduler::Dispatcher;

use crate::config::Config;

/// Services every request handler works with
#[derive(Clone)]
pub struct LabContext {
    pub database: Database,
    pub reservations: ReservationManager,
    pub dispatcher: Dispatcher,
}

impl LabContext {
    pub fn new(database: Database, reservations: ReservationManager, dispatcher: Dispatcher) -> Self {
        Self {
            database,
            reservations,
            dispatcher,
        }
    }
}

/// Shared application state
///
/// Cloned into every handler by axum; all fields are cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub lab: LabContext,
}

impl AppState {
    pub fn new(config: Config, lab: LabContext) -> Self {
        Self {
            config: Arc::new(config),
            lab,
        }
    }

    pub fn pool(&self) -> &SqlxPool<SqlxSqlite> {
        self.lab.database.pool()
    }
}
