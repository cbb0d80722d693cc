//! Periodic maintenance jobs

use chrono::Utc;
use sqlx::{Pool, Sqlite};
use standctl_core::{Error, Result};
use standctl_database::{queries, ReservationManager};
use std::time::Duration;
use tracing::info;

use crate::config::HousekeepingConfig;
use crate::Scheduler;

/// Release every reservation whose TTL has passed
pub async fn release_expired_reservations(manager: &ReservationManager) -> Result<usize> {
    let released = manager.release_expired(Utc::now()).await?;
    Ok(released.len())
}

/// Delete finished tasks older than `ttl`
pub async fn purge_finished_tasks(pool: &Pool<Sqlite>, ttl: Duration) -> Result<u64> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| Error::ConfigError(format!("task result ttl out of range: {}", e)))?;
    let removed = queries::purge_finished(pool, Utc::now() - ttl).await?;
    if removed > 0 {
        info!(removed, "Purged finished tasks");
    }
    Ok(removed)
}

/// Register the maintenance jobs on `scheduler`
pub async fn register(
    scheduler: &Scheduler,
    config: &HousekeepingConfig,
    manager: ReservationManager,
    pool: Pool<Sqlite>,
) -> Result<()> {
    scheduler
        .add_job("release_expired_reservations", &config.reservation_sweep, move || {
            let manager = manager.clone();
            async move { release_expired_reservations(&manager).await.map(|_| ()) }
        })
        .await?;

    let ttl = config.task_result_ttl();
    scheduler
        .add_job("purge_finished_tasks", &config.task_purge, move || {
            let pool = pool.clone();
            async move { purge_finished_tasks(&pool, ttl).await.map(|_| ()) }
        })
        .await?;

    Ok(())
}
