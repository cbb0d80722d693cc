//! Task execution lanes and the housekeeping scheduler

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use standctl_core::{Error, Result};

pub mod config;
pub mod dispatcher;
pub mod housekeeping;
pub mod job;
pub mod worker;

pub use config::{DispatcherConfig, HousekeepingConfig, LaneConfig, LanesConfig};
pub use dispatcher::{Dispatcher, Lanes, Transports, MAX_RETRY_DELAY_SECS, MAX_TIMEOUT_SECS};
pub use job::{Job, JobSpec, TaskHandle};
pub use worker::Worker;

type JobFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type JobHandler = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Scheduled job
pub struct ScheduledJob {
    pub id: String,
    pub schedule: Schedule,
    handler: JobHandler,
}

/// Cron scheduler for periodic jobs
pub struct Scheduler {
    jobs: Arc<RwLock<Vec<ScheduledJob>>>,
    tick: Duration,
}

impl Scheduler {
    /// Create a new scheduler checking once per second
    pub fn new() -> Self {
        Self::with_tick(Duration::from_secs(1))
    }

    pub fn with_tick(tick: Duration) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(Vec::new())),
            tick,
        }
    }

    /// Add a job to the scheduler
    pub async fn add_job<F, Fut>(
        &self,
        id: impl Into<String>,
        cron_expr: &str,
        handler: F,
    ) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let schedule = Schedule::from_str(cron_expr).map_err(|e| {
            Error::ConfigError(format!("Invalid cron expression '{}': {}", cron_expr, e))
        })?;

        let id = id.into();
        info!(id = %id, schedule = %cron_expr, "Scheduled job added");

        let handler: JobHandler = Arc::new(move || Box::pin(handler()) as JobFuture);
        self.jobs.write().await.push(ScheduledJob {
            id,
            schedule,
            handler,
        });

        Ok(())
    }

    /// Ids of the registered jobs
    pub async fn job_ids(&self) -> Vec<String> {
        self.jobs.read().await.iter().map(|j| j.id.clone()).collect()
    }

    /// Run every job with an occurrence in `(since, now]`, once each.
    ///
    /// Returns how many jobs ran.
    pub async fn run_due(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> usize {
        let due: Vec<(String, JobHandler)> = {
            let jobs = self.jobs.read().await;
            jobs.iter()
                .filter(|job| {
                    job.schedule
                        .after(&since)
                        .next()
                        .is_some_and(|next| next <= now)
                })
                .map(|job| (job.id.clone(), job.handler.clone()))
                .collect()
        };

        for (id, handler) in &due {
            debug!(job_id = %id, "Executing scheduled job");
            match handler().await {
                Ok(()) => debug!(job_id = %id, "Scheduled job completed"),
                Err(e) => error!(job_id = %id, error = %e, "Scheduled job failed"),
            }
        }

        due.len()
    }

    /// Start the scheduler loop
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        info!(tick_ms = self.tick.as_millis() as u64, "Starting scheduler");

        tokio::spawn(async move {
            let mut last = Utc::now();
            loop {
                tokio::time::sleep(self.tick).await;
                let now = Utc::now();
                self.run_due(last, now).await;
                last = now;
            }
        })
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
