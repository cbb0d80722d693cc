//! Execution worker
//!
//! Runs one attempt of a job: claim, resolve credentials, connect, perform
//! the operation, close, then record SUCCESS, RETRY or FAILURE.

use sqlx::{Pool, Sqlite};
use standctl_core::{
    run_once, CredentialProvider, Error, ErrorDescriptor, RawOutput, Result, Target, TaskOutput,
    TaskResult, TaskState, Transport,
};
use standctl_database::{queries, TaskTransitionUpdate};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::WeakUnboundedSender;
use tracing::{debug, error, info, instrument, warn};

use crate::job::Job;

/// Executes jobs of one lane
pub struct Worker {
    db_pool: Pool<Sqlite>,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
    /// Lane queue for retries; weak so a dropped dispatcher closes the lane
    retry_lane: WeakUnboundedSender<Job>,
}

impl Worker {
    pub fn new(
        db_pool: Pool<Sqlite>,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialProvider>,
        retry_lane: WeakUnboundedSender<Job>,
    ) -> Self {
        Self {
            db_pool,
            transport,
            credentials,
            retry_lane,
        }
    }

    /// Run one attempt of `job`.
    ///
    /// Returns the state the task was moved to, or `None` if the job was
    /// dropped because the task could not be claimed (e.g. it was cancelled).
    #[instrument(skip(self, job), fields(task_id = %job.task_id, lane = %job.transport()))]
    pub async fn run(&self, mut job: Job) -> Result<Option<TaskState>> {
        if job.attempt >= job.max_retries {
            let err = Error::MaxRetriesExceeded {
                attempts: job.attempt,
            };
            warn!(attempts = job.attempt, max_retries = job.max_retries, "Retry budget exhausted");
            let moved = queries::transition_task(
                &self.db_pool,
                &job.task_id,
                &[TaskState::Pending, TaskState::Retry],
                TaskTransitionUpdate::to(TaskState::Failure).with_error(ErrorDescriptor::from(&err)),
            )
            .await?;
            return Ok(moved.then_some(TaskState::Failure));
        }

        let attempt = job.attempt + 1;
        if !queries::claim_task(&self.db_pool, &job.task_id, attempt).await? {
            debug!("Task is no longer queued, dropping job");
            return Ok(None);
        }
        job.attempt = attempt;

        info!(
            attempt,
            max_retries = job.max_retries,
            target = %job.target.display(),
            op = job.operation.name(),
            "Task started"
        );

        match self.execute(&job).await {
            Ok((raw, elapsed)) => {
                let result = TaskResult {
                    output: TaskOutput::from_raw(&job.operation, raw),
                    elapsed_secs: elapsed.as_secs_f64(),
                };
                info!(attempt, elapsed_secs = result.elapsed_secs, "Task succeeded");
                self.record(&job, TaskTransitionUpdate::to(TaskState::Success).with_result(result))
                    .await?;
                Ok(Some(TaskState::Success))
            }
            Err(e) if e.is_retryable() && attempt < job.max_retries => {
                warn!(
                    attempt,
                    error = %e,
                    retry_in_secs = job.retry_delay_secs,
                    "Attempt failed, will retry"
                );
                let update =
                    TaskTransitionUpdate::to(TaskState::Retry).with_error(ErrorDescriptor::from(&e));
                if self.record(&job, update).await? {
                    self.schedule_retry(job);
                }
                Ok(Some(TaskState::Retry))
            }
            Err(e) => {
                error!(attempt, error = %e, category = e.category(), "Task failed");
                let update = TaskTransitionUpdate::to(TaskState::Failure)
                    .with_error(ErrorDescriptor::from(&e));
                self.record(&job, update).await?;
                Ok(Some(TaskState::Failure))
            }
        }
    }

    /// Resolve credentials, then connect, run and close, timing the transport part
    async fn execute(&self, job: &Job) -> Result<(RawOutput, Duration)> {
        let target = self.resolve_target(&job.target).await?;

        let started = Instant::now();
        let raw = run_once(self.transport.as_ref(), &target, &job.operation, job.timeout()).await?;
        Ok((raw, started.elapsed()))
    }

    async fn resolve_target(&self, target: &Target) -> Result<Target> {
        let mut target = target.clone();
        if let Target::Shell(shell) = &mut target {
            if shell.password.is_none() {
                let password = self
                    .credentials
                    .get_credential(&shell.username, &shell.credential_context)
                    .await?;
                shell.password = Some(password);
            }
        }
        Ok(target)
    }

    /// STARTED -> next state. Returns whether the write happened.
    async fn record(&self, job: &Job, update: TaskTransitionUpdate) -> Result<bool> {
        let to = update.to;
        let moved =
            queries::transition_task(&self.db_pool, &job.task_id, &[TaskState::Started], update)
                .await?;
        if !moved {
            warn!(task_id = %job.task_id, to = %to, "Task left STARTED unexpectedly, result dropped");
        }
        Ok(moved)
    }

    /// Put the job back on its lane after the fixed retry delay
    fn schedule_retry(&self, job: Job) {
        let lane = self.retry_lane.clone();
        let delay = job.retry_delay();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match lane.upgrade() {
                Some(tx) => {
                    let task_id = job.task_id.clone();
                    if tx.send(job).is_err() {
                        warn!(task_id = %task_id, "Lane closed before retry could be queued");
                    }
                }
                None => {
                    debug!(task_id = %job.task_id, "Lane gone, task left in RETRY for recovery");
                }
            }
        });
    }
}
