//! Task dispatcher
//!
//! Validates submissions, records them as PENDING and queues an immutable
//! [`Job`] on the lane of its transport. Each lane is an independent queue
//! drained by a bounded pool of workers.

use sqlx::{Pool, Sqlite};
use standctl_core::transport::serial::validate_line;
use standctl_core::{
    CredentialContext, CredentialProvider, Error, ErrorDescriptor, Result, SerialLine,
    SerialTarget, ShellTarget, Target, TaskState, Transport, TransportKind,
};
use standctl_database::{
    queries, CreateTask, Task, TaskFilter, TaskStatus, TaskTransitionUpdate, Unit,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::DispatcherConfig;
use crate::job::{Job, JobSpec, TaskHandle};
use crate::worker::Worker;

/// Longest per-attempt timeout a submission may ask for
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Longest delay between attempts a submission may ask for
pub const MAX_RETRY_DELAY_SECS: u64 = 60 * 60;

/// One transport implementation per lane
#[derive(Clone)]
pub struct Transports {
    shell: Arc<dyn Transport>,
    serial: Arc<dyn Transport>,
}

impl Transports {
    pub fn new(shell: Arc<dyn Transport>, serial: Arc<dyn Transport>) -> Self {
        Self { shell, serial }
    }

    /// SSH for the shell lane, tokio-serial for the serial lane
    pub fn native() -> Self {
        Self {
            shell: Arc::new(standctl_core::transport::SshTransport::new()),
            serial: Arc::new(standctl_core::transport::SerialTransport::new()),
        }
    }

    pub fn get(&self, kind: TransportKind) -> Arc<dyn Transport> {
        match kind {
            TransportKind::Shell => self.shell.clone(),
            TransportKind::Serial => self.serial.clone(),
        }
    }
}

/// Receiving ends of the lane queues, consumed when the lanes are spawned
pub struct Lanes {
    receivers: HashMap<TransportKind, UnboundedReceiver<Job>>,
}

impl Lanes {
    /// Take the queue of one lane, e.g. to drain it by hand
    pub fn take(&mut self, kind: TransportKind) -> Option<UnboundedReceiver<Job>> {
        self.receivers.remove(&kind)
    }

    /// Spawn one consumer loop per lane
    pub fn spawn(
        mut self,
        dispatcher: &Dispatcher,
        transports: &Transports,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for kind in [TransportKind::Shell, TransportKind::Serial] {
            let Some(rx) = self.take(kind) else {
                continue;
            };
            let worker = Arc::new(dispatcher.worker(kind, transports.get(kind), credentials.clone()));
            let workers = dispatcher.config.lanes.get(kind).workers;
            handles.push(tokio::spawn(run_lane(kind, rx, worker, workers)));
        }

        handles
    }
}

async fn run_lane(
    kind: TransportKind,
    mut rx: UnboundedReceiver<Job>,
    worker: Arc<Worker>,
    workers: usize,
) {
    // Bounds concurrent jobs on this lane
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    info!(lane = %kind, workers, "Lane started");

    while let Some(job) = rx.recv().await {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                error!(lane = %kind, error = %e, "Lane semaphore closed");
                break;
            }
        };

        let worker = worker.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let task_id = job.task_id.clone();
            if let Err(e) = worker.run(job).await {
                error!(task_id = %task_id, error = %e, "Failed to record task outcome");
            }
        });
    }

    info!(lane = %kind, "Lane stopped");
}

/// Entry point for remote-command tasks
#[derive(Clone)]
pub struct Dispatcher {
    db_pool: Pool<Sqlite>,
    config: Arc<DispatcherConfig>,
    lanes: HashMap<TransportKind, UnboundedSender<Job>>,
}

impl Dispatcher {
    /// Create a dispatcher and its (not yet consumed) lane queues
    pub fn new(db_pool: Pool<Sqlite>, config: DispatcherConfig) -> (Self, Lanes) {
        let mut lanes = HashMap::new();
        let mut receivers = HashMap::new();
        for kind in [TransportKind::Shell, TransportKind::Serial] {
            let (tx, rx) = mpsc::unbounded_channel();
            lanes.insert(kind, tx);
            receivers.insert(kind, rx);
        }

        let dispatcher = Self {
            db_pool,
            config: Arc::new(config),
            lanes,
        };
        (dispatcher, Lanes { receivers })
    }

    /// Create a dispatcher with running lanes
    pub fn start(
        db_pool: Pool<Sqlite>,
        config: DispatcherConfig,
        transports: &Transports,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let (dispatcher, lanes) = Self::new(db_pool, config);
        lanes.spawn(&dispatcher, transports, credentials);
        dispatcher
    }

    /// Worker bound to the lane of `kind`
    pub fn worker(
        &self,
        kind: TransportKind,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Worker {
        let retry_lane = self
            .lanes
            .get(&kind)
            .map(|tx| tx.downgrade())
            .unwrap_or_else(|| mpsc::unbounded_channel::<Job>().0.downgrade());
        Worker::new(self.db_pool.clone(), transport, credentials, retry_lane)
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Validate a submission, record it as PENDING and queue it
    #[instrument(skip(self, spec), fields(unit = %spec.target_unit, transport = %spec.transport))]
    pub async fn submit(&self, spec: JobSpec) -> Result<TaskHandle> {
        let unit = queries::get_unit(&self.db_pool, &spec.target_unit).await?;

        if !unit.is_device() {
            return Err(Error::InvalidRequest(format!(
                "unit '{}' is not a device and cannot run tasks",
                unit.id
            )));
        }
        if !unit.is_leased() {
            return Err(Error::ResourceNotLeased(format!(
                "unit '{}' must be reserved before running tasks on it",
                unit.id
            )));
        }
        if !spec.operation.supported_by(spec.transport) {
            return Err(Error::InvalidRequest(format!(
                "operation '{}' is not available over {}",
                spec.operation.name(),
                spec.transport
            )));
        }

        let lane = self.config.lanes.get(spec.transport);
        let max_retries = spec.max_retries.unwrap_or(lane.max_retries);
        if max_retries == 0 {
            return Err(Error::InvalidRequest(
                "max_retries must allow at least one attempt".to_string(),
            ));
        }
        let timeout_secs = spec.timeout_secs.unwrap_or(lane.command_timeout_secs);
        if timeout_secs == 0 || timeout_secs > MAX_TIMEOUT_SECS {
            return Err(Error::InvalidRequest(format!(
                "timeout must be between 1 and {} seconds",
                MAX_TIMEOUT_SECS
            )));
        }
        let retry_delay_secs = spec.retry_delay_secs.unwrap_or(lane.retry_delay_secs);
        if retry_delay_secs > MAX_RETRY_DELAY_SECS {
            return Err(Error::InvalidRequest(format!(
                "retry delay must be at most {} seconds",
                MAX_RETRY_DELAY_SECS
            )));
        }

        let target = self.target_for(&unit, &spec)?;
        let task_id = uuid::Uuid::new_v4().to_string();

        let job = Job {
            task_id: task_id.clone(),
            unit_id: unit.id.clone(),
            target,
            operation: spec.operation.clone(),
            attempt: 0,
            max_retries,
            timeout_secs,
            retry_delay_secs,
        };

        queries::create_task(
            &self.db_pool,
            &CreateTask {
                id: task_id.clone(),
                unit_id: unit.id.clone(),
                transport: spec.transport,
                operation: spec.operation.name().to_string(),
                job: serde_json::to_string(&job)?,
                max_retries,
            },
        )
        .await?;

        self.enqueue(job)?;
        info!(task_id = %task_id, max_retries, "Task queued");

        Ok(TaskHandle {
            status_location: format!("{}/{}", self.config.status_prefix, task_id),
            task_id,
        })
    }

    /// Build the transport binding for `unit`
    fn target_for(&self, unit: &Unit, spec: &JobSpec) -> Result<Target> {
        match spec.transport {
            TransportKind::Shell => {
                let (Some(host), Some(port)) = (unit.host.clone(), unit.shell_port()) else {
                    return Err(Error::InvalidRequest(format!(
                        "unit '{}' has no shell binding",
                        unit.id
                    )));
                };
                Ok(Target::Shell(ShellTarget {
                    host,
                    port,
                    username: spec
                        .username
                        .clone()
                        .unwrap_or_else(|| self.config.default_user.clone()),
                    credential_context: CredentialContext {
                        unit_type: unit.unit_type.clone(),
                        image: unit.image.clone(),
                    },
                    password: None,
                }))
            }
            TransportKind::Serial => {
                let port = unit.serial_port.clone().ok_or_else(|| {
                    Error::InvalidRequest(format!("unit '{}' has no serial binding", unit.id))
                })?;
                let line = SerialLine {
                    baudrate: spec.baudrate.unwrap_or(self.config.serial_line.baudrate),
                    ..self.config.serial_line
                };
                validate_line(&line)?;
                Ok(Target::Serial(SerialTarget { port, line }))
            }
        }
    }

    fn enqueue(&self, job: Job) -> Result<()> {
        let kind = job.transport();
        let lane = self
            .lanes
            .get(&kind)
            .ok_or_else(|| Error::Other(format!("no {} lane", kind)))?;
        lane.send(job)
            .map_err(|_| Error::Other(format!("{} lane is closed", kind)))
    }

    /// Cancel a task that has not been picked up yet
    #[instrument(skip(self))]
    pub async fn cancel(&self, task_id: &str) -> Result<TaskStatus> {
        let task = queries::get_task(&self.db_pool, task_id).await?;

        let cancelled = queries::transition_task(
            &self.db_pool,
            task_id,
            &[TaskState::Pending, TaskState::Retry],
            TaskTransitionUpdate::to(TaskState::Cancelled),
        )
        .await?;

        if !cancelled {
            // Re-read, the state may have moved since
            let current = queries::get_task(&self.db_pool, task_id)
                .await
                .map(|t| t.state_str)
                .unwrap_or(task.state_str);
            return Err(Error::InvalidRequest(format!(
                "task '{}' is {} and can no longer be cancelled",
                task_id, current
            )));
        }

        info!(task_id, "Task cancelled");
        queries::get_task_status(&self.db_pool, task_id).await
    }

    /// Re-queue every task left unfinished by a previous run.
    ///
    /// Tasks interrupted while STARTED are put back to RETRY first. Returns
    /// how many jobs were queued.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize> {
        let unfinished = queries::list_unfinished_tasks(&self.db_pool).await?;
        let mut queued = 0;

        for task in unfinished {
            match self.recover_task(&task).await {
                Ok(true) => queued += 1,
                Ok(false) => debug!(task_id = %task.id, "Task moved on, not recovered"),
                Err(e) => warn!(task_id = %task.id, error = %e, "Failed to recover task"),
            }
        }

        if queued > 0 {
            info!(queued, "Recovered unfinished tasks");
        }
        Ok(queued)
    }

    async fn recover_task(&self, task: &Task) -> Result<bool> {
        let mut job: Job = match serde_json::from_str(&task.job) {
            Ok(job) => job,
            Err(e) => {
                let err = Error::SerializationError(e);
                error!(task_id = %task.id, error = %err, "Stored job is unreadable");
                return queries::transition_task(
                    &self.db_pool,
                    &task.id,
                    &[TaskState::Pending, TaskState::Started, TaskState::Retry],
                    TaskTransitionUpdate::to(TaskState::Failure)
                        .with_error(ErrorDescriptor::from(&err)),
                )
                .await
                .map(|_| false);
            }
        };

        if task.state() == Some(TaskState::Started) {
            let err = Error::Other("execution interrupted by a restart".to_string());
            let moved = queries::transition_task(
                &self.db_pool,
                &task.id,
                &[TaskState::Started],
                TaskTransitionUpdate::to(TaskState::Retry).with_error(ErrorDescriptor::from(&err)),
            )
            .await?;
            if !moved {
                return Ok(false);
            }
        }

        job.attempt = u32::try_from(task.attempts).unwrap_or(0);
        self.enqueue(job)?;
        Ok(true)
    }

    /// Polled status of a task
    pub async fn status(&self, task_id: &str) -> Result<TaskStatus> {
        queries::get_task_status(&self.db_pool, task_id).await
    }

    /// List tasks matching `filter`
    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        queries::list_tasks(&self.db_pool, filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LanesConfig;
    use async_trait::async_trait;
    use standctl_core::{ConfiguredCredentials, Operation, RawOutput, Session, TaskOutput};
    use standctl_database::{
        CreateReservation, Database, DeviceSpec, Inventory, ReservationManager,
    };
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Transport whose connects follow a script of errors, then succeed
    struct ScriptedTransport {
        kind: TransportKind,
        failures: Mutex<VecDeque<Error>>,
        output: String,
        connects: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(kind: TransportKind, failures: Vec<Error>, output: &str) -> Arc<Self> {
            Arc::new(Self {
                kind,
                failures: Mutex::new(failures.into()),
                output: output.to_string(),
                connects: AtomicUsize::new(0),
            })
        }

        fn always_failing(kind: TransportKind) -> Arc<Self> {
            let failures = (0..16)
                .map(|_| Error::TransportConnect("connection refused".into()))
                .collect();
            Self::new(kind, failures, "")
        }
    }

    struct EchoSession {
        output: String,
    }

    #[async_trait]
    impl Session for EchoSession {
        async fn execute(&mut self, _op: &Operation, _timeout: Duration) -> Result<RawOutput> {
            Ok(RawOutput {
                stdout: self.output.clone(),
                exit_code: Some(0),
                ..Default::default()
            })
        }

        async fn close(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        async fn connect(&self, _target: &Target, _timeout: Duration) -> Result<Box<dyn Session>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let next = self.failures.lock().unwrap().pop_front();
            match next {
                Some(err) => Err(err),
                None => Ok(Box::new(EchoSession {
                    output: self.output.clone(),
                })),
            }
        }
    }

    fn config() -> DispatcherConfig {
        let mut lanes = LanesConfig::default();
        lanes.shell.retry_delay_secs = 0;
        lanes.serial.retry_delay_secs = 0;
        DispatcherConfig {
            lanes,
            ..Default::default()
        }
    }

    fn credentials() -> Arc<dyn CredentialProvider> {
        Arc::new(ConfiguredCredentials::new(
            vec!["root".into()],
            Some("devpass".into()),
            None,
        ))
    }

    /// One device with both bindings, reserved unless `reserve` is false
    async fn setup(reserve: bool) -> Database {
        let db = Database::in_memory().await.unwrap();
        let inventory = Inventory {
            devices: vec![
                DeviceSpec {
                    id: "dut-01".into(),
                    unit_type: "tedix-v1-02".into(),
                    host: Some("10.0.0.11".into()),
                    ssh_port: None,
                    serial_port: Some("/dev/ttyUSB0".into()),
                    image: Some("dev".into()),
                },
                DeviceSpec {
                    id: "dut-02".into(),
                    unit_type: "tedix-v2-01".into(),
                    host: Some("10.0.0.12".into()),
                    ssh_port: None,
                    serial_port: None,
                    image: Some("dev".into()),
                },
            ],
            ..Default::default()
        };
        queries::load_inventory(db.pool(), &inventory).await.unwrap();

        if reserve {
            ReservationManager::new(db.pool().clone(), None)
                .create_reservation(&CreateReservation {
                    requester: "tester".into(),
                    requested_counts: [("tedix-v1-02".to_string(), 1)].into_iter().collect(),
                    ttl_secs: None,
                })
                .await
                .unwrap();
        }
        db
    }

    fn serial_spec(operation: Operation) -> JobSpec {
        JobSpec {
            target_unit: "dut-01".into(),
            transport: TransportKind::Serial,
            operation,
            username: None,
            baudrate: None,
            timeout_secs: Some(1),
            max_retries: None,
            retry_delay_secs: None,
        }
    }

    async fn wait_terminal(dispatcher: &Dispatcher, task_id: &str) -> TaskStatus {
        for _ in 0..500 {
            let status = dispatcher.status(task_id).await.unwrap();
            if status.state.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} did not finish", task_id);
    }

    fn history(status: &TaskStatus) -> Vec<&str> {
        status.history.iter().map(|t| t.state.as_str()).collect()
    }

    #[tokio::test]
    async fn test_serial_write_then_read_retries_after_timeout() {
        let db = setup(true).await;
        let serial = ScriptedTransport::new(
            TransportKind::Serial,
            vec![Error::TransportTimeout("port did not open".into())],
            "v1.4.2\n",
        );
        let transports = Transports::new(
            ScriptedTransport::always_failing(TransportKind::Shell),
            serial.clone(),
        );
        let dispatcher = Dispatcher::start(db.pool().clone(), config(), &transports, credentials());

        let handle = dispatcher
            .submit(serial_spec(Operation::WriteThenRead {
                text: "version\n".into(),
            }))
            .await
            .unwrap();
        assert_eq!(
            handle.status_location,
            format!("/api/v1/tasks/{}", handle.task_id)
        );

        let status = wait_terminal(&dispatcher, &handle.task_id).await;
        assert_eq!(status.state, TaskState::Success);
        assert_eq!(
            history(&status),
            vec!["PENDING", "STARTED", "RETRY", "STARTED", "SUCCESS"]
        );
        assert_eq!(status.attempts, 2);
        assert_eq!(serial.connects.load(Ordering::SeqCst), 2);

        let result = status.result.unwrap();
        assert!(result.elapsed_secs >= 0.0);
        assert_eq!(
            result.output,
            TaskOutput::WriteThenRead {
                output: "v1.4.2\n".into()
            }
        );
        // The failed attempt stays visible
        assert_eq!(status.last_error.unwrap().category, "transport_timeout");
    }

    #[tokio::test]
    async fn test_retries_up_to_budget_then_fails() {
        let db = setup(true).await;
        let shell = ScriptedTransport::always_failing(TransportKind::Shell);
        let transports = Transports::new(
            shell.clone(),
            ScriptedTransport::always_failing(TransportKind::Serial),
        );
        let dispatcher = Dispatcher::start(db.pool().clone(), config(), &transports, credentials());

        let handle = dispatcher
            .submit(JobSpec {
                target_unit: "dut-01".into(),
                transport: TransportKind::Shell,
                operation: Operation::Exec {
                    command: "uname -a".into(),
                },
                username: None,
                baudrate: None,
                timeout_secs: None,
                max_retries: Some(3),
                retry_delay_secs: None,
            })
            .await
            .unwrap();

        let status = wait_terminal(&dispatcher, &handle.task_id).await;
        assert_eq!(status.state, TaskState::Failure);
        assert_eq!(status.attempts, 3);
        assert_eq!(
            history(&status),
            vec!["PENDING", "STARTED", "RETRY", "STARTED", "RETRY", "STARTED", "FAILURE"]
        );
        assert_eq!(status.last_error.unwrap().category, "transport_connect_error");
        assert_eq!(shell.connects.load(Ordering::SeqCst), 3);

        // Nothing moves after the terminal state
        tokio::time::sleep(Duration::from_millis(50)).await;
        let later = dispatcher.status(&handle.task_id).await.unwrap();
        assert_eq!(later.history.len(), status.history.len());
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let db = setup(true).await;
        let transports = Transports::new(
            ScriptedTransport::new(TransportKind::Shell, vec![], "ok"),
            ScriptedTransport::new(
                TransportKind::Serial,
                vec![Error::InvalidRequest("bad line".into())],
                "",
            ),
        );
        let dispatcher = Dispatcher::start(db.pool().clone(), config(), &transports, credentials());

        let handle = dispatcher.submit(serial_spec(Operation::Read)).await.unwrap();
        let status = wait_terminal(&dispatcher, &handle.task_id).await;
        assert_eq!(status.state, TaskState::Failure);
        assert_eq!(status.attempts, 1);
        assert_eq!(history(&status), vec!["PENDING", "STARTED", "FAILURE"]);
    }

    #[tokio::test]
    async fn test_shell_task_uses_credentials() {
        let db = setup(true).await;
        let transports = Transports::new(
            ScriptedTransport::new(TransportKind::Shell, vec![], "Linux dut-01"),
            ScriptedTransport::always_failing(TransportKind::Serial),
        );
        let dispatcher = Dispatcher::start(db.pool().clone(), config(), &transports, credentials());

        let mut spec = serial_spec(Operation::Exec {
            command: "uname -n".into(),
        });
        spec.transport = TransportKind::Shell;
        let handle = dispatcher.submit(spec).await.unwrap();

        let status = wait_terminal(&dispatcher, &handle.task_id).await;
        assert_eq!(status.state, TaskState::Success);
        match status.result.unwrap().output {
            TaskOutput::Exec {
                stdout, exit_code, ..
            } => {
                assert_eq!(stdout, "Linux dut-01");
                assert_eq!(exit_code, Some(0));
            }
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_submit_validation() {
        let db = setup(true).await;
        let (dispatcher, _lanes) = Dispatcher::new(db.pool().clone(), config());

        let mut spec = serial_spec(Operation::Read);
        spec.target_unit = "ghost".into();
        let err = dispatcher.submit(spec).await.unwrap_err();
        assert!(matches!(err, Error::ResourceNotFound(_)));

        let mut spec = serial_spec(Operation::Read);
        spec.target_unit = "dut-02".into();
        spec.transport = TransportKind::Shell;
        let err = dispatcher.submit(spec).await.unwrap_err();
        assert!(matches!(err, Error::ResourceNotLeased(_)));

        let err = dispatcher
            .submit(serial_spec(Operation::Exec {
                command: "ls".into(),
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        let mut spec = serial_spec(Operation::Read);
        spec.max_retries = Some(0);
        let err = dispatcher.submit(spec).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        let mut spec = serial_spec(Operation::Read);
        spec.timeout_secs = Some(u64::MAX);
        let err = dispatcher.submit(spec).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        let mut spec = serial_spec(Operation::Read);
        spec.timeout_secs = Some(MAX_TIMEOUT_SECS + 1);
        let err = dispatcher.submit(spec).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        let mut spec = serial_spec(Operation::Read);
        spec.retry_delay_secs = Some(u64::MAX);
        let err = dispatcher.submit(spec).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        let mut spec = serial_spec(Operation::Read);
        spec.baudrate = Some(0);
        let err = dispatcher.submit(spec).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        // Nothing was recorded for rejected submissions
        assert!(dispatcher.list(&TaskFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_job_is_dropped_by_worker() {
        let db = setup(true).await;
        let (dispatcher, mut lanes) = Dispatcher::new(db.pool().clone(), config());
        let mut serial_rx = lanes.take(TransportKind::Serial).unwrap();

        let handle = dispatcher.submit(serial_spec(Operation::Read)).await.unwrap();
        let status = dispatcher.cancel(&handle.task_id).await.unwrap();
        assert_eq!(status.state, TaskState::Cancelled);

        let err = dispatcher.cancel(&handle.task_id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        let err = dispatcher.cancel("ghost").await.unwrap_err();
        assert!(matches!(err, Error::TaskNotFound(_)));

        let serial = ScriptedTransport::new(TransportKind::Serial, vec![], "boot>");
        let worker = dispatcher.worker(TransportKind::Serial, serial.clone(), credentials());
        let job = serial_rx.try_recv().unwrap();
        assert_eq!(job.task_id, handle.task_id);

        assert_eq!(worker.run(job).await.unwrap(), None);
        assert_eq!(serial.connects.load(Ordering::SeqCst), 0);

        let status = dispatcher.status(&handle.task_id).await.unwrap();
        assert_eq!(status.state, TaskState::Cancelled);
        assert_eq!(history(&status), vec!["PENDING", "CANCELLED"]);
    }

    #[tokio::test]
    async fn test_recover_requeues_and_enforces_budget() {
        let db = setup(true).await;
        let (dispatcher, mut lanes) = Dispatcher::new(db.pool().clone(), config());
        let mut serial_rx = lanes.take(TransportKind::Serial).unwrap();

        // One task still queued, one interrupted on its last attempt
        let pending = dispatcher.submit(serial_spec(Operation::Read)).await.unwrap();
        let mut spec = serial_spec(Operation::Read);
        spec.max_retries = Some(2);
        let interrupted = dispatcher.submit(spec).await.unwrap();
        while serial_rx.try_recv().is_ok() {}

        assert!(queries::claim_task(db.pool(), &interrupted.task_id, 2).await.unwrap());

        assert_eq!(dispatcher.recover().await.unwrap(), 2);

        let status = dispatcher.status(&interrupted.task_id).await.unwrap();
        assert_eq!(status.state, TaskState::Retry);

        let worker = dispatcher.worker(
            TransportKind::Serial,
            ScriptedTransport::new(TransportKind::Serial, vec![], "login:"),
            credentials(),
        );
        let mut outcomes = HashMap::new();
        while let Ok(job) = serial_rx.try_recv() {
            let id = job.task_id.clone();
            outcomes.insert(id, worker.run(job).await.unwrap());
        }

        assert_eq!(outcomes[&pending.task_id], Some(TaskState::Success));
        assert_eq!(outcomes[&interrupted.task_id], Some(TaskState::Failure));

        let status = dispatcher.status(&interrupted.task_id).await.unwrap();
        assert_eq!(status.last_error.unwrap().category, "max_retries_exceeded");
        assert_eq!(status.attempts, 2);
    }
}
