use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use async_trait::async_trait;
use bmc_error::GenericError;
use metrics::counter;
use snafu::{OptionExt as _, Snafu};
use tokio::{
    pin, select,
    sync::{mpsc, oneshot},
    task::{AbortHandle, Id, JoinSet},
};
use tracing::{debug, error, warn};

use super::{
    process::{is_valid_name, Process},
    restart::{ChildExit, RestartAction, RestartMode, RestartPolicy, RestartState, RestartStrategy},
    shutdown::{ProcessShutdown, ShutdownHandle, ShutdownReason},
};
use crate::{collections::FastIndexMap, task::panic_message};

const CONTROL_CHANNEL_CAPACITY: usize = 32;

/// A `Future` that represents the execution of a supervised process.
pub type SupervisorFuture = Pin<Box<dyn Future<Output = Result<(), GenericError>> + Send>>;

/// A `Future` that represents the full lifecycle of a worker: restart backoff, initialization, and running.
type WorkerFuture = Pin<Box<dyn Future<Output = Result<(), WorkerError>> + Send>>;

/// Worker lifecycle errors.
///
/// Initialization failures are fatal to the supervisor. Everything else is handed to the child's restart policy.
#[derive(Debug)]
enum WorkerError {
    /// The worker failed during async initialization.
    Initialization(InitializationError),

    /// The worker failed to start in time, or failed while running.
    Process(ProcessError),
}

/// Process errors.
#[derive(Debug, Snafu)]
pub enum ProcessError {
    /// The child process was aborted by the supervisor.
    #[snafu(display("Child process was aborted by the supervisor."))]
    Aborted,

    /// The child process panicked.
    #[snafu(display("Child process panicked: {}", message))]
    Panicked {
        /// The panic message.
        message: String,
    },

    /// The child process did not finish initializing within its startup timeout.
    #[snafu(display("Child process did not finish starting within {:?}.", timeout))]
    StartupTimedOut {
        /// The startup timeout that was exceeded.
        timeout: Duration,
    },

    /// The child process terminated with an error.
    #[snafu(display("Child process terminated with an error: {}", source))]
    Terminated {
        /// The error that caused the termination.
        source: GenericError,
    },

    /// The child process returned without an error.
    #[snafu(display("Child process completed."))]
    Completed,
}

impl ProcessError {
    /// Classifies the outcome of a child process for its restart policy.
    ///
    /// Returning successfully, or returning a [`ShutdownReason`] as the error, is a normal exit.
    fn classify(result: &Result<(), ProcessError>) -> ChildExit {
        match result {
            Ok(()) | Err(ProcessError::Completed) => ChildExit::Normal,
            Err(ProcessError::Terminated { source }) if source.downcast_ref::<ShutdownReason>().is_some() => {
                ChildExit::Normal
            }
            Err(_) => ChildExit::Abnormal,
        }
    }
}

/// Initialization errors.
///
/// Initialization errors are distinct from runtime errors: they indicate that a process could not be started at all
/// (e.g., the broker never became ready, a device node is missing). These errors do NOT trigger restart logic; instead,
/// they immediately propagate up and fail the supervisor.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum InitializationError {
    /// The process could not be initialized due to an error.
    #[snafu(display("Process failed to initialize: {}", source))]
    Failed {
        /// The underlying error that caused initialization to fail.
        source: GenericError,
    },

    /// The process is permanently unavailable and cannot be initialized.
    ///
    /// This is for cases where initialization is structurally impossible, not due to a transient error.
    #[snafu(display("Process is permanently unavailable"))]
    PermanentlyUnavailable,
}

/// Strategy for shutting down a process.
#[derive(Clone, Copy, Debug)]
pub enum ShutdownStrategy {
    /// Waits for the configured duration for the process to exit, and then forcefully aborts it otherwise.
    Graceful(Duration),

    /// Forcefully aborts the process without waiting.
    Brutal,
}

/// A supervisable process.
#[async_trait]
pub trait Supervisable: Send + Sync {
    /// Returns the name of the process.
    fn name(&self) -> &str;

    /// Returns the shutdown strategy for the process.
    fn shutdown_strategy(&self) -> ShutdownStrategy {
        ShutdownStrategy::Graceful(Duration::from_secs(5))
    }

    /// Initializes the process asynchronously.
    ///
    /// During initialization, any resources or configuration for the process can be created asynchronously, and the
    /// same runtime that is used for running the process is used for initialization. The resulting future is expected
    /// to complete as soon as reasonably possible after `process_shutdown` resolves.
    ///
    /// # Errors
    ///
    /// If the process cannot be initialized, an error is returned.
    async fn initialize(&self, process_shutdown: ProcessShutdown) -> Result<SupervisorFuture, InitializationError>;
}

/// Supervisor errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum SupervisorError {
    /// Supervisor or worker name is invalid.
    #[snafu(display("Invalid name for supervisor or worker: '{}'", name))]
    InvalidName {
        /// The invalid name.
        name: String,
    },

    /// A child with the same name is already registered.
    #[snafu(display("Child process '{}' is already registered.", name))]
    DuplicateChild {
        /// The name of the child.
        name: String,
    },

    /// A child process failed to initialize.
    ///
    /// This error indicates that a child could not complete its async initialization. This is distinct from runtime
    /// failures and does NOT trigger restart logic.
    #[snafu(display("Child process '{}' failed to initialize: {}", child_name, source))]
    FailedToInitialize {
        /// The name of the child that failed to initialize.
        child_name: String,

        /// The underlying initialization error.
        source: InitializationError,
    },

    /// The supervisor exceeded its restart limits and was forced to shutdown.
    #[snafu(display(
        "Supervisor exceeded its restart limits after child process '{}' exited: {}",
        child_name,
        source
    ))]
    RestartLimitExceeded {
        /// The name of the child whose exit exceeded the limit.
        child_name: String,

        /// How the child exited.
        source: ProcessError,
    },

    /// The supervisor is not running, so the request could not be served.
    #[snafu(display("Supervisor is not running."))]
    NotRunning,
}

/// A child process specification.
///
/// All workers added to a [`Supervisor`] must be specified as a `ChildSpecification`. This acts a template for how the
/// supervisor should create the underlying future that represents the process, along with the restart policy and
/// startup timeout that apply to it.
///
/// A child process specification can be created implicitly from any type that implements [`Supervisable`], in which
/// case it uses the [`Permanent`][RestartPolicy::Permanent] policy and no startup timeout.
#[derive(Clone)]
pub struct ChildSpecification {
    worker: Arc<dyn Supervisable>,
    restart_policy: RestartPolicy,
    startup_timeout: Option<Duration>,
}

impl ChildSpecification {
    /// Creates a new `ChildSpecification` for the given worker.
    pub fn new<T: Supervisable + 'static>(worker: T) -> Self {
        Self::from_shared(Arc::new(worker))
    }

    /// Creates a new `ChildSpecification` for a worker that is already shared.
    pub fn from_shared(worker: Arc<dyn Supervisable>) -> Self {
        Self {
            worker,
            restart_policy: RestartPolicy::default(),
            startup_timeout: None,
        }
    }

    /// Sets the restart policy.
    pub fn with_restart_policy(mut self, restart_policy: RestartPolicy) -> Self {
        self.restart_policy = restart_policy;
        self
    }

    /// Sets the startup timeout, which bounds how long initialization may take.
    pub fn with_startup_timeout(mut self, startup_timeout: Duration) -> Self {
        self.startup_timeout = Some(startup_timeout);
        self
    }

    /// Returns the name of the child.
    pub fn name(&self) -> &str {
        self.worker.name()
    }

    /// Returns the restart policy of the child.
    pub fn restart_policy(&self) -> RestartPolicy {
        self.restart_policy
    }

    fn create_worker_future(&self, mut process_shutdown: ProcessShutdown, backoff: Duration) -> WorkerFuture {
        let worker = Arc::clone(&self.worker);
        let startup_timeout = self.startup_timeout;

        Box::pin(async move {
            if !backoff.is_zero() {
                select! {
                    _ = tokio::time::sleep(backoff) => {},
                    _ = process_shutdown.wait_for_shutdown() => return Ok(()),
                }
            }

            let initialize = worker.initialize(process_shutdown);
            let initialized = match startup_timeout {
                Some(timeout) => tokio::time::timeout(timeout, initialize)
                    .await
                    .map_err(|_| WorkerError::Process(ProcessError::StartupTimedOut { timeout }))?,
                None => initialize.await,
            };

            let run_future = initialized.map_err(WorkerError::Initialization)?;
            run_future
                .await
                .map_err(|source| WorkerError::Process(ProcessError::Terminated { source }))
        })
    }
}

impl<T> From<T> for ChildSpecification
where
    T: Supervisable + 'static,
{
    fn from(worker: T) -> Self {
        Self::new(worker)
    }
}

/// A point-in-time view of a supervised child.
#[derive(Clone, Debug)]
pub struct ChildSnapshot {
    /// Name of the child.
    pub name: String,

    /// Restart policy of the child.
    pub restart_policy: RestartPolicy,

    /// Number of times the child has been restarted.
    pub restart_count: usize,

    /// The error the child last exited with, if any.
    pub last_error: Option<String>,

    /// Whether the child is currently running.
    pub running: bool,
}

struct ChildRecord {
    spec: ChildSpecification,
    restart_count: usize,
    last_error: Option<String>,
    running: bool,
}

impl ChildRecord {
    fn snapshot(&self, name: &str) -> ChildSnapshot {
        ChildSnapshot {
            name: name.to_string(),
            restart_policy: self.spec.restart_policy,
            restart_count: self.restart_count,
            last_error: self.last_error.clone(),
            running: self.running,
        }
    }
}

enum ControlMessage {
    AddChild {
        child: ChildSpecification,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    ListChildren {
        reply: oneshot::Sender<Vec<ChildSnapshot>>,
    },
}

/// A handle for interacting with a running [`Supervisor`].
///
/// Requests are queued until the supervisor starts running, and are served by its control loop, so they never race
/// with restarts. Once the supervisor has stopped, every request fails with [`SupervisorError::NotRunning`].
#[derive(Clone)]
pub struct SupervisorHandle {
    supervisor_id: Arc<str>,
    control_tx: mpsc::Sender<ControlMessage>,
}

impl SupervisorHandle {
    /// Returns the ID of the supervisor this handle belongs to.
    pub fn supervisor_id(&self) -> &str {
        &self.supervisor_id
    }

    /// Adds a worker to the running supervisor, and starts it.
    ///
    /// # Errors
    ///
    /// If the name of the worker is invalid or already registered, or the supervisor is not running, an error is
    /// returned.
    pub async fn add_worker<T: Into<ChildSpecification>>(&self, child: T) -> Result<(), SupervisorError> {
        let (reply, reply_rx) = oneshot::channel();
        let message = ControlMessage::AddChild {
            child: child.into(),
            reply,
        };
        self.control_tx.send(message).await.map_err(|_| SupervisorError::NotRunning)?;
        reply_rx.await.map_err(|_| SupervisorError::NotRunning)?
    }

    /// Returns a snapshot of every registered child, in registration order.
    ///
    /// # Errors
    ///
    /// If the supervisor is not running, an error is returned.
    pub async fn children(&self) -> Result<Vec<ChildSnapshot>, SupervisorError> {
        let (reply, reply_rx) = oneshot::channel();
        self.control_tx
            .send(ControlMessage::ListChildren { reply })
            .await
            .map_err(|_| SupervisorError::NotRunning)?;
        reply_rx.await.map_err(|_| SupervisorError::NotRunning)
    }
}

/// Supervises a set of workers.
///
/// # Workers
///
/// All workers are defined through implementation of the [`Supervisable`] trait, which provides the logic for both
/// creating the underlying worker future that is spawned, as well as other metadata, such as the worker's name, how the
/// worker should be shutdown, and so on. Workers are registered through a [`ChildSpecification`], either before the
/// supervisor runs ([`add_worker`][Self::add_worker]) or while it runs ([`SupervisorHandle::add_worker`]). Names are
/// unique within a supervisor.
///
/// # Instrumentation
///
/// Individual worker processes are wrapped in a dedicated [`tracing::Span`] to allow tracing the causal relationship
/// between arbitrary code and the worker executing it. Restarts are counted in the `supervisor_child_restarts_total`
/// metric.
///
/// # Restarts
///
/// Whether an exited child is restarted at all is decided by its [`RestartPolicy`]. How often, and which siblings are
/// restarted alongside it, is decided by the supervisor's [`RestartStrategy`].
///
/// # Shutdown
///
/// Children are shut down in the reverse order of registration, so a child registered after the ones it depends on
/// stops before them. Each child is given the reason the supervisor itself was asked to stop.
pub struct Supervisor {
    supervisor_id: Arc<str>,
    children: FastIndexMap<String, ChildRecord>,
    restart_strategy: RestartStrategy,
    control_tx: mpsc::Sender<ControlMessage>,
    control_rx: mpsc::Receiver<ControlMessage>,
}

impl Supervisor {
    /// Creates an empty `Supervisor` with the default restart strategy.
    ///
    /// # Errors
    ///
    /// If the supervisor ID is not a valid process name, an error is returned.
    pub fn new<S: AsRef<str>>(supervisor_id: S) -> Result<Self, SupervisorError> {
        if !is_valid_name(supervisor_id.as_ref()) {
            return Err(SupervisorError::InvalidName {
                name: supervisor_id.as_ref().to_string(),
            });
        }

        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);

        Ok(Self {
            supervisor_id: supervisor_id.as_ref().into(),
            children: FastIndexMap::default(),
            restart_strategy: RestartStrategy::default(),
            control_tx,
            control_rx,
        })
    }

    /// Returns the supervisor's ID.
    pub fn id(&self) -> &str {
        &self.supervisor_id
    }

    /// Sets the restart strategy for the supervisor.
    pub fn with_restart_strategy(mut self, strategy: RestartStrategy) -> Self {
        self.restart_strategy = strategy;
        self
    }

    /// Returns a handle for adding workers and inspecting children while the supervisor runs.
    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            supervisor_id: Arc::clone(&self.supervisor_id),
            control_tx: self.control_tx.clone(),
        }
    }

    /// Adds a worker to the supervisor.
    ///
    /// Workers added this way are started, in registration order, when the supervisor starts running.
    ///
    /// # Errors
    ///
    /// If the name of the worker is invalid, or a worker with the same name is already registered, an error is
    /// returned and the existing registration is left untouched.
    pub fn add_worker<T: Into<ChildSpecification>>(&mut self, child: T) -> Result<(), SupervisorError> {
        self.register_child(child.into()).map(|_| ())
    }

    /// Returns a snapshot of every registered child, in registration order.
    pub fn children(&self) -> Vec<ChildSnapshot> {
        self.children
            .iter()
            .map(|(name, record)| record.snapshot(name))
            .collect()
    }

    fn register_child(&mut self, child: ChildSpecification) -> Result<String, SupervisorError> {
        let name = child.name().to_string();
        if !is_valid_name(&name) {
            return Err(SupervisorError::InvalidName { name });
        }
        if self.children.contains_key(&name) {
            return Err(SupervisorError::DuplicateChild { name });
        }

        debug!(
            supervisor_id = %self.supervisor_id,
            "Registering child process #{}. ({}, {})",
            self.children.len(),
            name,
            child.restart_policy(),
        );
        self.children.insert(
            name.clone(),
            ChildRecord {
                spec: child,
                restart_count: 0,
                last_error: None,
                running: false,
            },
        );

        Ok(name)
    }

    fn spawn_child(
        &mut self, child_name: &str, backoff: Duration, worker_state: &mut WorkerState,
    ) -> Result<(), SupervisorError> {
        let record = self
            .children
            .get_mut(child_name)
            .context(InvalidName { name: child_name })?;

        debug!(
            supervisor_id = %self.supervisor_id,
            worker_name = child_name,
            restart_count = record.restart_count,
            "Spawning child process.",
        );
        worker_state.add_worker(child_name, &record.spec, record.restart_count, backoff)?;
        record.running = true;

        Ok(())
    }

    fn spawn_all_children(&mut self, worker_state: &mut WorkerState) -> Result<(), SupervisorError> {
        debug!(supervisor_id = %self.supervisor_id, "Spawning all registered child processes.");
        let child_names = self.children.keys().cloned().collect::<Vec<_>>();
        for child_name in child_names {
            self.spawn_child(&child_name, Duration::ZERO, worker_state)?;
        }

        Ok(())
    }

    fn mark_all_stopped(&mut self) {
        for record in self.children.values_mut() {
            record.running = false;
        }
    }

    fn record_restart(&mut self, child_name: &str) {
        if let Some(record) = self.children.get_mut(child_name) {
            record.restart_count += 1;
        }
        counter!(
            "supervisor_child_restarts_total",
            "supervisor" => self.supervisor_id.to_string(),
            "child" => child_name.to_string()
        )
        .increment(1);
    }

    fn handle_control_message(&mut self, message: ControlMessage, worker_state: &mut WorkerState) {
        match message {
            ControlMessage::AddChild { child, reply } => {
                let result = match self.register_child(child) {
                    Ok(child_name) => {
                        let result = self.spawn_child(&child_name, Duration::ZERO, worker_state);
                        if result.is_err() {
                            self.children.shift_remove(&child_name);
                        }
                        result
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            ControlMessage::ListChildren { reply } => {
                let _ = reply.send(self.children());
            }
        }
    }

    async fn handle_worker_exit(
        &mut self, child_name: String, worker_result: Result<(), WorkerError>, restart_state: &mut RestartState,
        worker_state: &mut WorkerState,
    ) -> Result<(), SupervisorError> {
        let worker_result = match worker_result {
            Ok(()) => Ok(()),
            Err(WorkerError::Process(e)) => Err(e),

            // Initialization failures are not eligible for restart -- they propagate immediately.
            Err(WorkerError::Initialization(e)) => {
                error!(supervisor_id = %self.supervisor_id, worker_name = %child_name, "Child process failed to initialize: {}", e);
                let reason = ShutdownReason::custom(format!("child process '{}' failed to initialize", child_name));
                worker_state.shutdown_workers(&reason).await;
                self.mark_all_stopped();
                return Err(SupervisorError::FailedToInitialize { child_name, source: e });
            }
        };

        let exit = ProcessError::classify(&worker_result);
        let Some(record) = self.children.get_mut(&child_name) else {
            return Ok(());
        };
        record.running = false;
        if let Err(e) = &worker_result {
            record.last_error = Some(e.to_string());
        }

        let restart_policy = record.spec.restart_policy;
        if !restart_policy.should_restart(exit) {
            debug!(supervisor_id = %self.supervisor_id, worker_name = %child_name, %restart_policy, ?exit, ?worker_result, "Child process finished.");
            if restart_policy == RestartPolicy::Temporary {
                self.children.shift_remove(&child_name);
            }
            return Ok(());
        }

        let backoff = self.restart_strategy.backoff();
        match restart_state.evaluate_restart() {
            RestartAction::Restart(RestartMode::OneForOne) => {
                warn!(supervisor_id = %self.supervisor_id, worker_name = %child_name, ?worker_result, "Child process terminated, restarting.");
                self.record_restart(&child_name);
                self.spawn_child(&child_name, backoff, worker_state)
            }
            RestartAction::Restart(RestartMode::OneForAll) => {
                warn!(supervisor_id = %self.supervisor_id, worker_name = %child_name, ?worker_result, "Child process terminated, restarting all processes.");
                let restarting = self
                    .children
                    .iter()
                    .filter(|(name, record)| {
                        **name == child_name
                            || (record.running && record.spec.restart_policy != RestartPolicy::Temporary)
                    })
                    .map(|(name, _)| name.clone())
                    .collect::<Vec<_>>();

                let reason = ShutdownReason::custom(format!("restarting after child process '{}' exited", child_name));
                worker_state.shutdown_workers(&reason).await;
                self.mark_all_stopped();

                // Temporary children stop along with their siblings, but are never restarted.
                self.children
                    .retain(|_, record| record.spec.restart_policy != RestartPolicy::Temporary);

                for name in restarting {
                    self.record_restart(&name);
                    self.spawn_child(&name, backoff, worker_state)?;
                }
                Ok(())
            }
            RestartAction::Shutdown => {
                error!(supervisor_id = %self.supervisor_id, worker_name = %child_name, ?worker_result, "Supervisor shutting down due to restart limits.");
                let reason = ShutdownReason::custom("supervisor exceeded its restart limits");
                worker_state.shutdown_workers(&reason).await;
                self.mark_all_stopped();
                Err(SupervisorError::RestartLimitExceeded {
                    child_name,
                    source: worker_result.err().unwrap_or(ProcessError::Completed),
                })
            }
        }
    }

    async fn run_inner(
        &mut self, process: Process, mut process_shutdown: ProcessShutdown,
    ) -> Result<ShutdownReason, SupervisorError> {
        let mut restart_state = RestartState::new(self.restart_strategy);
        let mut worker_state = WorkerState::new(process);

        // Initialization is folded into each worker's task, so this returns immediately after spawning and children
        // initialize concurrently in the background.
        self.spawn_all_children(&mut worker_state)?;

        loop {
            select! {
                reason = process_shutdown.wait_for_shutdown() => {
                    debug!(supervisor_id = %self.supervisor_id, %reason, "Shutdown triggered, shutting down all child processes.");
                    worker_state.shutdown_workers(&reason).await;
                    self.mark_all_stopped();
                    return Ok(reason);
                },
                Some(message) = self.control_rx.recv() => {
                    self.handle_control_message(message, &mut worker_state);
                },
                Some((child_name, worker_result)) = worker_state.wait_for_next_worker(), if !worker_state.is_empty() => {
                    self.handle_worker_exit(child_name, worker_result, &mut restart_state, &mut worker_state).await?;
                },
            }
        }
    }

    /// Runs the supervisor forever.
    ///
    /// # Errors
    ///
    /// If the supervisor exceeds its restart limits, or fails to initialize a child process, an error is returned.
    pub async fn run(&mut self) -> Result<ShutdownReason, SupervisorError> {
        self.run_with_process_shutdown(ProcessShutdown::noop()).await
    }

    /// Runs the supervisor until shutdown is triggered.
    ///
    /// When `shutdown` resolves, the supervisor will shutdown all child processes according to their shutdown strategy,
    /// and then return [`ShutdownReason::Requested`].
    ///
    /// # Errors
    ///
    /// If the supervisor exceeds its restart limits, or fails to initialize a child process, an error is returned.
    pub async fn run_with_shutdown<F: Future + Send + 'static>(
        &mut self, shutdown: F,
    ) -> Result<ShutdownReason, SupervisorError> {
        self.run_with_process_shutdown(ProcessShutdown::wrapped(shutdown)).await
    }

    /// Runs the supervisor until the given `ProcessShutdown` signal is received.
    ///
    /// The reason carried by the signal is passed to every child, and returned once all children have stopped.
    ///
    /// A supervisor runs at most once: when this call returns, the supervisor's handles stop serving requests.
    ///
    /// # Errors
    ///
    /// If the supervisor exceeds its restart limits, or fails to initialize a child process, an error is returned.
    pub async fn run_with_process_shutdown(
        &mut self, process_shutdown: ProcessShutdown,
    ) -> Result<ShutdownReason, SupervisorError> {
        let process = Process::supervisor(&self.supervisor_id).context(InvalidName {
            name: self.supervisor_id.to_string(),
        })?;

        debug!(supervisor_id = %self.supervisor_id, "Supervisor starting.");
        let result = process
            .instrument(self.run_inner(process.clone(), process_shutdown))
            .await;

        self.close_control_channel();
        result
    }

    fn close_control_channel(&mut self) {
        self.control_rx.close();
        while let Ok(message) = self.control_rx.try_recv() {
            match message {
                ControlMessage::AddChild { reply, .. } => {
                    let _ = reply.send(Err(SupervisorError::NotRunning));
                }
                // Dropping the reply sender reports `NotRunning` to the caller.
                ControlMessage::ListChildren { .. } => {}
            }
        }
    }
}

struct ProcessState {
    child_name: String,
    shutdown_strategy: ShutdownStrategy,
    shutdown_handle: ShutdownHandle,
    abort_handle: AbortHandle,
}

struct WorkerState {
    process: Process,
    worker_tasks: JoinSet<Result<(), WorkerError>>,
    worker_map: FastIndexMap<Id, ProcessState>,
}

impl WorkerState {
    fn new(process: Process) -> Self {
        Self {
            process,
            worker_tasks: JoinSet::new(),
            worker_map: FastIndexMap::default(),
        }
    }

    fn is_empty(&self) -> bool {
        self.worker_tasks.is_empty()
    }

    fn add_worker(
        &mut self, child_name: &str, child_spec: &ChildSpecification, generation: usize, backoff: Duration,
    ) -> Result<(), SupervisorError> {
        let (process_shutdown, shutdown_handle) = ProcessShutdown::paired();
        let process =
            Process::worker(child_name, &self.process, generation).context(InvalidName { name: child_name })?;
        let worker_future = child_spec.create_worker_future(process_shutdown, backoff);
        let abort_handle = self.worker_tasks.spawn(process.instrument(worker_future));
        self.worker_map.insert(
            abort_handle.id(),
            ProcessState {
                child_name: child_name.to_string(),
                shutdown_strategy: child_spec.worker.shutdown_strategy(),
                shutdown_handle,
                abort_handle,
            },
        );
        Ok(())
    }

    async fn wait_for_next_worker(&mut self) -> Option<(String, Result<(), WorkerError>)> {
        debug!("Waiting for next process to complete.");

        loop {
            let (worker_task_id, worker_result) = match self.worker_tasks.join_next_with_id().await? {
                Ok((worker_task_id, worker_result)) => (worker_task_id, worker_result),
                Err(e) => {
                    let worker_task_id = e.id();
                    let error = if e.is_panic() {
                        ProcessError::Panicked {
                            message: panic_message(&*e.into_panic()),
                        }
                    } else {
                        ProcessError::Aborted
                    };
                    (worker_task_id, Err(WorkerError::Process(error)))
                }
            };

            // `shift_remove` keeps the remaining workers in registration order, which shutdown relies on.
            if let Some(process_state) = self.worker_map.shift_remove(&worker_task_id) {
                return Some((process_state.child_name, worker_result));
            }
        }
    }

    async fn shutdown_workers(&mut self, reason: &ShutdownReason) {
        debug!(%reason, "Shutting down all processes.");

        // Popping from the worker map yields workers in the reverse order they were added, so dependent processes are
        // stopped before the processes they depend on.
        //
        // For each entry, we trigger shutdown in whatever way necessary, and then wait for the process to exit by
        // driving the `JoinSet`. Other workers that complete in the meantime are simply removed from the worker map.
        while let Some((current_worker_task_id, process_state)) = self.worker_map.pop() {
            let ProcessState {
                child_name,
                shutdown_strategy,
                shutdown_handle,
                abort_handle,
            } = process_state;

            let shutdown_deadline = match shutdown_strategy {
                ShutdownStrategy::Graceful(timeout) => {
                    debug!(worker_name = %child_name, shutdown_timeout = ?timeout, "Gracefully shutting down process.");
                    shutdown_handle.trigger_with(reason.clone());

                    tokio::time::sleep(timeout)
                }
                ShutdownStrategy::Brutal => {
                    debug!(worker_name = %child_name, "Forcefully aborting process.");
                    abort_handle.abort();

                    // The task is already aborted, so the deadline only needs to never fire.
                    tokio::time::sleep(Duration::MAX)
                }
            };
            pin!(shutdown_deadline);

            loop {
                select! {
                    worker_result = self.worker_tasks.join_next_with_id() => {
                        let worker_task_id = match worker_result {
                            Some(Ok((worker_task_id, _))) => worker_task_id,
                            Some(Err(e)) => e.id(),
                            None => break,
                        };

                        if worker_task_id == current_worker_task_id {
                            debug!(worker_name = %child_name, "Process exited.");
                            break;
                        }

                        debug!(?worker_task_id, "Non-target process exited. Continuing to wait.");
                        self.worker_map.shift_remove(&worker_task_id);
                    },
                    _ = &mut shutdown_deadline => {
                        debug!(worker_name = %child_name, "Shutdown timeout expired, forcefully aborting process.");
                        abort_handle.abort();
                    }
                }
            }
        }

        debug_assert!(self.worker_map.is_empty(), "worker map should be empty after shutdown");
    }
}
