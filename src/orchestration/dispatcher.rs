//! # Process Dispatcher
//!
//! The worker loop. One cycle:
//!
//! 1. claim the unleased process with the oldest TODO step this worker can execute
//! 2. route it to the registered executor, initializing the process on first contact
//! 3. execute the step, resolving a retrigger step to the step type it re-runs
//! 4. commit the outcome in one versioned write that also releases the lease
//!
//! Nothing is written before step 4. A cancelled execution releases the lease and leaves the
//! step TODO; a commit that loses the version check is discarded and the process is picked up
//! again by a later poll.
//!
//! Initialization and execution must finish before the lease runs out. The deadline is taken
//! before the claim and keeps a margin to the stored `lock_expiry_date`, so once another worker
//! can claim the process this worker has already dropped the execution.
//!
//! ```rust,no_run
//! use portal_processes::orchestration::{DispatcherConfig, ProcessDispatcher};
//! # use portal_processes::orchestration::ExecutorRegistry;
//! # use portal_processes::repository::ProcessRepository;
//! # use portal_processes::portal::{ProcessTypeId, ProcessStepTypeId};
//! # use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(
//! #     repository: Arc<dyn ProcessRepository<ProcessTypeId, ProcessStepTypeId>>,
//! #     registry: Arc<ExecutorRegistry<ProcessTypeId, ProcessStepTypeId>>,
//! # ) {
//! let dispatcher = ProcessDispatcher::new(repository, registry, DispatcherConfig::default());
//! let shutdown = CancellationToken::new();
//! dispatcher.run(shutdown.child_token()).await;
//! # }
//! ```

use super::executor::{
    InitializationResult, ProcessContext, ProcessTypeExecutor, StepExecutionResult,
};
use super::registry::ExecutorRegistry;
use crate::config::WorkerConfig;
use crate::error::{ProcessError, ProcessResult};
use crate::logging::log_step_operation;
use crate::models::{Process, ProcessStep};
use crate::repository::{ClaimedProcess, ProcessRepository, StepOutcome};
use crate::state_machine::ProcessStepStatus;
use crate::taxonomy::TypeCode;
use dashmap::DashMap;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub worker_id: String,
    pub poll_interval: Duration,
    pub lock_expiry: Duration,
    pub error_backoff: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for DispatcherConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            worker_id: config
                .worker_id
                .clone()
                .unwrap_or_else(|| format!("process-worker-{}", Uuid::new_v4())),
            poll_interval: config.poll_interval(),
            lock_expiry: config.lock_expiry(),
            error_backoff: config.error_backoff(),
        }
    }
}

/// Result of a single dispatch cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome<S> {
    /// No executable step was available
    Idle,
    /// The outcome of `step_id` was committed, or for a pending result deferred
    Executed {
        process_id: Uuid,
        step_id: Uuid,
        step_type: S,
        status: ProcessStepStatus,
    },
    /// The commit lost the version check and was discarded
    Conflict { process_id: Uuid },
    /// Cancellation interrupted the cycle; the step stays TODO
    Cancelled { process_id: Uuid },
    /// The lease ran out before the step finished; the step stays TODO
    Expired { process_id: Uuid, step_id: Uuid },
}

enum Interrupted {
    Cancelled,
    Expired,
}

enum Guarded<T> {
    Completed(anyhow::Result<T>),
    Panicked(String),
    Cancelled,
    Expired,
}

/// Run executor code so that cancellation, lease expiry and panics end up as values
async fn guard<T, F>(cancel: &CancellationToken, deadline: Instant, future: F) -> Guarded<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let execution = AssertUnwindSafe(future).catch_unwind();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Guarded::Cancelled,
        _ = tokio::time::sleep_until(deadline) => Guarded::Expired,
        outcome = execution => match outcome {
            Ok(result) => Guarded::Completed(result),
            Err(panic) => Guarded::Panicked(panic_message(panic.as_ref())),
        },
    }
}

/// Upper bound of the margin kept between the execution deadline and the lease expiry
const MAX_LEASE_MARGIN: Duration = Duration::from_secs(5);

/// Time a claimed step may run: the lease minus a tenth of it, at most `MAX_LEASE_MARGIN`
fn execution_budget(lock_expiry: Duration) -> Duration {
    lock_expiry.saturating_sub((lock_expiry / 10).min(MAX_LEASE_MARGIN))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "Unknown panic".to_string()
    }
}

/// Initialization of a process, valid while nobody but this worker changes the process
struct Initialized<P, S> {
    process_type_id: P,
    result: InitializationResult<S>,
    /// Version this worker left the process at
    version: i64,
    touched: Instant,
}

pub struct ProcessDispatcher<P, S> {
    repository: Arc<dyn ProcessRepository<P, S>>,
    registry: Arc<ExecutorRegistry<P, S>>,
    config: DispatcherConfig,
    initialized: DashMap<Uuid, Initialized<P, S>>,
}

impl<P: TypeCode, S: TypeCode> ProcessDispatcher<P, S> {
    pub fn new(
        repository: Arc<dyn ProcessRepository<P, S>>,
        registry: Arc<ExecutorRegistry<P, S>>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            repository,
            registry,
            config,
            initialized: DashMap::new(),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Number of processes with a cached initialization result
    pub fn initialized_process_count(&self) -> usize {
        self.initialized.len()
    }

    /// Poll until cancelled. Idle polls sleep `poll_interval`; repository failures are logged
    /// and retried after `error_backoff`.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            worker_id = %self.config.worker_id,
            process_types = ?self.registry.process_types().collect::<Vec<_>>(),
            "Process dispatcher started"
        );

        while !cancel.is_cancelled() {
            let pause = match self.run_cycle(&cancel).await {
                Ok(CycleOutcome::Idle) => Some(self.config.poll_interval),
                Ok(CycleOutcome::Cancelled { .. }) => break,
                Ok(_) => None,
                Err(err) => {
                    error!(
                        worker_id = %self.config.worker_id,
                        error = %err,
                        "Dispatch cycle failed, backing off"
                    );
                    Some(self.config.error_backoff)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "Process dispatcher stopped");
    }

    /// Run cycles until a poll finds nothing to do and return the non-idle outcomes.
    ///
    /// Also stops when a step that already came back pending or expired comes back again,
    /// which happens with a lease short enough to expire within the drain.
    pub async fn run_until_idle(
        &self,
        cancel: &CancellationToken,
    ) -> ProcessResult<Vec<CycleOutcome<S>>> {
        let mut outcomes = Vec::new();
        let mut pending = HashSet::new();
        loop {
            let outcome = self.run_cycle(cancel).await?;
            match &outcome {
                CycleOutcome::Idle => break,
                CycleOutcome::Cancelled { .. } => {
                    outcomes.push(outcome);
                    break;
                }
                CycleOutcome::Executed {
                    step_id,
                    status: ProcessStepStatus::Todo,
                    ..
                }
                | CycleOutcome::Expired { step_id, .. } => {
                    if !pending.insert(*step_id) {
                        break;
                    }
                }
                _ => {}
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Claim, execute and commit at most one step
    #[instrument(skip(self, cancel), fields(worker_id = %self.config.worker_id))]
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> ProcessResult<CycleOutcome<S>> {
        if cancel.is_cancelled() {
            return Ok(CycleOutcome::Idle);
        }

        let filter = self.registry.executable_filter();
        if filter.is_empty() {
            return Ok(CycleOutcome::Idle);
        }
        self.prune_initialized();

        let deadline = Instant::now() + execution_budget(self.config.lock_expiry);
        let Some(claimed) = self
            .repository
            .get_process_with_next_executable_step(filter, self.config.lock_expiry)
            .await?
        else {
            return Ok(CycleOutcome::Idle);
        };

        let duplicate_step_ids = claimed.duplicate_step_ids();
        if !duplicate_step_ids.is_empty() {
            warn!(
                process_id = %claimed.process.id,
                step_type = %claimed.step.process_step_type_id,
                duplicates = duplicate_step_ids.len(),
                "Process has more than one TODO step of the same type, extra steps become DUPLICATE"
            );
        }

        let ClaimedProcess {
            process,
            step,
            steps,
        } = claimed;

        let Some(executor) = self.registry.get(process.process_type_id).cloned() else {
            self.release(process.id, process.version).await;
            return Err(ProcessError::Configuration(format!(
                "no executor registered for process type {}",
                process.process_type_id
            )));
        };

        let stored_type = step.process_step_type_id;
        let step_type = self.registry.taxonomy().resolve_execution_step(stored_type);
        let is_retrigger = step_type != stored_type;

        debug!(
            process_id = %process.id,
            step_id = %step.id,
            step_type = %stored_type,
            execution_step_type = %step_type,
            version = process.version,
            "Dispatching process step"
        );

        let init_skips = match self
            .initialization(&process, &steps, &executor, cancel, deadline)
            .await
        {
            Ok(Ok(skips)) => skips,
            Ok(Err(result)) => {
                return self
                    .commit(process.id, process.version, &step, duplicate_step_ids, result, Vec::new())
                    .await;
            }
            Err(interrupted) => {
                return Ok(self.interrupted(interrupted, process.id, process.version, &step).await);
            }
        };

        let result = if init_skips.contains(&stored_type) || init_skips.contains(&step_type) {
            debug!(process_id = %process.id, step_type = %stored_type, "Step skipped by initialization");
            StepExecutionResult::skipped()
        } else {
            let context = ProcessContext {
                process_id: process.id,
                process_type_id: process.process_type_id,
                version: process.version,
                step: step.clone(),
                step_type,
                is_retrigger,
                steps,
            };
            let execution = executor.execute_process_step(step_type, &context, cancel);
            match guard(cancel, deadline, execution).await {
                Guarded::Completed(Ok(result)) if result.status.is_execution_outcome() => result,
                Guarded::Completed(Ok(result)) => {
                    error!(
                        process_id = %process.id,
                        step_id = %step.id,
                        step_type = %step_type,
                        status = %result.status,
                        "Executor returned a status it may not report"
                    );
                    StepExecutionResult::failed(format!(
                        "executor returned invalid status {}",
                        result.status
                    ))
                }
                Guarded::Completed(Err(err)) => {
                    error!(
                        process_id = %process.id,
                        step_id = %step.id,
                        step_type = %step_type,
                        error = %err,
                        "Unexpected error executing process step"
                    );
                    StepExecutionResult::failed(format!("unexpected error: {err}"))
                }
                Guarded::Panicked(message) => {
                    error!(
                        process_id = %process.id,
                        step_id = %step.id,
                        step_type = %step_type,
                        panic_msg = %message,
                        "Executor panicked executing process step"
                    );
                    StepExecutionResult::failed("step execution panicked")
                }
                Guarded::Cancelled => {
                    return Ok(self
                        .interrupted(Interrupted::Cancelled, process.id, process.version, &step)
                        .await);
                }
                Guarded::Expired => {
                    return Ok(self
                        .interrupted(Interrupted::Expired, process.id, process.version, &step)
                        .await);
                }
            }
        };

        self.commit(process.id, process.version, &step, duplicate_step_ids, result, init_skips)
            .await
    }

    /// Skip list of the process's initialization, running it on first contact.
    ///
    /// A cached result is reused only when the claim is the next change after this worker's
    /// own last write; otherwise the process is initialized again. `Ok(Err(_))` carries the
    /// failed result to commit when initialization itself went wrong.
    async fn initialization(
        &self,
        process: &Process<P>,
        steps: &[ProcessStep<S>],
        executor: &Arc<dyn ProcessTypeExecutor<P, S>>,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<Result<Vec<S>, StepExecutionResult<S>>, Interrupted> {
        let cached = self.initialized.get(&process.id).map(|cached| {
            (
                cached.version + 1 == process.version,
                cached.result.skip_step_type_ids.clone(),
            )
        });
        match cached {
            Some((true, skips)) => return Ok(Ok(skips)),
            Some((false, _)) => {
                debug!(process_id = %process.id, "Process changed elsewhere, initializing again");
                self.evict(process.id);
            }
            None => {}
        }

        let todo_types: Vec<S> = steps
            .iter()
            .filter(|s| s.is_todo())
            .map(|s| s.process_step_type_id)
            .collect();

        let initialization = executor.initialize_process(process.id, &todo_types, cancel);
        match guard(cancel, deadline, initialization).await {
            Guarded::Completed(Ok(initialization)) => {
                let skips = initialization.skip_step_type_ids.clone();
                debug!(
                    process_id = %process.id,
                    skip_step_types = ?skips,
                    "Process initialized"
                );
                self.initialized.insert(
                    process.id,
                    Initialized {
                        process_type_id: process.process_type_id,
                        result: initialization,
                        version: process.version,
                        touched: Instant::now(),
                    },
                );
                Ok(Ok(skips))
            }
            Guarded::Completed(Err(err)) => {
                error!(process_id = %process.id, error = %err, "Process initialization failed");
                Ok(Err(StepExecutionResult::failed(format!(
                    "unexpected error initializing process: {err}"
                ))))
            }
            Guarded::Panicked(message) => {
                error!(process_id = %process.id, panic_msg = %message, "Process initialization panicked");
                Ok(Err(StepExecutionResult::failed(
                    "process initialization panicked",
                )))
            }
            Guarded::Cancelled => Err(Interrupted::Cancelled),
            Guarded::Expired => Err(Interrupted::Expired),
        }
    }

    /// Release the lease of an execution that did not finish; the step stays TODO
    async fn interrupted(
        &self,
        interrupted: Interrupted,
        process_id: Uuid,
        version: i64,
        step: &ProcessStep<S>,
    ) -> CycleOutcome<S> {
        self.evict(process_id);
        self.release(process_id, version).await;
        match interrupted {
            Interrupted::Cancelled => {
                info!(
                    process_id = %process_id,
                    step_id = %step.id,
                    "Step execution cancelled, step stays TODO"
                );
                CycleOutcome::Cancelled { process_id }
            }
            Interrupted::Expired => {
                warn!(
                    process_id = %process_id,
                    step_id = %step.id,
                    lock_expiry = ?self.config.lock_expiry,
                    "Step execution outlived the lease, step stays TODO"
                );
                CycleOutcome::Expired {
                    process_id,
                    step_id: step.id,
                }
            }
        }
    }

    /// Forget a process's initialization here and in its executor
    fn evict(&self, process_id: Uuid) {
        if let Some((_, initialized)) = self.initialized.remove(&process_id) {
            if let Some(executor) = self.registry.get(initialized.process_type_id) {
                executor.forget_process(process_id);
            }
        }
    }

    /// Evict initializations this worker has not used for two lease periods. Their processes
    /// were finished or taken over elsewhere, and a later claim initializes them again.
    fn prune_initialized(&self) {
        let max_idle = self.config.lock_expiry.saturating_mul(2);
        let stale: Vec<Uuid> = self
            .initialized
            .iter()
            .filter(|entry| entry.touched.elapsed() > max_idle)
            .map(|entry| *entry.key())
            .collect();
        for process_id in stale {
            self.evict(process_id);
        }
    }

    async fn commit(
        &self,
        process_id: Uuid,
        version: i64,
        step: &ProcessStep<S>,
        duplicate_step_ids: Vec<Uuid>,
        result: StepExecutionResult<S>,
        init_skips: Vec<S>,
    ) -> ProcessResult<CycleOutcome<S>> {
        let step_type = step.process_step_type_id;
        let executed = CycleOutcome::Executed {
            process_id,
            step_id: step.id,
            step_type,
            status: result.status,
        };

        if result.is_noop() && duplicate_step_ids.is_empty() {
            if let Some(mut initialized) = self.initialized.get_mut(&process_id) {
                initialized.version = version;
                initialized.touched = Instant::now();
            }
            // the lease is kept so the step is polled again once it expires
            debug!(
                process_id = %process_id,
                step_id = %step.id,
                lock_expiry = ?self.config.lock_expiry,
                "Step still pending, deferring until the lease expires"
            );
            return Ok(executed);
        }

        let mut skip_step_type_ids = result.skip_step_type_ids;
        skip_step_type_ids.extend(init_skips);
        let mut schedule_step_type_ids = result.next_step_type_ids;
        schedule_step_type_ids.extend(result.schedule_step_type_ids);

        let outcome = StepOutcome {
            process_id,
            expected_version: version,
            step_id: step.id,
            status: result.status,
            message: result.process_message,
            duplicate_step_ids,
            skip_step_type_ids,
            schedule_step_type_ids,
        };

        match self.repository.persist_step_outcome(outcome).await {
            Ok(persisted) => {
                let created: Vec<String> = persisted
                    .created_steps
                    .iter()
                    .map(|s| s.process_step_type_id.to_string())
                    .collect();
                log_step_operation(
                    "execute",
                    process_id,
                    Some(step.id),
                    &step_type.to_string(),
                    &result.status.to_string(),
                    (!created.is_empty())
                        .then(|| format!("created {}", created.join(", ")))
                        .as_deref(),
                );
                if persisted.has_todo_steps {
                    if let Some(mut initialized) = self.initialized.get_mut(&process_id) {
                        initialized.version = persisted.process.version;
                        initialized.touched = Instant::now();
                    }
                } else {
                    self.evict(process_id);
                    debug!(process_id = %process_id, "Process has no TODO steps left");
                }
                Ok(executed)
            }
            Err(err) if err.is_conflict() => {
                self.evict(process_id);
                warn!(
                    process_id = %process_id,
                    step_id = %step.id,
                    error = %err,
                    "Process was modified concurrently, discarding step outcome"
                );
                Ok(CycleOutcome::Conflict { process_id })
            }
            Err(err) => {
                self.evict(process_id);
                Err(err)
            }
        }
    }

    /// Best-effort lease release; an expired lease frees the process anyway
    async fn release(&self, process_id: Uuid, version: i64) {
        if let Err(err) = self.repository.release_lock(process_id, version).await {
            warn!(
                process_id = %process_id,
                error = %err,
                "Failed to release process lease"
            );
        }
    }
}
