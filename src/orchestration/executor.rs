//! # Process Type Executor
//!
//! One implementation per process domain. The dispatcher routes a claimed process to the
//! executor registered for its process type and invokes it with the step type to run. A
//! retrigger step arrives already resolved to the step type it re-runs.
//!
//! Expected business failures are returned as [`StepExecutionResult::failed`]. An `Err` (or a
//! panic) is the channel for unexpected conditions: the dispatcher logs it and persists the
//! step as FAILED with a generic message.

use crate::models::ProcessStep;
use crate::state_machine::ProcessStepStatus;
use crate::taxonomy::TypeCode;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[async_trait]
pub trait ProcessTypeExecutor<P: TypeCode, S: TypeCode>: Send + Sync {
    /// The process type this executor handles
    fn process_type_id(&self) -> P;

    /// Whether this executor runs `step_type` for its own process type
    fn is_executable_step_type_id(&self, step_type: S) -> bool;

    /// Invoked before the first execution of a process on this dispatcher, and again when
    /// somebody else changed the process since this dispatcher last committed it.
    ///
    /// `step_type_ids` are the types of the process's TODO steps at that moment.
    async fn initialize_process(
        &self,
        _process_id: Uuid,
        _step_type_ids: &[S],
        _cancellation_token: &CancellationToken,
    ) -> anyhow::Result<InitializationResult<S>> {
        Ok(InitializationResult::default())
    }

    /// Drop whatever the executor cached for `process_id` while initializing or executing
    fn forget_process(&self, _process_id: Uuid) {}

    async fn execute_process_step(
        &self,
        step_type: S,
        context: &ProcessContext<P, S>,
        cancellation_token: &CancellationToken,
    ) -> anyhow::Result<StepExecutionResult<S>>;
}

/// What the dispatcher knows about the process while a step runs
#[derive(Debug, Clone)]
pub struct ProcessContext<P, S> {
    pub process_id: Uuid,
    pub process_type_id: P,
    /// Version held by the claim
    pub version: i64,
    /// The stored step being executed
    pub step: ProcessStep<S>,
    /// Step type whose logic runs; differs from the stored type for retrigger steps
    pub step_type: S,
    pub is_retrigger: bool,
    /// All steps of the process at claim time
    pub steps: Vec<ProcessStep<S>>,
}

impl<P: TypeCode, S: TypeCode> ProcessContext<P, S> {
    /// Whether the process has a step of `step_type` in `status`
    pub fn has_step(&self, step_type: S, status: ProcessStepStatus) -> bool {
        self.steps
            .iter()
            .any(|s| s.process_step_type_id == step_type && s.process_step_status_id == status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializationResult<S> {
    /// Whether the executor changed anything while initializing
    pub modified: bool,
    /// TODO steps of these types are skipped before anything executes
    pub skip_step_type_ids: Vec<S>,
}

impl<S> Default for InitializationResult<S> {
    fn default() -> Self {
        Self {
            modified: false,
            skip_step_type_ids: Vec::new(),
        }
    }
}

impl<S> InitializationResult<S> {
    pub fn skipping(skip_step_type_ids: Vec<S>) -> Self {
        Self {
            modified: !skip_step_type_ids.is_empty(),
            skip_step_type_ids,
        }
    }
}

/// Outcome of one step execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepExecutionResult<S> {
    /// Whether anything needs to be written; an unmodified pending result only releases the lease
    pub modified: bool,
    /// New status of the executed step. `Todo` keeps it pending for a later poll.
    pub status: ProcessStepStatus,
    /// Follow-up steps to enqueue
    pub next_step_type_ids: Vec<S>,
    /// Steps to create that are completed by an external callback rather than executed
    pub schedule_step_type_ids: Vec<S>,
    /// TODO steps of these types become SKIPPED
    pub skip_step_type_ids: Vec<S>,
    pub process_message: Option<String>,
}

impl<S> StepExecutionResult<S> {
    fn with_status(status: ProcessStepStatus) -> Self {
        Self {
            modified: true,
            status,
            next_step_type_ids: Vec::new(),
            schedule_step_type_ids: Vec::new(),
            skip_step_type_ids: Vec::new(),
            process_message: None,
        }
    }

    pub fn done<I>(next_step_type_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
    {
        Self {
            next_step_type_ids: next_step_type_ids.into_iter().collect(),
            ..Self::with_status(ProcessStepStatus::Done)
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            process_message: Some(message.into()),
            ..Self::with_status(ProcessStepStatus::Failed)
        }
    }

    pub fn skipped() -> Self {
        Self::with_status(ProcessStepStatus::Skipped)
    }

    /// Not finished yet, poll again later
    pub fn todo() -> Self {
        Self {
            modified: false,
            ..Self::with_status(ProcessStepStatus::Todo)
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.process_message = Some(message.into());
        self.modified = true;
        self
    }

    pub fn with_scheduled<I>(mut self, step_type_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
    {
        self.schedule_step_type_ids.extend(step_type_ids);
        self.modified = true;
        self
    }

    pub fn with_skipped<I>(mut self, step_type_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
    {
        self.skip_step_type_ids.extend(step_type_ids);
        self.modified = true;
        self
    }

    /// Whether committing this result would change nothing
    pub fn is_noop(&self) -> bool {
        !self.modified
            && self.status == ProcessStepStatus::Todo
            && self.next_step_type_ids.is_empty()
            && self.schedule_step_type_ids.is_empty()
            && self.skip_step_type_ids.is_empty()
    }
}
