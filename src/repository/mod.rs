//! # Process Repository
//!
//! Persistence boundary of the engine. Every operation that changes a process or one of its
//! steps increments the process version; operations taking an `expected_version` fail with
//! [`ProcessError::Conflict`](crate::error::ProcessError::Conflict) when the stored version
//! differs, which is how a worker learns that somebody else touched the process since it read
//! it.
//!
//! Two implementations are provided:
//! - [`PgProcessRepository`]: PostgreSQL, claims with `FOR UPDATE SKIP LOCKED`
//! - [`InMemoryProcessRepository`]: a single mutex over the whole store, for tests and
//!   embedded use

mod in_memory;
mod postgres;

pub use in_memory::InMemoryProcessRepository;
pub use postgres::PgProcessRepository;

use crate::error::ProcessResult;
use crate::models::{Process, ProcessStep};
use crate::state_machine::ProcessStepStatus;
use crate::taxonomy::TypeCode;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use uuid::Uuid;

/// The (process type, step type) pairs a poll may return
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableStepFilter<P, S> {
    entries: BTreeMap<P, BTreeSet<S>>,
}

impl<P: TypeCode, S: TypeCode> Default for ExecutableStepFilter<P, S> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<P: TypeCode, S: TypeCode> ExecutableStepFilter<P, S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<I>(mut self, process_type: P, step_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
    {
        self.insert(process_type, step_types);
        self
    }

    pub fn insert<I>(&mut self, process_type: P, step_types: I)
    where
        I: IntoIterator<Item = S>,
    {
        self.entries
            .entry(process_type)
            .or_default()
            .extend(step_types);
    }

    pub fn contains(&self, process_type: P, step_type: S) -> bool {
        self.entries
            .get(&process_type)
            .is_some_and(|steps| steps.contains(&step_type))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(BTreeSet::is_empty)
    }

    pub fn process_types(&self) -> impl Iterator<Item = P> + '_ {
        self.entries.keys().copied()
    }

    /// Parallel code arrays, the shape the SQL claim query unnests
    pub fn code_pairs(&self) -> (Vec<i32>, Vec<i32>) {
        self.entries
            .iter()
            .flat_map(|(process_type, steps)| {
                steps
                    .iter()
                    .map(move |step| (process_type.code(), step.code()))
            })
            .unzip()
    }
}

/// A process claimed by a poll, together with the step to execute
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedProcess<P, S> {
    /// The process as of the claim; `version` is the token the commit must present
    pub process: Process<P>,
    /// Oldest executable TODO step of the process
    pub step: ProcessStep<S>,
    /// All steps of the process at claim time, in creation order
    pub steps: Vec<ProcessStep<S>>,
}

impl<P: TypeCode, S: TypeCode> ClaimedProcess<P, S> {
    /// Other TODO steps of the same type as the claimed one
    pub fn duplicate_step_ids(&self) -> Vec<Uuid> {
        self.steps
            .iter()
            .filter(|s| s.id != self.step.id && s.is_todo_of(self.step.process_step_type_id))
            .map(|s| s.id)
            .collect()
    }

    pub fn todo_steps(&self) -> impl Iterator<Item = &ProcessStep<S>> {
        self.steps.iter().filter(|s| s.is_todo())
    }
}

/// Everything one dispatch cycle commits, applied atomically
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome<S> {
    pub process_id: Uuid,
    pub expected_version: i64,
    pub step_id: Uuid,
    /// New status of the executed step; `Todo` keeps it pending
    pub status: ProcessStepStatus,
    pub message: Option<String>,
    /// TODO steps superseded by the executed step
    pub duplicate_step_ids: Vec<Uuid>,
    /// TODO steps of these types (other than the executed one) become SKIPPED
    pub skip_step_type_ids: Vec<S>,
    /// New TODO steps, created only when no TODO step of the type exists
    pub schedule_step_type_ids: Vec<S>,
}

impl<S: TypeCode> StepOutcome<S> {
    /// Schedule list without repeated types, first occurrence wins
    pub(crate) fn distinct_schedule_step_type_ids(&self) -> Vec<S> {
        let mut seen = BTreeSet::new();
        self.schedule_step_type_ids
            .iter()
            .copied()
            .filter(|step_type| seen.insert(*step_type))
            .collect()
    }
}

/// Result of a committed [`StepOutcome`]
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedOutcome<P, S> {
    /// The process after the commit, lease released
    pub process: Process<P>,
    pub created_steps: Vec<ProcessStep<S>>,
    pub skipped_step_ids: Vec<Uuid>,
    /// Whether any TODO step is left on the process
    pub has_todo_steps: bool,
}

#[async_trait]
pub trait ProcessRepository<P: TypeCode, S: TypeCode>: Send + Sync {
    /// Allocate a new process with a fresh identity and the initial version, no steps yet
    async fn create_process(&self, process_type_id: P) -> ProcessResult<Process<P>>;

    /// Append a step to a process
    async fn create_process_step(
        &self,
        process_id: Uuid,
        process_step_type_id: S,
        status: ProcessStepStatus,
    ) -> ProcessResult<ProcessStep<S>>;

    /// Append a step, conditioned on the process version
    async fn create_process_step_at_version(
        &self,
        process_id: Uuid,
        process_step_type_id: S,
        status: ProcessStepStatus,
        expected_version: i64,
    ) -> ProcessResult<ProcessStep<S>>;

    async fn get_process(&self, process_id: Uuid) -> ProcessResult<Option<Process<P>>>;

    /// All steps of a process in creation order
    async fn get_process_steps(&self, process_id: Uuid) -> ProcessResult<Vec<ProcessStep<S>>>;

    async fn get_process_step(&self, step_id: Uuid) -> ProcessResult<Option<ProcessStep<S>>>;

    /// Claim the unleased process with the oldest TODO step matching `filter`.
    ///
    /// The claim leases the process for `lock_expiry` and increments its version. Concurrent
    /// callers never receive the same process while the lease is active.
    async fn get_process_with_next_executable_step(
        &self,
        filter: &ExecutableStepFilter<P, S>,
        lock_expiry: Duration,
    ) -> ProcessResult<Option<ClaimedProcess<P, S>>>;

    /// Set the status of a single step, conditioned on the process version
    async fn update_process_step_status(
        &self,
        step_id: Uuid,
        status: ProcessStepStatus,
        message: Option<String>,
        expected_version: i64,
    ) -> ProcessResult<Process<P>>;

    /// Put a FAILED or DONE step back to TODO, conditioned on the process version
    async fn requeue_step(
        &self,
        step_id: Uuid,
        expected_version: i64,
    ) -> ProcessResult<ProcessStep<S>>;

    /// Commit a dispatch cycle and release the lease
    async fn persist_step_outcome(
        &self,
        outcome: StepOutcome<S>,
    ) -> ProcessResult<PersistedOutcome<P, S>>;

    /// Release a lease without touching any step
    async fn release_lock(&self, process_id: Uuid, expected_version: i64)
        -> ProcessResult<Process<P>>;
}
