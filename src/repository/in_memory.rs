use super::{
    ClaimedProcess, ExecutableStepFilter, PersistedOutcome, ProcessRepository, StepOutcome,
};
use crate::error::{ProcessError, ProcessResult};
use crate::models::{Process, ProcessStep};
use crate::state_machine::ProcessStepStatus;
use crate::taxonomy::TypeCode;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Process store kept in memory.
///
/// All operations run under one mutex, which makes each of them atomic and serializes
/// concurrent claims the way row locks do in PostgreSQL.
pub struct InMemoryProcessRepository<P, S> {
    state: Mutex<StoreState<P, S>>,
}

struct StoreState<P, S> {
    processes: HashMap<Uuid, Process<P>>,
    /// Steps of all processes in creation order
    steps: Vec<ProcessStep<S>>,
    step_index: HashMap<Uuid, usize>,
}

impl<P: TypeCode, S: TypeCode> Default for InMemoryProcessRepository<P, S> {
    fn default() -> Self {
        Self {
            state: Mutex::new(StoreState {
                processes: HashMap::new(),
                steps: Vec::new(),
                step_index: HashMap::new(),
            }),
        }
    }
}

impl<P: TypeCode, S: TypeCode> InMemoryProcessRepository<P, S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted steps across all processes
    pub fn step_count(&self) -> usize {
        self.state.lock().steps.len()
    }
}

impl<P: TypeCode, S: TypeCode> StoreState<P, S> {
    fn process_mut(&mut self, process_id: Uuid) -> ProcessResult<&mut Process<P>> {
        self.processes
            .get_mut(&process_id)
            .ok_or_else(|| ProcessError::process_not_found(process_id))
    }

    fn step_position(&self, step_id: Uuid) -> ProcessResult<usize> {
        self.step_index
            .get(&step_id)
            .copied()
            .ok_or_else(|| ProcessError::step_not_found(step_id))
    }

    fn check_version(&self, process_id: Uuid, expected_version: i64) -> ProcessResult<()> {
        let process = self
            .processes
            .get(&process_id)
            .ok_or_else(|| ProcessError::process_not_found(process_id))?;
        if process.version != expected_version {
            return Err(ProcessError::version_conflict(process_id, expected_version));
        }
        Ok(())
    }

    fn bump_version(&mut self, process_id: Uuid) -> ProcessResult<Process<P>> {
        let process = self.process_mut(process_id)?;
        process.version += 1;
        Ok(process.clone())
    }

    fn push_step(&mut self, process_id: Uuid, step_type: S, status: ProcessStepStatus) -> ProcessStep<S> {
        let step = ProcessStep {
            id: Uuid::new_v4(),
            process_id,
            process_step_type_id: step_type,
            process_step_status_id: status,
            message: None,
            date_created: Utc::now(),
            date_last_changed: None,
        };
        self.step_index.insert(step.id, self.steps.len());
        self.steps.push(step.clone());
        step
    }

    fn steps_of(&self, process_id: Uuid) -> Vec<ProcessStep<S>> {
        self.steps
            .iter()
            .filter(|s| s.process_id == process_id)
            .cloned()
            .collect()
    }

    fn set_status(
        &mut self,
        position: usize,
        status: ProcessStepStatus,
        message: Option<String>,
        now: DateTime<Utc>,
    ) {
        let step = &mut self.steps[position];
        step.process_step_status_id = status;
        step.message = message;
        step.date_last_changed = Some(now);
    }
}

#[async_trait]
impl<P: TypeCode, S: TypeCode> ProcessRepository<P, S> for InMemoryProcessRepository<P, S> {
    async fn create_process(&self, process_type_id: P) -> ProcessResult<Process<P>> {
        let process = Process {
            id: Uuid::new_v4(),
            process_type_id,
            version: Process::<P>::INITIAL_VERSION,
            lock_expiry_date: None,
            date_created: Utc::now(),
        };
        self.state
            .lock()
            .processes
            .insert(process.id, process.clone());
        Ok(process)
    }

    async fn create_process_step(
        &self,
        process_id: Uuid,
        process_step_type_id: S,
        status: ProcessStepStatus,
    ) -> ProcessResult<ProcessStep<S>> {
        let mut state = self.state.lock();
        state.bump_version(process_id)?;
        Ok(state.push_step(process_id, process_step_type_id, status))
    }

    async fn create_process_step_at_version(
        &self,
        process_id: Uuid,
        process_step_type_id: S,
        status: ProcessStepStatus,
        expected_version: i64,
    ) -> ProcessResult<ProcessStep<S>> {
        let mut state = self.state.lock();
        state.check_version(process_id, expected_version)?;
        state.bump_version(process_id)?;
        Ok(state.push_step(process_id, process_step_type_id, status))
    }

    async fn get_process(&self, process_id: Uuid) -> ProcessResult<Option<Process<P>>> {
        Ok(self.state.lock().processes.get(&process_id).cloned())
    }

    async fn get_process_steps(&self, process_id: Uuid) -> ProcessResult<Vec<ProcessStep<S>>> {
        Ok(self.state.lock().steps_of(process_id))
    }

    async fn get_process_step(&self, step_id: Uuid) -> ProcessResult<Option<ProcessStep<S>>> {
        let state = self.state.lock();
        Ok(state
            .step_index
            .get(&step_id)
            .map(|position| state.steps[*position].clone()))
    }

    async fn get_process_with_next_executable_step(
        &self,
        filter: &ExecutableStepFilter<P, S>,
        lock_expiry: Duration,
    ) -> ProcessResult<Option<ClaimedProcess<P, S>>> {
        let lease = chrono::Duration::from_std(lock_expiry)
            .map_err(|e| ProcessError::Validation(format!("invalid lock expiry: {e}")))?;
        let now = Utc::now();
        let mut state = self.state.lock();

        let candidate = state.steps.iter().find(|step| {
            step.is_todo()
                && state.processes.get(&step.process_id).is_some_and(|process| {
                    !process.is_locked_at(now)
                        && filter.contains(process.process_type_id, step.process_step_type_id)
                })
        });
        let Some(step) = candidate.cloned() else {
            return Ok(None);
        };

        let process = state.process_mut(step.process_id)?;
        process.lock_expiry_date = Some(now + lease);
        process.version += 1;
        let process = process.clone();

        debug!(
            process_id = %process.id,
            step_id = %step.id,
            step_type = %step.process_step_type_id,
            version = process.version,
            "Claimed process"
        );

        Ok(Some(ClaimedProcess {
            steps: state.steps_of(process.id),
            process,
            step,
        }))
    }

    async fn update_process_step_status(
        &self,
        step_id: Uuid,
        status: ProcessStepStatus,
        message: Option<String>,
        expected_version: i64,
    ) -> ProcessResult<Process<P>> {
        let mut state = self.state.lock();
        let position = state.step_position(step_id)?;
        let process_id = state.steps[position].process_id;
        state.check_version(process_id, expected_version)?;
        state.steps[position]
            .process_step_status_id
            .transition_to(status)?;

        state.set_status(position, status, message, Utc::now());
        state.bump_version(process_id)
    }

    async fn requeue_step(
        &self,
        step_id: Uuid,
        expected_version: i64,
    ) -> ProcessResult<ProcessStep<S>> {
        let mut state = self.state.lock();
        let position = state.step_position(step_id)?;
        let process_id = state.steps[position].process_id;
        state.check_version(process_id, expected_version)?;
        let current = state.steps[position].process_step_status_id;
        if !current.can_requeue() {
            return Err(ProcessError::Conflict(format!(
                "step {step_id} is {current} and cannot be requeued"
            )));
        }

        state.set_status(position, ProcessStepStatus::Todo, None, Utc::now());
        state.bump_version(process_id)?;
        Ok(state.steps[position].clone())
    }

    async fn persist_step_outcome(
        &self,
        outcome: StepOutcome<S>,
    ) -> ProcessResult<PersistedOutcome<P, S>> {
        let mut state = self.state.lock();
        let process_id = outcome.process_id;
        state.check_version(process_id, outcome.expected_version)?;

        // validate everything before the first mutation so a rejected outcome leaves no trace
        let position = state.step_position(outcome.step_id)?;
        let executed = &state.steps[position];
        if executed.process_id != process_id || !executed.is_todo() {
            return Err(ProcessError::Conflict(format!(
                "step {} is no longer pending on process {process_id}",
                outcome.step_id
            )));
        }
        if outcome.status != ProcessStepStatus::Todo {
            executed.process_step_status_id.transition_to(outcome.status)?;
        }
        let mut duplicate_positions = Vec::with_capacity(outcome.duplicate_step_ids.len());
        for duplicate_id in &outcome.duplicate_step_ids {
            let duplicate_position = state.step_position(*duplicate_id)?;
            let duplicate = &state.steps[duplicate_position];
            if duplicate.process_id != process_id || duplicate.id == outcome.step_id {
                return Err(ProcessError::Validation(format!(
                    "step {duplicate_id} cannot be marked as duplicate of {}",
                    outcome.step_id
                )));
            }
            if duplicate.is_todo() {
                duplicate_positions.push(duplicate_position);
            } else {
                warn!(step_id = %duplicate_id, "Duplicate step is no longer pending, leaving it untouched");
            }
        }

        let now = Utc::now();
        let executed_message = match outcome.status {
            ProcessStepStatus::Todo => outcome
                .message
                .clone()
                .or_else(|| state.steps[position].message.clone()),
            _ => outcome.message.clone(),
        };
        let executed_status = outcome.status;
        state.set_status(position, executed_status, executed_message, now);
        for duplicate_position in duplicate_positions {
            state.set_status(duplicate_position, ProcessStepStatus::Duplicate, None, now);
        }

        let skipped_step_ids: Vec<Uuid> = state
            .steps
            .iter()
            .filter(|s| {
                s.process_id == process_id
                    && s.id != outcome.step_id
                    && s.is_todo()
                    && outcome.skip_step_type_ids.contains(&s.process_step_type_id)
            })
            .map(|s| s.id)
            .collect();
        for skipped_id in &skipped_step_ids {
            let skipped_position = state.step_position(*skipped_id)?;
            state.set_status(skipped_position, ProcessStepStatus::Skipped, None, now);
        }

        let mut created_steps = Vec::new();
        for step_type in outcome.distinct_schedule_step_type_ids() {
            let pending = state
                .steps
                .iter()
                .any(|s| s.process_id == process_id && s.is_todo_of(step_type));
            if !pending {
                created_steps.push(state.push_step(process_id, step_type, ProcessStepStatus::Todo));
            }
        }

        let has_todo_steps = state
            .steps
            .iter()
            .any(|s| s.process_id == process_id && s.is_todo());
        let process = state.process_mut(process_id)?;
        process.lock_expiry_date = None;
        process.version += 1;

        Ok(PersistedOutcome {
            process: process.clone(),
            created_steps,
            skipped_step_ids,
            has_todo_steps,
        })
    }

    async fn release_lock(
        &self,
        process_id: Uuid,
        expected_version: i64,
    ) -> ProcessResult<Process<P>> {
        let mut state = self.state.lock();
        state.check_version(process_id, expected_version)?;
        let process = state.process_mut(process_id)?;
        process.lock_expiry_date = None;
        process.version += 1;
        Ok(process.clone())
    }
}
