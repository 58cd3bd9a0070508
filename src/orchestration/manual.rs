//! Completion of steps no executor runs, such as a step waiting for a provider callback.

use crate::error::{ProcessError, ProcessResult};
use crate::models::{Process, ProcessStep};
use crate::repository::{PersistedOutcome, ProcessRepository, StepOutcome};
use crate::state_machine::ProcessStepStatus;
use crate::taxonomy::TypeCode;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

pub struct ManualStepService<P, S> {
    repository: Arc<dyn ProcessRepository<P, S>>,
}

struct PendingStep<P, S> {
    process: Process<P>,
    step: ProcessStep<S>,
    duplicate_step_ids: Vec<Uuid>,
}

impl<P: TypeCode, S: TypeCode> ManualStepService<P, S> {
    pub fn new(repository: Arc<dyn ProcessRepository<P, S>>) -> Self {
        Self { repository }
    }

    async fn pending_step(&self, process_id: Uuid, step_type: S) -> ProcessResult<PendingStep<P, S>> {
        let process = self
            .repository
            .get_process(process_id)
            .await?
            .ok_or_else(|| ProcessError::process_not_found(process_id))?;
        if process.is_locked() {
            return Err(ProcessError::Conflict(format!(
                "process {process_id} is being executed by a worker"
            )));
        }

        let steps = self.repository.get_process_steps(process_id).await?;
        let mut pending = steps.into_iter().filter(|s| s.is_todo_of(step_type));
        let step = pending.next().ok_or_else(|| {
            ProcessError::Conflict(format!(
                "process {process_id} has no pending {step_type} step"
            ))
        })?;
        Ok(PendingStep {
            process,
            step,
            duplicate_step_ids: pending.map(|s| s.id).collect(),
        })
    }

    /// Mark the pending step of `step_type` DONE and enqueue `next_step_type_ids`
    #[instrument(skip(self, next_step_type_ids, message))]
    pub async fn complete_step(
        &self,
        process_id: Uuid,
        step_type: S,
        next_step_type_ids: Vec<S>,
        message: Option<String>,
    ) -> ProcessResult<PersistedOutcome<P, S>> {
        let pending = self.pending_step(process_id, step_type).await?;
        let persisted = self
            .repository
            .persist_step_outcome(StepOutcome {
                process_id,
                expected_version: pending.process.version,
                step_id: pending.step.id,
                status: ProcessStepStatus::Done,
                message,
                duplicate_step_ids: pending.duplicate_step_ids,
                skip_step_type_ids: Vec::new(),
                schedule_step_type_ids: next_step_type_ids,
            })
            .await?;

        info!(
            process_id = %process_id,
            step_id = %pending.step.id,
            step_type = %step_type,
            created = persisted.created_steps.len(),
            "Manual step completed"
        );
        Ok(persisted)
    }

    /// Mark the pending step of `step_type` FAILED, making it eligible for a retrigger
    #[instrument(skip(self, message))]
    pub async fn fail_step(
        &self,
        process_id: Uuid,
        step_type: S,
        message: String,
    ) -> ProcessResult<Process<P>> {
        let pending = self.pending_step(process_id, step_type).await?;
        let process = self
            .repository
            .update_process_step_status(
                pending.step.id,
                ProcessStepStatus::Failed,
                Some(message),
                pending.process.version,
            )
            .await?;

        info!(
            process_id = %process_id,
            step_id = %pending.step.id,
            step_type = %step_type,
            "Manual step failed"
        );
        Ok(process)
    }
}
