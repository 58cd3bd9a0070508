//! # Retrigger Flow
//!
//! Recovery of a FAILED step: a TODO step of the companion retrigger type is enqueued, and the
//! dispatcher runs it with the executor logic of the original step type. The failed step stays
//! untouched as audit history.

use crate::error::{ProcessError, ProcessResult};
use crate::models::ProcessStep;
use crate::repository::ProcessRepository;
use crate::state_machine::ProcessStepStatus;
use crate::taxonomy::{StepTaxonomy, TypeCode};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

pub struct RetriggerService<P, S> {
    repository: Arc<dyn ProcessRepository<P, S>>,
    taxonomy: Arc<StepTaxonomy<P, S>>,
}

impl<P: TypeCode, S: TypeCode> RetriggerService<P, S> {
    pub fn new(
        repository: Arc<dyn ProcessRepository<P, S>>,
        taxonomy: Arc<StepTaxonomy<P, S>>,
    ) -> Self {
        Self {
            repository,
            taxonomy,
        }
    }

    /// Enqueue the retrigger step of a failed `step_type`.
    ///
    /// Returns the TODO retrigger step, reusing one that is already pending. Fails with a
    /// conflict when the step type has no retrigger companion, the process is leased by a
    /// worker, the step is still pending, or its latest attempt did not fail. The write is
    /// conditioned on the version read here, so a concurrent change to the process also
    /// ends in a conflict.
    #[instrument(skip(self))]
    pub async fn retrigger(&self, process_id: Uuid, step_type: S) -> ProcessResult<ProcessStep<S>> {
        let retrigger_type = self.taxonomy.retrigger_step(step_type).ok_or_else(|| {
            ProcessError::Conflict(format!("step {step_type} is not retriggerable"))
        })?;

        let process = self
            .repository
            .get_process(process_id)
            .await?
            .ok_or_else(|| ProcessError::process_not_found(process_id))?;
        if !self
            .taxonomy
            .is_executable(process.process_type_id, retrigger_type)
        {
            return Err(ProcessError::Conflict(format!(
                "step {retrigger_type} is not executable for process type {}",
                process.process_type_id
            )));
        }
        if process.is_locked() {
            return Err(ProcessError::Conflict(format!(
                "process {process_id} is being executed by a worker"
            )));
        }

        let steps = self.repository.get_process_steps(process_id).await?;
        if let Some(pending) = steps.iter().find(|s| s.is_todo_of(retrigger_type)) {
            return Ok(pending.clone());
        }
        if steps.iter().any(|s| s.is_todo_of(step_type)) {
            return Err(ProcessError::Conflict(format!(
                "step {step_type} of process {process_id} is still pending"
            )));
        }

        let latest = steps.iter().rev().find(|s| {
            s.process_step_type_id == step_type || s.process_step_type_id == retrigger_type
        });
        let latest = match latest {
            Some(latest) if latest.process_step_status_id == ProcessStepStatus::Failed => latest,
            Some(latest) => {
                return Err(ProcessError::Conflict(format!(
                    "latest {} step of process {process_id} is {}, not FAILED",
                    latest.process_step_type_id, latest.process_step_status_id
                )))
            }
            None => {
                return Err(ProcessError::Conflict(format!(
                    "process {process_id} has no {step_type} step to retrigger"
                )))
            }
        };

        let step = if latest.process_step_type_id == retrigger_type {
            self.repository
                .requeue_step(latest.id, process.version)
                .await?
        } else {
            self.repository
                .create_process_step_at_version(
                    process_id,
                    retrigger_type,
                    ProcessStepStatus::Todo,
                    process.version,
                )
                .await?
        };

        info!(
            process_id = %process_id,
            step_id = %step.id,
            step_type = %step_type,
            retrigger_step_type = %retrigger_type,
            "Retrigger step enqueued"
        );
        Ok(step)
    }
}
