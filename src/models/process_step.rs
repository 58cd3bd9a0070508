//! # Process Step Model
//!
//! One unit of work of a process. Steps are never deleted; superseded, skipped and failed
//! steps stay behind as the audit trail of the process.
//!
//! Maps to the `process_steps` table (`id`, `process_id`, `process_step_type_id`,
//! `process_step_status_id`, `message`, `date_created`, `date_last_changed`).

use crate::state_machine::ProcessStepStatus;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessStep<S> {
    pub id: Uuid,
    pub process_id: Uuid,
    pub process_step_type_id: S,
    pub process_step_status_id: ProcessStepStatus,
    /// Human-readable outcome note of the last execution
    pub message: Option<String>,
    pub date_created: DateTime<Utc>,
    pub date_last_changed: Option<DateTime<Utc>>,
}

impl<S: PartialEq + Copy> ProcessStep<S> {
    pub fn is_todo(&self) -> bool {
        self.process_step_status_id.is_pending()
    }

    pub fn is_todo_of(&self, step_type: S) -> bool {
        self.is_todo() && self.process_step_type_id == step_type
    }
}
