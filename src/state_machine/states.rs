use crate::error::{ProcessError, ProcessResult};
use crate::taxonomy::TypeCode;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Process step status, persisted by code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStepStatus {
    /// Waiting to be executed (or, for non-executable step types, to be completed manually)
    Todo,
    /// Executed successfully
    Done,
    /// Not executed because the process no longer needs it
    Skipped,
    /// Executed and failed; recoverable only through a retrigger
    Failed,
    /// Superseded by another step of the same type
    Duplicate,
}

impl ProcessStepStatus {
    /// Statuses that will never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Skipped | Self::Duplicate)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Todo)
    }

    /// Statuses a step may be put back to TODO from
    pub fn can_requeue(&self) -> bool {
        matches!(self, Self::Failed | Self::Done)
    }

    /// Statuses an executor may report for the step it ran
    pub fn is_execution_outcome(&self) -> bool {
        !matches!(self, Self::Duplicate)
    }

    pub fn can_transition_to(&self, target: ProcessStepStatus) -> bool {
        match (self, target) {
            (Self::Todo, Self::Done | Self::Failed | Self::Skipped | Self::Duplicate) => true,
            (Self::Failed | Self::Done, Self::Todo) => true,
            _ => false,
        }
    }

    pub fn transition_to(&self, target: ProcessStepStatus) -> ProcessResult<ProcessStepStatus> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(ProcessError::Validation(format!(
                "invalid step status transition from {self} to {target}"
            )))
        }
    }
}

impl TypeCode for ProcessStepStatus {
    fn code(self) -> i32 {
        match self {
            Self::Todo => 1,
            Self::Done => 2,
            Self::Skipped => 3,
            Self::Failed => 4,
            Self::Duplicate => 5,
        }
    }

    fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Todo),
            2 => Some(Self::Done),
            3 => Some(Self::Skipped),
            4 => Some(Self::Failed),
            5 => Some(Self::Duplicate),
            _ => None,
        }
    }
}

impl fmt::Display for ProcessStepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Todo => write!(f, "TODO"),
            Self::Done => write!(f, "DONE"),
            Self::Skipped => write!(f, "SKIPPED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Duplicate => write!(f, "DUPLICATE"),
        }
    }
}

impl std::str::FromStr for ProcessStepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TODO" => Ok(Self::Todo),
            "DONE" => Ok(Self::Done),
            "SKIPPED" => Ok(Self::Skipped),
            "FAILED" => Ok(Self::Failed),
            "DUPLICATE" => Ok(Self::Duplicate),
            _ => Err(format!("Invalid process step status: {s}")),
        }
    }
}

/// Default status for new process steps
impl Default for ProcessStepStatus {
    fn default() -> Self {
        Self::Todo
    }
}
