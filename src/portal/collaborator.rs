//! Failures reported by the external systems portal executors call.

use crate::orchestration::StepExecutionResult;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    /// The remote system could not be reached or timed out; worth another attempt later
    #[error("{service} unavailable: {message}")]
    Unavailable {
        service: &'static str,
        message: String,
    },
    /// The remote system answered and refused the request
    #[error("{service} rejected the request with status {status}: {message}")]
    Rejected {
        service: &'static str,
        status: u16,
        message: String,
    },
    #[error("{0} not found")]
    NotFound(String),
}

impl CollaboratorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Business outcome of a failed collaborator call: transient failures leave the step
    /// pending, everything else fails it with the error as process message
    pub fn into_step_result<S>(self) -> StepExecutionResult<S> {
        if self.is_transient() {
            warn!(error = %self, "Collaborator unavailable, step stays pending");
            StepExecutionResult::todo()
        } else {
            StepExecutionResult::failed(self.to_string())
        }
    }
}
