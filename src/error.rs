//! Error types for the process engine.

use crate::config::ConfigurationError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProcessError {
    /// A referenced process or process step does not exist
    #[error("{entity} {id} does not exist")]
    NotFound { entity: &'static str, id: Uuid },
    /// Optimistic version mismatch, a leased process, or a retrigger of a step that
    /// has no retrigger companion
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Validation error: {0}")]
    Validation(String),
}

impl ProcessError {
    pub fn process_not_found(id: Uuid) -> Self {
        Self::NotFound {
            entity: "process",
            id,
        }
    }

    pub fn step_not_found(id: Uuid) -> Self {
        Self::NotFound {
            entity: "process step",
            id,
        }
    }

    pub fn version_conflict(process_id: Uuid, expected_version: i64) -> Self {
        Self::Conflict(format!(
            "process {process_id} was modified concurrently (expected version {expected_version})"
        ))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<sqlx::Error> for ProcessError {
    fn from(err: sqlx::Error) -> Self {
        ProcessError::Database(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for ProcessError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        ProcessError::Database(format!("migration failed: {err}"))
    }
}

impl From<ConfigurationError> for ProcessError {
    fn from(err: ConfigurationError) -> Self {
        ProcessError::Configuration(err.to_string())
    }
}

pub type ProcessResult<T> = std::result::Result<T, ProcessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let id = Uuid::nil();
        assert_eq!(
            ProcessError::process_not_found(id).to_string(),
            format!("process {id} does not exist")
        );
        assert!(ProcessError::step_not_found(id).is_not_found());
    }

    #[test]
    fn test_version_conflict_is_conflict() {
        let err = ProcessError::version_conflict(Uuid::nil(), 7);
        assert!(err.is_conflict());
        assert!(err.to_string().contains("expected version 7"));
    }
}
