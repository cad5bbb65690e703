//! Error types for the workflow engine.
//!
//! `EngineError` is the single error enum crossing module boundaries.
//! `ConcurrencyConflict` deserves a note: losing an optimistic-lock race is
//! routine coordination between workers, not a failure. Callers that hit it
//! discard their unit of work and let the winner's state stand.

use thiserror::Error;

/// Engine-level errors.
#[derive(Error, Debug)]
pub enum EngineError {
    /// No definition with the given id (and version, where pinned).
    #[error("Workflow definition not found: {0}")]
    DefinitionNotFound(String),

    /// Definition exists but cannot be executed (not published, or failed
    /// publish-time validation).
    #[error("Workflow definition not executable: {0}")]
    DefinitionNotExecutable(String),

    /// No instance with the given id.
    #[error("Workflow instance not found: {0}")]
    InstanceNotFound(String),

    /// The instance is in the wrong state for the requested transition.
    #[error("Workflow instance not runnable: {0}")]
    InstanceNotRunnable(String),

    /// No executor is registered for the step type.
    #[error("Unsupported step type: {0}")]
    UnsupportedStepType(String),

    /// Executor-reported business failure.
    #[error("Step execution failed: {0}")]
    StepExecution(String),

    /// Lost an optimistic-lock race on the instance row.
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Malformed condition or template expression.
    #[error("Expression evaluation error: {0}")]
    ExpressionEvaluation(String),

    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Task is in the wrong state for the requested action.
    #[error("Task not actionable: {0}")]
    TaskNotActionable(String),

    /// Validation error (definition structure, step configuration, request
    /// shape).
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether this error is benign coordination noise rather than a real
    /// failure. Benign errors are logged at debug level and absorbed.
    pub fn is_benign(&self) -> bool {
        matches!(self, EngineError::ConcurrencyConflict(_))
    }
}

/// Result type alias using EngineError.
pub type EngineResult<T> = Result<T, EngineError>;

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_not_found_display() {
        let err = EngineError::DefinitionNotFound("abc".to_string());
        assert_eq!(err.to_string(), "Workflow definition not found: abc");
    }

    #[test]
    fn test_concurrency_conflict_is_benign() {
        assert!(EngineError::ConcurrencyConflict("lost race".into()).is_benign());
        assert!(!EngineError::Validation("bad".into()).is_benign());
    }
}
