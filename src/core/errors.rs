use serde::{Deserialize, Serialize};

use crate::core::domain::ExecutionOutcome;

/// Faults of the sandbox itself. Problems with the candidate's code never
/// end up here, they are reported through `ExecutionOutcome`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SandboxError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("failed to start sandboxed process: {0}")]
    Spawn(String),
    #[error("sandbox I/O failure: {0}")]
    Io(String),
    #[error("sandbox backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("sandbox worker pool is closed")]
    PoolClosed,
}

impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        SandboxError::Io(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PersistenceError {
    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: String },
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error("conflicting write: {0}")]
    Conflict(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvaluationError {
    #[error("evaluation service unavailable: {0}")]
    Unavailable(String),
    #[error("invalid evaluation response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
    #[error("invalid request: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    CandidateError,
    ResourceLimitError,
    InfrastructureError,
    PersistenceError,
    InvalidRequest,
}

impl FailureKind {
    /// Text shown to the candidate.
    pub fn user_message(&self) -> &'static str {
        match self {
            FailureKind::CandidateError => {
                "Your code produced wrong output or exited with an error."
            }
            FailureKind::ResourceLimitError => {
                "Your code exceeded the time or memory limit."
            }
            FailureKind::InfrastructureError => {
                "A server problem prevented us from testing your code, please retry."
            }
            FailureKind::PersistenceError => {
                "Your result could not be saved because of a server problem, please retry."
            }
            FailureKind::InvalidRequest => "The request was invalid.",
        }
    }
}

impl ExecutionOutcome {
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            ExecutionOutcome::Completed => None,
            ExecutionOutcome::RuntimeError => Some(FailureKind::CandidateError),
            ExecutionOutcome::TimedOut | ExecutionOutcome::MemoryExceeded => {
                Some(FailureKind::ResourceLimitError)
            }
        }
    }
}

impl PipelineError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            PipelineError::Sandbox(_) => FailureKind::InfrastructureError,
            PipelineError::Persistence(PersistenceError::NotFound { .. }) => {
                FailureKind::InvalidRequest
            }
            PipelineError::Persistence(_) => FailureKind::PersistenceError,
            PipelineError::Evaluation(_) => FailureKind::InfrastructureError,
            PipelineError::Validation(_) => FailureKind::InvalidRequest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infrastructure_and_candidate_messages_differ() {
        let infra = PipelineError::Sandbox(SandboxError::Spawn("docker: not found".to_string()));
        assert_eq!(infra.failure_kind(), FailureKind::InfrastructureError);
        assert!(infra.failure_kind().user_message().contains("retry"));
        assert!(!FailureKind::CandidateError.user_message().contains("server"));
    }

    #[test]
    fn test_missing_question_is_invalid_request() {
        let err = PipelineError::from(PersistenceError::NotFound {
            entity: "question".to_string(),
            id: "q1".to_string(),
        });
        assert_eq!(err.failure_kind(), FailureKind::InvalidRequest);
        assert_eq!(err.to_string(), "question q1 not found");
    }
}
