//! Newline-delimited JSON. Each request line is an object with an `op` field
//! and an optional `id` that is echoed back, since responses on one
//! connection may arrive out of request order.
//!
//! ```text
//! {"id":1,"op":"run_sample","code":"print(input())","language":"python","testcases":[{"input":"7","expected_output":"7"}]}
//! {"id":1,"ok":{"outcomes":[...],"passed_count":1,...}}
//! ```
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::{
    domain::{SampleRequest, SubmissionRequest, ViolationKind},
    errors::{FailureKind, PipelineError},
};

#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(flatten)]
    pub request: Request,
}

#[derive(Debug, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    RunSample(SampleRequest),
    RunSubmission(SubmissionRequest),
    JoinSession {
        participant_id: String,
        test_id: String,
        question_id: String,
        language: String,
    },
    UpdateCode {
        session_id: Uuid,
        code: String,
    },
    AcknowledgeStart {
        session_id: Uuid,
    },
    ReportViolation {
        session_id: Uuid,
        violation: ViolationKind,
    },
    Tick {
        session_id: Uuid,
    },
    SessionStatus {
        session_id: Uuid,
    },
    ApplyEvaluation {
        submission_id: Uuid,
        response: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("unknown session {0}")]
    UnknownSession(Uuid),
    #[error("run aborted: {0}")]
    Aborted(String),
    #[error("failed to encode response: {0}")]
    Encode(String),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl RequestError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RequestError::Malformed(_) | RequestError::UnknownSession(_) => {
                FailureKind::InvalidRequest
            }
            RequestError::Aborted(_) | RequestError::Encode(_) => FailureKind::InfrastructureError,
            RequestError::Pipeline(err) => err.failure_kind(),
        }
    }
}

#[derive(Debug, PartialEq, Serialize)]
pub struct ErrorBody {
    pub kind: FailureKind,
    /// Plain-language text for the candidate.
    pub message: String,
    pub detail: String,
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok(Value),
    Error(ErrorBody),
}

#[derive(Debug, PartialEq, Serialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl Response {
    pub fn new(id: Option<Value>, result: Result<Value, RequestError>) -> Self {
        let outcome = match result {
            Ok(value) => Outcome::Ok(value),
            Err(err) => {
                let kind = err.kind();
                Outcome::Error(ErrorBody {
                    kind,
                    message: kind.user_message().to_string(),
                    detail: err.to_string(),
                })
            }
        };
        Self { id, outcome }
    }

    pub fn to_line(&self) -> String {
        match serde_json::to_string(self) {
            Ok(line) => line,
            Err(err) => {
                tracing::error!("Failed to serialize response: {}", err);
                r#"{"error":{"kind":"infrastructure_error","message":"A server problem prevented us from testing your code, please retry.","detail":"unencodable response"}}"#.to_string()
            }
        }
    }
}

pub fn parse_line(line: &str) -> Result<Envelope, RequestError> {
    serde_json::from_str(line).map_err(|e| RequestError::Malformed(e.to_string()))
}
