use crate::core::{
    domain::{AiEvaluation, SubmissionRecord},
    errors::EvaluationError,
};

#[mockall::automock]
#[async_trait::async_trait]
pub trait Evaluator: std::fmt::Debug + Send + Sync {
    async fn evaluate(&self, submission: &SubmissionRecord)
    -> Result<AiEvaluation, EvaluationError>;
}
