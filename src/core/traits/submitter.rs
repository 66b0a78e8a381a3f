use crate::core::{
    domain::{SubmissionReport, SubmissionRequest},
    errors::PipelineError,
};

/// Entry point the proctoring layer uses for forced submissions.
#[mockall::automock]
#[async_trait::async_trait]
pub trait SubmissionRunner: std::fmt::Debug + Send + Sync {
    async fn run_submission(
        &self,
        request: &SubmissionRequest,
    ) -> Result<SubmissionReport, PipelineError>;
}
