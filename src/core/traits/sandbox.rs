use crate::core::{
    domain::{ExecutionRequest, ExecutionResult},
    errors::SandboxError,
};

/// One bounded execution of untrusted code. Implementations make exactly one
/// attempt per request and never retry.
#[mockall::automock]
#[async_trait::async_trait]
pub trait Sandbox: std::fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, SandboxError>;
}
