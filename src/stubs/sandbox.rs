use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::core::{
    domain::{ExecutionRequest, ExecutionResult},
    errors::SandboxError,
    traits::sandbox::Sandbox,
};

/// Returns the same result for every request after a fixed delay.
#[derive(Debug, Clone)]
pub struct SandboxStub {
    result: Result<ExecutionResult, SandboxError>,
    delay: Duration,
}

impl SandboxStub {
    pub fn new(result: Result<ExecutionResult, SandboxError>, delay: Duration) -> Self {
        Self { result, delay }
    }
}

#[async_trait::async_trait]
impl Sandbox for SandboxStub {
    fn name(&self) -> &'static str {
        "stub"
    }

    #[tracing::instrument(skip(request))]
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
        tracing::debug!(
            "Start execution: language={:?}, stdin={:?}, timeout={}s",
            request.language_id,
            request.input,
            request.timeout_seconds
        );
        tokio::time::sleep(self.delay).await;
        tracing::debug!("Execution result: {:?}", self.result);

        self.result.clone()
    }
}

type Script = HashMap<String, (Duration, Result<ExecutionResult, SandboxError>)>;

/// Answers by request input, each entry with its own delay, and records the
/// order in which executions finished.
#[derive(Debug, Clone)]
pub struct ScriptedSandbox {
    script: Arc<Script>,
    completed: Arc<Mutex<Vec<String>>>,
}

impl ScriptedSandbox {
    pub fn new(entries: Vec<(&str, Duration, Result<ExecutionResult, SandboxError>)>) -> Self {
        Self {
            script: Arc::new(
                entries
                    .into_iter()
                    .map(|(input, delay, result)| (input.to_string(), (delay, result)))
                    .collect(),
            ),
            completed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn completion_log(&self) -> Arc<Mutex<Vec<String>>> {
        self.completed.clone()
    }
}

#[async_trait::async_trait]
impl Sandbox for ScriptedSandbox {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
        let Some((delay, result)) = self.script.get(&request.input) else {
            return Err(SandboxError::Spawn(format!(
                "no scripted result for input {:?}",
                request.input
            )));
        };
        tokio::time::sleep(*delay).await;

        if let Ok(mut completed) = self.completed.lock() {
            completed.push(request.input.clone());
        }
        result.clone()
    }
}
