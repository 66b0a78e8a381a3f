use futures::stream::FuturesUnordered;
use std::sync::Arc;
use tokio_stream::StreamExt;

use crate::core::{
    domain::{
        ExecutionOutcome, ExecutionRequest, ExecutionResult, RunSummary, Testcase,
        TestcaseOutcome,
    },
    errors::SandboxError,
    traits::sandbox::Sandbox,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub timeout_seconds: u64,
    pub memory_limit_mb: u64,
}

impl ExecutionLimits {
    /// Request-supplied limits never exceed the configured ones.
    pub fn capped(&self, timeout_seconds: Option<u64>, memory_limit_mb: Option<u64>) -> Self {
        Self {
            timeout_seconds: timeout_seconds
                .map_or(self.timeout_seconds, |t| t.clamp(1, self.timeout_seconds)),
            memory_limit_mb: memory_limit_mb
                .map_or(self.memory_limit_mb, |m| m.clamp(1, self.memory_limit_mb)),
        }
    }
}

/// Fans one submission out over its test cases and folds the results back
/// into input order.
#[derive(Clone, Debug)]
pub struct TestcaseRunner {
    sandbox: Arc<dyn Sandbox>,
    limits: ExecutionLimits,
}

impl TestcaseRunner {
    pub fn new(sandbox: Arc<dyn Sandbox>, limits: ExecutionLimits) -> Self {
        Self { sandbox, limits }
    }

    pub fn limits(&self) -> ExecutionLimits {
        self.limits
    }

    pub async fn run(&self, code: &str, language: &str, testcases: &[Testcase]) -> RunSummary {
        self.run_with(code, None, language, testcases, self.limits)
            .await
    }

    #[tracing::instrument(skip(self, code, driver_code, testcases), fields(cases = testcases.len()))]
    pub async fn run_with(
        &self,
        code: &str,
        driver_code: Option<&str>,
        language: &str,
        testcases: &[Testcase],
        limits: ExecutionLimits,
    ) -> RunSummary {
        let source = assemble_source(code, driver_code);
        let mut futures = create_case_futures(&self.sandbox, &source, language, testcases, limits);
        let mut outcomes: Vec<Option<TestcaseOutcome>> = vec![None; testcases.len()];

        while let Some((idx, result)) = futures.next().await {
            match result {
                Ok(result) => {
                    tracing::debug!("Test case {} finished: {:?}", idx, result.outcome);
                    outcomes[idx] = Some((idx, &testcases[idx], result).into());
                }
                Err(err) => {
                    // Dropping the remaining futures cancels in-flight cases.
                    tracing::error!(
                        "Sandbox failure on test case {}, aborting run: {}",
                        idx,
                        err
                    );
                    return RunSummary::aborted(&err.to_string());
                }
            }
        }

        RunSummary::from_outcomes(outcomes.into_iter().flatten().collect())
    }
}

/// Driver code is appended once; every case shares the same source.
fn assemble_source(code: &str, driver_code: Option<&str>) -> Arc<str> {
    match driver_code {
        Some(driver) if !driver.trim().is_empty() => format!("{code}\n{driver}\n").into(),
        _ => code.into(),
    }
}

fn create_case_futures(
    sandbox: &Arc<dyn Sandbox>,
    source: &Arc<str>,
    language: &str,
    testcases: &[Testcase],
    limits: ExecutionLimits,
) -> FuturesUnordered<
    impl std::future::Future<Output = (usize, Result<ExecutionResult, SandboxError>)> + use<>,
> {
    let futures = FuturesUnordered::new();

    for (idx, testcase) in testcases.iter().enumerate() {
        let sandbox = sandbox.clone();
        let request = ExecutionRequest {
            source_code: source.clone(),
            language_id: language.to_string(),
            input: testcase.input.clone(),
            timeout_seconds: limits.timeout_seconds,
            memory_limit_mb: limits.memory_limit_mb,
        };

        futures.push(async move { (idx, sandbox.execute(&request).await) });
    }

    futures
}

/// Only trailing whitespace is ignored. Structured outputs (e.g. JSON with
/// unordered keys) are compared byte for byte.
pub fn outputs_match(actual: &str, expected: &str) -> bool {
    actual.trim_end() == expected.trim_end()
}

impl From<(usize, &Testcase, ExecutionResult)> for TestcaseOutcome {
    fn from((index, testcase, result): (usize, &Testcase, ExecutionResult)) -> Self {
        let actual_output = result.stdout.trim_end().to_string();
        let expected_output = testcase.expected_output.trim_end().to_string();
        let passed = result.outcome == ExecutionOutcome::Completed
            && outputs_match(&actual_output, &expected_output);

        let error = match result.outcome {
            ExecutionOutcome::Completed => None,
            ExecutionOutcome::TimedOut => Some("Time limit exceeded".to_string()),
            ExecutionOutcome::MemoryExceeded => Some("Memory limit exceeded".to_string()),
            ExecutionOutcome::RuntimeError => Some(runtime_error_message(&result)),
        };

        TestcaseOutcome {
            index,
            passed,
            actual_output,
            expected_output,
            execution_time_ms: result.wall_time_ms,
            memory_used_mb: result.peak_memory_mb,
            outcome: result.outcome,
            error,
        }
    }
}

fn runtime_error_message(result: &ExecutionResult) -> String {
    let stderr = result.stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    match result.exit_status {
        Some(status) => format!("Runtime error (exit status {status})"),
        None => "Runtime error".to_string(),
    }
}
