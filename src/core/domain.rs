use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct ExecutionRequest {
    /// Candidate code with any driver already appended. Shared between all
    /// test cases of one run.
    pub source_code: Arc<str>,
    pub language_id: String,
    pub input: String,
    pub timeout_seconds: u64,
    pub memory_limit_mb: u64,
}

impl ExecutionRequest {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb * 1024 * 1024
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed,
    TimedOut,
    MemoryExceeded,
    RuntimeError,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, or `128 + signal` when the process was killed by a signal.
    /// `None` when the sandbox killed the process itself.
    pub exit_status: Option<i32>,
    pub wall_time_ms: u64,
    pub peak_memory_mb: f64,
    pub outcome: ExecutionOutcome,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Testcase {
    pub input: String,
    pub expected_output: String,
}

impl Testcase {
    pub fn new(input: &str, expected_output: &str) -> Self {
        Self {
            input: input.to_string(),
            expected_output: expected_output.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestcaseOutcome {
    pub index: usize,
    pub passed: bool,
    pub actual_output: String,
    pub expected_output: String,
    pub execution_time_ms: u64,
    pub memory_used_mb: f64,
    pub outcome: ExecutionOutcome,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub outcomes: Vec<TestcaseOutcome>,
    pub passed_count: usize,
    pub total_count: usize,
    pub avg_time_ms: f64,
    pub max_memory_mb: f64,
    /// Set only when the sandbox itself failed and the run was aborted.
    pub runtime_error: Option<String>,
}

impl RunSummary {
    /// Builds a summary from outcomes already ordered by test case index.
    pub fn from_outcomes(outcomes: Vec<TestcaseOutcome>) -> Self {
        let total_count = outcomes.len();
        let passed_count = outcomes.iter().filter(|o| o.passed).count();
        let avg_time_ms = if total_count == 0 {
            0.0
        } else {
            outcomes
                .iter()
                .map(|o| o.execution_time_ms as f64)
                .sum::<f64>()
                / total_count as f64
        };
        let max_memory_mb = outcomes
            .iter()
            .map(|o| o.memory_used_mb)
            .fold(0.0, f64::max);

        Self {
            outcomes,
            passed_count,
            total_count,
            avg_time_ms,
            max_memory_mb,
            runtime_error: None,
        }
    }

    pub fn aborted(msg: &str) -> Self {
        Self {
            runtime_error: Some(msg.to_string()),
            ..Self::default()
        }
    }

    pub fn failed_count(&self) -> usize {
        self.total_count - self.passed_count
    }

    pub fn pass_rate(&self) -> f64 {
        if self.total_count == 0 {
            0.0
        } else {
            self.passed_count as f64 / self.total_count as f64
        }
    }
}

/// Qualitative evaluation delivered by the external review service. Only
/// `quality` and `clarity` take part in scoring.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AiEvaluation {
    pub quality: f64,
    pub clarity: f64,
    #[serde(default = "unknown_label")]
    pub time_complexity: String,
    #[serde(default = "unknown_label")]
    pub space_complexity: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub justification: Option<String>,
}

pub const UNKNOWN_COMPLEXITY: &str = "Unknown";

fn unknown_label() -> String {
    UNKNOWN_COMPLEXITY.to_string()
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub base: f64,
    pub time_bonus: f64,
    pub memory_bonus: f64,
    pub penalty: f64,
    pub pass_rate_percent: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoringResult {
    pub rule_based_score: f64,
    pub ai_score: Option<f64>,
    pub final_score: f64,
    pub breakdown: ScoreBreakdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TimeClass {
    #[serde(rename = "O(1)")]
    Constant,
    #[serde(rename = "O(log n)")]
    Logarithmic,
    #[serde(rename = "O(n)")]
    Linear,
    #[serde(rename = "O(n log n)")]
    Linearithmic,
    #[serde(rename = "O(n²)")]
    Quadratic,
    #[serde(rename = "O(2ⁿ)")]
    Exponential,
}

impl TimeClass {
    pub fn label(&self) -> &'static str {
        match self {
            TimeClass::Constant => "O(1)",
            TimeClass::Logarithmic => "O(log n)",
            TimeClass::Linear => "O(n)",
            TimeClass::Linearithmic => "O(n log n)",
            TimeClass::Quadratic => "O(n²)",
            TimeClass::Exponential => "O(2ⁿ)",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SpaceClass {
    #[serde(rename = "O(1)")]
    Constant,
    #[serde(rename = "O(n)")]
    Linear,
    #[serde(rename = "O(n²)")]
    Quadratic,
    #[serde(rename = "O(n³)")]
    Cubic,
}

impl SpaceClass {
    pub fn label(&self) -> &'static str {
        match self {
            SpaceClass::Constant => "O(1)",
            SpaceClass::Linear => "O(n)",
            SpaceClass::Quadratic => "O(n²)",
            SpaceClass::Cubic => "O(n³)",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexityEstimate {
    pub time_class: TimeClass,
    pub space_class: SpaceClass,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuestionRecord {
    pub question_id: String,
    pub max_points: f64,
    #[serde(default)]
    pub driver_code: Option<String>,
    pub testcases: Vec<Testcase>,
}

/// "Try before submit": runs caller-supplied samples without persisting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SampleRequest {
    pub code: String,
    pub language: String,
    pub testcases: Vec<Testcase>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRequest {
    pub question_id: String,
    #[serde(default)]
    pub participant_id: Option<String>,
    pub code: String,
    pub language: String,
    #[serde(default)]
    pub is_final: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub id: Uuid,
    pub participant_id: Option<String>,
    pub question_id: String,
    pub code: String,
    pub language: String,
    pub is_final: bool,
    pub max_points: f64,
    pub run: RunSummary,
    pub scoring: ScoringResult,
    pub complexity: ComplexityEstimate,
    pub ai_evaluation: Option<AiEvaluation>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubmissionReport {
    pub submission_id: Uuid,
    pub run: RunSummary,
    pub scoring: ScoringResult,
    pub complexity: ComplexityEstimate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Registered,
    Started,
    Submitted,
    Terminated,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Submitted | SessionStatus::Terminated)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    TabHidden,
    WindowBlur,
    PasteAttempt,
    CopyAttempt,
    RightClick,
    Other(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FinalSubmission {
    Scored {
        submission_id: Uuid,
        scoring: ScoringResult,
    },
    Failed {
        message: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProctoredSession {
    pub id: Uuid,
    pub participant_id: String,
    pub test_id: String,
    pub question_id: String,
    pub language: String,
    pub code_buffer: String,
    pub status: SessionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub time_remaining_seconds: u64,
    pub violation_count: u32,
    pub last_violation: Option<ViolationKind>,
    pub final_submission: Option<FinalSubmission>,
}

impl ProctoredSession {
    pub fn new(
        participant_id: &str,
        test_id: &str,
        question_id: &str,
        language: &str,
        duration_seconds: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            participant_id: participant_id.to_string(),
            test_id: test_id.to_string(),
            question_id: question_id.to_string(),
            language: language.to_string(),
            code_buffer: String::new(),
            status: SessionStatus::Registered,
            started_at: None,
            finished_at: None,
            time_remaining_seconds: duration_seconds,
            violation_count: 0,
            last_violation: None,
            final_submission: None,
        }
    }

    pub fn change_status(&self, new_status: SessionStatus) -> Self {
        Self {
            status: new_status,
            ..self.clone()
        }
    }
}
