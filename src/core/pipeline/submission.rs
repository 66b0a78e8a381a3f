use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::core::{
    domain::{
        AiEvaluation, RunSummary, SampleRequest, ScoringResult, SubmissionRecord,
        SubmissionReport, SubmissionRequest, UNKNOWN_COMPLEXITY,
    },
    errors::PipelineError,
    pipeline::{
        complexity::{estimate, estimate_source},
        evaluation::parse_evaluation_response,
        running::TestcaseRunner,
        scoring::ScoringPolicy,
    },
    traits::{evaluator::Evaluator, store::RecordStore, submitter::SubmissionRunner},
};

/// Run, score, estimate and persist. Shared by the request handlers and the
/// proctoring service.
#[derive(Clone, Debug)]
pub struct Pipeline {
    runner: TestcaseRunner,
    scoring: ScoringPolicy,
    store: Arc<dyn RecordStore>,
    evaluator: Option<Arc<dyn Evaluator>>,
}

impl Pipeline {
    pub fn new(runner: TestcaseRunner, scoring: ScoringPolicy, store: Arc<dyn RecordStore>) -> Self {
        Self {
            runner,
            scoring,
            store,
            evaluator: None,
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub async fn run_sample(&self, request: &SampleRequest) -> Result<RunSummary, PipelineError> {
        if request.testcases.is_empty() {
            return Err(PipelineError::Validation(
                "at least one sample test case is required".to_string(),
            ));
        }

        let limits = self
            .runner
            .limits()
            .capped(request.timeout_seconds, request.memory_limit_mb);
        Ok(self
            .runner
            .run_with(
                &request.code,
                None,
                &request.language,
                &request.testcases,
                limits,
            )
            .await)
    }

    #[tracing::instrument(skip(self, request), fields(question_id = %request.question_id, language = %request.language))]
    pub async fn submit(&self, request: &SubmissionRequest) -> Result<SubmissionReport, PipelineError> {
        let question = self.store.load_question(&request.question_id).await?;

        let run = self
            .runner
            .run_with(
                &request.code,
                question.driver_code.as_deref(),
                &request.language,
                &question.testcases,
                self.runner.limits(),
            )
            .await;
        let scoring = self.scoring.score(&run, question.max_points, None);
        let complexity = estimate(&run);

        let record = SubmissionRecord {
            id: Uuid::new_v4(),
            participant_id: request.participant_id.clone(),
            question_id: request.question_id.clone(),
            code: request.code.clone(),
            language: request.language.clone(),
            is_final: request.is_final,
            max_points: question.max_points,
            run,
            scoring,
            complexity,
            ai_evaluation: None,
            submitted_at: Utc::now(),
        };
        self.store.save_submission(&record).await?;

        match &record.run.runtime_error {
            Some(err) => tracing::error!(
                "Submission {} stored without a usable run: {}",
                record.id,
                err
            ),
            None => {
                tracing::info!(
                    "Submission {} scored {} ({}/{} passed)",
                    record.id,
                    record.scoring.final_score,
                    record.run.passed_count,
                    record.run.total_count
                );
                self.spawn_evaluation(&record);
            }
        }

        Ok(SubmissionReport {
            submission_id: record.id,
            run: record.run,
            scoring: record.scoring,
            complexity: record.complexity,
        })
    }

    /// Re-scores a stored submission with a delivered evaluation. Calling it
    /// again with the same evaluation stores the same result.
    pub async fn apply_ai_evaluation(
        &self,
        submission_id: Uuid,
        evaluation: AiEvaluation,
    ) -> Result<ScoringResult, PipelineError> {
        let record = self.store.load_submission(submission_id).await?;
        self.rescore(&record, evaluation).await
    }

    /// Same as `apply_ai_evaluation`, starting from the raw text returned by
    /// the review model.
    pub async fn apply_evaluation_response(
        &self,
        submission_id: Uuid,
        response: &str,
    ) -> Result<ScoringResult, PipelineError> {
        let record = self.store.load_submission(submission_id).await?;
        let evaluation =
            parse_evaluation_response(response, record.run.passed_count, record.run.total_count);
        self.rescore(&record, evaluation).await
    }

    async fn rescore(
        &self,
        record: &SubmissionRecord,
        mut evaluation: AiEvaluation,
    ) -> Result<ScoringResult, PipelineError> {
        if record.run.runtime_error.is_some() {
            return Err(PipelineError::Validation(format!(
                "submission {} has no usable run to evaluate",
                record.id
            )));
        }
        if evaluation.time_complexity == UNKNOWN_COMPLEXITY
            || evaluation.space_complexity == UNKNOWN_COMPLEXITY
        {
            let structural = estimate_source(&record.code);
            if evaluation.time_complexity == UNKNOWN_COMPLEXITY {
                evaluation.time_complexity = structural.time_class.label().to_string();
            }
            if evaluation.space_complexity == UNKNOWN_COMPLEXITY {
                evaluation.space_complexity = structural.space_class.label().to_string();
            }
        }

        let scoring = self
            .scoring
            .score(&record.run, record.max_points, Some(&evaluation));
        self.store
            .update_evaluation(record.id, &evaluation, &scoring)
            .await?;

        tracing::info!(
            "Submission {} re-scored with evaluation: {} -> {}",
            record.id,
            record.scoring.final_score,
            scoring.final_score
        );
        Ok(scoring)
    }

    fn spawn_evaluation(&self, record: &SubmissionRecord) {
        let Some(evaluator) = self.evaluator.clone() else {
            return;
        };
        let pipeline = self.clone();
        let record = record.clone();

        tokio::spawn(async move {
            let evaluation = match evaluator.evaluate(&record).await {
                Ok(evaluation) => evaluation,
                Err(err) => {
                    tracing::warn!(
                        "Evaluation of submission {} failed, keeping rule-based score: {}",
                        record.id,
                        err
                    );
                    return;
                }
            };
            if let Err(err) = pipeline.rescore(&record, evaluation).await {
                tracing::error!("Failed to store evaluation of {}: {}", record.id, err);
            }
        });
    }
}

#[async_trait::async_trait]
impl SubmissionRunner for Pipeline {
    async fn run_submission(
        &self,
        request: &SubmissionRequest,
    ) -> Result<SubmissionReport, PipelineError> {
        self.submit(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        domain::{
            ComplexityEstimate, ExecutionOutcome, ExecutionResult, QuestionRecord, SpaceClass,
            Testcase, TimeClass,
        },
        errors::{EvaluationError, PersistenceError, SandboxError},
        pipeline::running::ExecutionLimits,
        traits::{evaluator::MockEvaluator, sandbox::MockSandbox, store::MockRecordStore},
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn limits() -> ExecutionLimits {
        ExecutionLimits {
            timeout_seconds: 5,
            memory_limit_mb: 128,
        }
    }

    fn echo_sandbox() -> MockSandbox {
        let mut sandbox = MockSandbox::new();
        sandbox.expect_execute().returning(|request| {
            Ok(ExecutionResult {
                stdout: format!("{}\n", request.input),
                stderr: String::new(),
                exit_status: Some(0),
                wall_time_ms: 500,
                peak_memory_mb: 100.0,
                outcome: ExecutionOutcome::Completed,
            })
        });
        sandbox
    }

    fn question() -> QuestionRecord {
        QuestionRecord {
            question_id: "q1".to_string(),
            max_points: 100.0,
            driver_code: Some("print(solve(input()))".to_string()),
            testcases: vec![
                Testcase::new("1", "1"),
                Testcase::new("2", "2"),
                Testcase::new("3", "4"),
                Testcase::new("4", "4"),
                Testcase::new("5", "5"),
            ],
        }
    }

    fn request(code: &str) -> SubmissionRequest {
        SubmissionRequest {
            question_id: "q1".to_string(),
            participant_id: Some("p1".to_string()),
            code: code.to_string(),
            language: "python".to_string(),
            is_final: true,
        }
    }

    fn stored_record(id: Uuid, code: &str) -> SubmissionRecord {
        let run = RunSummary {
            outcomes: Vec::new(),
            passed_count: 8,
            total_count: 10,
            avg_time_ms: 500.0,
            max_memory_mb: 500.0,
            runtime_error: None,
        };
        let scoring = ScoringPolicy::default().score(&run, 100.0, None);
        SubmissionRecord {
            id,
            participant_id: None,
            question_id: "q1".to_string(),
            code: code.to_string(),
            language: "python".to_string(),
            is_final: false,
            max_points: 100.0,
            run,
            scoring,
            complexity: ComplexityEstimate {
                time_class: TimeClass::Linearithmic,
                space_class: SpaceClass::Quadratic,
            },
            ai_evaluation: None,
            submitted_at: Utc::now(),
        }
    }

    fn evaluation(quality: f64, clarity: f64) -> AiEvaluation {
        AiEvaluation {
            quality,
            clarity,
            time_complexity: UNKNOWN_COMPLEXITY.to_string(),
            space_complexity: "O(1)".to_string(),
            suggestions: Vec::new(),
            justification: None,
        }
    }

    #[tokio::test]
    async fn test_sample_requires_testcases() {
        let pipeline = Pipeline::new(
            TestcaseRunner::new(Arc::new(MockSandbox::new()), limits()),
            ScoringPolicy::default(),
            Arc::new(MockRecordStore::new()),
        );

        let result = pipeline
            .run_sample(&SampleRequest {
                code: "print(1)".to_string(),
                language: "python".to_string(),
                testcases: Vec::new(),
                timeout_seconds: None,
                memory_limit_mb: None,
            })
            .await;

        assert!(matches!(result, Err(PipelineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_sample_caps_limits_and_skips_store() {
        let mut sandbox = MockSandbox::new();
        sandbox
            .expect_execute()
            .withf(|request| request.timeout_seconds == 5 && request.memory_limit_mb == 64)
            .times(2)
            .returning(|request| {
                Ok(ExecutionResult {
                    stdout: request.input.clone(),
                    stderr: String::new(),
                    exit_status: Some(0),
                    wall_time_ms: 1,
                    peak_memory_mb: 1.0,
                    outcome: ExecutionOutcome::Completed,
                })
            });
        let pipeline = Pipeline::new(
            TestcaseRunner::new(Arc::new(sandbox), limits()),
            ScoringPolicy::default(),
            Arc::new(MockRecordStore::new()),
        );

        let summary = pipeline
            .run_sample(&SampleRequest {
                code: "print(input())".to_string(),
                language: "python".to_string(),
                testcases: vec![Testcase::new("a", "a"), Testcase::new("b", "c")],
                timeout_seconds: Some(60),
                memory_limit_mb: Some(64),
            })
            .await
            .unwrap();

        assert_eq!(summary.passed_count, 1);
        assert_eq!(summary.total_count, 2);
    }

    #[tokio::test]
    async fn test_submission_is_scored_and_saved() {
        let mut store = MockRecordStore::new();
        store
            .expect_load_question()
            .withf(|id| id == "q1")
            .times(1)
            .returning(|_| Ok(question()));
        store
            .expect_save_submission()
            .withf(|record| {
                record.participant_id.as_deref() == Some("p1")
                    && record.is_final
                    && record.run.passed_count == 4
                    && record.scoring.rule_based_score == 80.0
                    && record.ai_evaluation.is_none()
            })
            .times(1)
            .returning(|_| Ok(()));
        let pipeline = Pipeline::new(
            TestcaseRunner::new(Arc::new(echo_sandbox()), limits()),
            ScoringPolicy::default(),
            Arc::new(store),
        );

        let report = pipeline
            .run_submission(&request("def solve(x):\n    return x"))
            .await
            .unwrap();

        assert_eq!(report.run.total_count, 5);
        assert!(!report.run.outcomes[2].passed);
        assert_eq!(report.scoring.final_score, 80.0);
        assert_eq!(report.scoring.ai_score, None);
        assert_eq!(
            report.complexity,
            ComplexityEstimate {
                time_class: TimeClass::Linearithmic,
                space_class: SpaceClass::Quadratic,
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_question_never_reaches_sandbox() {
        let mut store = MockRecordStore::new();
        store.expect_load_question().returning(|id| {
            Err(PersistenceError::NotFound {
                entity: "question".to_string(),
                id: id.to_string(),
            })
        });
        let pipeline = Pipeline::new(
            TestcaseRunner::new(Arc::new(MockSandbox::new()), limits()),
            ScoringPolicy::default(),
            Arc::new(store),
        );

        let err = pipeline.run_submission(&request("")).await.unwrap_err();

        assert_eq!(err.to_string(), "question q1 not found");
    }

    #[tokio::test]
    async fn test_store_failure_is_surfaced() {
        let mut store = MockRecordStore::new();
        store.expect_load_question().returning(|_| Ok(question()));
        store
            .expect_save_submission()
            .returning(|_| Err(PersistenceError::Unavailable("connection refused".to_string())));
        let pipeline = Pipeline::new(
            TestcaseRunner::new(Arc::new(echo_sandbox()), limits()),
            ScoringPolicy::default(),
            Arc::new(store),
        );

        let err = pipeline.run_submission(&request("")).await.unwrap_err();

        assert_eq!(
            err,
            PipelineError::Persistence(PersistenceError::Unavailable(
                "connection refused".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_aborted_run_is_flagged_and_not_evaluated() {
        let mut sandbox = MockSandbox::new();
        sandbox
            .expect_execute()
            .returning(|_| Err(SandboxError::BackendUnavailable("docker daemon".to_string())));
        let mut store = MockRecordStore::new();
        store.expect_load_question().returning(|_| Ok(question()));
        store
            .expect_save_submission()
            .withf(|record| record.run.runtime_error.is_some() && record.scoring.final_score == 0.0)
            .times(1)
            .returning(|_| Ok(()));
        let evaluations = Arc::new(AtomicUsize::new(0));
        let evaluations_in_mock = evaluations.clone();
        let mut evaluator = MockEvaluator::new();
        evaluator.expect_evaluate().returning(move |_| {
            evaluations_in_mock.fetch_add(1, Ordering::SeqCst);
            Err(EvaluationError::Unavailable("unexpected".to_string()))
        });
        let pipeline = Pipeline::new(
            TestcaseRunner::new(Arc::new(sandbox), limits()),
            ScoringPolicy::default(),
            Arc::new(store),
        )
        .with_evaluator(Arc::new(evaluator));

        let report = pipeline.run_submission(&request("")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            report.run.runtime_error.as_deref(),
            Some("sandbox backend unavailable: docker daemon")
        );
        assert!(report.run.outcomes.is_empty());
        assert_eq!(evaluations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_apply_evaluation_rescores_and_fills_unknown_labels() {
        let id = Uuid::new_v4();
        let mut store = MockRecordStore::new();
        store
            .expect_load_submission()
            .times(2)
            .returning(move |id| Ok(stored_record(id, "for x in range(3):\n    print(x)\n")));
        store
            .expect_update_evaluation()
            .withf(move |stored_id, evaluation, scoring| {
                *stored_id == id
                    && evaluation.time_complexity == "O(n)"
                    && evaluation.space_complexity == "O(1)"
                    && scoring.rule_based_score == 80.0
                    && scoring.ai_score == Some(70.0)
                    && scoring.final_score == 77.0
            })
            .times(2)
            .returning(|_, _, _| Ok(()));
        let pipeline = Pipeline::new(
            TestcaseRunner::new(Arc::new(MockSandbox::new()), limits()),
            ScoringPolicy::default(),
            Arc::new(store),
        );

        let first = pipeline
            .apply_ai_evaluation(id, evaluation(8.0, 6.0))
            .await
            .unwrap();
        let second = pipeline
            .apply_ai_evaluation(id, evaluation(8.0, 6.0))
            .await
            .unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_apply_raw_response_uses_fallback_scores() {
        let id = Uuid::new_v4();
        let mut store = MockRecordStore::new();
        store
            .expect_load_submission()
            .returning(|id| Ok(stored_record(id, "print(1)")));
        store
            .expect_update_evaluation()
            .withf(|_, evaluation, _| evaluation.quality == 5.0 && evaluation.clarity == 5.0)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let pipeline = Pipeline::new(
            TestcaseRunner::new(Arc::new(MockSandbox::new()), limits()),
            ScoringPolicy::default(),
            Arc::new(store),
        );

        let scoring = pipeline
            .apply_evaluation_response(id, "sorry, no JSON today")
            .await
            .unwrap();

        // 0.7 * 80 + 0.3 * 50
        assert_eq!(scoring.final_score, 71.0);
    }

    #[tokio::test]
    async fn test_aborted_submission_is_never_rescored() {
        let mut store = MockRecordStore::new();
        store.expect_load_submission().times(2).returning(|id| {
            let mut record = stored_record(id, "print(1)");
            record.run = RunSummary::aborted("sandbox backend unavailable: docker daemon");
            record.scoring = ScoringPolicy::default().score(&record.run, 100.0, None);
            Ok(record)
        });
        store.expect_update_evaluation().times(0);
        let pipeline = Pipeline::new(
            TestcaseRunner::new(Arc::new(MockSandbox::new()), limits()),
            ScoringPolicy::default(),
            Arc::new(store),
        );
        let id = Uuid::new_v4();

        let raw = pipeline.apply_evaluation_response(id, "").await;
        let delivered = pipeline.apply_ai_evaluation(id, evaluation(9.0, 9.0)).await;

        assert!(matches!(raw, Err(PipelineError::Validation(_))));
        assert!(matches!(delivered, Err(PipelineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_background_evaluation_updates_record() {
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut store = MockRecordStore::new();
        store.expect_load_question().returning(|_| Ok(question()));
        store.expect_save_submission().returning(|_| Ok(()));
        store
            .expect_update_evaluation()
            .times(1)
            .returning(move |_, _, scoring| {
                let _ = done_tx.send(scoring.clone());
                Ok(())
            });
        let mut evaluator = MockEvaluator::new();
        evaluator
            .expect_evaluate()
            .times(1)
            .returning(|_| Ok(evaluation(8.0, 6.0)));
        let pipeline = Pipeline::new(
            TestcaseRunner::new(Arc::new(echo_sandbox()), limits()),
            ScoringPolicy::default(),
            Arc::new(store),
        )
        .with_evaluator(Arc::new(evaluator));

        let report = pipeline.run_submission(&request("")).await.unwrap();
        let rescored = tokio::time::timeout(Duration::from_secs(1), done_rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.scoring.final_score, 80.0);
        assert_eq!(rescored.final_score, 77.0);
    }

    #[tokio::test]
    async fn test_failed_evaluation_keeps_rule_score() {
        let mut store = MockRecordStore::new();
        store.expect_load_question().returning(|_| Ok(question()));
        store.expect_save_submission().returning(|_| Ok(()));
        let mut evaluator = MockEvaluator::new();
        evaluator
            .expect_evaluate()
            .times(1)
            .returning(|_| Err(EvaluationError::Unavailable("timeout".to_string())));
        let pipeline = Pipeline::new(
            TestcaseRunner::new(Arc::new(echo_sandbox()), limits()),
            ScoringPolicy::default(),
            Arc::new(store),
        )
        .with_evaluator(Arc::new(evaluator));

        let report = pipeline.run_submission(&request("")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(report.scoring.final_score, 80.0);
    }
}
