use uuid::Uuid;

use crate::core::{
    domain::{AiEvaluation, ProctoredSession, QuestionRecord, ScoringResult, SubmissionRecord},
    errors::PersistenceError,
};

/// External record store. Callers own retries.
#[mockall::automock]
#[async_trait::async_trait]
pub trait RecordStore: std::fmt::Debug + Send + Sync {
    async fn load_question(&self, question_id: &str) -> Result<QuestionRecord, PersistenceError>;

    async fn save_submission(&self, record: &SubmissionRecord) -> Result<(), PersistenceError>;

    async fn load_submission(&self, id: Uuid) -> Result<SubmissionRecord, PersistenceError>;

    async fn update_evaluation(
        &self,
        id: Uuid,
        evaluation: &AiEvaluation,
        scoring: &ScoringResult,
    ) -> Result<(), PersistenceError>;

    async fn save_session(&self, session: &ProctoredSession) -> Result<(), PersistenceError>;

    async fn load_session(&self, id: Uuid) -> Result<ProctoredSession, PersistenceError>;
}
