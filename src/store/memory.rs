use dashmap::DashMap;
use uuid::Uuid;

use crate::core::{
    domain::{AiEvaluation, ProctoredSession, QuestionRecord, ScoringResult, SubmissionRecord},
    errors::PersistenceError,
    traits::store::RecordStore,
};

/// Process-local record store for standalone mode.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    questions: DashMap<String, QuestionRecord>,
    submissions: DashMap<Uuid, SubmissionRecord>,
    sessions: DashMap<Uuid, ProctoredSession>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_questions<I>(questions: I) -> Self
    where
        I: IntoIterator<Item = QuestionRecord>,
    {
        let store = Self::new();
        for question in questions {
            store.insert_question(question);
        }
        store
    }

    pub fn insert_question(&self, question: QuestionRecord) {
        self.questions.insert(question.question_id.clone(), question);
    }

    pub fn session(&self, id: Uuid) -> Option<ProctoredSession> {
        self.sessions.get(&id).map(|s| s.clone())
    }
}

fn not_found(entity: &str, id: impl ToString) -> PersistenceError {
    PersistenceError::NotFound {
        entity: entity.to_string(),
        id: id.to_string(),
    }
}

#[async_trait::async_trait]
impl RecordStore for InMemoryStore {
    async fn load_question(&self, question_id: &str) -> Result<QuestionRecord, PersistenceError> {
        self.questions
            .get(question_id)
            .map(|q| q.clone())
            .ok_or_else(|| not_found("question", question_id))
    }

    async fn save_submission(&self, record: &SubmissionRecord) -> Result<(), PersistenceError> {
        if self.submissions.contains_key(&record.id) {
            return Err(PersistenceError::Conflict(format!(
                "submission {} already exists",
                record.id
            )));
        }
        self.submissions.insert(record.id, record.clone());
        Ok(())
    }

    async fn load_submission(&self, id: Uuid) -> Result<SubmissionRecord, PersistenceError> {
        self.submissions
            .get(&id)
            .map(|s| s.clone())
            .ok_or_else(|| not_found("submission", id))
    }

    async fn update_evaluation(
        &self,
        id: Uuid,
        evaluation: &AiEvaluation,
        scoring: &ScoringResult,
    ) -> Result<(), PersistenceError> {
        let mut record = self
            .submissions
            .get_mut(&id)
            .ok_or_else(|| not_found("submission", id))?;
        record.ai_evaluation = Some(evaluation.clone());
        record.scoring = scoring.clone();
        Ok(())
    }

    async fn save_session(&self, session: &ProctoredSession) -> Result<(), PersistenceError> {
        self.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn load_session(&self, id: Uuid) -> Result<ProctoredSession, PersistenceError> {
        self.session(id).ok_or_else(|| not_found("session", id))
    }
}
