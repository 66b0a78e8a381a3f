use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::core::{
    domain::{
        FinalSubmission, ProctoredSession, SessionStatus, SubmissionRequest, ViolationKind,
    },
    errors::PersistenceError,
    session::machine::{SessionEvent, Step, transition},
    traits::{store::RecordStore, submitter::SubmissionRunner},
};

pub const ABANDONED_MSG: &str = "Forced submission abandoned: the service is shutting down";

/// Drives sessions through the transition function and performs the forced
/// submission when an attempt ends. Callers hand in the session exclusively
/// (`&mut`), so a second signal is only seen after the first one has been
/// fully applied.
#[derive(Clone, Debug)]
pub struct ProctoringService {
    runner: Arc<dyn SubmissionRunner>,
    store: Arc<dyn RecordStore>,
    duration_seconds: u64,
    shutdown: watch::Receiver<bool>,
}

impl ProctoringService {
    pub fn new(
        runner: Arc<dyn SubmissionRunner>,
        store: Arc<dyn RecordStore>,
        duration_seconds: u64,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            runner,
            store,
            duration_seconds,
            shutdown,
        }
    }

    pub async fn join(
        &self,
        participant_id: &str,
        test_id: &str,
        question_id: &str,
        language: &str,
    ) -> ProctoredSession {
        let session = ProctoredSession::new(
            participant_id,
            test_id,
            question_id,
            language,
            self.duration_seconds,
        );
        tracing::info!(
            "Participant {} joined test {} as session {}",
            participant_id,
            test_id,
            session.id
        );
        self.persist(&session).await;
        session
    }

    /// The buffer is frozen once the session is over.
    pub fn update_code(&self, session: &mut ProctoredSession, code: &str) -> SessionStatus {
        if !session.status.is_terminal() {
            session.code_buffer = code.to_string();
        }
        session.status
    }

    pub async fn acknowledge_start(&self, session: &mut ProctoredSession) -> SessionStatus {
        self.apply(session, SessionEvent::Acknowledge).await
    }

    pub async fn report_violation(
        &self,
        session: &mut ProctoredSession,
        kind: ViolationKind,
    ) -> SessionStatus {
        self.apply(session, SessionEvent::Violation(kind)).await
    }

    pub async fn tick(&self, session: &mut ProctoredSession) -> SessionStatus {
        self.apply(session, SessionEvent::Tick).await
    }

    #[tracing::instrument(skip(self, session), fields(session_id = %session.id))]
    async fn apply(&self, session: &mut ProctoredSession, event: SessionEvent) -> SessionStatus {
        match transition(session, &event, Utc::now()) {
            Step::Unchanged => {
                tracing::debug!("Event {:?} ignored in status {:?}", event, session.status);
            }
            Step::Updated(updated) => {
                if updated.status != session.status {
                    tracing::info!("Session {:?} -> {:?}", session.status, updated.status);
                }
                *session = updated;
                self.persist(session).await;
            }
            Step::Finalize {
                session: finishing,
                next,
            } => {
                tracing::warn!("Session ends as {:?} after {:?}", next, event);
                *session = self.finalize(finishing, next).await;
                self.persist(session).await;
            }
        }
        session.status
    }

    async fn finalize(&self, mut session: ProctoredSession, next: SessionStatus) -> ProctoredSession {
        let request = SubmissionRequest {
            question_id: session.question_id.clone(),
            participant_id: Some(session.participant_id.clone()),
            code: session.code_buffer.clone(),
            language: session.language.clone(),
            is_final: true,
        };

        let mut shutdown = self.shutdown.clone();
        let result = tokio::select! {
            result = self.runner.run_submission(&request) => Some(result),
            _ = shutdown_requested(&mut shutdown) => None,
        };

        let final_submission = match result {
            Some(Ok(report)) => match report.run.runtime_error {
                Some(err) => FinalSubmission::Failed { message: err },
                None => FinalSubmission::Scored {
                    submission_id: report.submission_id,
                    scoring: report.scoring,
                },
            },
            Some(Err(err)) => {
                tracing::error!("Forced submission failed: {}", err);
                FinalSubmission::Failed {
                    message: err.to_string(),
                }
            }
            None => {
                tracing::warn!("{}", ABANDONED_MSG);
                FinalSubmission::Failed {
                    message: ABANDONED_MSG.to_string(),
                }
            }
        };

        session.final_submission = Some(final_submission);
        session.finished_at = Some(Utc::now());
        session.change_status(next)
    }

    /// The last mirrored copy of a session.
    pub async fn load(&self, id: Uuid) -> Result<ProctoredSession, PersistenceError> {
        self.store.load_session(id).await
    }

    async fn persist(&self, session: &ProctoredSession) {
        if let Err(err) = self.store.save_session(session).await {
            tracing::error!("Failed to mirror session {}: {}", session.id, err);
        }
    }
}

/// Resolves once shutdown is signalled. A dropped sender never resolves.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
