use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{
    Mutex,
    mpsc::{Receiver, Sender},
    watch,
};
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use crate::constants::RES_TX_ERR;
use crate::core::{
    domain::ProctoredSession, errors::PersistenceError, pipeline::submission::Pipeline,
    session::service::ProctoringService,
};
use crate::server::{
    models::{Inbound, Outbound},
    protocol::{Request, RequestError, Response, parse_line},
};

type Sessions = Arc<DashMap<Uuid, Arc<Mutex<ProctoredSession>>>>;

/// Everything a request handler needs. Each session sits behind its own
/// lock so signals for one session are applied one at a time.
#[derive(Clone, Debug)]
pub struct AppState {
    pipeline: Pipeline,
    proctoring: ProctoringService,
    sessions: Sessions,
}

impl AppState {
    pub fn new(pipeline: Pipeline, proctoring: ProctoringService) -> Self {
        Self {
            pipeline,
            proctoring,
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub async fn handle_line(&self, line: &str) -> Response {
        match parse_line(line) {
            Ok(envelope) => Response::new(envelope.id, self.dispatch(envelope.request).await),
            Err(err) => {
                tracing::debug!("Rejected request: {}", err);
                Response::new(None, Err(err))
            }
        }
    }

    #[tracing::instrument(skip_all)]
    pub async fn dispatch(&self, request: Request) -> Result<Value, RequestError> {
        match request {
            Request::RunSample(sample) => {
                let summary = self.pipeline.run_sample(&sample).await?;
                if let Some(err) = summary.runtime_error {
                    return Err(RequestError::Aborted(err));
                }
                encode(&summary)
            }
            Request::RunSubmission(submission) => {
                let report = self.pipeline.submit(&submission).await?;
                if let Some(err) = report.run.runtime_error {
                    return Err(RequestError::Aborted(err));
                }
                encode(&report)
            }
            Request::JoinSession {
                participant_id,
                test_id,
                question_id,
                language,
            } => {
                let session = self
                    .proctoring
                    .join(&participant_id, &test_id, &question_id, &language)
                    .await;
                let value = encode(&session)?;
                self.sessions
                    .insert(session.id, Arc::new(Mutex::new(session)));
                Ok(value)
            }
            Request::UpdateCode { session_id, code } => {
                let session = self.session(session_id)?;
                let mut session = session.lock().await;
                self.proctoring.update_code(&mut session, &code);
                encode(&*session)
            }
            Request::AcknowledgeStart { session_id } => {
                let session = self.session(session_id)?;
                let mut session = session.lock().await;
                self.proctoring.acknowledge_start(&mut session).await;
                self.settle(&session).await;
                encode(&*session)
            }
            Request::ReportViolation {
                session_id,
                violation,
            } => {
                let session = self.session(session_id)?;
                let mut session = session.lock().await;
                self.proctoring
                    .report_violation(&mut session, violation)
                    .await;
                self.settle(&session).await;
                encode(&*session)
            }
            Request::Tick { session_id } => {
                let session = self.session(session_id)?;
                let mut session = session.lock().await;
                self.proctoring.tick(&mut session).await;
                self.settle(&session).await;
                encode(&*session)
            }
            Request::SessionStatus { session_id } => match self.session(session_id) {
                Ok(session) => encode(&*session.lock().await),
                Err(_) => encode(&self.stored_session(session_id).await?),
            },
            Request::ApplyEvaluation {
                submission_id,
                response,
            } => {
                let scoring = self
                    .pipeline
                    .apply_evaluation_response(submission_id, &response)
                    .await?;
                encode(&scoring)
            }
        }
    }

    fn session(&self, id: Uuid) -> Result<Arc<Mutex<ProctoredSession>>, RequestError> {
        self.sessions
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(RequestError::UnknownSession(id))
    }

    /// Finished sessions are only served from the store.
    async fn settle(&self, session: &ProctoredSession) {
        if !session.status.is_terminal() {
            return;
        }
        match self.proctoring.load(session.id).await {
            Ok(stored) if stored.status == session.status => {
                self.sessions.remove(&session.id);
            }
            Ok(_) => tracing::warn!("Session {} not stored in its final state yet", session.id),
            Err(err) => tracing::warn!("Keeping session {} in memory: {}", session.id, err),
        }
    }

    async fn stored_session(&self, id: Uuid) -> Result<ProctoredSession, RequestError> {
        self.proctoring.load(id).await.map_err(|err| match err {
            PersistenceError::NotFound { .. } => RequestError::UnknownSession(id),
            err => RequestError::Pipeline(err.into()),
        })
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Value, RequestError> {
    serde_json::to_value(value).map_err(|e| RequestError::Encode(e.to_string()))
}

/// Handles every request in its own task, so a long submission does not hold
/// up other requests on the same connection. Once shutdown is signalled no
/// new lines are taken and the returned handle resolves when every request
/// already in progress has been answered.
pub fn handle_messages(
    state: AppState,
    res_tx: Sender<Outbound>,
    mut msg_handle_rx: Receiver<Inbound>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                msg = msg_handle_rx.recv() => {
                    let Some(msg) = msg else {
                        break;
                    };
                    let state = state.clone();
                    let res_tx = res_tx.clone();
                    in_flight.spawn(async move {
                        let response = state.handle_line(&msg.line).await;
                        if res_tx
                            .send(Outbound::new(msg.connection_id, response.to_line()))
                            .await
                            .is_err()
                        {
                            tracing::error!("{}", RES_TX_ERR);
                        }
                    });
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(err) = joined {
                        tracing::error!("Request handler failed: {}", err);
                    }
                }
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }

        tracing::info!("Waiting for {} requests in progress", in_flight.len());
        while let Some(joined) = in_flight.join_next().await {
            if let Err(err) = joined {
                tracing::error!("Request handler failed: {}", err);
            }
        }
    })
}
