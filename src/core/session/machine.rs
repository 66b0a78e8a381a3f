use chrono::{DateTime, Utc};

use crate::core::domain::{ProctoredSession, SessionStatus, ViolationKind};

#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    Acknowledge,
    Violation(ViolationKind),
    /// One second of the attempt has elapsed.
    Tick,
}

/// What applying an event asks the caller to do.
#[derive(Clone, Debug, PartialEq)]
pub enum Step {
    Unchanged,
    Updated(ProctoredSession),
    /// The attempt is over. The caller runs the forced submission on the
    /// returned session's code buffer, records its result and then commits
    /// the session in status `next`.
    Finalize {
        session: ProctoredSession,
        next: SessionStatus,
    },
}

/// Pure transition function. Terminal sessions never change, and a session
/// that has not been acknowledged ignores everything except the
/// acknowledgement.
pub fn transition(session: &ProctoredSession, event: &SessionEvent, now: DateTime<Utc>) -> Step {
    match (session.status, event) {
        (status, _) if status.is_terminal() => Step::Unchanged,

        (SessionStatus::Registered, SessionEvent::Acknowledge) => {
            let mut started = session.change_status(SessionStatus::Started);
            started.started_at = Some(now);
            Step::Updated(started)
        }
        (SessionStatus::Registered, _) => Step::Unchanged,

        (SessionStatus::Started, SessionEvent::Acknowledge) => Step::Unchanged,
        (SessionStatus::Started, SessionEvent::Violation(kind)) => {
            let mut violated = session.clone();
            violated.violation_count += 1;
            violated.last_violation = Some(kind.clone());
            Step::Finalize {
                session: violated,
                next: SessionStatus::Terminated,
            }
        }
        (SessionStatus::Started, SessionEvent::Tick) => {
            let mut ticked = session.clone();
            ticked.time_remaining_seconds = ticked.time_remaining_seconds.saturating_sub(1);
            if ticked.time_remaining_seconds == 0 {
                Step::Finalize {
                    session: ticked,
                    next: SessionStatus::Submitted,
                }
            } else {
                Step::Updated(ticked)
            }
        }

        (SessionStatus::Submitted | SessionStatus::Terminated, _) => Step::Unchanged,
    }
}
