//! Session state machine
//!
//! ```text
//!  Uninitialized ──initialize──▶ Initializing ──authenticated──▶ Ready
//!        ▲                           │  ▲                         │  ▲
//!        └────── initialize failed ──┘  └─ authenticate + retry    │  │
//!                                                   sendUserMessage │  │ response
//!                                                                  ▼  │
//!                                      Cancelling ◀──cancel────── Busy
//!                                           └─────── response ───────▶ Ready
//!
//!  any state ──transport closed / process exit / stop──▶ Terminated
//! ```
//!
//! Checks and updates happen under one lock, so two callers can never both
//! move `Ready -> Busy`. The current state is also published on a watch
//! channel for observers.

use crate::error::{AcpError, Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Busy,
    Cancelling,
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Cancelling => "cancelling",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// A state change that was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
}

impl Transition {
    pub fn is_change(&self) -> bool {
        self.from != self.to
    }
}

pub struct SessionStateMachine {
    state: Mutex<SessionState>,
    tx: watch::Sender<SessionState>,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SessionState::Uninitialized);
        Self {
            state: Mutex::new(SessionState::Uninitialized),
            tx,
        }
    }

    pub fn current(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_terminated(&self) -> bool {
        self.current() == SessionState::Terminated
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Apply `next` to the current state, or fail with `InvalidState` naming
    /// `operation` when it returns `None`.
    fn apply(
        &self,
        operation: &'static str,
        next: impl FnOnce(SessionState) -> Option<SessionState>,
    ) -> Result<Transition> {
        let mut state = self.state.lock();
        let from = *state;
        let Some(to) = next(from) else {
            return Err(Error::Acp(AcpError::InvalidState {
                operation,
                state: from,
            }));
        };

        if from != to {
            debug!("Session state {} -> {}", from, to);
            *state = to;
            self.tx.send_replace(to);
        }
        Ok(Transition { from, to })
    }

    /// `initialize` is about to be sent. Allowed again while Initializing so
    /// the coordinator can retry after `authenticate`.
    pub fn begin_initialize(&self) -> Result<Transition> {
        self.apply("initialize", |s| match s {
            SessionState::Uninitialized | SessionState::Initializing => {
                Some(SessionState::Initializing)
            }
            _ => None,
        })
    }

    /// `initialize` answered. Unauthenticated agents keep the session in
    /// Initializing until the coordinator authenticates and retries.
    pub fn finish_initialize(&self, authenticated: bool) -> Result<Transition> {
        self.apply("complete initialization", |s| match s {
            SessionState::Initializing if authenticated => Some(SessionState::Ready),
            SessionState::Initializing => Some(SessionState::Initializing),
            _ => None,
        })
    }

    /// `initialize` failed on the wire; go back so it can be attempted again.
    pub fn initialize_failed(&self) -> Option<Transition> {
        self.apply("abort initialization", |s| match s {
            SessionState::Initializing => Some(SessionState::Uninitialized),
            _ => None,
        })
        .ok()
    }

    pub fn check_authenticate(&self) -> Result<()> {
        self.apply("authenticate", |s| match s {
            SessionState::Initializing => Some(s),
            _ => None,
        })
        .map(|_| ())
    }

    pub fn begin_prompt(&self) -> Result<Transition> {
        self.apply("send a user message", |s| match s {
            SessionState::Ready => Some(SessionState::Busy),
            _ => None,
        })
    }

    /// The prompt's response arrived (or the caller stopped waiting).
    pub fn finish_prompt(&self) -> Option<Transition> {
        self.apply("finish a user message", |s| match s {
            SessionState::Busy | SessionState::Cancelling => Some(SessionState::Ready),
            _ => None,
        })
        .ok()
    }

    /// Cancelling is local only; the agent is free to ignore the request.
    pub fn begin_cancel(&self) -> Result<Transition> {
        self.apply("cancel a user message", |s| match s {
            SessionState::Busy | SessionState::Cancelling => Some(SessionState::Cancelling),
            _ => None,
        })
    }

    /// Terminal and sticky. Returns `None` if already terminated.
    pub fn terminate(&self) -> Option<Transition> {
        self.apply("terminate", |s| match s {
            SessionState::Terminated => None,
            _ => Some(SessionState::Terminated),
        })
        .ok()
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn invalid_state(result: Result<Transition>) -> SessionState {
        match result {
            Err(Error::Acp(AcpError::InvalidState { state, .. })) => state,
            other => panic!("Expected InvalidState, got {other:?}"),
        }
    }

    #[test]
    fn test_happy_path() {
        let session = SessionStateMachine::new();
        assert_eq!(session.current(), SessionState::Uninitialized);

        session.begin_initialize().unwrap();
        let t = session.finish_initialize(true).unwrap();
        assert_eq!(
            t,
            Transition {
                from: SessionState::Initializing,
                to: SessionState::Ready
            }
        );

        session.begin_prompt().unwrap();
        assert_eq!(session.current(), SessionState::Busy);
        session.begin_cancel().unwrap();
        assert_eq!(session.current(), SessionState::Cancelling);
        session.finish_prompt().unwrap();
        assert_eq!(session.current(), SessionState::Ready);
    }

    #[test]
    fn test_unauthenticated_stays_initializing() {
        let session = SessionStateMachine::new();
        session.begin_initialize().unwrap();

        let t = session.finish_initialize(false).unwrap();
        assert!(!t.is_change());
        session.check_authenticate().unwrap();
        session.begin_initialize().unwrap();
        session.finish_initialize(true).unwrap();
        assert_eq!(session.current(), SessionState::Ready);

        assert!(matches!(
            session.check_authenticate(),
            Err(Error::Acp(AcpError::InvalidState {
                state: SessionState::Ready,
                ..
            }))
        ));
    }

    #[test]
    fn test_prompt_before_initialize_is_invalid() {
        let session = SessionStateMachine::new();
        assert_eq!(
            invalid_state(session.begin_prompt()),
            SessionState::Uninitialized
        );
        assert_eq!(
            invalid_state(session.begin_cancel()),
            SessionState::Uninitialized
        );
        assert_eq!(session.current(), SessionState::Uninitialized);
    }

    #[test]
    fn test_only_one_prompt_at_a_time() {
        let session = SessionStateMachine::new();
        session.begin_initialize().unwrap();
        session.finish_initialize(true).unwrap();

        session.begin_prompt().unwrap();
        assert_eq!(invalid_state(session.begin_prompt()), SessionState::Busy);
    }

    #[test]
    fn test_initialize_failure_reverts() {
        let session = SessionStateMachine::new();
        session.begin_initialize().unwrap();
        session.initialize_failed().unwrap();
        assert_eq!(session.current(), SessionState::Uninitialized);
        assert!(session.initialize_failed().is_none());
    }

    #[test]
    fn test_terminated_is_sticky() {
        let session = SessionStateMachine::new();
        session.begin_initialize().unwrap();
        assert!(session.terminate().is_some());
        assert!(session.terminate().is_none());

        assert_eq!(
            invalid_state(session.begin_initialize()),
            SessionState::Terminated
        );
        assert!(session.finish_prompt().is_none());
        assert!(session.is_terminated());
    }

    #[tokio::test]
    async fn test_watchers_see_transitions() {
        let session = SessionStateMachine::new();
        let mut rx = session.subscribe();

        session.begin_initialize().unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), SessionState::Initializing);

        session.terminate();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), SessionState::Terminated);
    }

    #[test]
    fn test_display_is_lowercase() {
        assert_eq!(SessionState::Cancelling.to_string(), "cancelling");
        assert_eq!(SessionState::Uninitialized.to_string(), "uninitialized");
    }
}
