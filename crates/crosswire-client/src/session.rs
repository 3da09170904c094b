//! Session/login state tracker.
//!
//! An application-level handshake phase layered above the transport
//! connection. The engine resets it to `NotLoggedIn` whenever the connection
//! drops; applications drive the login transitions around their own login
//! RPC and may gate higher-level calls on [`SessionTracker::get`].

use crosswire_core::{InvalidSessionTransition, SessionState};
use tokio::sync::watch;

#[derive(Debug)]
pub struct SessionTracker {
    tx: watch::Sender<SessionState>,
}

impl SessionTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SessionState::NotLoggedIn);
        Self { tx }
    }

    pub fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    pub fn is_logged_in(&self) -> bool {
        self.get() == SessionState::LoggedIn
    }

    /// `NotLoggedIn`/`LoginFailed` -> `LoggingIn`.
    pub fn begin_login(&self) -> Result<(), InvalidSessionTransition> {
        self.transition(SessionState::LoggingIn)
    }

    /// `LoggingIn` -> `LoggedIn`. The only edge into `LoggedIn`.
    pub fn complete_login(&self) -> Result<(), InvalidSessionTransition> {
        self.transition(SessionState::LoggedIn)
    }

    /// `LoggingIn` -> `LoginFailed`.
    pub fn fail_login(&self) -> Result<(), InvalidSessionTransition> {
        self.transition(SessionState::LoginFailed)
    }

    /// Back to `NotLoggedIn`; always legal (disconnect path).
    pub fn reset(&self) {
        // The transition table always permits resets.
        let _ = self.transition(SessionState::NotLoggedIn);
    }

    fn transition(&self, next: SessionState) -> Result<(), InvalidSessionTransition> {
        let mut result = Ok(());
        self.tx.send_if_modified(|current| {
            if current.can_transition_to(next) {
                tracing::debug!("session state: {:?} -> {:?}", current, next);
                *current = next;
                true
            } else {
                result = Err(InvalidSessionTransition {
                    from: *current,
                    to: next,
                });
                false
            }
        });
        result
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn login_flow() {
        let session = SessionTracker::new();
        assert_eq!(session.get(), NotLoggedIn);
        session.begin_login().unwrap();
        session.complete_login().unwrap();
        assert!(session.is_logged_in());
    }

    #[test]
    fn logged_in_is_only_reachable_from_logging_in() {
        let session = SessionTracker::new();
        assert!(session.complete_login().is_err());
        session.begin_login().unwrap();
        session.fail_login().unwrap();
        assert!(session.complete_login().is_err());
        // Retry after failure.
        session.begin_login().unwrap();
        session.complete_login().unwrap();
    }

    #[test]
    fn reset_is_always_legal() {
        let session = SessionTracker::new();
        session.begin_login().unwrap();
        session.complete_login().unwrap();
        session.reset();
        assert_eq!(session.get(), NotLoggedIn);
        session.reset();
        assert_eq!(session.get(), NotLoggedIn);
    }
}
