//! Connection and session lifecycle states.
//!
//! The connection state is a single guarded field with a change notification
//! on every transition; the session state is an application-level handshake
//! phase layered above it. Reconnection is an application-level retry — there
//! is deliberately no `Connecting -> Reconnecting` edge.

use tokio::sync::watch;

/// Transport-level phase of one peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
}

impl ConnectionState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Connected, Disconnecting)
                | (Connected, Reconnecting)
                | (Reconnecting, Connecting)
                | (Reconnecting, Connected)
                | (Reconnecting, Disconnected)
                | (Disconnecting, Disconnected)
        )
    }
}

/// Application-level handshake phase, layered above [`ConnectionState`].
///
/// `LoggedIn` is reachable only from `LoggingIn`, and the state resets to
/// `NotLoggedIn` whenever the connection drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotLoggedIn,
    LoggingIn,
    LoggedIn,
    LoginFailed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            // Reset is always allowed (disconnect path).
            (_, NotLoggedIn) => true,
            (NotLoggedIn, LoggingIn) | (LoginFailed, LoggingIn) => true,
            (LoggingIn, LoggedIn) | (LoggingIn, LoginFailed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid connection state transition: {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid session state transition: {from:?} -> {to:?}")]
pub struct InvalidSessionTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// Guarded connection state with watch-based change notifications.
#[derive(Debug)]
pub struct ConnectionTracker {
    tx: watch::Sender<ConnectionState>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Transition to `next`, enforcing the transition table and emitting a
    /// change notification.
    pub fn set(&self, next: ConnectionState) -> Result<(), InvalidTransition> {
        let mut result = Ok(());
        self.tx.send_if_modified(|current| {
            if current.can_transition_to(next) {
                tracing::debug!("connection state: {:?} -> {:?}", current, next);
                *current = next;
                true
            } else {
                result = Err(InvalidTransition {
                    from: *current,
                    to: next,
                });
                false
            }
        });
        result
    }

    /// Transition to `next` if legal from the current state; returns whether
    /// the transition happened. For event-driven paths where a losing race
    /// (e.g. double disconnect) is expected and harmless.
    pub fn set_if_legal(&self, next: ConnectionState) -> bool {
        self.set(next).is_ok()
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn connect_path_is_legal() {
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Disconnected));
        assert!(Connected.can_transition_to(Disconnected));
    }

    #[test]
    fn no_connecting_to_reconnecting_edge() {
        assert!(!Connecting.can_transition_to(Reconnecting));
        assert!(!Disconnected.can_transition_to(Reconnecting));
    }

    #[test]
    fn tracker_enforces_the_table_and_notifies() {
        let tracker = ConnectionTracker::new();
        let mut rx = tracker.subscribe();
        assert_eq!(tracker.get(), Disconnected);

        tracker.set(Connecting).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Connecting);

        assert!(tracker.set(Reconnecting).is_err());
        assert_eq!(tracker.get(), Connecting);

        tracker.set(Connected).unwrap();
        tracker.set(Disconnecting).unwrap();
        tracker.set(Disconnected).unwrap();
        assert_eq!(*rx.borrow_and_update(), Disconnected);
    }

    #[test]
    fn session_logged_in_only_from_logging_in() {
        use SessionState::*;
        assert!(LoggingIn.can_transition_to(LoggedIn));
        assert!(!NotLoggedIn.can_transition_to(LoggedIn));
        assert!(!LoginFailed.can_transition_to(LoggedIn));
        // Reset on disconnect is always legal.
        assert!(LoggedIn.can_transition_to(NotLoggedIn));
        assert!(LoggingIn.can_transition_to(NotLoggedIn));
    }
}
