use poglets_common::{Result, TunnelError};
use std::fmt;
use tokio::sync::watch;

/// Lifecycle of one control connection.
///
/// `Closed` is terminal; a reconnect creates a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Active,
    Draining,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::{Active, Authenticating, Closed, Connecting, Draining};
        matches!(
            (self, next),
            (Connecting, Authenticating)
                | (Authenticating, Active)
                | (Active, Draining)
                | (Connecting | Authenticating | Active | Draining, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Active => "active",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state plus a broadcast of every transition.
#[derive(Debug)]
pub(crate) struct StateCell {
    tx: watch::Sender<SessionState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(SessionState::Connecting);
        Self { tx }
    }

    pub(crate) fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    pub(crate) fn advance(&self, next: SessionState) -> Result<()> {
        let current = self.get();
        if !current.can_transition_to(next) {
            return Err(TunnelError::InvalidState(format!(
                "session cannot move from {current} to {next}"
            )));
        }
        self.tx.send_replace(next);
        Ok(())
    }

    pub(crate) fn close(&self) {
        self.tx.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = SessionState::Closed;
                true
            }
        });
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), SessionState::Connecting);
        cell.advance(SessionState::Authenticating).unwrap();
        cell.advance(SessionState::Active).unwrap();
        cell.advance(SessionState::Draining).unwrap();
        cell.advance(SessionState::Closed).unwrap();
        assert!(cell.get().is_terminal());
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let cell = StateCell::new();
        assert!(cell.advance(SessionState::Active).is_err());
        assert!(cell.advance(SessionState::Draining).is_err());

        cell.close();
        assert!(cell.advance(SessionState::Authenticating).is_err());
        assert!(!SessionState::Closed.can_transition_to(SessionState::Closed));
        assert!(!SessionState::Draining.can_transition_to(SessionState::Active));
    }

    #[tokio::test]
    async fn test_subscribers_see_close() {
        let cell = StateCell::new();
        let mut rx = cell.subscribe();
        cell.advance(SessionState::Authenticating).unwrap();
        cell.close();
        let state = *rx.wait_for(|s| s.is_terminal()).await.unwrap();
        assert_eq!(state, SessionState::Closed);
    }
}
