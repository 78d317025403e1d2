//! ConnectionStateMachine - the single source of truth for "may a request
//! be sent now".
//!
//! Backed by a `watch` channel so callers can observe transitions.

use tokio::sync::watch;

use crate::api::types::{ApiError, ConnectionState};

pub struct ConnectionStateMachine {
    state: watch::Sender<ConnectionState>,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self { state }
    }

    pub fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Move to `to` if the transition is legal from the current state.
    pub fn transition(&self, to: ConnectionState) -> Result<ConnectionState, ApiError> {
        let mut outcome = Ok(to);
        self.state.send_if_modified(|current| {
            if is_legal(*current, to) {
                log::debug!("Connection state: {current} -> {to}");
                *current = to;
                true
            } else {
                outcome = Err(ApiError::InvalidTransition { from: *current, to });
                false
            }
        });
        outcome
    }

    /// Set the state unconditionally (teardown paths).
    pub fn force(&self, to: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == to {
                return false;
            }
            log::debug!("Connection state forced: {current} -> {to}");
            *current = to;
            true
        });
    }

    /// Fails with `NotReady` unless the state is `Ready`.
    pub fn ensure_ready(&self) -> Result<(), ApiError> {
        match self.current() {
            ConnectionState::Ready => Ok(()),
            state => Err(ApiError::NotReady { state }),
        }
    }
}

fn is_legal(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;

    matches!(
        (from, to),
        (Disconnected, Initializing)
            | (Initializing, Ready)
            | (Initializing, Closing)
            | (Ready, Closing)
            | (Closing, Disconnected)
            | (Error, Disconnected)
            | (Disconnected | Initializing | Ready | Closing, Error)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_full_lifecycle() {
        let machine = ConnectionStateMachine::new();
        assert_eq!(machine.current(), Disconnected);

        for next in [Initializing, Ready, Closing, Disconnected] {
            assert_eq!(machine.transition(next), Ok(next));
        }
    }

    #[test]
    fn test_illegal_transition_keeps_state() {
        let machine = ConnectionStateMachine::new();
        assert_eq!(
            machine.transition(Ready),
            Err(ApiError::InvalidTransition {
                from: Disconnected,
                to: Ready
            })
        );
        assert_eq!(machine.current(), Disconnected);
    }

    #[test]
    fn test_any_state_may_fail() {
        let machine = ConnectionStateMachine::new();
        machine.transition(Initializing).unwrap();
        machine.transition(Error).unwrap();
        assert!(machine.transition(Ready).is_err());
        machine.transition(Disconnected).unwrap();
    }

    #[test]
    fn test_ensure_ready_reports_current_state() {
        let machine = ConnectionStateMachine::new();
        machine.transition(Initializing).unwrap();
        assert_eq!(
            machine.ensure_ready(),
            Err(ApiError::NotReady {
                state: Initializing
            })
        );
        machine.transition(Ready).unwrap();
        assert_eq!(machine.ensure_ready(), Ok(()));
    }

    #[tokio::test]
    async fn test_watchers_see_transitions() {
        let machine = ConnectionStateMachine::new();
        let mut rx = machine.subscribe();

        machine.transition(Initializing).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), Initializing);

        machine.force(Disconnected);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Disconnected);
    }
}
