//! Control-plane link state machine:
//!
//! ```text
//! Disconnected ──Start──> Connecting ──DialOk──> Connected
//!      ▲                     │ DialFail             │
//!      │                     ▼                      ▼
//!      └── Stop ──── Reconnecting ◄── HeartbeatTimeout / ReadError
//! ```

use serde::{Deserialize, Serialize};

use gwcp_core::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionEvent {
    Start,
    DialOk,
    DialFail,
    HeartbeatTimeout,
    ReadError,
    Stop,
}

pub struct LinkStateMachine {
    current_state: LinkState,
}

impl LinkStateMachine {
    pub fn new() -> Self {
        Self {
            current_state: LinkState::Disconnected,
        }
    }

    pub fn state(&self) -> LinkState {
        self.current_state
    }

    /// Attempts a transition. `Stop` is valid from any state and is
    /// idempotent (`Disconnected` + `Stop` stays `Disconnected`) so the
    /// caller never needs to guard against calling it twice.
    pub fn transition(&mut self, event: TransitionEvent) -> Result<LinkState> {
        let new_state = match (self.current_state, event) {
            (_, TransitionEvent::Stop) => LinkState::Disconnected,

            (LinkState::Disconnected, TransitionEvent::Start) => LinkState::Connecting,

            (LinkState::Connecting, TransitionEvent::DialOk) => LinkState::Connected,
            (LinkState::Connecting, TransitionEvent::DialFail) => LinkState::Reconnecting,

            (LinkState::Connected, TransitionEvent::HeartbeatTimeout) => LinkState::Reconnecting,
            (LinkState::Connected, TransitionEvent::ReadError) => LinkState::Reconnecting,

            (LinkState::Reconnecting, TransitionEvent::Start) => LinkState::Connecting,

            (current, event) => {
                return Err(Error::Internal(format!(
                    "no transition for event {event:?} from state {current:?}"
                )));
            }
        };

        self.current_state = new_state;
        Ok(new_state)
    }
}

impl Default for LinkStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransitionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransitionEvent::Start => "Start",
            TransitionEvent::DialOk => "DialOk",
            TransitionEvent::DialFail => "DialFail",
            TransitionEvent::HeartbeatTimeout => "HeartbeatTimeout",
            TransitionEvent::ReadError => "ReadError",
            TransitionEvent::Stop => "Stop",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_connect() {
        let mut sm = LinkStateMachine::new();
        assert_eq!(sm.transition(TransitionEvent::Start).unwrap(), LinkState::Connecting);
        assert_eq!(sm.transition(TransitionEvent::DialOk).unwrap(), LinkState::Connected);
    }

    #[test]
    fn dial_failure_goes_to_reconnecting() {
        let mut sm = LinkStateMachine::new();
        sm.transition(TransitionEvent::Start).unwrap();
        assert_eq!(
            sm.transition(TransitionEvent::DialFail).unwrap(),
            LinkState::Reconnecting
        );
    }

    #[test]
    fn heartbeat_timeout_from_connected_reconnects() {
        let mut sm = LinkStateMachine::new();
        sm.transition(TransitionEvent::Start).unwrap();
        sm.transition(TransitionEvent::DialOk).unwrap();
        assert_eq!(
            sm.transition(TransitionEvent::HeartbeatTimeout).unwrap(),
            LinkState::Reconnecting
        );
    }

    #[test]
    fn stop_is_idempotent_from_any_state() {
        let mut sm = LinkStateMachine::new();
        assert_eq!(sm.transition(TransitionEvent::Stop).unwrap(), LinkState::Disconnected);
        assert_eq!(sm.transition(TransitionEvent::Stop).unwrap(), LinkState::Disconnected);

        sm.transition(TransitionEvent::Start).unwrap();
        sm.transition(TransitionEvent::Stop).unwrap();
        assert_eq!(sm.state(), LinkState::Disconnected);
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mut sm = LinkStateMachine::new();
        assert!(sm.transition(TransitionEvent::DialOk).is_err());
    }

    #[test]
    fn reconnecting_restarts_the_dial() {
        let mut sm = LinkStateMachine::new();
        sm.transition(TransitionEvent::Start).unwrap();
        sm.transition(TransitionEvent::DialFail).unwrap();
        assert_eq!(sm.transition(TransitionEvent::Start).unwrap(), LinkState::Connecting);
    }
}
