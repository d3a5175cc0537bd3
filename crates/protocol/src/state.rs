//! Connection lifecycle vocabulary shared by client and gateway.
//!
//! Each side keeps its own `ConnectionState` and drives it independently;
//! they converge only through message exchange. Both check every mutation
//! against [`ConnectionState::can_transition_to`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of one logical session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No usable transport.
    Disconnected,
    /// Socket upgrade / handshake in progress.
    Connecting,
    /// Handshake complete, rooms not yet restored.
    Connected,
    /// Room re-subscription in progress.
    Restoring,
    /// Fully restored; application traffic flows.
    Ready,
}

impl ConnectionState {
    /// Returns `true` if `next` is adjacent to `self` in the lifecycle graph.
    ///
    /// Forward edges are `disconnected → connecting → connected → restoring →
    /// ready`. `disconnected` is reachable from every other state.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connected, Restoring)
                | (Restoring, Ready)
                | (Connecting | Connected | Restoring | Ready, Disconnected)
        )
    }

    /// Validates a transition, returning the new state on success.
    pub fn transition(self, next: ConnectionState) -> Result<ConnectionState, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                from: self,
                to: next,
            })
        }
    }

    /// Returns `true` once application frames may flow.
    pub fn is_ready(self) -> bool {
        self == ConnectionState::Ready
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Restoring => "restoring",
            Self::Ready => "ready",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transition outside the lifecycle graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal state transition {from} -> {to}")]
pub struct TransitionError {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::*;
    use super::*;

    const ALL: [ConnectionState; 5] = [Disconnected, Connecting, Connected, Restoring, Ready];

    #[test]
    fn forward_path_is_legal() {
        let path = [Disconnected, Connecting, Connected, Restoring, Ready];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn disconnected_reachable_from_every_other_state() {
        for state in [Connecting, Connected, Restoring, Ready] {
            assert_eq!(state.transition(Disconnected), Ok(Disconnected));
        }
    }

    #[test]
    fn skipping_ahead_is_rejected() {
        let err = Disconnected.transition(Ready).unwrap_err();
        assert_eq!(err.from, Disconnected);
        assert_eq!(err.to, Ready);
        assert!(!Connecting.can_transition_to(Ready));
        assert!(!Connected.can_transition_to(Ready));
        assert!(!Disconnected.can_transition_to(Connected));
    }

    #[test]
    fn going_backwards_is_rejected() {
        assert!(!Ready.can_transition_to(Restoring));
        assert!(!Restoring.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
    }

    #[test]
    fn self_transitions_are_rejected() {
        for state in ALL {
            assert!(!state.can_transition_to(state), "{state} -> {state}");
        }
    }

    #[test]
    fn legal_edge_count() {
        let legal = ALL
            .iter()
            .flat_map(|a| ALL.iter().map(move |b| (*a, *b)))
            .filter(|(a, b)| a.can_transition_to(*b))
            .count();
        // Four forward edges plus four edges into `disconnected`.
        assert_eq!(legal, 8);
    }

    #[test]
    fn state_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Restoring).unwrap(), "\"restoring\"");
        let s: ConnectionState = serde_json::from_str("\"ready\"").unwrap();
        assert_eq!(s, Ready);
    }

    #[test]
    fn error_display_names_both_states() {
        let err = Disconnected.transition(Ready).unwrap_err();
        assert_eq!(err.to_string(), "illegal state transition disconnected -> ready");
    }
}
