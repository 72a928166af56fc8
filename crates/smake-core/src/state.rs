use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::CoreError;

/// Lifecycle state of a managed instance record.
///
/// `Pending` is the initial state and `Terminated` the only terminal one.
/// `Failed` is deliberately non-terminal: re-provisioning is a caller decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Ready,
    Failed,
    Stopped,
    Terminating,
    Terminated,
}

impl InstanceState {
    pub const ALL: [InstanceState; 6] = [
        InstanceState::Pending,
        InstanceState::Ready,
        InstanceState::Failed,
        InstanceState::Stopped,
        InstanceState::Terminating,
        InstanceState::Terminated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Ready => "ready",
            InstanceState::Failed => "failed",
            InstanceState::Stopped => "stopped",
            InstanceState::Terminating => "terminating",
            InstanceState::Terminated => "terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Terminated)
    }

    /// Only a ready instance may carry a network address.
    pub fn allows_uri(&self) -> bool {
        matches!(self, InstanceState::Ready)
    }

    /// Whether the lifecycle may move a record from `self` to `next`.
    ///
    /// Re-asserting the current state is always allowed.
    pub fn can_transition_to(&self, next: InstanceState) -> bool {
        use InstanceState::*;

        if *self == next {
            return true;
        }

        match self {
            Pending => matches!(next, Ready | Failed | Stopped | Terminating),
            // a restart re-enters readiness polling
            Ready => matches!(next, Pending | Failed | Stopped | Terminating),
            Failed => matches!(next, Pending | Terminating),
            Stopped => matches!(next, Pending | Terminating),
            Terminating => matches!(next, Terminated),
            Terminated => false,
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InstanceState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| CoreError::InvalidState(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_test::{assert_tokens, Token};

    #[test]
    fn test_state_wire_form_is_snake_case() {
        assert_tokens(
            &InstanceState::Terminating,
            &[Token::UnitVariant {
                name: "InstanceState",
                variant: "terminating",
            }],
        );
    }

    #[test]
    fn test_parse_known_and_unknown_states() {
        assert_eq!(
            "ready".parse::<InstanceState>().unwrap(),
            InstanceState::Ready
        );
        let err = "booting".parse::<InstanceState>().unwrap_err();
        assert!(err.to_string().contains("booting"));
    }

    #[test]
    fn test_readiness_transitions_from_pending() {
        assert!(InstanceState::Pending.can_transition_to(InstanceState::Ready));
        assert!(InstanceState::Pending.can_transition_to(InstanceState::Failed));
        assert!(!InstanceState::Terminating.can_transition_to(InstanceState::Pending));
    }

    #[test]
    fn test_restart_returns_to_pending() {
        assert!(InstanceState::Ready.can_transition_to(InstanceState::Pending));
        assert!(InstanceState::Stopped.can_transition_to(InstanceState::Pending));
        assert!(InstanceState::Failed.can_transition_to(InstanceState::Pending));
        assert!(!InstanceState::Terminated.can_transition_to(InstanceState::Pending));
    }

    #[test]
    fn test_explicit_termination_path() {
        assert!(InstanceState::Ready.can_transition_to(InstanceState::Terminating));
        assert!(InstanceState::Failed.can_transition_to(InstanceState::Terminating));
        assert!(InstanceState::Terminating.can_transition_to(InstanceState::Terminated));
        assert!(!InstanceState::Terminating.can_transition_to(InstanceState::Ready));
    }

    #[test]
    fn test_only_ready_allows_uri() {
        let with_uri: Vec<_> = InstanceState::ALL
            .iter()
            .filter(|state| state.allows_uri())
            .collect();
        assert_eq!(with_uri, vec![&InstanceState::Ready]);
    }

    mod property_tests_state_machine {
        use super::*;
        use proptest::prelude::*;

        fn state_strategy() -> impl Strategy<Value = InstanceState> {
            prop::sample::select(InstanceState::ALL.to_vec())
        }

        proptest! {
            #[test]
            fn property_terminated_admits_no_other_state(next in state_strategy()) {
                let allowed = InstanceState::Terminated.can_transition_to(next);
                prop_assert_eq!(allowed, next == InstanceState::Terminated);
            }

            #[test]
            fn property_display_parses_back(state in state_strategy()) {
                let parsed: InstanceState = state.to_string().parse().unwrap();
                prop_assert_eq!(parsed, state);
            }

            #[test]
            fn property_every_state_can_reach_termination(state in state_strategy()) {
                let reaches = state.is_terminal()
                    || state.can_transition_to(InstanceState::Terminating)
                    || state == InstanceState::Terminating;
                prop_assert!(reaches);
            }
        }
    }
}
