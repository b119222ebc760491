//! The Entity lifecycle state machine.
//!
//! States only move forward — `Uninitialized → Initialized → Running ⇄
//! Paused → Terminated` — except that `Terminate` is legal from any
//! non-terminal state (an Entity can be torn down mid-initialization if a
//! sibling fails). Once `Terminated`, no further command is accepted.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initialized,
    Running,
    Paused,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleCommand {
    Initialize,
    Start,
    Pause,
    Resume,
    Terminate,
}

/// A named phase, used for Supervisor-wide per-phase timeouts and error
/// messages. Distinct from `LifecycleCommand` only in that it has no
/// corresponding target state (`Pause`/`Resume` collapse into `Running` as
/// a state, but are reported as their own phase names on failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Initialize,
    Start,
    Pause,
    Resume,
    Terminate,
}

impl LifecycleCommand {
    pub fn phase_name(&self) -> &'static str {
        match self {
            LifecycleCommand::Initialize => "Initialize",
            LifecycleCommand::Start => "Start",
            LifecycleCommand::Pause => "Pause",
            LifecycleCommand::Resume => "Resume",
            LifecycleCommand::Terminate => "Terminate",
        }
    }

    pub fn target_state(&self) -> LifecycleState {
        match self {
            LifecycleCommand::Initialize => LifecycleState::Initialized,
            LifecycleCommand::Start => LifecycleState::Running,
            LifecycleCommand::Pause => LifecycleState::Paused,
            LifecycleCommand::Resume => LifecycleState::Running,
            LifecycleCommand::Terminate => LifecycleState::Terminated,
        }
    }
}

impl LifecycleState {
    /// Default per-phase timeout.
    pub fn default_timeout(phase: LifecyclePhase) -> std::time::Duration {
        use std::time::Duration;
        match phase {
            LifecyclePhase::Initialize => Duration::from_secs(30),
            LifecyclePhase::Start | LifecyclePhase::Pause | LifecyclePhase::Resume => Duration::from_secs(10),
            LifecyclePhase::Terminate => Duration::from_secs(60),
        }
    }

    pub fn can_transition_to(&self, target: LifecycleState) -> bool {
        use LifecycleState::*;
        if *self == Terminated {
            return false;
        }
        if target == Terminated {
            return true;
        }
        matches!(
            (*self, target),
            (Uninitialized, Initialized) | (Initialized, Running) | (Running, Paused) | (Paused, Running)
        )
    }

    /// Encoding for the `state()` snapshot an `EntityHandle` publishes to
    /// readers outside the worker task (e.g. the `inspect` CLI path).
    pub fn as_u8(&self) -> u8 {
        match self {
            LifecycleState::Uninitialized => 0,
            LifecycleState::Initialized => 1,
            LifecycleState::Running => 2,
            LifecycleState::Paused => 3,
            LifecycleState::Terminated => 4,
        }
    }

    pub fn from_u8(v: u8) -> LifecycleState {
        match v {
            0 => LifecycleState::Uninitialized,
            1 => LifecycleState::Initialized,
            2 => LifecycleState::Running,
            3 => LifecycleState::Paused,
            _ => LifecycleState::Terminated,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    #[test]
    fn forward_progression_is_legal() {
        assert!(Uninitialized.can_transition_to(Initialized));
        assert!(Initialized.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
    }

    #[test]
    fn skipping_initialize_is_illegal() {
        assert!(!Uninitialized.can_transition_to(Running));
    }

    #[test]
    fn terminate_is_legal_from_any_non_terminal_state() {
        assert!(Uninitialized.can_transition_to(Terminated));
        assert!(Initialized.can_transition_to(Terminated));
        assert!(Running.can_transition_to(Terminated));
        assert!(Paused.can_transition_to(Terminated));
    }

    #[test]
    fn terminated_is_final() {
        assert!(!Terminated.can_transition_to(Running));
        assert!(!Terminated.can_transition_to(Terminated));
    }

    #[test]
    fn re_initializing_is_illegal() {
        assert!(!Running.can_transition_to(Initialized));
    }

    #[test]
    fn u8_encoding_round_trips() {
        for s in [Uninitialized, Initialized, Running, Paused, Terminated] {
            assert_eq!(LifecycleState::from_u8(s.as_u8()), s);
        }
    }
}
