//! Container lifecycle state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DockyardError, Result};

/// Where a container is in its managed lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Request built, nothing created yet.
    Configured,
    /// Attached to an existing container through reuse.
    Attached,
    /// Create call in flight.
    Creating,
    /// Created, not started.
    Created,
    /// Start call in flight.
    Starting,
    /// Started, waiting for readiness.
    AwaitingReady,
    /// Ready for use.
    Running,
    /// Stop call in flight.
    Stopping,
    /// Stopped, not removed.
    Stopped,
    /// Removed from the engine.
    Removed,
    /// An attempt failed; may retry.
    Failed,
    /// Every attempt failed.
    FatallyFailed,
}

impl LifecycleState {
    /// Whether a transition to `target` is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: &Self) -> bool {
        use LifecycleState::{
            Attached, AwaitingReady, Configured, Created, Creating, Failed, FatallyFailed,
            Removed, Running, Starting, Stopped, Stopping,
        };

        matches!(
            (self, target),
            (Configured, Attached | Creating)
                | (Creating, Created)
                | (Created, Starting)
                | (Starting, AwaitingReady)
                | (AwaitingReady, Running)
                | (Creating | Created | Starting | AwaitingReady, Failed)
                | (Failed, Creating | FatallyFailed)
                | (Running | Attached, Stopping)
                | (Stopping, Stopped)
                | (Stopped, Removed)
        )
    }

    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Removed | Self::FatallyFailed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Configured => "Configured",
            Self::Attached => "Attached",
            Self::Creating => "Creating",
            Self::Created => "Created",
            Self::Starting => "Starting",
            Self::AwaitingReady => "AwaitingReady",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Removed => "Removed",
            Self::Failed => "Failed",
            Self::FatallyFailed => "FatallyFailed",
        };
        f.write_str(name)
    }
}

/// Current state plus every state visited, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    history: Vec<LifecycleState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// Start in [`LifecycleState::Configured`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            history: vec![LifecycleState::Configured],
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.history
            .last()
            .copied()
            .unwrap_or(LifecycleState::Configured)
    }

    /// Every state visited, oldest first.
    #[must_use]
    pub fn history(&self) -> &[LifecycleState] {
        &self.history
    }

    /// Move to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`DockyardError::InvalidTransition`] if the move is not allowed.
    pub fn transition_to(&mut self, target: LifecycleState) -> Result<()> {
        let current = self.state();
        if !current.can_transition_to(&target) {
            return Err(DockyardError::InvalidTransition {
                from: current.to_string(),
                to: target.to_string(),
            });
        }
        self.history.push(target);
        Ok(())
    }

    /// Undo the last transition.
    pub(crate) fn pop(&mut self) {
        if self.history.len() > 1 {
            self.history.pop();
        }
    }

    /// Record `target` without checking the transition.
    pub(crate) fn force(&mut self, target: LifecycleState) {
        self.history.push(target);
    }
}

#[cfg(test)]
mod tests {
    use super::LifecycleState::*;
    use super::*;
    use test_case::test_case;

    #[test_case(Configured, Creating ; "create")]
    #[test_case(Configured, Attached ; "attach")]
    #[test_case(AwaitingReady, Failed ; "readiness failure")]
    #[test_case(Failed, Creating ; "retry")]
    #[test_case(Failed, FatallyFailed ; "give up")]
    #[test_case(Attached, Stopping ; "stop reused")]
    #[test_case(Stopped, Removed ; "remove")]
    fn test_valid_transitions(from: LifecycleState, to: LifecycleState) {
        assert!(from.can_transition_to(&to));
    }

    #[test_case(Configured, Running ; "skip creation")]
    #[test_case(Running, Failed ; "fail after running")]
    #[test_case(Removed, Creating ; "resurrect")]
    #[test_case(FatallyFailed, Creating ; "retry after fatal")]
    #[test_case(Attached, AwaitingReady ; "wait on reused")]
    fn test_invalid_transitions(from: LifecycleState, to: LifecycleState) {
        assert!(!from.can_transition_to(&to));
    }

    #[test]
    fn test_lifecycle_records_history() {
        let mut lifecycle = Lifecycle::new();
        for state in [Creating, Failed, Creating, Created, Starting, AwaitingReady, Running] {
            lifecycle.transition_to(state).expect("transition");
        }
        assert_eq!(lifecycle.state(), Running);
        assert_eq!(lifecycle.history().len(), 8);
        assert_eq!(
            lifecycle.history().iter().filter(|s| **s == Creating).count(),
            2
        );
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let mut lifecycle = Lifecycle::new();
        let err = lifecycle.transition_to(Running).expect_err("invalid");
        assert!(err.to_string().contains("Configured to Running"));
        assert_eq!(lifecycle.state(), Configured);
    }

    #[test]
    fn test_terminal_states() {
        assert!(Removed.is_terminal());
        assert!(FatallyFailed.is_terminal());
        assert!(!Failed.is_terminal());
    }
}
