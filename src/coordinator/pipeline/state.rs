//! Pipeline state machine.
//!
//! ```text
//! Validating -> Allocating -> Persisting -> PostProcessing -> Notifying -> Done
//!      |             |            |              |
//!      +-------------+------------+--------------+--> RollingBack
//! ```
//!
//! `Notifying` never rolls back: the resource is already committed, so a
//! failed notification is only logged.

use std::fmt;
use std::time::Instant;

use tracing::debug;

use crate::error::{TxnError, TxnResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Validating,
    Allocating,
    Persisting,
    PostProcessing,
    Notifying,
    Done,
    RollingBack,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Validating => "validating",
            PipelineState::Allocating => "allocating",
            PipelineState::Persisting => "persisting",
            PipelineState::PostProcessing => "post_processing",
            PipelineState::Notifying => "notifying",
            PipelineState::Done => "done",
            PipelineState::RollingBack => "rolling_back",
        }
    }

    /// States a failure can roll back from.
    pub fn can_roll_back(&self) -> bool {
        matches!(
            self,
            PipelineState::Validating
                | PipelineState::Allocating
                | PipelineState::Persisting
                | PipelineState::PostProcessing
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::RollingBack)
    }

    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (Validating, Allocating)
            | (Allocating, Persisting)
            | (Persisting, PostProcessing)
            | (PostProcessing, Notifying)
            | (Notifying, Done) => true,
            (from, RollingBack) => from.can_roll_back(),
            _ => false,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the states one run visits.
#[derive(Debug)]
pub struct StateTracker {
    current: PipelineState,
    transitions: Vec<PipelineState>,
    entered_at: Instant,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    /// Every run starts in `Validating`.
    pub fn new() -> Self {
        Self {
            current: PipelineState::Validating,
            transitions: vec![PipelineState::Validating],
            entered_at: Instant::now(),
        }
    }

    pub fn current(&self) -> PipelineState {
        self.current
    }

    pub fn transitions(&self) -> &[PipelineState] {
        &self.transitions
    }

    pub fn into_transitions(self) -> Vec<PipelineState> {
        self.transitions
    }

    /// Move to `next`. Re-entering the current state is a no-op.
    pub fn advance(&mut self, next: PipelineState) -> TxnResult<()> {
        if next == self.current {
            return Ok(());
        }
        if !self.current.can_transition_to(next) {
            return Err(TxnError::Internal(format!(
                "invalid pipeline transition {} -> {}",
                self.current, next
            )));
        }
        debug!(
            from = self.current.as_str(),
            to = next.as_str(),
            elapsed_us = self.entered_at.elapsed().as_micros() as u64,
            "Pipeline transition"
        );
        self.current = next;
        self.entered_at = Instant::now();
        self.transitions.push(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PipelineState::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut tracker = StateTracker::new();
        for next in [Allocating, Persisting, PostProcessing, Notifying, Done] {
            tracker.advance(next).unwrap();
        }
        assert_eq!(
            tracker.transitions(),
            &[Validating, Allocating, Persisting, PostProcessing, Notifying, Done]
        );
        assert!(tracker.current().is_terminal());
    }

    #[test]
    fn test_rollback_only_before_notifying() {
        for state in [Validating, Allocating, Persisting, PostProcessing] {
            assert!(state.can_transition_to(RollingBack), "{}", state);
        }
        assert!(!Notifying.can_transition_to(RollingBack));
        assert!(!Done.can_transition_to(RollingBack));
    }

    #[test]
    fn test_skipping_states_is_rejected() {
        let mut tracker = StateTracker::new();
        assert!(matches!(
            tracker.advance(Persisting),
            Err(TxnError::Internal(_))
        ));
        tracker.advance(Validating).unwrap();
        assert_eq!(tracker.transitions(), &[Validating]);
    }
}
