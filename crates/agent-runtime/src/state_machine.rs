//! Orchestrator State Machine — legal transition guards over
//! `coordination::Status`.
//!
//! Wraps the persisted [`Status`] enum (the state data model already lives
//! in `coordination::state::types`) with a transition guard, an in-memory
//! audit log, and checkpoint/resume helpers for crash recovery. The
//! Orchestrator calls `advance()` to move between statuses; an illegal
//! transition is rejected rather than silently applied.

use std::fmt;
use std::time::Instant;

use coordination::Status;
use serde::{Deserialize, Serialize};

/// Legal transitions between statuses:
///
/// ```text
/// New → Planning
/// Planning → PlanningDone | BreakdownDone
/// BreakdownDone → Orchestrating
/// Orchestrating → CodingDone | WaitingHuman
/// PlanningDone → Coding
/// Coding → CodingDone
/// CodingDone → Testing
/// Testing → TestsFailed | TestsPassed
/// TestsFailed → Fixing
/// Fixing → Testing
/// TestsPassed → Reviewing
/// Reviewing → ReviewApproved | ReviewRejected
/// ReviewRejected → Coding
/// ReviewApproved → WaitingHuman
/// WaitingHuman → Completed | Failed
/// ```
/// Any non-terminal status may also transition directly to `Failed`.
fn is_legal_transition(from: Status, to: Status) -> bool {
    use Status::*;

    if to == Failed && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (New, Planning)
            | (Planning, PlanningDone)
            | (Planning, BreakdownDone)
            | (BreakdownDone, Orchestrating)
            | (Orchestrating, CodingDone)
            | (Orchestrating, WaitingHuman)
            | (PlanningDone, Coding)
            | (Coding, CodingDone)
            | (CodingDone, Testing)
            | (Testing, TestsFailed)
            | (Testing, TestsPassed)
            | (TestsFailed, Fixing)
            | (Fixing, Testing)
            | (TestsPassed, Reviewing)
            | (Reviewing, ReviewApproved)
            | (Reviewing, ReviewRejected)
            | (ReviewRejected, Coding)
            | (ReviewApproved, WaitingHuman)
            | (WaitingHuman, Completed)
    )
}

/// A single recorded status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: Status,
    pub to: Status,
    pub attempt: u32,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IllegalTransition {
    pub from: Status,
    pub to: Status,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal status transition: {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

/// Guards and logs transitions for one task's run. Constructed fresh per
/// task load; the authoritative current status lives on the persisted
/// `Task`, not in this struct.
#[derive(Debug)]
pub struct StateMachine {
    current: Status,
    attempt: u32,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl StateMachine {
    pub fn new(current: Status) -> Self {
        Self {
            current,
            attempt: 0,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> Status {
        self.current
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn set_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
    }

    /// Attempts to advance to `to`; rejects illegal transitions rather than
    /// applying them.
    pub fn advance(&mut self, to: Status, reason: Option<&str>) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }

        let record = TransitionRecord {
            from: self.current,
            to,
            attempt: self.attempt,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        };
        tracing::debug!(from = %self.current, to = %to, attempt = self.attempt, "status transition");
        self.transitions.push(record);
        self.current = to;
        Ok(())
    }

    /// Always-legal escape hatch to `Failed` from any non-terminal status.
    pub fn fail(&mut self, reason: &str) -> Result<(), IllegalTransition> {
        self.advance(Status::Failed, Some(reason))
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_xs_task_reaches_completed() {
        let mut sm = StateMachine::new(Status::New);
        for to in [
            Status::Planning,
            Status::PlanningDone,
            Status::Coding,
            Status::CodingDone,
            Status::Testing,
            Status::TestsPassed,
            Status::Reviewing,
            Status::ReviewApproved,
            Status::WaitingHuman,
            Status::Completed,
        ] {
            sm.advance(to, None).unwrap();
        }
        assert!(sm.is_terminal());
    }

    #[test]
    fn tests_failed_then_fixing_loops_back_to_testing() {
        let mut sm = StateMachine::new(Status::Testing);
        sm.advance(Status::TestsFailed, Some("npm test exit 1")).unwrap();
        sm.advance(Status::Fixing, None).unwrap();
        sm.advance(Status::Testing, None).unwrap();
        assert_eq!(sm.current(), Status::Testing);
    }

    #[test]
    fn review_rejected_loops_back_to_coding() {
        let mut sm = StateMachine::new(Status::Reviewing);
        sm.advance(Status::ReviewRejected, None).unwrap();
        sm.advance(Status::Coding, None).unwrap();
        assert_eq!(sm.current(), Status::Coding);
    }

    #[test]
    fn orchestrated_path_goes_through_breakdown_and_orchestrating() {
        let mut sm = StateMachine::new(Status::Planning);
        sm.advance(Status::BreakdownDone, None).unwrap();
        sm.advance(Status::Orchestrating, None).unwrap();
        sm.advance(Status::CodingDone, None).unwrap();
        assert_eq!(sm.current(), Status::CodingDone);
    }

    #[test]
    fn orchestrating_routes_directly_to_waiting_human_on_conflict() {
        let mut sm = StateMachine::new(Status::Orchestrating);
        sm.advance(Status::WaitingHuman, Some("aggregation conflict")).unwrap();
        assert_eq!(sm.current(), Status::WaitingHuman);
    }

    #[test]
    fn rejects_illegal_transition() {
        let mut sm = StateMachine::new(Status::New);
        assert!(sm.advance(Status::Completed, None).is_err());
        assert_eq!(sm.current(), Status::New);
    }

    #[test]
    fn any_non_terminal_state_can_fail() {
        let mut sm = StateMachine::new(Status::Coding);
        sm.fail("storage-fatal").unwrap();
        assert_eq!(sm.current(), Status::Failed);
        assert!(sm.is_terminal());
    }

    #[test]
    fn terminal_states_reject_further_transitions() {
        let mut sm = StateMachine::new(Status::Failed);
        assert!(sm.advance(Status::Planning, None).is_err());
        assert!(sm.fail("again").is_err());
    }
}
