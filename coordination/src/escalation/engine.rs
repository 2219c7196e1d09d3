//! Retry and model-escalation policy.
//!
//! A stage retry increments the task's `attempt_count`. Once it reaches
//! `max_attempts` the next attempt escalates the position to
//! `escalation_1`, then `escalation_2` after a second `max_attempts`
//! worth of failures. Cumulative attempts across all stages of a task are
//! capped separately; exceeding that cap moves the task to WAITING_HUMAN
//! with `lastError = "MAX_ATTEMPTS"`.

use crate::escalation::state::EscalationLevel;
use crate::state::{CoderEffort, Complexity, Position};

pub const MAX_ATTEMPTS_ERROR: &str = "MAX_ATTEMPTS";

#[derive(Debug, Clone, Copy)]
pub struct EscalationConfig {
    /// Same-stage attempts before the position escalates.
    pub max_attempts: u32,
    /// Cumulative attempts across all stages before giving up entirely.
    pub max_cumulative_attempts: u32,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_cumulative_attempts: 9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the current stage at `position`, the resolved Model Router position for this attempt.
    Retry {
        position: Position,
        level: EscalationLevel,
    },
    /// Cumulative cap exceeded — move the task to WAITING_HUMAN.
    WaitingHuman { last_error: String },
}

/// Deterministic retry/escalation decision-maker. Stateless: the caller
/// supplies the task's current attempt counters and gets back what to do
/// next.
pub struct EscalationEngine {
    config: EscalationConfig,
}

impl EscalationEngine {
    pub fn new(config: EscalationConfig) -> Self {
        Self { config }
    }

    /// Decides the next attempt for a coding stage, where the base
    /// position is complexity/effort-keyed.
    pub fn decide_coder(
        &self,
        attempt_count: u32,
        cumulative_attempts: u32,
        complexity: Complexity,
        effort: CoderEffort,
    ) -> RetryDecision {
        self.decide(
            attempt_count,
            cumulative_attempts,
            Position::Coder { complexity, effort },
        )
    }

    /// Decides the next attempt for a non-coding stage (fixer, reviewer)
    /// whose base position is fixed.
    pub fn decide_stage(
        &self,
        attempt_count: u32,
        cumulative_attempts: u32,
        base: Position,
    ) -> RetryDecision {
        self.decide(attempt_count, cumulative_attempts, base)
    }

    fn decide(
        &self,
        attempt_count: u32,
        cumulative_attempts: u32,
        base: Position,
    ) -> RetryDecision {
        if cumulative_attempts >= self.config.max_cumulative_attempts {
            return RetryDecision::WaitingHuman {
                last_error: MAX_ATTEMPTS_ERROR.to_string(),
            };
        }
        let level = EscalationLevel::from_attempt(attempt_count, self.config.max_attempts);
        let position = match level {
            EscalationLevel::Base => base,
            EscalationLevel::Escalation1 => Position::Escalation1,
            EscalationLevel::Escalation2 => Position::Escalation2,
        };
        RetryDecision::Retry { position, level }
    }
}

impl Default for EscalationEngine {
    fn default() -> Self {
        Self::new(EscalationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_at_base_position_below_attempt_cap() {
        let engine = EscalationEngine::default();
        let decision = engine.decide_coder(1, 1, Complexity::S, CoderEffort::Medium);
        assert_eq!(
            decision,
            RetryDecision::Retry {
                position: Position::Coder {
                    complexity: Complexity::S,
                    effort: CoderEffort::Medium
                },
                level: EscalationLevel::Base,
            }
        );
    }

    #[test]
    fn escalates_to_escalation_one_at_attempt_cap() {
        let engine = EscalationEngine::default();
        let decision = engine.decide_coder(3, 3, Complexity::S, CoderEffort::Medium);
        assert_eq!(
            decision,
            RetryDecision::Retry {
                position: Position::Escalation1,
                level: EscalationLevel::Escalation1,
            }
        );
    }

    #[test]
    fn escalates_to_escalation_two_after_second_cap() {
        let engine = EscalationEngine::default();
        let decision = engine.decide_coder(6, 6, Complexity::S, CoderEffort::Medium);
        assert_eq!(
            decision,
            RetryDecision::Retry {
                position: Position::Escalation2,
                level: EscalationLevel::Escalation2,
            }
        );
    }

    #[test]
    fn cumulative_cap_exceeded_moves_to_waiting_human() {
        let config = EscalationConfig {
            max_attempts: 3,
            max_cumulative_attempts: 5,
        };
        let engine = EscalationEngine::new(config);
        let decision = engine.decide_coder(2, 5, Complexity::M, CoderEffort::Low);
        assert_eq!(
            decision,
            RetryDecision::WaitingHuman {
                last_error: MAX_ATTEMPTS_ERROR.to_string()
            }
        );
    }

    #[test]
    fn non_coder_stage_escalates_the_same_way() {
        let engine = EscalationEngine::default();
        let decision = engine.decide_stage(3, 3, Position::Reviewer);
        assert_eq!(
            decision,
            RetryDecision::Retry {
                position: Position::Escalation1,
                level: EscalationLevel::Escalation1,
            }
        );
    }
}
