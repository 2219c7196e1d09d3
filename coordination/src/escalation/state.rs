//! Per-task escalation bookkeeping: model escalation level and the two
//! fatal-class counters that skip retry entirely.

use serde::{Deserialize, Serialize};

/// Which model position a stage's next attempt should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    /// Use the stage's own position (`coder_{complexity}_{effort}`, `fixer`, `reviewer`, ...).
    Base,
    Escalation1,
    Escalation2,
}

impl EscalationLevel {
    /// `attemptCount = maxAttempts` escalates to `escalation_1`; a second
    /// `maxAttempts` worth of failures escalates further to `escalation_2`.
    pub fn from_attempt(attempt_count: u32, max_attempts: u32) -> Self {
        if max_attempts == 0 {
            return EscalationLevel::Escalation2;
        }
        match attempt_count / max_attempts {
            0 => EscalationLevel::Base,
            1 => EscalationLevel::Escalation1,
            _ => EscalationLevel::Escalation2,
        }
    }
}

/// Counts consecutive storage-fatal checkpoint restorations for one task.
/// Two in a row is the fatal threshold — the Orchestrator gives up rather
/// than restoring a third time.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StorageFatalTracker {
    pub consecutive_restorations: u32,
}

impl StorageFatalTracker {
    /// Records a restoration; returns `true` once the fatal threshold is reached.
    pub fn record_restoration(&mut self) -> bool {
        self.consecutive_restorations += 1;
        self.consecutive_restorations >= 2
    }

    pub fn reset(&mut self) {
        self.consecutive_restorations = 0;
    }
}

/// Counts consecutive schema-validation failures on one agent's output.
/// A second consecutive failure is treated as model-fatal rather than
/// re-prompted again.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SchemaFailureTracker {
    pub consecutive_failures: u32,
}

impl SchemaFailureTracker {
    /// Records a failure; returns `true` once the fatal threshold is reached.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        self.consecutive_failures >= 2
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalation_level_escalates_at_attempt_cap() {
        assert_eq!(EscalationLevel::from_attempt(0, 3), EscalationLevel::Base);
        assert_eq!(EscalationLevel::from_attempt(2, 3), EscalationLevel::Base);
        assert_eq!(
            EscalationLevel::from_attempt(3, 3),
            EscalationLevel::Escalation1
        );
        assert_eq!(
            EscalationLevel::from_attempt(5, 3),
            EscalationLevel::Escalation1
        );
        assert_eq!(
            EscalationLevel::from_attempt(6, 3),
            EscalationLevel::Escalation2
        );
        assert_eq!(
            EscalationLevel::from_attempt(100, 3),
            EscalationLevel::Escalation2
        );
    }

    #[test]
    fn storage_fatal_tracker_trips_on_second_restoration() {
        let mut t = StorageFatalTracker::default();
        assert!(!t.record_restoration());
        assert!(t.record_restoration());
        t.reset();
        assert!(!t.record_restoration());
    }

    #[test]
    fn schema_failure_tracker_trips_on_second_failure() {
        let mut t = SchemaFailureTracker::default();
        assert!(!t.record_failure());
        assert!(t.record_failure());
    }
}
