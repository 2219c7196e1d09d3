//! Retry and model-escalation policy for stage-level failures.
//!
//! A stage retry increments the task's attempt count; once it reaches
//! `max_attempts` the next attempt escalates the position to
//! `escalation_1`, then `escalation_2`. Cumulative attempts across all
//! stages are capped separately by [`EscalationConfig::max_cumulative_attempts`];
//! exceeding it moves the task to WAITING_HUMAN. Storage-fatal and
//! schema-invalid failures that repeat twice in a row skip retry entirely
//! — see [`StorageFatalTracker`] and [`SchemaFailureTracker`].

pub mod engine;
pub mod state;

pub use engine::{EscalationConfig, EscalationEngine, RetryDecision, MAX_ATTEMPTS_ERROR};
pub use state::{EscalationLevel, SchemaFailureTracker, StorageFatalTracker};
