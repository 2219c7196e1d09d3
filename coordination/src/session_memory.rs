//! Session Memory operations layer: the write/read API the
//! Orchestrator and agents use against a task's [`SessionMemory`] document.
//! The passive struct lives in `state::types`; this module is the only
//! place allowed to mutate it, so every invariant (write-once outputs,
//! failure-pattern dedup, checkpoint/restore) is enforced in one spot.

use serde_json::Value;

use crate::feedback::error_parser::normalize_pattern;
use crate::state::store::{StateStore, StoreError, StoreResult};
use crate::state::types::{
    AttemptOutcome, AttemptRecord, Checkpoint, FailurePattern, Phase, ProgressEntry, ProgressKind,
    SessionMemory,
};

#[derive(Debug, thiserror::Error)]
pub enum SessionMemoryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("agent output for {0:?} was already set (write-once)")]
    OutputAlreadySet(String),
    #[error("no attempt in progress for task {0}")]
    NoAttemptInProgress(String),
    #[error("checkpoint {0} not found")]
    CheckpointNotFound(String),
}

pub type SessionMemoryResult<T> = Result<T, SessionMemoryError>;

/// Thin, stateless wrapper over a [`StateStore`] implementing the Session
/// Memory operation contract. Cheap to construct per call site.
pub struct SessionMemoryOps<'a> {
    store: &'a StateStore,
}

impl<'a> SessionMemoryOps<'a> {
    pub fn new(store: &'a StateStore) -> Self {
        Self { store }
    }

    /// Creates and persists a fresh session for a new task.
    pub fn create(&self, task_id: &str) -> SessionMemoryResult<SessionMemory> {
        let session = SessionMemory::new(task_id.to_string());
        self.store.put_session(&session)?;
        Ok(session)
    }

    /// Appends a progress entry and bumps `error_count`/`retry_count` as the
    /// entry kind implies.
    pub fn log_progress(
        &self,
        task_id: &str,
        kind: ProgressKind,
        phase: Phase,
        attempt: u32,
        summary: impl Into<String>,
        payload: Option<Value>,
    ) -> SessionMemoryResult<SessionMemory> {
        let is_error = kind.is_error();
        let is_retry = kind.is_retry();
        Ok(self.store.mutate_session(task_id, |session| {
            session.phase = phase;
            if is_error {
                session.error_count += 1;
            }
            if is_retry {
                session.retry_count += 1;
            }
            session.progress.push(ProgressEntry {
                kind,
                phase,
                attempt,
                summary: summary.into(),
                payload,
                timestamp: chrono::Utc::now(),
            });
            Ok(())
        })?)
    }

    /// Starts a new attempt record. Fails closed if the previous attempt (if
    /// any) was never ended — callers must call `end_attempt` first.
    pub fn start_attempt(&self, task_id: &str, attempt_number: u32) -> SessionMemoryResult<SessionMemory> {
        Ok(self.store.mutate_session(task_id, |session| {
            if let Some(last) = session.attempts.last() {
                if last.ended_at.is_none() {
                    return Err(StoreError::StorageFatal(format!(
                        "attempt {} never ended before starting attempt {attempt_number}",
                        last.attempt_number
                    )));
                }
            }
            session.attempts.push(AttemptRecord::start(attempt_number));
            Ok(())
        })?)
    }

    /// Ends the in-progress attempt with an outcome. On a failure outcome,
    /// the (normalized) failure reason is merged into `failure_patterns[]`:
    /// an existing pattern's `occurrences` is incremented and `last_seen`
    /// bumped, otherwise a new entry is appended.
    pub fn end_attempt(
        &self,
        task_id: &str,
        outcome: AttemptOutcome,
        diff: Option<String>,
        commit_message: Option<String>,
        failure_reason: Option<String>,
        failure_details: Option<String>,
    ) -> SessionMemoryResult<SessionMemory> {
        let task_id_owned = task_id.to_string();
        let result = self.store.mutate_session(task_id, |session| {
            let attempt = session
                .attempts
                .last_mut()
                .filter(|a| a.ended_at.is_none())
                .ok_or_else(|| {
                    StoreError::StorageFatal(format!("no attempt in progress for {task_id_owned}"))
                })?;
            attempt.ended_at = Some(chrono::Utc::now());
            attempt.outcome = outcome;
            attempt.diff = diff;
            attempt.commit_message = commit_message;
            attempt.failure_reason = failure_reason.clone();
            attempt.failure_details = failure_details;

            if !matches!(outcome, AttemptOutcome::Success | AttemptOutcome::InProgress) {
                if let Some(reason) = failure_reason {
                    merge_failure_pattern(session, &reason);
                }
            }
            Ok(())
        });
        result.map_err(|e| match e {
            StoreError::StorageFatal(msg) if msg.contains("no attempt in progress") => {
                SessionMemoryError::NoAttemptInProgress(task_id.to_string())
            }
            other => SessionMemoryError::Store(other),
        })
    }

    /// Sets an agent's output payload, write-once: a second call for the
    /// same agent name fails rather than silently overwriting.
    pub fn set_agent_output(
        &self,
        task_id: &str,
        agent_name: &str,
        output: Value,
    ) -> SessionMemoryResult<SessionMemory> {
        let agent_name_owned = agent_name.to_string();
        let result = self.store.mutate_session(task_id, |session| {
            if session.outputs.contains_key(&agent_name_owned) {
                return Err(StoreError::StorageFatal(format!(
                    "output already set for {agent_name_owned}"
                )));
            }
            session.outputs.insert(agent_name_owned.clone(), output);
            Ok(())
        });
        result.map_err(|e| match e {
            StoreError::StorageFatal(msg) if msg.contains("output already set") => {
                SessionMemoryError::OutputAlreadySet(agent_name.to_string())
            }
            other => SessionMemoryError::Store(other),
        })
    }

    /// Snapshots the session into a checkpoint, recording the checkpoint id
    /// on the session itself.
    pub fn checkpoint(&self, task_id: &str, reason: Option<String>) -> SessionMemoryResult<Checkpoint> {
        let snapshot = self.store.require_session(task_id)?;
        let checkpoint = Checkpoint {
            id: format!("{task_id}-ckpt-{}", snapshot.progress.len()),
            task_id: task_id.to_string(),
            reason,
            snapshot,
            created_at: chrono::Utc::now(),
        };
        self.store.put_checkpoint(&checkpoint)?;
        self.store.mutate_session(task_id, |session| {
            session.last_checkpoint = Some(checkpoint.id.clone());
            session.progress.push(ProgressEntry {
                kind: ProgressKind::Checkpointed {
                    checkpoint_id: checkpoint.id.clone(),
                },
                phase: session.phase,
                attempt: session.attempts.len() as u32,
                summary: "checkpoint created".to_string(),
                payload: None,
                timestamp: chrono::Utc::now(),
            });
            Ok(())
        })?;
        Ok(checkpoint)
    }

    /// Restores a task's session from a checkpoint, replacing the current
    /// session state with the snapshot and recording a `Restored` entry.
    pub fn restore(&self, task_id: &str, checkpoint_id: &str) -> SessionMemoryResult<SessionMemory> {
        let checkpoint = self
            .store
            .get_checkpoint(checkpoint_id)?
            .ok_or_else(|| SessionMemoryError::CheckpointNotFound(checkpoint_id.to_string()))?;
        let mut restored = checkpoint.snapshot;
        restored.progress.push(ProgressEntry {
            kind: ProgressKind::Restored {
                checkpoint_id: checkpoint_id.to_string(),
            },
            phase: restored.phase,
            attempt: restored.attempts.len() as u32,
            summary: format!("restored from {checkpoint_id}"),
            payload: None,
            timestamp: chrono::Utc::now(),
        });
        self.store.put_session(&restored)?;
        let _ = task_id;
        Ok(restored)
    }

    /// The most recent `limit` error-kind progress entries.
    pub fn get_recent_errors(&self, task_id: &str, limit: usize) -> StoreResult<Vec<ProgressEntry>> {
        let session = self.store.require_session(task_id)?;
        Ok(session
            .progress
            .into_iter()
            .rev()
            .filter(|e| e.kind.is_error())
            .take(limit)
            .collect())
    }

    /// Per-outcome counts across every recorded attempt.
    pub fn get_attempt_summary(&self, task_id: &str) -> StoreResult<Vec<(AttemptOutcome, usize)>> {
        let session = self.store.require_session(task_id)?;
        let mut counts: Vec<(AttemptOutcome, usize)> = Vec::new();
        for attempt in &session.attempts {
            match counts.iter_mut().find(|(o, _)| *o == attempt.outcome) {
                Some((_, n)) => *n += 1,
                None => counts.push((attempt.outcome, 1)),
            }
        }
        Ok(counts)
    }

    pub fn get_failure_patterns(&self, task_id: &str) -> StoreResult<Vec<FailurePattern>> {
        Ok(self.store.require_session(task_id)?.failure_patterns)
    }
}

fn merge_failure_pattern(session: &mut SessionMemory, reason: &str) {
    let normalized = normalize_pattern(reason);
    if let Some(existing) = session
        .failure_patterns
        .iter_mut()
        .find(|p| p.pattern == normalized)
    {
        existing.occurrences += 1;
        existing.last_seen = chrono::Utc::now();
    } else {
        session.failure_patterns.push(FailurePattern {
            pattern: normalized,
            occurrences: 1,
            last_seen: chrono::Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn create_then_log_progress_advances_phase_and_counters() {
        let (_dir, store) = temp_store();
        let ops = SessionMemoryOps::new(&store);
        ops.create("t1").unwrap();
        let session = ops
            .log_progress(
                "t1",
                ProgressKind::Error {
                    error_kind: "compile".into(),
                },
                Phase::Coding,
                1,
                "build failed",
                None,
            )
            .unwrap();
        assert_eq!(session.error_count, 1);
        assert_eq!(session.phase, Phase::Coding);
    }

    #[test]
    fn start_attempt_rejects_overlapping_attempts() {
        let (_dir, store) = temp_store();
        let ops = SessionMemoryOps::new(&store);
        ops.create("t1").unwrap();
        ops.start_attempt("t1", 1).unwrap();
        assert!(ops.start_attempt("t1", 2).is_err());
    }

    #[test]
    fn end_attempt_merges_failure_pattern_occurrences() {
        let (_dir, store) = temp_store();
        let ops = SessionMemoryOps::new(&store);
        ops.create("t1").unwrap();
        ops.start_attempt("t1", 1).unwrap();
        ops.end_attempt(
            "t1",
            AttemptOutcome::TestsFailed,
            None,
            None,
            Some("error at src/lib.rs:42:7: expected `i32`, found `&str`".into()),
            None,
        )
        .unwrap();
        ops.start_attempt("t1", 2).unwrap();
        ops.end_attempt(
            "t1",
            AttemptOutcome::TestsFailed,
            None,
            None,
            Some("error at src/lib.rs:99:3: expected `u64`, found `&String`".into()),
            None,
        )
        .unwrap();

        let patterns = ops.get_failure_patterns("t1").unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].occurrences, 2);
    }

    #[test]
    fn set_agent_output_is_write_once() {
        let (_dir, store) = temp_store();
        let ops = SessionMemoryOps::new(&store);
        ops.create("t1").unwrap();
        ops.set_agent_output("t1", "coder", serde_json::json!({"diff": "x"}))
            .unwrap();
        assert!(matches!(
            ops.set_agent_output("t1", "coder", serde_json::json!({"diff": "y"})),
            Err(SessionMemoryError::OutputAlreadySet(_))
        ));
    }

    #[test]
    fn checkpoint_then_restore_round_trips_state() {
        let (_dir, store) = temp_store();
        let ops = SessionMemoryOps::new(&store);
        ops.create("t1").unwrap();
        ops.start_attempt("t1", 1).unwrap();
        let checkpoint = ops.checkpoint("t1", Some("pre-risky-step".into())).unwrap();

        ops.end_attempt("t1", AttemptOutcome::Error, None, None, Some("boom".into()), None)
            .unwrap();

        let restored = ops.restore("t1", &checkpoint.id).unwrap();
        assert_eq!(restored.attempts.last().unwrap().outcome, AttemptOutcome::InProgress);
    }

    #[test]
    fn attempt_summary_counts_by_outcome() {
        let (_dir, store) = temp_store();
        let ops = SessionMemoryOps::new(&store);
        ops.create("t1").unwrap();
        ops.start_attempt("t1", 1).unwrap();
        ops.end_attempt("t1", AttemptOutcome::Success, None, None, None, None)
            .unwrap();
        let summary = ops.get_attempt_summary("t1").unwrap();
        assert_eq!(summary, vec![(AttemptOutcome::Success, 1)]);
    }
}
