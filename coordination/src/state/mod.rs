//! Persistent state for the task orchestration engine.
//!
//! The store uses RocksDB column families to logically separate tasks,
//! task events, session memory, checkpoints, model configuration and its
//! audit log, and repository records while sharing a single database
//! instance.

pub mod schema;
pub mod store;
pub mod types;

pub use store::{RetryPolicy, SharedStateStore, StateStore, StoreError, StoreResult};
pub use types::{
    AttemptOutcome, AttemptRecord, Checkpoint, CoderEffort, Complexity, Effort, FailurePattern,
    IssueRef, ModelConfigAuditEntry, OrchestrationState, Phase, Position, ProgressEntry,
    ProgressKind, RepoCoordinate, SessionMemory, Status, Subtask, SubtaskDefinition, SubtaskId,
    SubtaskStatus, Task, TaskId, Verdict,
};
