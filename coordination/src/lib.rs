//! Deterministic, non-LLM coordination engine for the task orchestration
//! system: persistent task state, the task-event bus and history,
//! position-keyed model routing, the diff engine, dependency scheduling,
//! task breakdown, diff aggregation, session memory operations, and the
//! retry/escalation policy. The agent-facing orchestrator loop lives in
//! the `agent-runtime` crate and is built on top of these primitives.

#![allow(dead_code)]

pub mod aggregator;
pub mod breakdown;
pub mod diff;
pub mod escalation;
pub mod events;
pub mod feedback;
pub mod router;
pub mod scheduler;
pub mod session_memory;
pub mod state;

pub use aggregator::{aggregate_child_diffs, AggregationConflict, AggregationError, AggregationOutcome};

pub use breakdown::{breakdown_plan, BreakdownError, BreakdownInput, CandidateFile};

pub use diff::{
    align_hunk, apply_file_diff, combine, detect_conflicts, normalize_ws, parse_unified_diff,
    regenerate_diff_text, serialize_file_diff, serialize_unified_diff, Alignment, Conflict,
    ConflictResolution, DiffError, DiffLine, DiffResult, FileDiff, Hunk, MatchKind, SubtaskDiff,
    UnifiedDiff,
};

pub use escalation::{
    EscalationConfig, EscalationEngine, EscalationLevel, RetryDecision, SchemaFailureTracker,
    StorageFatalTracker, MAX_ATTEMPTS_ERROR,
};

pub use events::{
    EventBus, EventBusError, EventBusExt, EventBusResult, EventFilter, EventHistory, EventId,
    EventLevel, EventStats, FilteredReceiver, HistoryError, HistoryResult, ReplayBuilder,
    ReplayStats, SharedEventBus, TaskEventKind,
};

pub use feedback::{CompileResult, Compiler, ErrorCategory, ErrorSummary, ParsedError, RustcErrorParser};

pub use scheduler::{
    critical_path, find_parallel_groups, get_next_executable_subtasks, topological_sort,
    validate_no_cycles, SchedulerError, SubtaskGraph,
};

pub use session_memory::{SessionMemoryError, SessionMemoryOps};

pub use router::{
    CircuitBreaker, CircuitState, ComplexityFactors, EffortEstimator, FallbackLadder, ModelRouter,
    PreRoutingAnalysis, PreRoutingClassifier, RiskFactor, RiskKind, RiskLevel, TaskClassification,
    TaskType,
};

pub use state::{
    AttemptOutcome, AttemptRecord, Checkpoint, CoderEffort, Complexity, Effort, FailurePattern,
    IssueRef, ModelConfigAuditEntry, OrchestrationState, Phase, Position, ProgressEntry,
    ProgressKind, RepoCoordinate, SessionMemory, SharedStateStore, StateStore, Status, StoreError,
    StoreResult, Subtask, SubtaskDefinition, SubtaskId, SubtaskStatus, Task, TaskId, Verdict,
};
