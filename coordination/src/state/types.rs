//! Core data model for the task orchestration engine.
//!
//! These types are the persisted, typed session state described in the
//! design notes: no dynamically-typed JSON blobs cross a module boundary —
//! serde enforces the schema at every store read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type TaskId = String;
pub type SubtaskId = String;

/// Orchestrator state machine status. See `state_machine.rs` for the legal
/// transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    New,
    Planning,
    PlanningDone,
    BreakdownDone,
    Orchestrating,
    Coding,
    CodingDone,
    Testing,
    TestsFailed,
    Fixing,
    TestsPassed,
    Reviewing,
    ReviewApproved,
    ReviewRejected,
    WaitingHuman,
    Completed,
    Failed,
}

impl Status {
    /// Terminal statuses never advance.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self).unwrap_or_default();
        write!(f, "{}", s.as_str().unwrap_or("unknown"))
    }
}

/// T-shirt complexity estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Xs,
    S,
    M,
    L,
    Xl,
}

/// Effort estimate, independent of complexity (a large but mechanical
/// change is XL/low-effort; a tiny but tricky change is XS/high-effort).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effort {
    Low,
    Medium,
    High,
}

/// Reviewer verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    RequestChanges,
    NeedsDiscussion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoCoordinate {
    pub owner: String,
    pub name: String,
}

impl RepoCoordinate {
    /// Parses `"owner/repo"`. Rejects any other format, per the VCS
    /// adapter's `parseRepo` contract.
    pub fn parse(s: &str) -> Result<Self, String> {
        let mut parts = s.splitn(3, '/');
        let owner = parts.next().filter(|p| !p.is_empty());
        let name = parts.next().filter(|p| !p.is_empty());
        if parts.next().is_some() || owner.is_none() || name.is_none() {
            return Err(format!("not a valid owner/repo coordinate: {s:?}"));
        }
        Ok(Self {
            owner: owner.unwrap().to_string(),
            name: name.unwrap().to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRef {
    pub number: u64,
    pub title: String,
    pub body: String,
}

/// A unit of work the Orchestrator drives through `Status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub repo: RepoCoordinate,
    pub issue: IssueRef,
    pub status: Status,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub parent_task_id: Option<TaskId>,
    pub subtask_index: Option<usize>,

    pub definition_of_done: Vec<String>,
    pub plan_steps: Vec<String>,
    pub target_files: Vec<String>,
    pub branch_name: Option<String>,
    pub current_diff: Option<String>,
    pub commit_message: Option<String>,
    pub pr_reference: Option<String>,

    pub estimated_complexity: Option<Complexity>,
    pub estimated_effort: Option<Effort>,

    pub is_orchestrated: bool,
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: TaskId, repo: RepoCoordinate, issue: IssueRef, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id,
            repo,
            issue,
            status: Status::New,
            attempt_count: 0,
            max_attempts,
            parent_task_id: None,
            subtask_index: None,
            definition_of_done: Vec::new(),
            plan_steps: Vec::new(),
            target_files: Vec::new(),
            branch_name: None,
            current_diff: None,
            commit_message: None,
            pr_reference: None,
            estimated_complexity: None,
            estimated_effort: None,
            is_orchestrated: false,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn child(
        id: TaskId,
        repo: RepoCoordinate,
        issue: IssueRef,
        parent_task_id: TaskId,
        subtask_index: usize,
        max_attempts: u32,
    ) -> Self {
        let mut t = Self::new(id, repo, issue, max_attempts);
        t.parent_task_id = Some(parent_task_id);
        t.subtask_index = Some(subtask_index);
        t
    }
}

// ---------------------------------------------------------------------
// Session Memory
// ---------------------------------------------------------------------

/// Coarser-grained phase, used for dashboards; `Status` is the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Orchestrating,
    Coding,
    Testing,
    Reviewing,
    Publishing,
    Done,
}

/// Progress ledger entry kind. A closed tagged union, per the design note
/// replacing "any"-typed event metadata — each variant carries only the
/// fields that kind needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressKind {
    Planned,
    Coded,
    Tested,
    TestsFailed,
    Reviewed,
    PrCreated,
    Error { error_kind: String },
    RetryTriggered,
    Escalated { to_model: String },
    SubtaskUpdated { subtask_id: SubtaskId },
    AggregationConflict { files: Vec<String> },
    Checkpointed { checkpoint_id: String },
    Restored { checkpoint_id: String },
    Cancelled,
}

impl ProgressKind {
    pub fn is_error(&self) -> bool {
        matches!(self, ProgressKind::Error { .. })
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, ProgressKind::RetryTriggered)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub kind: ProgressKind,
    pub phase: Phase,
    pub attempt: u32,
    pub summary: String,
    pub payload: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    InProgress,
    Success,
    TestsFailed,
    ReviewRejected,
    Error,
    MaxAttempts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: AttemptOutcome,
    pub diff: Option<String>,
    pub commit_message: Option<String>,
    pub failure_reason: Option<String>,
    pub failure_details: Option<String>,
    pub total_tokens: u64,
    pub total_duration_ms: u64,
}

impl AttemptRecord {
    pub fn start(attempt_number: u32) -> Self {
        Self {
            attempt_number,
            started_at: Utc::now(),
            ended_at: None,
            outcome: AttemptOutcome::InProgress,
            diff: None,
            commit_message: None,
            failure_reason: None,
            failure_details: None,
            total_tokens: 0,
            total_duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailurePattern {
    pub pattern: String,
    pub occurrences: u32,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMemory {
    pub task_id: TaskId,
    pub phase: Phase,
    pub progress: Vec<ProgressEntry>,
    pub attempts: Vec<AttemptRecord>,
    pub failure_patterns: Vec<FailurePattern>,
    pub error_count: u64,
    pub retry_count: u64,
    /// Write-once per agent name.
    pub outputs: HashMap<String, serde_json::Value>,
    pub orchestration: Option<OrchestrationState>,
    pub parent_task_id: Option<TaskId>,
    pub subtask_index: Option<usize>,
    pub last_checkpoint: Option<String>,
}

impl SessionMemory {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            phase: Phase::Planning,
            progress: Vec::new(),
            attempts: Vec::new(),
            failure_patterns: Vec::new(),
            error_count: 0,
            retry_count: 0,
            outputs: HashMap::new(),
            orchestration: None,
            parent_task_id: None,
            subtask_index: None,
            last_checkpoint: None,
        }
    }
}

// ---------------------------------------------------------------------
// Orchestration State (subtask-level sub-document)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskDefinition {
    pub id: SubtaskId,
    pub title: String,
    pub description: String,
    pub target_files: Vec<String>,
    pub dependencies: Vec<SubtaskId>,
    pub acceptance_criteria: Vec<String>,
    /// XS or S only, enforced by Breakdown before emission.
    pub estimated_complexity: Complexity,
    pub estimated_lines: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub def: SubtaskDefinition,
    pub status: SubtaskStatus,
    pub attempts: u32,
    pub child_task_id: Option<TaskId>,
    pub diff: Option<String>,
}

impl Subtask {
    pub fn new(def: SubtaskDefinition) -> Self {
        Self {
            def,
            status: SubtaskStatus::Pending,
            attempts: 0,
            child_task_id: None,
            diff: None,
        }
    }

    /// Enforces the `pending -> in_progress -> {completed,failed}` invariant;
    /// a completed subtask's diff is then immutable.
    pub fn transition(&mut self, to: SubtaskStatus) -> Result<(), String> {
        let legal = matches!(
            (self.status, to),
            (SubtaskStatus::Pending, SubtaskStatus::InProgress)
                | (SubtaskStatus::InProgress, SubtaskStatus::Completed)
                | (SubtaskStatus::InProgress, SubtaskStatus::Failed)
        );
        if !legal {
            return Err(format!(
                "illegal subtask transition {:?} -> {:?}",
                self.status, to
            ));
        }
        self.status = to;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OrchestrationState {
    pub subtasks: Vec<Subtask>,
    pub completed_subtasks: Vec<SubtaskId>,
    pub current_subtask: Option<SubtaskId>,
    pub aggregated_diff: Option<String>,
}

impl OrchestrationState {
    pub fn subtask(&self, id: &str) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| s.def.id == id)
    }

    pub fn subtask_mut(&mut self, id: &str) -> Option<&mut Subtask> {
        self.subtasks.iter_mut().find(|s| s.def.id == id)
    }

    pub fn all_terminal(&self) -> bool {
        self.subtasks
            .iter()
            .all(|s| matches!(s.status, SubtaskStatus::Completed | SubtaskStatus::Failed))
    }

    pub fn any_failed(&self) -> bool {
        self.subtasks
            .iter()
            .any(|s| s.status == SubtaskStatus::Failed)
    }
}

// ---------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub task_id: TaskId,
    pub reason: Option<String>,
    pub snapshot: SessionMemory,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// Model routing positions
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoderEffort {
    Low,
    Medium,
    High,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    Planner,
    Fixer,
    Reviewer,
    Escalation1,
    Escalation2,
    Coder {
        complexity: Complexity,
        effort: CoderEffort,
    },
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Position::Planner => write!(f, "planner"),
            Position::Fixer => write!(f, "fixer"),
            Position::Reviewer => write!(f, "reviewer"),
            Position::Escalation1 => write!(f, "escalation_1"),
            Position::Escalation2 => write!(f, "escalation_2"),
            Position::Coder { complexity, effort } => {
                let c = match complexity {
                    Complexity::Xs => "xs",
                    Complexity::S => "s",
                    Complexity::M => "m",
                    Complexity::L => "l",
                    Complexity::Xl => "xl",
                };
                let e = match effort {
                    CoderEffort::Low => "low",
                    CoderEffort::Medium => "medium",
                    CoderEffort::High => "high",
                    CoderEffort::Default => "default",
                };
                write!(f, "coder_{c}_{e}")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfigAuditEntry {
    pub position: String,
    pub old_model: Option<String>,
    pub new_model: String,
    pub changed_at: DateTime<Utc>,
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_coordinate_rejects_bad_formats() {
        assert!(RepoCoordinate::parse("owner/repo").is_ok());
        assert!(RepoCoordinate::parse("owner/repo/extra").is_err());
        assert!(RepoCoordinate::parse("owner").is_err());
        assert!(RepoCoordinate::parse("/repo").is_err());
    }

    #[test]
    fn subtask_transition_invariants() {
        let def = SubtaskDefinition {
            id: "s1".into(),
            title: "t".into(),
            description: "d".into(),
            target_files: vec![],
            dependencies: vec![],
            acceptance_criteria: vec![],
            estimated_complexity: Complexity::Xs,
            estimated_lines: 10,
        };
        let mut st = Subtask::new(def);
        assert!(st.transition(SubtaskStatus::Completed).is_err());
        assert!(st.transition(SubtaskStatus::InProgress).is_ok());
        assert!(st.transition(SubtaskStatus::Completed).is_ok());
        assert!(st.transition(SubtaskStatus::Failed).is_err());
    }

    #[test]
    fn position_display_matches_resolution_keys() {
        assert_eq!(Position::Planner.to_string(), "planner");
        assert_eq!(
            Position::Coder {
                complexity: Complexity::S,
                effort: CoderEffort::High
            }
            .to_string(),
            "coder_s_high"
        );
    }
}
