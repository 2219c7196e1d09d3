//! Orchestrator process loop: drives one [`Task`] through [`Status`]
//! a single stage at a time. Every external call (Agent Runner, VCS
//! adapter, Store) is a suspension point; `process()` must be safe to
//! re-enter after a restart using the persisted status as ground truth —
//! no in-memory workflow state lives across calls.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use coordination::{
    aggregate_child_diffs, breakdown_plan, get_next_executable_subtasks, AggregationConflict,
    AggregationError, BreakdownInput, CandidateFile, CoderEffort, Complexity, EscalationConfig,
    EscalationEngine, IssueRef, ModelRouter, OrchestrationState, Phase, Position, ProgressKind,
    RepoCoordinate, RetryDecision, SchemaFailureTracker, SessionMemoryOps, SharedEventBus,
    SharedStateStore, Status, StorageFatalTracker, Subtask, SubtaskDefinition, SubtaskId,
    SubtaskStatus, Task, TaskEventKind, TaskId, Verdict, MAX_ATTEMPTS_ERROR,
};

use crate::config::OrchestratorConfig;
use crate::contracts::{
    parse_coder_output, parse_fixer_output, parse_planner_output, parse_reviewer_output,
    CoderOutput, FixerOutput, PlannerOutput, ReviewerOutput, SchemaError,
};
use crate::state_machine::StateMachine;

// ---------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("transient transport error: {0}")]
    TransientTransport(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("model call exhausted retries: {0}")]
    ModelFatal(String),
    #[error("agent output failed schema validation: {0}")]
    SchemaInvalid(String),
    #[error("storage-fatal: {0}")]
    StorageFatal(String),
    #[error("diff is invalid: {0}")]
    DiffInvalid(String),
    #[error("aggregation conflict in {0} file(s)")]
    MergeConflict(usize),
    #[error("task cancelled")]
    Cancelled,
    #[error("store error: {0}")]
    Store(#[from] coordination::StoreError),
    #[error("session memory error: {0}")]
    SessionMemory(#[from] coordination::SessionMemoryError),
}

impl From<SchemaError> for OrchestratorError {
    fn from(e: SchemaError) -> Self {
        OrchestratorError::SchemaInvalid(e.to_string())
    }
}

impl From<coordination::BreakdownError> for OrchestratorError {
    fn from(e: coordination::BreakdownError) -> Self {
        OrchestratorError::DiffInvalid(e.to_string())
    }
}

impl OrchestratorError {
    /// Errors of this kind restore the last checkpoint
    /// before the stage is re-entered, rather than going through the
    /// ordinary stage-retry/escalation ladder.
    pub fn is_storage_fatal(&self) -> bool {
        matches!(self, OrchestratorError::StorageFatal(_))
    }

    pub fn last_error(&self) -> String {
        match self {
            OrchestratorError::TransientTransport(m) => format!("transient-transport: {m}"),
            OrchestratorError::RateLimited(m) => format!("rate-limited: {m}"),
            OrchestratorError::ModelFatal(m) => format!("model-fatal: {m}"),
            OrchestratorError::SchemaInvalid(m) => format!("schema-invalid: {m}"),
            OrchestratorError::StorageFatal(m) => format!("storage-fatal: {m}"),
            OrchestratorError::DiffInvalid(m) => format!("diff-invalid: {m}"),
            OrchestratorError::MergeConflict(n) => format!("merge-conflict: {n} file(s)"),
            OrchestratorError::Cancelled => "cancelled".to_string(),
            OrchestratorError::Store(e) => format!("storage-fatal: {e}"),
            OrchestratorError::SessionMemory(e) => format!("storage-fatal: {e}"),
        }
    }
}

// ---------------------------------------------------------------------
// External interfaces — no concrete implementation lives in this
// crate, only the trait boundary and (behind #[cfg(test)]) stubs.
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct IssueData {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub state: String,
}

#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub success: bool,
    pub error_summary: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrStatus {
    Open,
    Merged,
    ClosedUnmerged,
}

/// The VCS surface the Orchestrator depends on.
#[async_trait]
pub trait VcsAdapter: Send + Sync {
    async fn get_issue(&self, repo: &RepoCoordinate, number: u64) -> Result<IssueData, OrchestratorError>;

    async fn get_repo_context(
        &self,
        repo: &RepoCoordinate,
        target_files: &[String],
    ) -> Result<String, OrchestratorError>;

    async fn get_files_content(
        &self,
        repo: &RepoCoordinate,
        paths: &[String],
        git_ref: &str,
    ) -> Result<Vec<(String, String)>, OrchestratorError>;

    async fn create_branch(&self, repo: &RepoCoordinate, branch_name: &str, base_ref: &str) -> Result<(), OrchestratorError>;

    async fn apply_diff(
        &self,
        repo: &RepoCoordinate,
        branch: &str,
        diff: &str,
        commit_message: &str,
    ) -> Result<String, OrchestratorError>;

    async fn create_pr(&self, repo: &RepoCoordinate, branch: &str, title: &str, body: &str) -> Result<String, OrchestratorError>;

    async fn update_pr(&self, pr_reference: &str, body: &str) -> Result<(), OrchestratorError>;

    async fn add_comment(&self, pr_reference: &str, body: &str) -> Result<(), OrchestratorError>;

    async fn add_labels(&self, pr_reference: &str, labels: &[String]) -> Result<(), OrchestratorError>;

    async fn wait_for_checks(&self, repo: &RepoCoordinate, branch: &str, timeout_ms: u64) -> Result<CheckOutcome, OrchestratorError>;

    /// Merge state for the WAITING_HUMAN reconcile loop.
    async fn pr_status(&self, pr_reference: &str) -> Result<PrStatus, OrchestratorError>;
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// The LLM completion surface the Agent Runner depends on.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String, OrchestratorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgentKind {
    Planner,
    Coder,
    Fixer,
    Reviewer,
}

impl AgentKind {
    fn name(self) -> &'static str {
        match self {
            AgentKind::Planner => "planner",
            AgentKind::Coder => "coder",
            AgentKind::Fixer => "fixer",
            AgentKind::Reviewer => "reviewer",
        }
    }
}

// ---------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------

pub struct Orchestrator {
    store: SharedStateStore,
    events: SharedEventBus,
    llm: Arc<dyn LlmAdapter>,
    vcs: Arc<dyn VcsAdapter>,
    escalation: EscalationEngine,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: SharedStateStore,
        events: SharedEventBus,
        llm: Arc<dyn LlmAdapter>,
        vcs: Arc<dyn VcsAdapter>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            events,
            llm,
            vcs,
            escalation: EscalationEngine::new(EscalationConfig::default()),
            config,
        }
    }

    fn session_ops(&self) -> SessionMemoryOps<'_> {
        SessionMemoryOps::new(&self.store)
    }

    /// The backing store, for callers that need to read task/session state
    /// without going through `process()`.
    pub fn store(&self) -> &SharedStateStore {
        &self.store
    }

    fn publish(&self, event: TaskEventKind) {
        if let Err(e) = self.events.publish(event) {
            warn!(error = %e, "failed to publish task event");
        }
    }

    fn status_changed(&self, task_id: &TaskId, from: Status, to: Status) {
        self.publish(TaskEventKind::StatusChanged {
            task_id: task_id.clone(),
            from: from.to_string(),
            to: to.to_string(),
            timestamp: chrono::Utc::now(),
        });
    }

    /// Advances a task one stage. Returns once the task has either
    /// suspended (WAITING_HUMAN, or ORCHESTRATING awaiting children) or
    /// reached a terminal status. Callers loop on this to drive a task to
    /// completion; each call is independently restart-safe.
    pub async fn process(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let task = self.store.require_task(task_id)?;

        let result = match task.status {
            Status::New => self.transition_only(task_id, Status::Planning).await,
            Status::Planning => self.run_planning(task_id).await,
            Status::BreakdownDone => self.run_breakdown(task_id).await,
            Status::Orchestrating => self.poll_orchestrating(task_id).await,
            Status::PlanningDone => self.transition_only(task_id, Status::Coding).await,
            Status::Coding => self.run_coding(task_id).await,
            Status::CodingDone => self.run_ci(task_id).await,
            Status::TestsFailed => self.run_fixing(task_id).await,
            Status::Fixing => self.transition_only(task_id, Status::Testing).await,
            Status::TestsPassed => self.transition_only(task_id, Status::Reviewing).await,
            Status::Reviewing => self.run_review(task_id).await,
            Status::ReviewApproved => self.publish_pr(task_id).await,
            Status::WaitingHuman => self.reconcile_waiting_human(task_id).await,
            Status::Testing | Status::ReviewRejected | Status::Completed | Status::Failed => Ok(()),
        };

        if let Err(ref e) = result {
            if e.is_storage_fatal() {
                self.restore_after_storage_fatal(task_id)?;
            }
        }
        result
    }

    /// Drives a task through repeated `process()` calls until it suspends
    /// or reaches a terminal status.
    pub async fn run_to_suspension(&self, task_id: &str) -> Result<Status, OrchestratorError> {
        loop {
            let before = self.store.require_task(task_id)?.status;
            self.process(task_id).await?;
            let after = self.store.require_task(task_id)?.status;
            if after == before || after.is_terminal() || after == Status::WaitingHuman {
                return Ok(after);
            }
        }
    }

    fn advance(&self, task: &mut Task, to: Status, reason: Option<&str>) -> Result<(), OrchestratorError> {
        let mut sm = StateMachine::new(task.status);
        sm.set_attempt(task.attempt_count);
        sm.advance(to, reason)
            .map_err(|e| OrchestratorError::StorageFatal(e.to_string()))?;
        let from = task.status;
        task.status = to;
        task.updated_at = chrono::Utc::now();
        self.store.put_task(task)?;
        self.status_changed(&task.id, from, to);
        self.session_ops().checkpoint(&task.id, Some(format!("{from} -> {to}")))?;
        Ok(())
    }

    async fn transition_only(&self, task_id: &str, to: Status) -> Result<(), OrchestratorError> {
        let mut task = self.store.require_task(task_id)?;
        self.advance(&mut task, to, None)
    }

    // -- Planning --------------------------------------------------------

    async fn run_planning(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let mut task = self.store.require_task(task_id)?;
        let repo_context = self.vcs.get_repo_context(&task.repo, &task.target_files).await?;

        let prompt = format!(
            "Issue: {}\n\n{}\n\nRepository context:\n{}",
            task.issue.title, task.issue.body, repo_context
        );
        let output: PlannerOutput = self
            .run_agent(AgentKind::Planner, &task, Position::Planner, &prompt)
            .await?;

        task.definition_of_done = output.definition_of_done.clone();
        task.plan_steps = output.plan_steps.clone();
        task.target_files = output.target_files.clone();
        task.estimated_complexity = Some(output.estimated_complexity);
        task.estimated_effort = Some(output.estimated_effort);
        self.store.put_task(&task)?;

        self.session_ops().log_progress(
            task_id,
            ProgressKind::Planned,
            Phase::Planning,
            task.attempt_count,
            "planner produced a plan",
            None,
        )?;
        self.publish(TaskEventKind::Planned {
            task_id: task.id.clone(),
            estimated_complexity: format!("{:?}", output.estimated_complexity),
            timestamp: chrono::Utc::now(),
        });

        let next = if matches!(output.estimated_complexity, Complexity::M | Complexity::L | Complexity::Xl) {
            Status::BreakdownDone
        } else {
            Status::PlanningDone
        };
        self.advance(&mut task, next, None)
    }

    // -- Breakdown / orchestrated children --------------------------------

    async fn run_breakdown(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let mut task = self.store.require_task(task_id)?;
        let input = BreakdownInput {
            task_title: task.issue.title.clone(),
            files: task
                .target_files
                .iter()
                .map(|path| CandidateFile {
                    path: path.clone(),
                    estimated_lines: 25,
                })
                .collect(),
        };
        let defs = breakdown_plan(&input)?;

        let orchestration = OrchestrationState {
            subtasks: defs.iter().cloned().map(Subtask::new).collect(),
            completed_subtasks: Vec::new(),
            current_subtask: None,
            aggregated_diff: None,
        };
        self.store.upsert_orchestration_state(task_id, orchestration)?;

        for (idx, def) in defs.iter().enumerate() {
            let child_id = format!("{task_id}-{}", def.id);
            let mut child = Task::child(
                child_id.clone(),
                task.repo.clone(),
                IssueRef {
                    number: task.issue.number,
                    title: def.title.clone(),
                    body: def.description.clone(),
                },
                task_id.to_string(),
                idx,
                task.max_attempts,
            );
            child.target_files = def.target_files.clone();
            child.definition_of_done = def.acceptance_criteria.clone();
            child.estimated_complexity = Some(def.estimated_complexity);
            self.store.put_task(&child)?;
            self.session_ops().create(&child_id)?;
            self.publish(TaskEventKind::SubtaskDispatched {
                task_id: task.id.clone(),
                subtask_id: def.id.clone(),
                child_task_id: child_id,
                timestamp: chrono::Utc::now(),
            });
        }

        task.is_orchestrated = true;
        self.store.put_task(&task)?;
        self.advance(&mut task, Status::Orchestrating, None)
    }

    /// Poll-driven: reconciles finished children into subtask status,
    /// dispatches newly-executable subtasks, and runs the Aggregator once
    /// every subtask is terminal.
    async fn poll_orchestrating(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let mut task = self.store.require_task(task_id)?;
        let session = self.store.require_session(task_id)?;
        let mut orch = session.orchestration.clone().ok_or_else(|| {
            OrchestratorError::DiffInvalid("orchestrating task has no orchestration state".into())
        })?;

        let children = self.store.child_tasks_of(task_id)?;
        for child in &children {
            let Some(idx) = child.subtask_index else { continue };
            let Some(subtask_id) = orch.subtasks.get(idx).map(|s| s.def.id.clone()) else {
                continue;
            };
            let current = orch.subtask(&subtask_id).map(|s| s.status);
            let target = match child.status {
                Status::Completed => Some(SubtaskStatus::Completed),
                Status::Failed => Some(SubtaskStatus::Failed),
                Status::New => None,
                _ => Some(SubtaskStatus::InProgress),
            };
            if let Some(to) = target {
                if is_forward(current, to) {
                    orch = self
                        .store
                        .update_subtask_status(task_id, &subtask_id, to, child.current_diff.clone())?;
                }
            }
        }

        if orch.any_failed() {
            self.session_ops().log_progress(
                task_id,
                ProgressKind::Error {
                    error_kind: "subtask-failed".into(),
                },
                Phase::Orchestrating,
                task.attempt_count,
                "a subtask failed terminally",
                None,
            )?;
            task.last_error = Some("subtask failed".into());
            return self.advance(&mut task, Status::Failed, Some("subtask failed"));
        }

        if orch.all_terminal() {
            return match aggregate_child_diffs(&self.store, task_id) {
                Ok(Ok(outcome)) => {
                    task.current_diff = Some(outcome.diff_text);
                    self.store.put_task(&task)?;
                    self.advance(&mut task, Status::CodingDone, None)
                }
                Ok(Err(AggregationConflict { conflicts })) => {
                    let files: Vec<String> = conflicts.iter().map(|c| c.file.clone()).collect();
                    self.publish(TaskEventKind::AggregationConflict {
                        task_id: task.id.clone(),
                        files: files.clone(),
                        timestamp: chrono::Utc::now(),
                    });
                    task.last_error = Some(format!("merge-conflict: {}", files.join(", ")));
                    self.advance(&mut task, Status::WaitingHuman, Some("aggregation conflict"))
                }
                Err(AggregationError::NothingToAggregate) => {
                    task.last_error = Some("no completed subtasks to aggregate".into());
                    self.advance(&mut task, Status::Failed, Some("nothing to aggregate"))
                }
                Err(e) => Err(OrchestratorError::DiffInvalid(e.to_string())),
            };
        }

        let completed: HashSet<SubtaskId> = orch.completed_subtasks.iter().cloned().collect();
        let in_progress: HashSet<SubtaskId> = orch
            .subtasks
            .iter()
            .filter(|s| s.status == SubtaskStatus::InProgress)
            .map(|s| s.def.id.clone())
            .collect();
        let defs: Vec<SubtaskDefinition> = orch.subtasks.iter().map(|s| s.def.clone()).collect();
        let ready = get_next_executable_subtasks(&defs, &completed, &in_progress, self.config.max_parallel);
        for subtask_id in ready {
            self.store
                .update_subtask_status(task_id, &subtask_id, SubtaskStatus::InProgress, None)?;
        }
        Ok(())
    }

    // -- Coding ------------------------------------------------------------

    async fn run_coding(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let mut task = self.store.require_task(task_id)?;
        self.session_ops().start_attempt(task_id, task.attempt_count + 1)?;

        let complexity = task.estimated_complexity.unwrap_or(Complexity::S);
        let effort = coder_effort(task.estimated_effort);
        let decision = self.escalation.decide_coder(task.attempt_count, task.attempt_count, complexity, effort);

        let position = match decision {
            RetryDecision::Retry { position, .. } => position,
            RetryDecision::WaitingHuman { last_error } => {
                task.last_error = Some(last_error);
                return self.advance(&mut task, Status::WaitingHuman, Some(MAX_ATTEMPTS_ERROR));
            }
        };

        let prompt = format!(
            "Plan: {:?}\nTarget files: {:?}\nDefinition of done: {:?}",
            task.plan_steps, task.target_files, task.definition_of_done
        );
        let outcome: Result<CoderOutput, OrchestratorError> =
            self.run_agent(AgentKind::Coder, &task, position, &prompt).await;

        let output = match outcome {
            Ok(o) => o,
            Err(e) => {
                self.session_ops().end_attempt(
                    task_id,
                    coordination::AttemptOutcome::Error,
                    None,
                    None,
                    Some(e.last_error()),
                    None,
                )?;
                task.attempt_count += 1;
                self.store.put_task(&task)?;
                return Err(e);
            }
        };

        task.current_diff = Some(output.diff.clone());
        task.commit_message = Some(output.commit_message.clone());
        task.attempt_count += 1;
        self.store.put_task(&task)?;
        self.session_ops().end_attempt(
            task_id,
            coordination::AttemptOutcome::Success,
            Some(output.diff),
            Some(output.commit_message),
            None,
            None,
        )?;
        self.publish(TaskEventKind::Coded {
            task_id: task.id.clone(),
            agent: position.to_string(),
            tokens_used: None,
            duration_ms: None,
            timestamp: chrono::Utc::now(),
        });
        self.advance(&mut task, Status::CodingDone, None)
    }

    // -- CI / testing --------------------------------------------------

    async fn run_ci(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let mut task = self.store.require_task(task_id)?;
        let branch = task.branch_name.clone().unwrap_or_else(|| format!("orchestrator/{task_id}"));
        let diff = task.current_diff.clone().unwrap_or_default();
        let commit_message = task.commit_message.clone().unwrap_or_else(|| "automated change".into());

        self.vcs.create_branch(&task.repo, &branch, "main").await?;
        self.vcs.apply_diff(&task.repo, &branch, &diff, &commit_message).await?;
        task.branch_name = Some(branch.clone());
        self.store.put_task(&task)?;

        self.advance(&mut task, Status::Testing, None)?;

        let outcome = self
            .vcs
            .wait_for_checks(&task.repo, &branch, self.config.ci_grace_period.as_millis() as u64)
            .await?;
        self.publish(TaskEventKind::Tested {
            task_id: task.id.clone(),
            success: outcome.success,
            message: outcome.error_summary.clone(),
            timestamp: chrono::Utc::now(),
        });

        let mut task = self.store.require_task(task_id)?;
        if outcome.success {
            self.session_ops().log_progress(
                task_id,
                ProgressKind::Tested,
                Phase::Testing,
                task.attempt_count,
                "CI passed",
                None,
            )?;
            self.advance(&mut task, Status::TestsPassed, None)
        } else {
            let summary = outcome.error_summary.unwrap_or_else(|| "CI failed".into());
            task.last_error = Some(summary.clone());
            self.store.put_task(&task)?;
            self.session_ops().log_progress(
                task_id,
                ProgressKind::TestsFailed,
                Phase::Testing,
                task.attempt_count,
                summary,
                None,
            )?;
            self.advance(&mut task, Status::TestsFailed, None)
        }
    }

    async fn run_fixing(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let mut task = self.store.require_task(task_id)?;
        self.advance(&mut task, Status::Fixing, None)?;

        let decision = self.escalation.decide_stage(task.attempt_count, task.attempt_count, Position::Fixer);
        let position = match decision {
            RetryDecision::Retry { position, .. } => position,
            RetryDecision::WaitingHuman { last_error } => {
                task.last_error = Some(last_error);
                return self.advance(&mut task, Status::WaitingHuman, Some(MAX_ATTEMPTS_ERROR));
            }
        };

        let patterns = self.session_ops().get_failure_patterns(task_id)?;
        let recurring: Vec<String> = patterns
            .iter()
            .filter(|p| p.occurrences >= 2)
            .map(|p| p.pattern.clone())
            .collect();
        let prompt = format!(
            "Previous diff:\n{}\n\nLast error:\n{}\n\nRecurring failure patterns: {:?}",
            task.current_diff.clone().unwrap_or_default(),
            task.last_error.clone().unwrap_or_default(),
            recurring
        );

        self.session_ops().start_attempt(task_id, task.attempt_count + 1)?;
        let outcome: Result<FixerOutput, OrchestratorError> =
            self.run_agent(AgentKind::Fixer, &task, position, &prompt).await;
        let output = match outcome {
            Ok(o) => o,
            Err(e) => {
                self.session_ops().end_attempt(
                    task_id,
                    coordination::AttemptOutcome::Error,
                    None,
                    None,
                    Some(e.last_error()),
                    None,
                )?;
                task.attempt_count += 1;
                self.store.put_task(&task)?;
                return Err(e);
            }
        };

        task.current_diff = Some(output.diff.clone());
        task.commit_message = Some(output.commit_message.clone());
        task.attempt_count += 1;
        self.store.put_task(&task)?;
        self.session_ops().end_attempt(
            task_id,
            coordination::AttemptOutcome::Success,
            Some(output.diff.clone()),
            Some(output.commit_message.clone()),
            None,
            None,
        )?;

        let branch = task.branch_name.clone().unwrap_or_else(|| format!("orchestrator/{task_id}"));
        self.vcs.apply_diff(&task.repo, &branch, &output.diff, &output.commit_message).await?;
        self.advance(&mut task, Status::Testing, None)?;

        let outcome = self
            .vcs
            .wait_for_checks(&task.repo, &branch, self.config.ci_grace_period.as_millis() as u64)
            .await?;
        self.publish(TaskEventKind::Tested {
            task_id: task.id.clone(),
            success: outcome.success,
            message: outcome.error_summary.clone(),
            timestamp: chrono::Utc::now(),
        });

        let mut task = self.store.require_task(task_id)?;
        if outcome.success {
            self.session_ops().log_progress(
                task_id,
                ProgressKind::Tested,
                Phase::Testing,
                task.attempt_count,
                "CI passed",
                None,
            )?;
            self.advance(&mut task, Status::TestsPassed, None)
        } else {
            let summary = outcome.error_summary.unwrap_or_else(|| "CI failed".into());
            task.last_error = Some(summary.clone());
            self.store.put_task(&task)?;
            self.session_ops().log_progress(
                task_id,
                ProgressKind::TestsFailed,
                Phase::Testing,
                task.attempt_count,
                summary,
                None,
            )?;
            self.advance(&mut task, Status::TestsFailed, None)
        }
    }

    // -- Review --------------------------------------------------------

    async fn run_review(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let mut task = self.store.require_task(task_id)?;
        let decision = self.escalation.decide_stage(task.attempt_count, task.attempt_count, Position::Reviewer);
        let position = match decision {
            RetryDecision::Retry { position, .. } => position,
            RetryDecision::WaitingHuman { last_error } => {
                task.last_error = Some(last_error);
                return self.advance(&mut task, Status::WaitingHuman, Some(MAX_ATTEMPTS_ERROR));
            }
        };

        let prompt = format!(
            "Diff under review:\n{}\n\nDefinition of done: {:?}",
            task.current_diff.clone().unwrap_or_default(),
            task.definition_of_done
        );
        let output: ReviewerOutput = self.run_agent(AgentKind::Reviewer, &task, position, &prompt).await?;

        self.publish(TaskEventKind::Reviewed {
            task_id: task.id.clone(),
            verdict: format!("{:?}", output.verdict),
            timestamp: chrono::Utc::now(),
        });
        self.session_ops().log_progress(
            task_id,
            ProgressKind::Reviewed,
            Phase::Reviewing,
            task.attempt_count,
            format!("{:?}", output.verdict),
            None,
        )?;

        match output.verdict {
            Verdict::Approve => self.advance(&mut task, Status::ReviewApproved, None),
            Verdict::RequestChanges | Verdict::NeedsDiscussion => {
                task.last_error = Some(output.comments.join("; "));
                self.store.put_task(&task)?;
                self.advance(&mut task, Status::ReviewRejected, None)?;
                let mut task = self.store.require_task(task_id)?;
                self.advance(&mut task, Status::Coding, None)
            }
        }
    }

    async fn publish_pr(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let mut task = self.store.require_task(task_id)?;
        let branch = task.branch_name.clone().unwrap_or_else(|| format!("orchestrator/{task_id}"));
        let pr_reference = match &task.pr_reference {
            Some(existing) => {
                self.vcs.update_pr(existing, &task.issue.title).await?;
                existing.clone()
            }
            None => {
                self.vcs
                    .create_pr(&task.repo, &branch, &task.issue.title, &task.issue.body)
                    .await?
            }
        };
        task.pr_reference = Some(pr_reference.clone());
        self.store.put_task(&task)?;
        self.publish(TaskEventKind::PrCreated {
            task_id: task.id.clone(),
            pr_reference,
            timestamp: chrono::Utc::now(),
        });
        self.advance(&mut task, Status::WaitingHuman, None)
    }

    /// Reconcile job: queries the VCS for the PR's merge state. Only moves
    /// the task off WAITING_HUMAN when the PR has actually resolved.
    async fn reconcile_waiting_human(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let mut task = self.store.require_task(task_id)?;
        let Some(pr_reference) = task.pr_reference.clone() else {
            return Ok(());
        };
        match self.vcs.pr_status(&pr_reference).await? {
            PrStatus::Open => Ok(()),
            PrStatus::Merged => self.advance(&mut task, Status::Completed, None),
            PrStatus::ClosedUnmerged => {
                task.last_error = Some("PR closed without merge".into());
                self.advance(&mut task, Status::Failed, Some("closed-unmerged"))
            }
        }
    }

    /// Cooperative cancellation: sets `Status=Failed`, `lastError="cancelled"`.
    pub fn cancel(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let mut task = self.store.require_task(task_id)?;
        if task.status.is_terminal() {
            return Ok(());
        }
        task.last_error = Some("cancelled".into());
        self.store.put_task(&task)?;
        self.session_ops().log_progress(
            task_id,
            ProgressKind::Cancelled,
            Phase::Done,
            task.attempt_count,
            "task cancelled",
            None,
        )?;
        self.publish(TaskEventKind::Cancelled {
            task_id: task.id.clone(),
            timestamp: chrono::Utc::now(),
        });
        self.advance(&mut task, Status::Failed, Some("cancelled"))
    }

    fn restore_after_storage_fatal(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let mut tracker = StorageFatalTracker::default();
        let fatal = tracker.record_restoration();
        let session = self.store.require_session(task_id)?;
        if let Some(checkpoint_id) = session.last_checkpoint.clone() {
            self.session_ops().restore(task_id, &checkpoint_id)?;
        }
        if fatal {
            let mut task = self.store.require_task(task_id)?;
            task.last_error = Some("storage-fatal: repeated checkpoint restoration".into());
            self.store.put_task(&task)?;
            self.advance(&mut task, Status::Failed, Some("storage-fatal"))?;
        }
        Ok(())
    }

    // -- Agent Runner ----------------------------------------------------

    async fn run_agent<T>(
        &self,
        kind: AgentKind,
        task: &Task,
        position: Position,
        prompt: &str,
    ) -> Result<T, OrchestratorError>
    where
        T: ParseAgentOutput,
    {
        let model = ModelRouter::new(self.store.clone())
            .model_for(position)
            .unwrap_or_else(|_| position.to_string());

        let mut schema_tracker = SchemaFailureTracker::default();
        let mut last_err = None;
        for _attempt in 0..self.config.llm_retry.max_attempts {
            let request = CompletionRequest {
                model: model.clone(),
                system_prompt: format!("You are the {} agent.", kind.name()),
                user_prompt: prompt.to_string(),
                max_tokens: 4096,
                temperature: 0.2,
            };
            let raw = match self.llm.complete(request).await {
                Ok(text) => text,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            match T::parse(&raw) {
                Ok(parsed) => {
                    self.session_ops()
                        .set_agent_output(&task.id, kind.name(), serde_json::json!({ "raw": raw }))
                        .ok();
                    return Ok(parsed);
                }
                Err(e) => {
                    let fatal = schema_tracker.record_failure();
                    last_err = Some(OrchestratorError::SchemaInvalid(e.to_string()));
                    if fatal {
                        break;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| OrchestratorError::ModelFatal(format!("{} exhausted retries", kind.name()))))
    }
}

trait ParseAgentOutput: Sized {
    fn parse(raw: &str) -> Result<Self, SchemaError>;
}

impl ParseAgentOutput for PlannerOutput {
    fn parse(raw: &str) -> Result<Self, SchemaError> {
        parse_planner_output(raw)
    }
}

impl ParseAgentOutput for CoderOutput {
    fn parse(raw: &str) -> Result<Self, SchemaError> {
        parse_coder_output(raw)
    }
}

impl ParseAgentOutput for FixerOutput {
    fn parse(raw: &str) -> Result<Self, SchemaError> {
        parse_fixer_output(raw)
    }
}

impl ParseAgentOutput for ReviewerOutput {
    fn parse(raw: &str) -> Result<Self, SchemaError> {
        parse_reviewer_output(raw)
    }
}

fn coder_effort(effort: Option<coordination::Effort>) -> CoderEffort {
    match effort {
        Some(coordination::Effort::Low) => CoderEffort::Low,
        Some(coordination::Effort::Medium) => CoderEffort::Medium,
        Some(coordination::Effort::High) => CoderEffort::High,
        None => CoderEffort::Default,
    }
}

/// A subtask's status only ever moves Pending -> InProgress -> {Completed,
/// Failed}; this rejects a stale/out-of-order reconcile from clobbering a
/// terminal status back to InProgress.
fn is_forward(current: Option<SubtaskStatus>, to: SubtaskStatus) -> bool {
    use SubtaskStatus::*;
    match (current, to) {
        (None, _) => false,
        (Some(Pending), InProgress) => true,
        (Some(InProgress), Completed) | (Some(InProgress), Failed) => true,
        _ => false,
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{ScriptedLlm, StubVcs};
    use super::*;
    use coordination::StateStore;

    fn orchestrator(llm: ScriptedLlm, config: OrchestratorConfig) -> (tempfile::TempDir, Orchestrator) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap().shared();
        let events = coordination::EventBus::new().shared();
        (
            dir,
            Orchestrator::new(store, events, Arc::new(llm), Arc::new(StubVcs), config),
        )
    }

    fn seed_task(orch: &Orchestrator, task_id: &str) {
        let task = Task::new(
            task_id.to_string(),
            RepoCoordinate::parse("acme/widgets").unwrap(),
            IssueRef {
                number: 1,
                title: "Add function sum(a,b) returning a+b in src/math.ts".into(),
                body: "body".into(),
            },
            3,
        );
        orch.store.put_task(&task).unwrap();
        orch.session_ops().create(task_id).unwrap();
    }

    #[tokio::test]
    async fn xs_task_happy_path_reaches_completed() {
        let planner = r#"{"definitionOfDone":["exports sum","sum(2,3)=5"],"planSteps":["add sum() to src/math.ts"],"targetFiles":["src/math.ts"],"estimatedComplexity":"xs","estimatedEffort":"low"}"#;
        let coder = r#"{"diff":"--- a/src/math.ts\n+++ b/src/math.ts\n@@ -1,1 +1,2 @@\n ctx\n+export function sum(a,b){return a+b}\n","commitMessage":"add sum","filesModified":["src/math.ts"]}"#;
        let reviewer = r#"{"verdict":"approve","comments":[]}"#;
        let llm = ScriptedLlm::new(vec![
            Ok(planner.to_string()),
            Ok(coder.to_string()),
            Ok(reviewer.to_string()),
        ]);
        let (_dir, orch) = orchestrator(llm, OrchestratorConfig::test_config("unused"));
        seed_task(&orch, "t1");

        let mut status = orch.store.require_task("t1").unwrap().status;
        let mut guard = 0;
        while !status.is_terminal() {
            orch.process("t1").await.unwrap();
            status = orch.store.require_task("t1").unwrap().status;
            guard += 1;
            assert!(guard < 50, "orchestrator did not converge");
        }

        assert_eq!(status, Status::Completed);
        let task = orch.store.require_task("t1").unwrap();
        assert_eq!(task.attempt_count, 1);
        assert!(task.pr_reference.is_some());
    }

    #[tokio::test]
    async fn cancel_sets_failed_with_cancelled_reason() {
        let (_dir, orch) = orchestrator(ScriptedLlm::new(vec![]), OrchestratorConfig::test_config("unused"));
        seed_task(&orch, "t2");
        orch.cancel("t2").unwrap();
        let task = orch.store.require_task("t2").unwrap();
        assert_eq!(task.status, Status::Failed);
        assert_eq!(task.last_error.as_deref(), Some("cancelled"));
    }
}
