//! End-to-end scenarios driving the Orchestrator against in-file mock
//! adapters — no live LLM or VCS calls. Mirrors the orchestration smoke
//! test's style of defining mocks directly in the integration test rather
//! than reusing the crate's own unit-test stubs, since those live behind
//! `#[cfg(test)]` inside the library and aren't visible from here.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use agent_runtime::config::OrchestratorConfig;
use agent_runtime::orchestrator::{
    CheckOutcome, CompletionRequest, IssueData, LlmAdapter, Orchestrator, OrchestratorError,
    PrStatus, VcsAdapter,
};
use coordination::{
    breakdown_plan, critical_path, CandidateFile, Complexity, EventBus, IssueRef, ModelRouter,
    Position, RepoCoordinate, StateStore, Status, Task, TaskId,
};

/// Replays a fixed queue of LLM responses in order, regardless of which
/// task or stage is asking, and records the model string each request
/// carried so tests can tell which `Position` the router resolved.
struct ScriptedLlm {
    responses: Mutex<Vec<Result<String, String>>>,
    models_seen: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(|s| Ok(s.to_string())).collect()),
            models_seen: Mutex::new(Vec::new()),
        }
    }

    fn models_seen(&self) -> Vec<String> {
        self.models_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmAdapter for ScriptedLlm {
    async fn complete(&self, request: CompletionRequest) -> Result<String, OrchestratorError> {
        self.models_seen.lock().unwrap().push(request.model);
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(OrchestratorError::ModelFatal("no scripted response left".into()));
        }
        match responses.remove(0) {
            Ok(text) => Ok(text),
            Err(msg) => Err(OrchestratorError::TransientTransport(msg)),
        }
    }
}

/// A VCS stub that always succeeds, with CI checks configurable to fail a
/// fixed number of times before passing — for exercising the fixer loop.
struct FakeVcs {
    ci_failures_remaining: AtomicU32,
}

impl FakeVcs {
    fn always_green() -> Self {
        Self { ci_failures_remaining: AtomicU32::new(0) }
    }

    fn fails_ci_times(n: u32) -> Self {
        Self { ci_failures_remaining: AtomicU32::new(n) }
    }
}

#[async_trait]
impl VcsAdapter for FakeVcs {
    async fn get_issue(&self, _repo: &RepoCoordinate, _number: u64) -> Result<IssueData, OrchestratorError> {
        Ok(IssueData { title: "stub".into(), body: "stub".into(), labels: vec![], state: "open".into() })
    }

    async fn get_repo_context(&self, _repo: &RepoCoordinate, _target_files: &[String]) -> Result<String, OrchestratorError> {
        Ok(String::new())
    }

    async fn get_files_content(
        &self,
        _repo: &RepoCoordinate,
        paths: &[String],
        _git_ref: &str,
    ) -> Result<Vec<(String, String)>, OrchestratorError> {
        Ok(paths.iter().map(|p| (p.clone(), String::new())).collect())
    }

    async fn create_branch(&self, _repo: &RepoCoordinate, _branch_name: &str, _base_ref: &str) -> Result<(), OrchestratorError> {
        Ok(())
    }

    async fn apply_diff(
        &self,
        _repo: &RepoCoordinate,
        _branch: &str,
        _diff: &str,
        _commit_message: &str,
    ) -> Result<String, OrchestratorError> {
        Ok("deadbeef".into())
    }

    async fn create_pr(&self, _repo: &RepoCoordinate, _branch: &str, _title: &str, _body: &str) -> Result<String, OrchestratorError> {
        Ok("pr-1".into())
    }

    async fn update_pr(&self, _pr_reference: &str, _body: &str) -> Result<(), OrchestratorError> {
        Ok(())
    }

    async fn add_comment(&self, _pr_reference: &str, _body: &str) -> Result<(), OrchestratorError> {
        Ok(())
    }

    async fn add_labels(&self, _pr_reference: &str, _labels: &[String]) -> Result<(), OrchestratorError> {
        Ok(())
    }

    async fn wait_for_checks(&self, _repo: &RepoCoordinate, _branch: &str, _timeout_ms: u64) -> Result<CheckOutcome, OrchestratorError> {
        let remaining = self.ci_failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.ci_failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Ok(CheckOutcome { success: false, error_summary: Some("assertion mismatch in sum()".into()) });
        }
        Ok(CheckOutcome { success: true, error_summary: None })
    }

    async fn pr_status(&self, _pr_reference: &str) -> Result<PrStatus, OrchestratorError> {
        Ok(PrStatus::Merged)
    }
}

fn new_orchestrator(llm: Arc<dyn LlmAdapter>, vcs: impl VcsAdapter + 'static, dir: &std::path::Path) -> Orchestrator {
    let store = StateStore::open(dir).unwrap().shared();
    let events = EventBus::new().shared();
    Orchestrator::new(store, events, llm, Arc::new(vcs), OrchestratorConfig::test_config(dir.to_string_lossy()))
}

fn seed_root_task(orch: &Orchestrator, task_id: &str, title: &str) {
    let task = Task::new(
        task_id.to_string(),
        RepoCoordinate::parse("acme/widgets").unwrap(),
        IssueRef { number: 1, title: title.to_string(), body: "body".into() },
        3,
    );
    orch.store().put_task(&task).unwrap();
    coordination::SessionMemoryOps::new(orch.store()).create(task_id).unwrap();
}

async fn run_until_terminal(orch: &Orchestrator, task_id: &str, max_steps: u32) -> Status {
    let mut status = orch.store().require_task(task_id).unwrap().status;
    let mut steps = 0;
    while !status.is_terminal() {
        orch.process(task_id).await.unwrap();
        status = orch.store().require_task(task_id).unwrap().status;
        steps += 1;
        assert!(steps < max_steps, "orchestrator did not converge within {max_steps} steps (stuck at {status:?})");
    }
    status
}

const PLANNER_XS: &str = r#"{"definitionOfDone":["exports sum","sum(2,3)=5"],"planSteps":["add sum() to src/math.ts"],"targetFiles":["src/math.ts"],"estimatedComplexity":"xs","estimatedEffort":"low"}"#;
const CODER_SUM: &str = r#"{"diff":"--- a/src/math.ts\n+++ b/src/math.ts\n@@ -1,1 +1,2 @@\n ctx\n+export function sum(a,b){return a+b}\n","commitMessage":"add sum","filesModified":["src/math.ts"]}"#;
const REVIEWER_APPROVE: &str = r#"{"verdict":"approve","comments":[]}"#;

#[tokio::test]
async fn xs_task_completes_in_one_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedLlm::new(vec![PLANNER_XS, CODER_SUM, REVIEWER_APPROVE]));
    let orch = new_orchestrator(llm, FakeVcs::always_green(), dir.path());
    seed_root_task(&orch, "t1", "Add function sum(a,b) returning a+b in src/math.ts");

    let status = run_until_terminal(&orch, "t1", 30).await;

    assert_eq!(status, Status::Completed);
    let task = orch.store().require_task("t1").unwrap();
    assert_eq!(task.attempt_count, 1);
    assert!(task.pr_reference.is_some());
    assert_eq!(task.target_files, vec!["src/math.ts".to_string()]);
}

#[tokio::test]
async fn fixer_recovers_from_one_ci_failure() {
    let dir = tempfile::tempdir().unwrap();
    let fixer_output = r#"{"diff":"--- a/src/math.ts\n+++ b/src/math.ts\n@@ -1,2 +1,2 @@\n ctx\n-export function sum(a,b){return a-b}\n+export function sum(a,b){return a+b}\n","commitMessage":"fix sum","filesModified":["src/math.ts"],"fixDescription":"corrected operator"}"#;
    let llm = Arc::new(ScriptedLlm::new(vec![PLANNER_XS, CODER_SUM, fixer_output, REVIEWER_APPROVE]));
    let orch = new_orchestrator(llm, FakeVcs::fails_ci_times(1), dir.path());
    seed_root_task(&orch, "t2", "Add function sum(a,b) returning a+b in src/math.ts");

    let status = run_until_terminal(&orch, "t2", 30).await;

    assert_eq!(status, Status::Completed);
    let task = orch.store().require_task("t2").unwrap();
    assert_eq!(task.attempt_count, 2, "coder attempt plus one fixer attempt");
    assert!(task.commit_message.as_deref() == Some("fix sum"));
}

/// Drives a breakdown with a shared directory anchor (`types.ts`) through
/// both children to completion, and checks the dependency/critical-path
/// shape the Breakdown and Scheduler engines derive for that same input.
#[tokio::test]
async fn breakdown_respects_subtask_dependency() {
    let dir = tempfile::tempdir().unwrap();
    let planner_child = r#"{"definitionOfDone":["compiles"],"planSteps":["implement"],"targetFiles":["src/feature/types.ts"],"estimatedComplexity":"xs","estimatedEffort":"low"}"#;
    let coder_child0 = r#"{"diff":"--- a/src/feature/types.ts\n+++ b/src/feature/types.ts\n@@ -1,1 +1,2 @@\n ctx\n+export type Widget = { id: string };\n","commitMessage":"add Widget type","filesModified":["src/feature/types.ts"]}"#;
    let coder_child1 = r#"{"diff":"--- a/src/feature/b.ts\n+++ b/src/feature/b.ts\n@@ -1,1 +1,2 @@\n ctx\n+export function useWidget() {}\n","commitMessage":"add useWidget","filesModified":["src/feature/b.ts"]}"#;
    let llm = Arc::new(ScriptedLlm::new(vec![
        planner_child, coder_child0, REVIEWER_APPROVE,
        planner_child, coder_child1, REVIEWER_APPROVE,
        REVIEWER_APPROVE,
    ]));
    let orch = new_orchestrator(llm, FakeVcs::always_green(), dir.path());

    let task = Task::new(
        "p1".to_string(),
        RepoCoordinate::parse("acme/widgets").unwrap(),
        IssueRef { number: 1, title: "Build the widget feature".into(), body: "body".into() },
        3,
    );
    let mut task = task;
    task.status = Status::BreakdownDone;
    task.target_files = vec![
        "src/feature/types.ts".to_string(),
        "src/feature/a.ts".to_string(),
        "src/feature/b.ts".to_string(),
    ];
    orch.store().put_task(&task).unwrap();
    coordination::SessionMemoryOps::new(orch.store()).create("p1").unwrap();

    orch.process("p1").await.unwrap();
    assert_eq!(orch.store().require_task("p1").unwrap().status, Status::Orchestrating);

    let children = orch.store().child_tasks_of("p1").unwrap();
    assert_eq!(children.len(), 2, "types.ts + a.ts merge into one subtask, b.ts stays separate");
    assert_eq!(children[0].target_files, vec!["src/feature/types.ts".to_string(), "src/feature/a.ts".to_string()]);
    assert_eq!(children[1].target_files, vec!["src/feature/b.ts".to_string()]);

    run_until_terminal(&orch, &children[0].id, 30).await;
    run_until_terminal(&orch, &children[1].id, 30).await;

    let status = run_until_terminal(&orch, "p1", 20).await;
    assert_eq!(status, Status::Completed);

    let parent = orch.store().require_task("p1").unwrap();
    let diff = parent.current_diff.unwrap();
    assert!(diff.contains("Widget"));
    assert!(diff.contains("useWidget"));

    let defs = breakdown_plan(&coordination::BreakdownInput {
        task_title: "Build the widget feature".into(),
        files: task
            .target_files
            .iter()
            .map(|path| CandidateFile { path: path.clone(), estimated_lines: 25 })
            .collect(),
    })
    .unwrap();
    assert_eq!(defs.len(), 2);
    let anchor = defs.iter().find(|d| d.target_files.contains(&"src/feature/types.ts".to_string())).unwrap();
    let dependent = defs.iter().find(|d| d.id != anchor.id).unwrap();
    assert!(dependent.dependencies.contains(&anchor.id));
    assert_eq!(critical_path(&defs).unwrap(), 2, "the dependent subtask sits one behind its anchor");
}

/// Two children whose diffs touch overlapping line ranges of the same file
/// can't be combined automatically; the parent must stop at WAITING_HUMAN
/// with the conflicting files recorded.
#[tokio::test]
async fn aggregation_conflict_routes_to_waiting_human() {
    let dir = tempfile::tempdir().unwrap();
    let planner_child = r#"{"definitionOfDone":["compiles"],"planSteps":["implement"],"targetFiles":["src/feature/x.ts"],"estimatedComplexity":"xs","estimatedEffort":"low"}"#;
    let coder_child0 = r#"{"diff":"--- a/src/feature/x.ts\n+++ b/src/feature/x.ts\n@@ -1,2 +1,2 @@\n-a\n+A\n b\n","commitMessage":"child0 edit","filesModified":["src/feature/x.ts"]}"#;
    let coder_child1 = r#"{"diff":"--- a/src/feature/x.ts\n+++ b/src/feature/x.ts\n@@ -1,1 +1,1 @@\n-a\n+AA\n","commitMessage":"child1 edit","filesModified":["src/feature/x.ts"]}"#;
    let llm = Arc::new(ScriptedLlm::new(vec![
        planner_child, coder_child0, REVIEWER_APPROVE,
        planner_child, coder_child1, REVIEWER_APPROVE,
    ]));
    let orch = new_orchestrator(llm, FakeVcs::always_green(), dir.path());

    let mut task = Task::new(
        "p2".to_string(),
        RepoCoordinate::parse("acme/widgets").unwrap(),
        IssueRef { number: 1, title: "Build the widget feature".into(), body: "body".into() },
        3,
    );
    task.status = Status::BreakdownDone;
    task.target_files = vec![
        "src/feature/types.ts".to_string(),
        "src/feature/a.ts".to_string(),
        "src/feature/b.ts".to_string(),
    ];
    orch.store().put_task(&task).unwrap();
    coordination::SessionMemoryOps::new(orch.store()).create("p2").unwrap();

    orch.process("p2").await.unwrap();
    let children = orch.store().child_tasks_of("p2").unwrap();
    assert_eq!(children.len(), 2);

    run_until_terminal(&orch, &children[0].id, 30).await;
    run_until_terminal(&orch, &children[1].id, 30).await;

    // Reconciling a completed child moves its subtask status Pending ->
    // InProgress on one poll and InProgress -> Completed on the next, so
    // it takes two polls before the Aggregator sees both as terminal.
    let mut parent_status = Status::Orchestrating;
    for _ in 0..5 {
        orch.process("p2").await.unwrap();
        parent_status = orch.store().require_task("p2").unwrap().status;
        if parent_status != Status::Orchestrating {
            break;
        }
    }
    assert_eq!(parent_status, Status::WaitingHuman);

    let parent = orch.store().require_task("p2").unwrap();
    assert_eq!(parent.status, Status::WaitingHuman);
    assert!(parent.last_error.as_deref().unwrap().contains("merge-conflict"));
    assert!(parent.last_error.as_deref().unwrap().contains("src/feature/x.ts"));
}

/// A Coder that returns unparseable output three times in a row (base
/// position, `max_attempts = 3`) forces the fourth attempt to escalation_1,
/// where a valid diff finally lands.
#[tokio::test]
async fn coder_escalates_after_repeated_schema_failures() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedLlm::new(vec!["not json at all", "still not json", "nope", CODER_SUM]));
    let orch = new_orchestrator(Arc::clone(&llm), FakeVcs::always_green(), dir.path());

    let mut task = Task::new(
        "t3".to_string(),
        RepoCoordinate::parse("acme/widgets").unwrap(),
        IssueRef { number: 1, title: "Add sum()".into(), body: "body".into() },
        9,
    );
    task.status = Status::Coding;
    task.estimated_complexity = Some(Complexity::S);
    task.plan_steps = vec!["add sum() to src/math.ts".into()];
    task.target_files = vec!["src/math.ts".into()];
    orch.store().put_task(&task).unwrap();
    coordination::SessionMemoryOps::new(orch.store()).create("t3").unwrap();

    let router = ModelRouter::new(orch.store().clone());
    router
        .set_model(
            Position::Coder { complexity: coordination::Complexity::S, effort: coordination::CoderEffort::Default },
            "coder-base-model",
            None,
        )
        .unwrap();
    router.set_model(Position::Escalation1, "coder-escalation-model", None).unwrap();

    for _ in 0..3 {
        assert!(orch.process("t3").await.is_err(), "schema-invalid coder output must fail the stage");
    }
    assert_eq!(orch.store().require_task("t3").unwrap().status, Status::Coding);
    assert_eq!(orch.store().require_task("t3").unwrap().attempt_count, 3);

    orch.process("t3").await.unwrap();
    let task = orch.store().require_task("t3").unwrap();
    assert_eq!(task.status, Status::CodingDone);
    assert_eq!(task.attempt_count, 4);
    assert_eq!(
        llm.models_seen().last().map(String::as_str),
        Some("coder-escalation-model"),
        "the fourth attempt must route through escalation_1, not the base coder position"
    );
}

/// The orchestrator must resume a task purely from persisted state: no
/// in-memory workflow data survives dropping the `Orchestrator` and
/// reopening the same store path.
#[tokio::test]
async fn orchestrator_resumes_from_checkpoint_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let task_id: TaskId = "t4".to_string();

    {
        let llm = Arc::new(ScriptedLlm::new(vec![PLANNER_XS]));
        let orch = new_orchestrator(llm, FakeVcs::always_green(), dir.path());
        seed_root_task(&orch, &task_id, "Add function sum(a,b) returning a+b in src/math.ts");

        orch.process(&task_id).await.unwrap(); // New -> Planning
        orch.process(&task_id).await.unwrap(); // Planning -> PlanningDone
        assert_eq!(orch.store().require_task(&task_id).unwrap().status, Status::PlanningDone);
    } // orchestrator, store and its rocksdb handle are dropped here

    let llm = Arc::new(ScriptedLlm::new(vec![CODER_SUM, REVIEWER_APPROVE]));
    let orch = new_orchestrator(llm, FakeVcs::always_green(), dir.path());

    let status = run_until_terminal(&orch, &task_id, 30).await;

    assert_eq!(status, Status::Completed);
    let task = orch.store().require_task(&task_id).unwrap();
    assert_eq!(task.plan_steps, vec!["add sum() to src/math.ts".to_string()], "plan survived the restart");
}
