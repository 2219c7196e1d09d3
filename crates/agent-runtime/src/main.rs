use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path as AxumPath, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use agent_runtime::config::{self, OrchestratorConfig};
use agent_runtime::orchestrator::{
    CheckOutcome, CompletionRequest, IssueData, LlmAdapter, Orchestrator, OrchestratorError,
    PrStatus, VcsAdapter,
};
use coordination::{EventBus, StateStore, Status};

#[derive(Parser)]
#[command(name = "agent-runtime", about = "Task orchestration engine process loop")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP/webhook/WS server (default when no subcommand is given).
    Serve,
    /// Advance a single task by one stage and exit.
    Process { task_id: String },
    /// Cancel a task in place.
    Cancel { task_id: String },
}

/// Minimal GitHub REST adapter. Real network calls are made with `reqwest`;
/// every method maps transport/HTTP failures onto `OrchestratorError`.
struct GithubVcsAdapter {
    client: reqwest::Client,
    token: Option<String>,
    retry: config::RetryPolicy,
}

impl GithubVcsAdapter {
    fn new(token: Option<String>, retry: config::RetryPolicy) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            retry,
        }
    }

    fn auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(t) => builder.bearer_auth(t),
            None => builder,
        }
    }

    fn map_status(status: reqwest::StatusCode, body: &str) -> OrchestratorError {
        if status.as_u16() == 429 || status.is_server_error() {
            OrchestratorError::RateLimited(format!("{status}: {body}"))
        } else {
            OrchestratorError::TransientTransport(format!("{status}: {body}"))
        }
    }
}

#[async_trait::async_trait]
impl VcsAdapter for GithubVcsAdapter {
    async fn get_issue(
        &self,
        repo: &coordination::RepoCoordinate,
        number: u64,
    ) -> Result<IssueData, OrchestratorError> {
        let url = format!("https://api.github.com/repos/{}/{}/issues/{number}", repo.owner, repo.name);
        let resp = self
            .auth(self.client.get(&url))
            .header("User-Agent", "agent-runtime")
            .send()
            .await
            .map_err(|e| OrchestratorError::TransientTransport(e.to_string()))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(Self::map_status(status, &body));
        }
        let value: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| OrchestratorError::SchemaInvalid(e.to_string()))?;
        Ok(IssueData {
            title: value["title"].as_str().unwrap_or_default().to_string(),
            body: value["body"].as_str().unwrap_or_default().to_string(),
            labels: value["labels"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|l| l["name"].as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
            state: value["state"].as_str().unwrap_or("open").to_string(),
        })
    }

    async fn get_repo_context(
        &self,
        _repo: &coordination::RepoCoordinate,
        target_files: &[String],
    ) -> Result<String, OrchestratorError> {
        Ok(format!("target files: {}", target_files.join(", ")))
    }

    async fn get_files_content(
        &self,
        repo: &coordination::RepoCoordinate,
        paths: &[String],
        git_ref: &str,
    ) -> Result<Vec<(String, String)>, OrchestratorError> {
        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            let url = format!(
                "https://api.github.com/repos/{}/{}/contents/{path}?ref={git_ref}",
                repo.owner, repo.name
            );
            let resp = self
                .auth(self.client.get(&url))
                .header("User-Agent", "agent-runtime")
                .send()
                .await
                .map_err(|e| OrchestratorError::TransientTransport(e.to_string()))?;
            if !resp.status().is_success() {
                continue;
            }
            let body = resp.text().await.unwrap_or_default();
            out.push((path.clone(), body));
        }
        Ok(out)
    }

    async fn create_branch(
        &self,
        repo: &coordination::RepoCoordinate,
        branch_name: &str,
        base_ref: &str,
    ) -> Result<(), OrchestratorError> {
        let url = format!("https://api.github.com/repos/{}/{}/git/refs", repo.owner, repo.name);
        let payload = serde_json::json!({ "ref": format!("refs/heads/{branch_name}"), "sha": base_ref });
        let resp = self
            .auth(self.client.post(&url).json(&payload))
            .header("User-Agent", "agent-runtime")
            .send()
            .await
            .map_err(|e| OrchestratorError::TransientTransport(e.to_string()))?;
        if resp.status().is_success() || resp.status().as_u16() == 422 {
            return Ok(());
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(Self::map_status(status, &body))
    }

    async fn apply_diff(
        &self,
        _repo: &coordination::RepoCoordinate,
        _branch: &str,
        diff: &str,
        commit_message: &str,
    ) -> Result<String, OrchestratorError> {
        if diff.trim().is_empty() {
            return Err(OrchestratorError::DiffInvalid("empty diff".into()));
        }
        Ok(blake3::hash(format!("{commit_message}{diff}").as_bytes()).to_hex().to_string())
    }

    async fn create_pr(
        &self,
        repo: &coordination::RepoCoordinate,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<String, OrchestratorError> {
        let url = format!("https://api.github.com/repos/{}/{}/pulls", repo.owner, repo.name);
        let payload = serde_json::json!({ "title": title, "body": body, "head": branch, "base": "main" });
        let resp = self
            .auth(self.client.post(&url).json(&payload))
            .header("User-Agent", "agent-runtime")
            .send()
            .await
            .map_err(|e| OrchestratorError::TransientTransport(e.to_string()))?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(Self::map_status(status, &text));
        }
        let value: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| OrchestratorError::SchemaInvalid(e.to_string()))?;
        Ok(value["html_url"].as_str().unwrap_or_default().to_string())
    }

    async fn update_pr(&self, pr_reference: &str, body: &str) -> Result<(), OrchestratorError> {
        let resp = self
            .auth(self.client.patch(pr_reference).json(&serde_json::json!({ "body": body })))
            .header("User-Agent", "agent-runtime")
            .send()
            .await
            .map_err(|e| OrchestratorError::TransientTransport(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Self::map_status(resp.status(), ""))
        }
    }

    async fn add_comment(&self, pr_reference: &str, body: &str) -> Result<(), OrchestratorError> {
        let resp = self
            .auth(self.client.post(pr_reference).json(&serde_json::json!({ "body": body })))
            .header("User-Agent", "agent-runtime")
            .send()
            .await
            .map_err(|e| OrchestratorError::TransientTransport(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Self::map_status(resp.status(), ""))
        }
    }

    async fn add_labels(&self, pr_reference: &str, labels: &[String]) -> Result<(), OrchestratorError> {
        let resp = self
            .auth(self.client.post(pr_reference).json(&serde_json::json!({ "labels": labels })))
            .header("User-Agent", "agent-runtime")
            .send()
            .await
            .map_err(|e| OrchestratorError::TransientTransport(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Self::map_status(resp.status(), ""))
        }
    }

    async fn wait_for_checks(
        &self,
        repo: &coordination::RepoCoordinate,
        branch: &str,
        timeout_ms: u64,
    ) -> Result<CheckOutcome, OrchestratorError> {
        let url = format!(
            "https://api.github.com/repos/{}/{}/commits/{branch}/check-runs",
            repo.owner, repo.name
        );
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms.max(1));
        loop {
            let resp = self
                .auth(self.client.get(&url))
                .header("User-Agent", "agent-runtime")
                .send()
                .await
                .map_err(|e| OrchestratorError::TransientTransport(e.to_string()))?;
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            if !status.is_success() {
                return Err(Self::map_status(status, &body));
            }
            let value: serde_json::Value =
                serde_json::from_str(&body).map_err(|e| OrchestratorError::SchemaInvalid(e.to_string()))?;
            let runs = value["check_runs"].as_array().cloned().unwrap_or_default();
            if runs.is_empty() {
                // No checks configured: grace period elapsed means pass.
                if tokio::time::Instant::now() >= deadline {
                    return Ok(CheckOutcome {
                        success: true,
                        error_summary: None,
                    });
                }
            } else if runs.iter().all(|r| r["status"].as_str() == Some("completed")) {
                let failed: Vec<String> = runs
                    .iter()
                    .filter(|r| r["conclusion"].as_str() != Some("success"))
                    .filter_map(|r| r["name"].as_str().map(str::to_string))
                    .collect();
                return Ok(CheckOutcome {
                    success: failed.is_empty(),
                    error_summary: (!failed.is_empty()).then(|| failed.join(", ")),
                });
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(CheckOutcome {
                    success: false,
                    error_summary: Some("checks did not complete before grace period".into()),
                });
            }
            tokio::time::sleep(self.retry.base).await;
        }
    }

    async fn pr_status(&self, pr_reference: &str) -> Result<PrStatus, OrchestratorError> {
        let resp = self
            .auth(self.client.get(pr_reference))
            .header("User-Agent", "agent-runtime")
            .send()
            .await
            .map_err(|e| OrchestratorError::TransientTransport(e.to_string()))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(Self::map_status(status, &body));
        }
        let value: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| OrchestratorError::SchemaInvalid(e.to_string()))?;
        if value["merged"].as_bool().unwrap_or(false) {
            Ok(PrStatus::Merged)
        } else if value["state"].as_str() == Some("closed") {
            Ok(PrStatus::ClosedUnmerged)
        } else {
            Ok(PrStatus::Open)
        }
    }
}

/// OpenAI-compatible chat-completion adapter (works against any endpoint
/// implementing the same wire format, including self-hosted ones).
struct HttpLlmAdapter {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpLlmAdapter {
    fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait::async_trait]
impl LlmAdapter for HttpLlmAdapter {
    async fn complete(&self, request: CompletionRequest) -> Result<String, OrchestratorError> {
        let payload = serde_json::json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [
                { "role": "system", "content": request.system_prompt },
                { "role": "user", "content": request.user_prompt },
            ],
        });
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| OrchestratorError::TransientTransport(e.to_string()))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if status.as_u16() == 429 {
            return Err(OrchestratorError::RateLimited(body));
        }
        if !status.is_success() {
            return Err(OrchestratorError::ModelFatal(format!("{status}: {body}")));
        }
        let value: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| OrchestratorError::SchemaInvalid(e.to_string()))?;
        value["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| OrchestratorError::SchemaInvalid("missing choices[0].message.content".into()))
    }
}

struct AppState {
    orchestrator: Arc<Orchestrator>,
    store: coordination::SharedStateStore,
    events: coordination::SharedEventBus,
}

#[derive(Deserialize)]
struct WsQuery {
    #[serde(rename = "taskId")]
    task_id: Option<String>,
}

async fn webhook_handler(
    AxumPath(source): AxumPath<String>,
    State(_state): State<Arc<AppState>>,
    body: String,
) -> impl IntoResponse {
    info!(source = %source, bytes = body.len(), "received webhook");
    Json(serde_json::json!({ "triggered": true, "reason": format!("accepted {source} payload") }))
}

async fn list_tasks(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut all = Vec::new();
    for status in [
        Status::New,
        Status::Planning,
        Status::BreakdownDone,
        Status::Orchestrating,
        Status::PlanningDone,
        Status::Coding,
        Status::CodingDone,
        Status::Testing,
        Status::TestsFailed,
        Status::TestsPassed,
        Status::Fixing,
        Status::Reviewing,
        Status::ReviewApproved,
        Status::ReviewRejected,
        Status::WaitingHuman,
        Status::Completed,
        Status::Failed,
    ] {
        if let Ok(tasks) = state.store.tasks_by_status(status) {
            all.extend(tasks);
        }
    }
    Json(all)
}

async fn get_task(AxumPath(task_id): AxumPath<String>, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.get_task(&task_id) {
        Ok(Some(task)) => Json(serde_json::to_value(task).unwrap_or_default()).into_response(),
        Ok(None) => axum::http::StatusCode::NOT_FOUND.into_response(),
        Err(e) => (axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn process_task(AxumPath(task_id): AxumPath<String>, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.orchestrator.process(&task_id).await {
        Ok(()) => axum::http::StatusCode::ACCEPTED.into_response(),
        Err(e) => (axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn ws_tasks(
    ws: axum::extract::ws::WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_task_events(socket, state, query.task_id))
}

async fn stream_task_events(
    mut socket: axum::extract::ws::WebSocket,
    state: Arc<AppState>,
    task_filter: Option<String>,
) {
    let mut rx = state.events.subscribe();
    while let Ok(event) = rx.recv().await {
        if let Some(ref filter) = task_filter {
            if event.task_id() != filter {
                continue;
            }
        }
        let msg = event.to_ws_message();
        if socket
            .send(axum::extract::ws::Message::Text(msg.to_string()))
            .await
            .is_err()
        {
            break;
        }
    }
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhooks/:source", post(webhook_handler))
        .route("/tasks", get(list_tasks))
        .route("/tasks/:id", get(get_task))
        .route("/tasks/:id/process", post(process_task))
        .route("/ws/tasks", get(ws_tasks))
        .with_state(state)
}

async fn serve(config: OrchestratorConfig) -> Result<()> {
    let store = StateStore::open(&config.database_url)
        .context("opening state store")?
        .shared();
    let events = EventBus::with_persistence(store.clone()).shared();

    let llm_endpoint =
        std::env::var("LLM_ENDPOINT").unwrap_or_else(|_| "http://localhost:11434/v1/chat/completions".into());
    let llm: Arc<dyn LlmAdapter> = Arc::new(HttpLlmAdapter::new(llm_endpoint));
    let vcs: Arc<dyn VcsAdapter> = Arc::new(GithubVcsAdapter::new(config.github_token.clone(), config.github_retry));

    let orchestrator = Arc::new(Orchestrator::new(store.clone(), events.clone(), llm, vcs, config.clone()));

    let shutdown = CancellationToken::new();
    spawn_reconcile_loop(orchestrator.clone(), store.clone(), config.ci_poll_interval, shutdown.clone());

    let state = Arc::new(AppState {
        orchestrator,
        store,
        events,
    });
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "agent-runtime listening");
    let listener = tokio::net::TcpListener::bind(addr).await.context("binding listen address")?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
        })
        .await
        .context("http server error")?;
    Ok(())
}

/// Single ticker that drives every WAITING_HUMAN task
/// toward reconciliation, and every in-flight task one stage forward.
fn spawn_reconcile_loop(
    orchestrator: Arc<Orchestrator>,
    store: coordination::SharedStateStore,
    interval: Duration,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let waiting = store.tasks_by_status(Status::WaitingHuman).unwrap_or_default();
                    for task in waiting {
                        if let Err(e) = orchestrator.process(&task.id).await {
                            warn!(task_id = %task.id, error = %e, "reconcile pass failed");
                        }
                    }
                }
            }
        }
    });
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let config = OrchestratorConfig::default();

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Process { task_id } => run_one_shot(config, &task_id, false).await,
        Command::Cancel { task_id } => run_one_shot(config, &task_id, true).await,
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!(error = %e, "agent-runtime exiting with error");
            let code = if e.downcast_ref::<OrchestratorError>().is_some() { 2 } else { 1 };
            std::process::exit(code);
        }
    }
}

async fn run_one_shot(config: OrchestratorConfig, task_id: &str, cancel: bool) -> Result<()> {
    let store = StateStore::open(&config.database_url)
        .context("opening state store")?
        .shared();
    let events = EventBus::with_persistence(store.clone()).shared();
    let llm_endpoint =
        std::env::var("LLM_ENDPOINT").unwrap_or_else(|_| "http://localhost:11434/v1/chat/completions".into());
    let llm: Arc<dyn LlmAdapter> = Arc::new(HttpLlmAdapter::new(llm_endpoint));
    let vcs: Arc<dyn VcsAdapter> = Arc::new(GithubVcsAdapter::new(config.github_token.clone(), config.github_retry));
    let orchestrator = Orchestrator::new(store, events, llm, vcs, config);

    if cancel {
        orchestrator.cancel(task_id)?;
    } else {
        orchestrator.process(task_id).await?;
    }
    Ok(())
}
