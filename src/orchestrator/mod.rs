//! # Orchestrator
//!
//! The long-lived variant: run records, re-execution, and a live event
//! stream for a dashboard collaborator.
//!
//! Wire surface:
//!
//! - `POST /run` `{label?, mode?}` → `{"runId": …}` — register and start;
//! - `POST /runs/{id}/retry` → `{"runId": …}` — re-execute an existing run
//!   (same id), replaying cached dependencies;
//! - `GET /runs` → `{"runs": [...]}`;
//! - `GET /health` → `{"status": "ok", "activeRunId": …}`;
//! - `GET /events` → SSE feed of lifecycle events, replayed from the
//!   beginning for subscribers that join mid-run.
//!
//! Event payloads pass through redaction before they reach the wire.

use crate::context::{ExportRegistry, Extensions};
use crate::discovery::{self, RunConfig, SuiteIndex};
use crate::errors::EngineError;
use crate::events::{EventKind, EventPublisher, RunEvents};
use crate::limits::EngineLimits;
use crate::planner;
use crate::protocol::{RunStatus, SuiteResult};
use crate::redaction;
use crate::report::{self, PerfCollector};
use crate::scheduler::{self, SchedulerOptions};
use crate::steps::{input::NonInteractiveInput, ExecutionServices, StepExecutor};
use crate::transport::ReqwestTransport;
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Lifecycle state of a registered run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Registered,
    Running,
    Success,
    Failure,
    Error,
}

/// One run as reported by `GET /runs`.
#[derive(Debug, Clone, Serialize)]
pub struct LiveRunRecord {
    pub run_id: String,
    pub label: Option<String>,
    pub state: RunState,
    pub registered_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
}

/// Shared orchestrator state.
#[derive(Clone)]
pub struct OrchestratorState {
    root: PathBuf,
    limits: Arc<EngineLimits>,
    publisher: Arc<EventPublisher>,
    runs: Arc<RwLock<HashMap<String, LiveRunRecord>>>,
    run_order: Arc<RwLock<Vec<String>>>,
    active: Arc<RwLock<Option<String>>>,
    /// Suite results of each finished run, for cached-replay on retry.
    prior: Arc<RwLock<HashMap<String, Vec<SuiteResult>>>>,
}

impl OrchestratorState {
    pub fn new(root: PathBuf, limits: EngineLimits) -> Self {
        Self {
            root,
            limits: Arc::new(limits),
            publisher: EventPublisher::new(1024),
            runs: Arc::new(RwLock::new(HashMap::new())),
            run_order: Arc::new(RwLock::new(Vec::new())),
            active: Arc::new(RwLock::new(None)),
            prior: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn publisher(&self) -> Arc<EventPublisher> {
        Arc::clone(&self.publisher)
    }

    /// Register a run and emit `run_registered`.
    pub async fn register(&self, label: Option<String>) -> String {
        let run_id = Uuid::new_v4().to_string();
        let record = LiveRunRecord {
            run_id: run_id.clone(),
            label: label.clone(),
            state: RunState::Registered,
            registered_at: Utc::now(),
            started_at: None,
            finished_at: None,
            success_rate: None,
        };
        self.runs.write().await.insert(run_id.clone(), record);
        self.run_order.write().await.push(run_id.clone());
        self.publisher
            .publish(&run_id, EventKind::RunRegistered { label });
        run_id
    }

    pub async fn records(&self) -> Vec<LiveRunRecord> {
        let runs = self.runs.read().await;
        let order = self.run_order.read().await;
        order.iter().filter_map(|id| runs.get(id).cloned()).collect()
    }

    pub async fn active_run(&self) -> Option<String> {
        self.active.read().await.clone()
    }

    async fn transition(&self, run_id: &str, state: RunState, success_rate: Option<f64>) {
        let mut runs = self.runs.write().await;
        if let Some(record) = runs.get_mut(run_id) {
            match state {
                RunState::Running => record.started_at = Some(Utc::now()),
                RunState::Success | RunState::Failure | RunState::Error => {
                    record.finished_at = Some(Utc::now());
                    record.success_rate = success_rate;
                }
                RunState::Registered => {}
            }
            record.state = state;
        }
    }

    /// Execute one registered run to completion, emitting the lifecycle
    /// events and recording results for later retry.
    pub async fn execute_run(&self, run_id: String, retry_of_prior: bool) {
        {
            let mut active = self.active.write().await;
            *active = Some(run_id.clone());
        }
        self.transition(&run_id, RunState::Running, None).await;
        // A retry keeps the run id; each execution gets its own terminal
        // event.
        self.publisher.reopen(&run_id);

        let events = RunEvents::new(self.publisher(), run_id.clone());
        let config = RunConfig::load(&self.root);
        let prior = if retry_of_prior {
            let prior = self.prior.read().await;
            prior.get(&run_id).map(|results| {
                results
                    .iter()
                    .map(|r| (r.node_id.clone(), r.clone()))
                    .collect::<HashMap<_, _>>()
            })
        } else {
            None
        };

        let outcome = run_once(
            &self.root,
            &config,
            Arc::clone(&self.limits),
            &run_id,
            Some(&events),
            prior.as_ref(),
            RunHandles::default(),
        )
        .await;

        match outcome {
            Ok(result) => {
                let state = match result.status {
                    RunStatus::Success => RunState::Success,
                    RunStatus::Failure => RunState::Failure,
                };
                self.prior
                    .write()
                    .await
                    .insert(run_id.clone(), result.suites.clone());
                self.transition(&run_id, state, Some(result.success_rate))
                    .await;
                events.emit(EventKind::RunCompleted {
                    status: result.status,
                    success_rate: result.success_rate,
                    total_duration_ms: result.total_duration_ms,
                });
            }
            Err(e) => {
                let message = e.to_string();
                error!(run_id = %run_id, %message, "run failed before execution");
                self.transition(&run_id, RunState::Error, None).await;
                events.emit(EventKind::RunError { message });
            }
        }

        let mut active = self.active.write().await;
        if active.as_deref() == Some(run_id.as_str()) {
            *active = None;
        }
    }
}

/// Per-run collaborator handles: how inputs are answered and how the run is
/// cancelled. The orchestrator always runs non-interactive with a fresh
/// token; the CLI wires stdin and Ctrl-C.
pub struct RunHandles {
    pub input: Arc<dyn crate::steps::input::InputProvider>,
    pub cancel: CancellationToken,
}

impl Default for RunHandles {
    fn default() -> Self {
        Self {
            input: Arc::new(NonInteractiveInput),
            cancel: CancellationToken::new(),
        }
    }
}

/// One full discovery → plan → schedule → aggregate pass.
pub async fn run_once(
    root: &std::path::Path,
    config: &RunConfig,
    limits: Arc<EngineLimits>,
    run_id: &str,
    events: Option<&RunEvents>,
    prior: Option<&HashMap<String, SuiteResult>>,
    handles: RunHandles,
) -> Result<crate::protocol::AggregatedResult, EngineError> {
    let started = Utc::now();

    let discovered = discovery::discover(root, &limits);
    for problem in &discovered.errors {
        warn!(error = %problem, "suite excluded during discovery");
    }
    if discovered.suites.is_empty() {
        return Err(EngineError::Discovery(format!(
            "no runnable suites under {} ({} documents rejected)",
            root.display(),
            discovered.errors.len()
        )));
    }
    let max_steps = discovered
        .suites
        .iter()
        .map(|s| s.steps.len())
        .max()
        .unwrap_or(0);
    limits
        .validate_counts(discovered.suites.len(), max_steps)
        .map_err(|e| EngineError::Discovery(e.to_string()))?;

    let index = Arc::new(SuiteIndex::build(root, discovered.suites)?);
    let plan = planner::plan(&index)?;

    if let Some(events) = events {
        events.emit(EventKind::RunStarted {
            suite_count: plan.suite_count(),
        });
    }

    let registry = ExportRegistry::new();
    let extensions = Arc::new(Extensions::default());
    let perf = Arc::new(PerfCollector::new());
    let services = Arc::new(ExecutionServices {
        transport: Arc::new(ReqwestTransport::new()),
        perf: Arc::clone(&perf),
        limits: Arc::clone(&limits),
        index: Arc::clone(&index),
        input: handles.input,
        cancel: handles.cancel,
    });
    let executor = StepExecutor::new(services);
    let options = SchedulerOptions::from_config(config, &limits);

    let suites = scheduler::execute(
        &executor,
        &index,
        &plan,
        Arc::clone(&registry),
        extensions,
        &options,
        &config.globals,
        &config.environment,
        events,
        prior,
    )
    .await;

    let finished = Utc::now();
    let total_ms = (finished - started).num_milliseconds().max(0) as u64;
    let result = report::aggregate(
        config.project_name.as_deref().unwrap_or("flowrunner"),
        run_id,
        started,
        finished,
        suites,
        registry.snapshot(),
        perf.summary(total_ms),
    );

    let output_dir = config
        .output_dir
        .clone()
        .unwrap_or_else(|| root.join("reports"));
    if let Err(e) = report::write_report(&output_dir, &result) {
        warn!(error = %e, "cannot write report files");
    }

    Ok(result)
}

// ============================================================================
// HTTP SURFACE
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct StartRunBody {
    #[serde(default)]
    pub label: Option<String>,
}

pub fn router(state: OrchestratorState) -> Router {
    Router::new()
        .route("/run", post(start_run))
        .route("/runs", get(list_runs))
        .route("/runs/{id}/retry", post(retry_run))
        .route("/health", get(health))
        .route("/events", get(events_stream))
        .with_state(state)
}

/// Serve the orchestrator until the process is stopped.
pub async fn serve(state: OrchestratorState, port: u16) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, root = %state.root.display(), "orchestrator listening");
    axum::serve(listener, router(state)).await
}

async fn start_run(
    State(state): State<OrchestratorState>,
    body: Option<Json<StartRunBody>>,
) -> impl IntoResponse {
    let label = body.and_then(|Json(b)| b.label);
    let run_id = state.register(label).await;
    let task_state = state.clone();
    let task_run_id = run_id.clone();
    tokio::spawn(async move {
        task_state.execute_run(task_run_id, false).await;
    });
    Json(serde_json::json!({ "runId": run_id }))
}

async fn retry_run(
    State(state): State<OrchestratorState>,
    AxumPath(run_id): AxumPath<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    if !state.runs.read().await.contains_key(&run_id) {
        return Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("unknown run '{run_id}'")})),
        ));
    }
    let task_state = state.clone();
    let task_run_id = run_id.clone();
    tokio::spawn(async move {
        task_state.execute_run(task_run_id, true).await;
    });
    Ok(Json(serde_json::json!({ "runId": run_id })))
}

async fn list_runs(State(state): State<OrchestratorState>) -> impl IntoResponse {
    Json(serde_json::json!({ "runs": state.records().await }))
}

async fn health(State(state): State<OrchestratorState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "activeRunId": state.active_run().await,
    }))
}

/// SSE feed: history replayed from the beginning, then the live broadcast.
async fn events_stream(State(state): State<OrchestratorState>) -> impl IntoResponse {
    let (replay, rx) = state.publisher.subscribe();
    let replay_stream = futures::stream::iter(replay.into_iter().map(|event| Ok(to_sse(&event))));
    let live_stream = BroadcastStream::new(rx).filter_map(|item| match item {
        Ok(event) => Some(Ok(to_sse(&event))),
        Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(skipped)) => {
            warn!(skipped, "SSE subscriber lagged, events dropped");
            Some(Ok(Event::default()
                .event("lagged")
                .data(format!("{{\"skipped\":{skipped}}}"))))
        }
    });
    let stream: std::pin::Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>> =
        Box::pin(replay_stream.chain(live_stream));
    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)))
}

fn to_sse(event: &crate::events::EngineEvent) -> Event {
    let tag = event.kind.tag();
    let payload = redaction::redact_document(event)
        .unwrap_or_else(|_| serde_json::json!({"run_id": event.run_id, "event": tag}));
    Event::default().event(tag).data(payload.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("flowrunner-orch-{tag}-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn register_records_and_health() {
        let state = OrchestratorState::new(temp_root("reg"), EngineLimits::default());
        let run_id = state.register(Some("nightly".into())).await;

        let records = state.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].run_id, run_id);
        assert_eq!(records[0].state, RunState::Registered);
        assert_eq!(records[0].label.as_deref(), Some("nightly"));
        assert_eq!(state.active_run().await, None);

        let history = state.publisher.history_for(&run_id);
        assert_eq!(history[0].kind.tag(), "run_registered");
    }

    #[tokio::test]
    async fn empty_root_yields_run_error_with_single_terminal_event() {
        // §8 invariant 8 end-to-end: run_registered first, exactly one
        // terminal event.
        let root = temp_root("empty");
        let state = OrchestratorState::new(root.clone(), EngineLimits::default());
        let run_id = state.register(None).await;
        state.execute_run(run_id.clone(), false).await;

        let records = state.records().await;
        assert_eq!(records[0].state, RunState::Error);
        assert_eq!(state.active_run().await, None);

        let history = state.publisher.history_for(&run_id);
        assert_eq!(history.first().unwrap().kind.tag(), "run_registered");
        assert_eq!(history.iter().filter(|e| e.kind.is_terminal()).count(), 1);
        assert_eq!(history.last().unwrap().kind.tag(), "run_error");
        for pair in history.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn retry_of_unknown_run_is_rejected() {
        let state = OrchestratorState::new(temp_root("retry"), EngineLimits::default());
        assert!(!state.runs.read().await.contains_key("ghost"));
    }

    #[test]
    fn sse_payloads_are_redacted() {
        let event = crate::events::EngineEvent {
            run_id: "r1".into(),
            timestamp: Utc::now(),
            kind: EventKind::RunError {
                message: "request failed: authorization: Bearer super.secret.jwt".into(),
            },
        };
        let sse = to_sse(&event);
        let rendered = format!("{sse:?}");
        assert!(!rendered.contains("super.secret.jwt"));
    }
}
