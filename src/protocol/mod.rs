//! # Suite Document & Result Model
//!
//! Data structures shared by the whole engine: the in-memory suite tree the
//! discovery layer produces, and the result tree the runner emits.
//!
//! A suite is a named, ordered set of steps with its own variables, optional
//! dependency edges on other suites, and an optional export list that is
//! promoted to the process-wide registry when the suite succeeds:
//!
//! ```yaml
//! suite_name: User journey
//! node_id: user-journey
//! priority: high
//! depends:
//!   - node_id: seed-data
//! exports: [auth_token]
//! steps:
//!   - name: Log in
//!     request: { method: POST, url: "{{api_url}}/login" }
//!     assert: { status_code: 200 }
//!     capture: { auth_token: body.token }
//! ```
//!
//! Each step carries exactly one primary action (`request`, `input`, `call`,
//! `iterate`, or scenarios alone); the dispatcher in `steps` enforces this at
//! load time and selects the matching strategy at run time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Ordered JSON mapping. `serde_json` is built with `preserve_order`, so
/// iteration follows the source document; assertion predicates and capture
/// definitions rely on this for deterministic result ordering.
pub type JsonMap = Map<String, Value>;

// ============================================================================
// SUITE DOCUMENT
// ============================================================================

/// A discovered suite: the in-memory form of one `*.flow.{yaml,json}` file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Suite {
    /// Human-readable name, used in reports and events.
    pub suite_name: String,

    /// Stable identifier used in dependency edges and the exported registry.
    pub node_id: String,

    /// Scheduling priority; breaks ties inside a wave.
    #[serde(default)]
    pub priority: Priority,

    /// Dependency edges to other suites.
    #[serde(default)]
    pub depends: Vec<DependencyEdge>,

    /// Variable names promoted to the global registry after success.
    #[serde(default)]
    pub exports: Vec<String>,

    /// Suite-scoped variables.
    #[serde(default)]
    pub variables: JsonMap,

    /// Suite-level TLS client certificate, merged into requests that do not
    /// declare their own.
    #[serde(default)]
    pub certificate: Option<CertificateConfig>,

    /// Suite-level timeout applied to every step (milliseconds).
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Ordered steps.
    pub steps: Vec<Step>,

    /// Where the document was loaded from. Set by discovery; used to resolve
    /// relative dependency and call paths.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,

    /// Discovery order, the stable tiebreak inside a wave.
    #[serde(skip)]
    pub source_index: usize,
}

/// Suite scheduling priority. `critical` suites sort first within a wave and
/// participate in the fail-fast policy by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Rank for in-wave ordering; lower runs first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

/// A dependency edge from the declaring suite to one of its dependencies.
///
/// Accepts either the full mapping form or a bare string shorthand that is
/// treated as a `node_id` reference:
///
/// ```yaml
/// depends:
///   - seed-data
///   - { path: ../auth/login.flow.yaml, required: false }
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct DependencyEdge {
    /// Target by stable node id. Checked before path resolution.
    pub node_id: Option<String>,

    /// Target by file path: literal, relative to the declaring file, or
    /// relative to the discovery root.
    pub path: Option<String>,

    /// Unresolvable required edges fail planning; optional edges only warn.
    pub required: bool,

    /// Guard expression; when it evaluates falsy the edge is ignored.
    pub condition: Option<String>,

    /// On orchestrator re-execution, reuse the dependency's recorded result
    /// instead of running it again.
    pub cache: bool,
}

impl<'de> Deserialize<'de> for DependencyEdge {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Short(String),
            Full {
                #[serde(default)]
                node_id: Option<String>,
                #[serde(default)]
                path: Option<String>,
                #[serde(default = "default_true")]
                required: bool,
                #[serde(default)]
                condition: Option<String>,
                #[serde(default)]
                cache: bool,
            },
        }

        match Raw::deserialize(deserializer)? {
            Raw::Short(reference) => Ok(DependencyEdge {
                node_id: Some(reference),
                path: None,
                required: true,
                condition: None,
                cache: false,
            }),
            Raw::Full {
                node_id,
                path,
                required,
                condition,
                cache,
            } => Ok(DependencyEdge {
                node_id,
                path,
                required,
                condition,
                cache,
            }),
        }
    }
}

fn default_true() -> bool {
    true
}

/// TLS client certificate material for mutual-TLS endpoints.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CertificateConfig {
    pub cert_file: String,
    pub key_file: String,
}

// ============================================================================
// STEP
// ============================================================================

/// One atomic unit of test work.
///
/// Exactly one primary action must be present: `request`, `input`, `call`,
/// `iterate`, or non-empty `scenarios` on their own. `request` and `input`
/// may coexist (inputs run after captures); everything else is exclusive and
/// rejected at load time.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Step {
    pub name: String,

    /// Identifier within the suite; derived from `name` when absent.
    #[serde(default)]
    pub step_id: Option<String>,

    #[serde(default)]
    pub request: Option<RequestSpec>,

    #[serde(default)]
    pub input: Option<InputSpec>,

    #[serde(default)]
    pub call: Option<CallSpec>,

    #[serde(default)]
    pub iterate: Option<IterateSpec>,

    /// Guarded branches evaluated against the response (or the previous
    /// step's response for scenario-only steps).
    #[serde(default)]
    pub scenarios: Vec<Scenario>,

    /// Assertions: mapping of response path to predicate node.
    #[serde(default, rename = "assert")]
    pub assertions: Option<JsonMap>,

    /// Captures: mapping of variable name to extraction expression.
    #[serde(default, rename = "capture")]
    pub captures: Option<JsonMap>,

    /// Runtime variable assignments applied before the step executes.
    #[serde(default)]
    pub variables: Option<JsonMap>,

    /// Fire-and-forget actions at the request lifecycle points.
    #[serde(default)]
    pub hooks: Option<Hooks>,

    /// Script run before the primary action; failure fails the step unless
    /// `continue_on_error` is set.
    #[serde(default)]
    pub pre_script: Option<String>,

    /// Script run after the response is available; may mutate runtime
    /// variables.
    #[serde(default)]
    pub post_script: Option<String>,

    /// Downgrade script failures to warnings.
    #[serde(default)]
    pub continue_on_error: bool,

    /// Per-step retry override.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,

    /// Per-step timeout override (milliseconds).
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Step {
    /// Effective step identifier: explicit `step_id`, else a slug of `name`.
    pub fn effective_id(&self) -> String {
        match &self.step_id {
            Some(id) => id.clone(),
            None => slugify(&self.name),
        }
    }
}

/// Lowercases and replaces non-alphanumeric runs with a single underscore.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_sep = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_sep = false;
        } else if !last_sep {
            out.push('_');
            last_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("step");
    }
    out
}

/// HTTP request description. All string positions are interpolated before
/// the request is handed to the transport.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequestSpec {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Option<JsonMap>,
    /// Query parameters, appended URL-encoded.
    #[serde(default)]
    pub params: Option<JsonMap>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub auth: Option<AuthSpec>,
    /// Overrides the suite-level certificate.
    #[serde(default)]
    pub certificate: Option<CertificateConfig>,
}

/// Authentication helper; expands into an `Authorization` header.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthSpec {
    Basic { username: String, password: String },
    Bearer(String),
}

/// Interactive prompt; the answer lands in `variable` on the runtime scope.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InputSpec {
    pub prompt: String,
    pub variable: String,
    #[serde(default)]
    pub default: Option<Value>,
    /// Do not echo the value; reports still redact it by the usual key
    /// patterns.
    #[serde(default)]
    pub masked: bool,
}

/// Cross-suite call: run a named step from another suite.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CallSpec {
    /// Target suite: node id, or a path confined to the discovery root.
    pub suite: String,
    /// Target step id (or name) inside that suite.
    pub step: String,
    /// Variables passed into the callee's runtime scope.
    #[serde(default)]
    pub variables: Option<JsonMap>,
    /// When true (default) the callee sees only the passed variables, its
    /// own suite variables and the global registry.
    #[serde(default = "default_true")]
    pub isolate_context: bool,
    /// Prefix applied to propagated variable names on return.
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub on_error: CallErrorMode,
}

/// What a failing callee does to the calling step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallErrorMode {
    /// Propagate the failure (default).
    #[default]
    Fail,
    /// Mark the step successful, keeping the error message.
    Continue,
    /// Mark the step successful and log a warning.
    Warn,
}

/// Loop wrapper: expands `over` (or `count`) to a finite sequence and runs
/// the wrapped strategy once per element.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IterateSpec {
    /// Expression or inline sequence to iterate over.
    #[serde(default)]
    pub over: Option<Value>,
    /// Shorthand for iterating `0..count`.
    #[serde(default)]
    pub count: Option<u64>,
    /// Binding name for the current element; `<as>_index` is bound as well.
    #[serde(default = "default_binding", rename = "as")]
    pub binding: String,
}

fn default_binding() -> String {
    "item".to_string()
}

/// A guarded branch inside a step.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Scenario {
    /// Guard expression evaluated against `status_code`, `headers`, `body`
    /// and the current variable view.
    pub condition: String,
    #[serde(default)]
    pub then: Option<ScenarioBranch>,
    #[serde(default, rename = "else")]
    pub otherwise: Option<ScenarioBranch>,
}

/// Contribution of a matched scenario branch.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ScenarioBranch {
    #[serde(default)]
    pub request: Option<RequestSpec>,
    #[serde(default, rename = "assert")]
    pub assertions: Option<JsonMap>,
    #[serde(default, rename = "capture")]
    pub captures: Option<JsonMap>,
    #[serde(default)]
    pub variables: Option<JsonMap>,
    /// Nested scenarios, bounded by the engine's scenario depth limit.
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
}

/// Hook actions at the well-defined lifecycle points. Hook errors are logged
/// and never fail the step.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Hooks {
    #[serde(default)]
    pub pre_request: Vec<HookAction>,
    #[serde(default)]
    pub post_request: Vec<HookAction>,
    #[serde(default)]
    pub pre_assert: Vec<HookAction>,
    #[serde(default)]
    pub post_assert: Vec<HookAction>,
    #[serde(default)]
    pub pre_capture: Vec<HookAction>,
    #[serde(default)]
    pub post_capture: Vec<HookAction>,
    #[serde(default)]
    pub pre_input: Vec<HookAction>,
    #[serde(default)]
    pub post_input: Vec<HookAction>,
}

/// One hook action: log a line, set runtime variables, or pause.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct HookAction {
    #[serde(default)]
    pub log: Option<String>,
    #[serde(default)]
    pub set: Option<JsonMap>,
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

/// Retry policy for a step or a suite.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default)]
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 0,
        }
    }
}

// ============================================================================
// RESULTS
// ============================================================================

/// Final status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failure,
    Skipped,
}

/// Outcome of a single assertion predicate.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AssertionOutcome {
    pub field_path: String,
    pub expected: Value,
    pub actual: Value,
    pub passed: bool,
    pub message: String,
}

/// The request as it went on the wire (after interpolation).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequestDetails {
    pub method: String,
    pub url: String,
    /// The URL before interpolation, kept for report readability.
    pub raw_url: String,
    #[serde(default)]
    pub headers: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// The response as observed by assertions and captures.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResponseDetails {
    pub status_code: u16,
    #[serde(default)]
    pub headers: JsonMap,
    #[serde(default)]
    pub body: Value,
    pub duration_ms: u64,
}

/// Branch bookkeeping for steps that evaluated scenarios.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScenarioMeta {
    /// How many scenario guards were evaluated.
    pub evaluated: usize,
    /// Index of the scenario whose branch ran, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_index: Option<usize>,
    /// Which branch ran: `then` or `else`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// The matching guard expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// Result of one step execution.
///
/// `status` is `failure` iff at least one assertion failed, the transport
/// failed, or a required script/hook chain failed without
/// `continue_on_error`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StepResult {
    pub step_id: String,
    /// `{node_id}::{step_id}`, unique across the run.
    pub qualified_step_id: String,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_details: Option<RequestDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_details: Option<ResponseDetails>,
    #[serde(default)]
    pub assertions: Vec<AssertionOutcome>,
    /// Values captured into the runtime scope by this step.
    #[serde(default)]
    pub captured: JsonMap,
    /// Variables assigned by `variables`, hooks, inputs or scripts.
    #[serde(default)]
    pub dynamic_assignments: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Structured code (`E3001`, …) classifying the failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_meta: Option<ScenarioMeta>,
    /// Child results when the step was an `iterate` wrapper.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration_results: Option<Vec<StepResult>>,
}

impl StepResult {
    /// A skeleton result for a step that did not execute.
    pub fn skipped(step_id: &str, qualified: &str, reason: impl Into<String>) -> Self {
        Self {
            step_id: step_id.to_string(),
            qualified_step_id: qualified.to_string(),
            status: StepStatus::Skipped,
            duration_ms: 0,
            request_details: None,
            response_details: None,
            assertions: Vec::new(),
            captured: JsonMap::new(),
            dynamic_assignments: JsonMap::new(),
            error_message: Some(reason.into()),
            error_code: None,
            scenario_meta: None,
            iteration_results: None,
        }
    }
}

/// Final status of a suite: success iff every step succeeded or was skipped,
/// skipped iff every step was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SuiteStatus {
    Success,
    Failure,
    Skipped,
}

impl SuiteStatus {
    /// Aggregate step statuses per the termination policy.
    pub fn from_steps(steps: &[StepResult]) -> Self {
        if steps.iter().any(|s| s.status == StepStatus::Failure) {
            SuiteStatus::Failure
        } else if !steps.is_empty() && steps.iter().all(|s| s.status == StepStatus::Skipped) {
            SuiteStatus::Skipped
        } else {
            SuiteStatus::Success
        }
    }
}

/// Result of one suite execution.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SuiteResult {
    pub node_id: String,
    pub suite_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: SuiteStatus,
    pub steps_executed: usize,
    pub steps_successful: usize,
    pub steps_failed: usize,
    pub success_rate: f64,
    pub steps: Vec<StepResult>,
    /// Union of every step's captured values.
    #[serde(default)]
    pub variables_captured: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl SuiteResult {
    /// Assemble a result from collected step results.
    pub fn from_steps(
        suite: &Suite,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        steps: Vec<StepResult>,
        error_message: Option<String>,
    ) -> Self {
        let executed = steps
            .iter()
            .filter(|s| s.status != StepStatus::Skipped)
            .count();
        let successful = steps
            .iter()
            .filter(|s| s.status == StepStatus::Success)
            .count();
        let failed = steps
            .iter()
            .filter(|s| s.status == StepStatus::Failure)
            .count();
        let mut captured = JsonMap::new();
        for step in &steps {
            for (k, v) in &step.captured {
                captured.insert(k.clone(), v.clone());
            }
        }
        let status = SuiteStatus::from_steps(&steps);
        Self {
            node_id: suite.node_id.clone(),
            suite_name: suite.suite_name.clone(),
            start_time,
            end_time,
            duration_ms: (end_time - start_time).num_milliseconds().max(0) as u64,
            status,
            steps_executed: executed,
            steps_successful: successful,
            steps_failed: failed,
            success_rate: if executed == 0 {
                if status == SuiteStatus::Failure {
                    0.0
                } else {
                    1.0
                }
            } else {
                successful as f64 / executed as f64
            },
            steps,
            variables_captured: captured,
            error_message,
        }
    }

    /// A result for a suite that never started (cancelled run, fail-fast,
    /// false dependency guard).
    pub fn skipped(suite: &Suite, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        let steps = suite
            .steps
            .iter()
            .map(|s| {
                let id = s.effective_id();
                StepResult::skipped(&id, &format!("{}::{}", suite.node_id, id), "suite skipped")
            })
            .collect();
        let mut result = Self::from_steps(suite, now, now, steps, Some(reason.into()));
        result.status = SuiteStatus::Skipped;
        result
    }
}

// ============================================================================
// AGGREGATION
// ============================================================================

/// Run-wide counters.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RunTotals {
    pub suites: usize,
    pub suites_successful: usize,
    pub suites_failed: usize,
    pub suites_skipped: usize,
    pub steps: usize,
    pub steps_successful: usize,
    pub steps_failed: usize,
    pub steps_skipped: usize,
}

/// Aggregate status of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failure,
}

/// The machine-readable aggregate written to `{output_dir}/latest.json`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AggregatedResult {
    pub project_name: String,
    pub run_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_duration_ms: u64,
    pub status: RunStatus,
    pub totals: RunTotals,
    pub success_rate: f64,
    pub suites: Vec<SuiteResult>,
    /// Final snapshot of the exported-variable registry, keyed
    /// `{producer}.{name}`.
    #[serde(default)]
    pub global_variables_final_state: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance_summary: Option<PerformanceSummary>,
}

/// One HTTP attempt, recorded per request for the performance summary.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PerformanceDatum {
    pub method: String,
    pub url: String,
    pub response_time_ms: u64,
    pub status_code: u16,
    pub timestamp: DateTime<Utc>,
}

/// Aggregated timings over every recorded HTTP attempt.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PerformanceSummary {
    pub request_count: usize,
    pub min_ms: u64,
    pub avg_ms: f64,
    pub max_ms: u64,
    pub median_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    /// Requests per second over the run duration.
    pub throughput_rps: f64,
    /// Top endpoints by mean response time, slowest first (at most 10).
    pub slowest_endpoints: Vec<EndpointTiming>,
}

/// Per-endpoint timing aggregate.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointTiming {
    pub method: String,
    pub url: String,
    pub mean_ms: f64,
    pub hits: usize,
}
