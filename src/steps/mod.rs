//! # Step Strategy Dispatcher
//!
//! Selects exactly one execution strategy per step and runs the lifecycle
//! around it. The primaries are mutually exclusive (checked at load time),
//! so dispatch is a closed sum over the step shape:
//!
//! | Strategy      | Selected when                                          |
//! |---------------|--------------------------------------------------------|
//! | Iterate       | `iterate` present (wraps any other strategy)           |
//! | Call          | `call` present                                         |
//! | Request       | `request` present                                      |
//! | Input         | `input` present, no request                            |
//! | Scenario-only | non-empty `scenarios` alone                            |
//!
//! Every step runs under `min(step timeout, suite timeout, engine timeout)`
//! and races the run's cancellation token; hooks are fire-and-forget while
//! scripts fail the step unless `continue_on_error` is set.

pub mod input;
pub mod iterate;
pub mod request;

use crate::calls::{self, CallStack};
use crate::context::VariableContext;
use crate::discovery::SuiteIndex;
use crate::errors::ErrorCode;
use crate::limits::EngineLimits;
use crate::protocol::{
    HookAction, JsonMap, ResponseDetails, Step, StepResult, StepStatus, Suite,
};
use crate::report::PerfCollector;
use crate::transport::HttpTransport;
use futures::future::BoxFuture;
use futures::FutureExt;
use self::input::InputProvider;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Everything a step needs to execute; one instance per run, shared by all
/// suite tasks.
pub struct ExecutionServices {
    pub transport: Arc<dyn HttpTransport>,
    pub perf: Arc<PerfCollector>,
    pub limits: Arc<EngineLimits>,
    pub index: Arc<SuiteIndex>,
    pub input: Arc<dyn InputProvider>,
    pub cancel: CancellationToken,
}

/// The strategy a step resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Iterate,
    Call,
    Request,
    Input,
    ScenarioOnly,
}

/// Pure function of the step shape. Load-time validation guarantees the
/// primaries are exclusive, so the precedence below is only meaningful for
/// `iterate` (a wrapper) and `request`+`input` (inputs run after captures).
pub fn classify(step: &Step) -> StepKind {
    if step.iterate.is_some() {
        StepKind::Iterate
    } else if step.call.is_some() {
        StepKind::Call
    } else if step.request.is_some() {
        StepKind::Request
    } else if step.input.is_some() {
        StepKind::Input
    } else {
        StepKind::ScenarioOnly
    }
}

/// Runs steps against the shared services.
#[derive(Clone)]
pub struct StepExecutor {
    pub services: Arc<ExecutionServices>,
}

impl StepExecutor {
    pub fn new(services: Arc<ExecutionServices>) -> Self {
        Self { services }
    }

    /// Execute one step under its effective timeout, racing cancellation.
    pub async fn execute_step(
        &self,
        suite: &Suite,
        step: &Step,
        ctx: &mut VariableContext,
        prev_response: Option<&ResponseDetails>,
        stack: &CallStack,
    ) -> StepResult {
        let step_id = step.effective_id();
        let qualified = format!("{}::{}", suite.node_id, step_id);
        let timeout = self
            .services
            .limits
            .effective_step_timeout(step.timeout_ms, suite.timeout_ms);
        let cancel = self.services.cancel.clone();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            timed = tokio::time::timeout(timeout, self.execute_inner(suite, step, ctx, prev_response, stack)) => Some(timed),
        };

        match outcome {
            Some(Ok(result)) => result,
            Some(Err(_)) => {
                warn!(step = %qualified, timeout_ms = timeout.as_millis() as u64, "step timed out");
                failure_result(
                    &step_id,
                    &qualified,
                    timeout.as_millis() as u64,
                    ErrorCode::STEP_TIMEOUT,
                    format!("step timed out after {}ms", timeout.as_millis()),
                )
            }
            None => failure_result(
                &step_id,
                &qualified,
                0,
                ErrorCode::CANCELLED,
                "step cancelled before completion",
            ),
        }
    }

    /// Boxed form, used wherever execution recurses (cross-suite calls,
    /// iterate expansion).
    pub fn execute_step_boxed<'a>(
        &'a self,
        suite: &'a Suite,
        step: &'a Step,
        ctx: &'a mut VariableContext,
        prev_response: Option<&'a ResponseDetails>,
        stack: &'a CallStack,
    ) -> BoxFuture<'a, StepResult> {
        self.execute_step(suite, step, ctx, prev_response, stack).boxed()
    }

    async fn execute_inner(
        &self,
        suite: &Suite,
        step: &Step,
        ctx: &mut VariableContext,
        prev_response: Option<&ResponseDetails>,
        stack: &CallStack,
    ) -> StepResult {
        let started = Instant::now();
        let mut result = base_result(suite, step);
        info!(step = %result.qualified_step_id, kind = ?classify(step), "running step");

        // Step-level variable assignments land on the runtime scope before
        // anything else executes.
        if let Some(vars) = &step.variables {
            for (name, value) in vars {
                let resolved = ctx.interpolate(value, false);
                ctx.set_runtime(name.clone(), resolved.clone());
                result.dynamic_assignments.insert(name.clone(), resolved);
            }
        }

        match classify(step) {
            StepKind::Iterate => {
                iterate::execute(self, suite, step, ctx, stack, &mut result).await
            }
            StepKind::Call => {
                let spec = step.call.as_ref().expect("classified as call");
                calls::execute_call_step(self, suite, step, spec, ctx, stack, &mut result).await
            }
            StepKind::Request => {
                let spec = step.request.as_ref().expect("classified as request");
                request::execute(self, suite, step, spec, ctx, &mut result).await
            }
            StepKind::Input => {
                let spec = step.input.as_ref().expect("classified as input");
                input::execute(self, step, spec, ctx, &mut result).await
            }
            StepKind::ScenarioOnly => {
                request::execute_scenario_only(self, suite, step, ctx, prev_response, &mut result)
                    .await
            }
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            step = %result.qualified_step_id,
            status = ?result.status,
            duration_ms = result.duration_ms,
            "step finished"
        );
        result
    }
}

/// Fresh result skeleton for a step about to execute.
pub(crate) fn base_result(suite: &Suite, step: &Step) -> StepResult {
    let step_id = step.effective_id();
    StepResult {
        qualified_step_id: format!("{}::{}", suite.node_id, step_id),
        step_id,
        status: StepStatus::Success,
        duration_ms: 0,
        request_details: None,
        response_details: None,
        assertions: Vec::new(),
        captured: JsonMap::new(),
        dynamic_assignments: JsonMap::new(),
        error_message: None,
        error_code: None,
        scenario_meta: None,
        iteration_results: None,
    }
}

fn failure_result(
    step_id: &str,
    qualified: &str,
    duration_ms: u64,
    code: ErrorCode,
    message: impl Into<String>,
) -> StepResult {
    StepResult {
        step_id: step_id.to_string(),
        qualified_step_id: qualified.to_string(),
        status: StepStatus::Failure,
        duration_ms,
        request_details: None,
        response_details: None,
        assertions: Vec::new(),
        captured: JsonMap::new(),
        dynamic_assignments: JsonMap::new(),
        error_message: Some(message.into()),
        error_code: Some(code.formatted()),
        scenario_meta: None,
        iteration_results: None,
    }
}

/// Mark a result failed, keeping the first error.
pub(crate) fn mark_failure(result: &mut StepResult, code: ErrorCode, message: impl Into<String>) {
    result.status = StepStatus::Failure;
    if result.error_message.is_none() {
        result.error_message = Some(message.into());
        result.error_code = Some(code.formatted());
    }
}

// ============================================================================
// HOOKS
// ============================================================================

/// Run hook actions at one lifecycle point. Hooks are fire-and-forget with
/// respect to step success: problems are logged, never propagated.
pub(crate) async fn run_hooks(
    point: &str,
    actions: Option<&[HookAction]>,
    ctx: &mut VariableContext,
    assignments: &mut JsonMap,
) {
    let actions = match actions {
        Some(actions) if !actions.is_empty() => actions,
        _ => return,
    };
    for action in actions {
        if let Some(template) = &action.log {
            let rendered = ctx.interpolate(&Value::String(template.clone()), true);
            info!(hook = point, message = %crate::expressions::stringified(&rendered), "hook log");
        }
        if let Some(vars) = &action.set {
            for (name, value) in vars {
                let resolved = ctx.interpolate(value, true);
                ctx.set_runtime(name.clone(), resolved.clone());
                assignments.insert(name.clone(), resolved);
            }
        }
        if let Some(ms) = action.delay_ms {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

// ============================================================================
// SCRIPTS
// ============================================================================

/// Run a pre/post script under the engine's execution budget. Assignments
/// made by the script land on the runtime scope and are recorded.
pub(crate) async fn run_script(
    kind: &str,
    script: &str,
    ctx: &mut VariableContext,
    response: Option<&ResponseDetails>,
    budget: Duration,
    assignments: &mut JsonMap,
) -> Result<(), (ErrorCode, String)> {
    let extensions = ctx.extensions();
    let scope = match response {
        Some(details) => ctx.with_response(details),
        None => ctx.clone(),
    };
    let source = script.to_string();

    let evaluated = tokio::time::timeout(
        budget,
        tokio::task::spawn_blocking(move || extensions.engine.evaluate_script(&source, &scope)),
    )
    .await;

    match evaluated {
        Err(_) => Err((
            ErrorCode::SCRIPT_TIMEOUT,
            format!("{kind} script exceeded its {}ms budget", budget.as_millis()),
        )),
        Ok(Err(join_error)) => Err((
            ErrorCode::SCRIPT_FAILED,
            format!("{kind} script panicked: {join_error}"),
        )),
        Ok(Ok(Err(eval_error))) => Err((
            ErrorCode::SCRIPT_FAILED,
            format!("{kind} script failed: {eval_error}"),
        )),
        Ok(Ok(Ok(outcome))) => {
            for (name, value) in outcome.assignments {
                ctx.set_runtime(name.clone(), value.clone());
                assignments.insert(name, value);
            }
            Ok(())
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step_from(value: serde_json::Value) -> Step {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn classification_table() {
        let request = step_from(json!({"name": "r", "request": {"method": "GET", "url": "/"}}));
        assert_eq!(classify(&request), StepKind::Request);

        let with_input = step_from(json!({
            "name": "ri",
            "request": {"method": "GET", "url": "/"},
            "input": {"prompt": "?", "variable": "v"}
        }));
        assert_eq!(classify(&with_input), StepKind::Request);

        let input_only = step_from(json!({"name": "i", "input": {"prompt": "?", "variable": "v"}}));
        assert_eq!(classify(&input_only), StepKind::Input);

        let call = step_from(json!({"name": "c", "call": {"suite": "s", "step": "t"}}));
        assert_eq!(classify(&call), StepKind::Call);

        let iterate = step_from(json!({
            "name": "it",
            "iterate": {"count": 2},
            "request": {"method": "GET", "url": "/"}
        }));
        assert_eq!(classify(&iterate), StepKind::Iterate);

        let scenario_only = step_from(json!({
            "name": "s",
            "scenarios": [{"condition": "true", "then": {}}]
        }));
        assert_eq!(classify(&scenario_only), StepKind::ScenarioOnly);
    }

    #[tokio::test]
    async fn hooks_set_variables_and_never_fail() {
        use crate::context::{ExportRegistry, Extensions};
        let mut ctx = crate::context::VariableContext::new(
            ExportRegistry::new(),
            Arc::new(Extensions::default()),
        );
        let actions: Vec<HookAction> = serde_json::from_value(json!([
            {"log": "about to run with {{missing}}"},
            {"set": {"flag": true, "note": "{{also_missing}}"}}
        ]))
        .unwrap();
        let mut assignments = JsonMap::new();
        run_hooks("pre_request", Some(&actions), &mut ctx, &mut assignments).await;
        assert_eq!(ctx.get("flag"), Some(json!(true)));
        // Unresolved hook interpolation keeps the placeholder, silently.
        assert_eq!(assignments.get("note"), Some(&json!("{{also_missing}}")));
    }

    #[tokio::test]
    async fn scripts_assign_and_fail_loudly() {
        use crate::context::{ExportRegistry, Extensions};
        let mut ctx = crate::context::VariableContext::new(
            ExportRegistry::new(),
            Arc::new(Extensions::default()),
        );
        ctx.set_runtime("base", json!(2));
        let mut assignments = JsonMap::new();

        let ok = run_script(
            "pre",
            "total = base + 3",
            &mut ctx,
            None,
            Duration::from_secs(1),
            &mut assignments,
        )
        .await;
        assert!(ok.is_ok());
        assert_eq!(ctx.get("total"), Some(json!(5)));
        assert_eq!(assignments.get("total"), Some(&json!(5)));

        let bad = run_script(
            "pre",
            "((broken",
            &mut ctx,
            None,
            Duration::from_secs(1),
            &mut assignments,
        )
        .await;
        let (code, message) = bad.unwrap_err();
        assert_eq!(code, ErrorCode::SCRIPT_FAILED);
        assert!(message.contains("pre script failed"));
    }
}
