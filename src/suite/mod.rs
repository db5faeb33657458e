//! # Suite Runner
//!
//! Runs the steps of one suite in source order, producing a `SuiteResult`.
//!
//! - Step `k`'s captures are on the runtime scope before step `k+1` begins
//!   interpolating.
//! - A failed step stops the suite; the remaining steps still appear in the
//!   result as `skipped`. A step marked `continue_on_error` lets the suite
//!   carry on past its failure.
//! - Per-step retry policies re-execute the step from a clean result.
//! - On success, exported names are materialised into the global registry;
//!   a missing export warns but does not fail.
//! - Cancellation is observed between steps and turns the suite result into
//!   a failure that says so.

use crate::calls::CallStack;
use crate::context::{ExportRegistry, Extensions, VariableContext};
use crate::events::{EventKind, RunEvents};
use crate::protocol::{JsonMap, ResponseDetails, StepResult, StepStatus, Suite, SuiteResult, SuiteStatus};
use crate::steps::StepExecutor;
use chrono::Utc;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{info, instrument, warn};

/// Scope seed for one suite execution: globals and environment from the run
/// configuration, imported maps from the suite's dependencies.
#[derive(Debug, Default, Clone)]
pub struct SuiteSeed {
    pub globals: JsonMap,
    pub environment: JsonMap,
    pub imported: Vec<(String, JsonMap)>,
}

/// Execute one suite.
#[instrument(name = "suite", skip_all, fields(node_id = %suite.node_id))]
pub async fn run_suite(
    executor: &StepExecutor,
    suite: &Suite,
    registry: Arc<ExportRegistry>,
    extensions: Arc<Extensions>,
    seed: SuiteSeed,
    events: Option<&RunEvents>,
) -> SuiteResult {
    let start_time = Utc::now();
    info!(suite = %suite.suite_name, steps = suite.steps.len(), "suite started");

    let mut ctx = VariableContext::new(registry, extensions);
    ctx.set_global_vars(&seed.globals);
    ctx.set_environment_vars(&seed.environment);
    ctx.set_suite_vars(&suite.variables);
    for (flow_id, vars) in seed.imported {
        ctx.add_imported(flow_id, vars);
    }

    let stack = CallStack::default();
    let mut results: Vec<StepResult> = Vec::with_capacity(suite.steps.len());
    let mut prev_response: Option<ResponseDetails> = None;
    let mut cancelled = false;
    let mut stopped_by: Option<String> = None;

    for step in &suite.steps {
        let step_id = step.effective_id();
        let qualified = format!("{}::{}", suite.node_id, step_id);

        if executor.services.cancel.is_cancelled() {
            cancelled = true;
            results.push(StepResult::skipped(&step_id, &qualified, "run cancelled"));
            continue;
        }
        if let Some(failed_step) = &stopped_by {
            results.push(StepResult::skipped(
                &step_id,
                &qualified,
                format!("previous step '{failed_step}' failed"),
            ));
            continue;
        }

        let retry = step.retry.unwrap_or_default();
        let max_attempts = retry.max_attempts.max(1);
        let mut attempt = 0u32;
        let result = loop {
            attempt += 1;
            let result = executor
                .execute_step(suite, step, &mut ctx, prev_response.as_ref(), &stack)
                .await;
            if result.status != StepStatus::Failure || attempt >= max_attempts {
                break result;
            }
            info!(
                step = %qualified,
                attempt,
                max_attempts,
                delay_ms = retry.delay_ms,
                "step failed, retrying"
            );
            sleep(Duration::from_millis(retry.delay_ms)).await;
        };

        if let Some(events) = events {
            events.emit(EventKind::StepCompleted {
                node_id: suite.node_id.clone(),
                step_id: result.step_id.clone(),
                status: result.status,
                duration_ms: result.duration_ms,
            });
        }

        if let Some(response) = &result.response_details {
            prev_response = Some(response.clone());
        }
        if result.status == StepStatus::Failure && !step.continue_on_error {
            stopped_by = Some(step_id.clone());
        }
        results.push(result);
    }

    let mut suite_result = SuiteResult::from_steps(suite, start_time, Utc::now(), results, None);

    if cancelled {
        suite_result.status = SuiteStatus::Failure;
        suite_result.error_message =
            Some("suite cancelled: run cancellation observed between steps".to_string());
    }

    // Exports happen only after success.
    if suite_result.status == SuiteStatus::Success {
        for name in &suite.exports {
            if !ctx.export(&suite.node_id, name) {
                warn!(suite = %suite.node_id, export = %name, "exported variable has no value, skipping");
            }
        }
    }

    info!(
        suite = %suite.node_id,
        status = ?suite_result.status,
        steps_failed = suite_result.steps_failed,
        duration_ms = suite_result.duration_ms,
        "suite finished"
    );
    suite_result
}
