//! Request strategy: the full §request lifecycle.
//!
//! Order of operations, each inside a success/continue/failed decision:
//! pre-request hooks and script, interpolation (merging suite TLS), the
//! transport call (recording one performance datum per attempt), post-request
//! hooks and script, scenarios, assertions, captures, then inputs when the
//! step declares both `request` and `input`.

use super::{mark_failure, run_hooks, run_script, StepExecutor};
use crate::assertions::{self, ResponseView};
use crate::captures;
use crate::context::VariableContext;
use crate::errors::ErrorCode;
use crate::expressions::stringified;
use crate::protocol::{
    AuthSpec, JsonMap, PerformanceDatum, RequestDetails, RequestSpec, ResponseDetails, Step,
    StepResult, StepStatus, Suite,
};
use crate::scenarios;
use crate::transport::{TransportError, TransportRequest};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use serde_json::Value;
use std::time::Instant;
use tracing::warn;

pub(crate) async fn execute(
    executor: &StepExecutor,
    suite: &Suite,
    step: &Step,
    spec: &RequestSpec,
    ctx: &mut VariableContext,
    result: &mut StepResult,
) {
    let hooks = step.hooks.as_ref();
    run_hooks(
        "pre_request",
        hooks.map(|h| h.pre_request.as_slice()),
        ctx,
        &mut result.dynamic_assignments,
    )
    .await;

    if let Some(script) = &step.pre_script {
        if let Err((code, message)) = run_script(
            "pre",
            script,
            ctx,
            None,
            executor.services.limits.script_budget,
            &mut result.dynamic_assignments,
        )
        .await
        {
            if step.continue_on_error {
                warn!(step = %result.qualified_step_id, %message, "pre script failed, continuing");
            } else {
                mark_failure(result, code, message);
                return;
            }
        }
    }

    let (details, outcome) = perform_http(executor, suite, &result.qualified_step_id, spec, ctx).await;
    result.request_details = Some(details);
    let response = match outcome {
        Ok(response) => response,
        Err(e) => {
            mark_failure(result, e.code(), e.to_string());
            return;
        }
    };
    result.response_details = Some(response.clone());

    run_hooks(
        "post_request",
        hooks.map(|h| h.post_request.as_slice()),
        ctx,
        &mut result.dynamic_assignments,
    )
    .await;

    if let Some(script) = &step.post_script {
        if let Err((code, message)) = run_script(
            "post",
            script,
            ctx,
            Some(&response),
            executor.services.limits.script_budget,
            &mut result.dynamic_assignments,
        )
        .await
        {
            if step.continue_on_error {
                warn!(step = %result.qualified_step_id, %message, "post script failed, continuing");
            } else {
                mark_failure(result, code, message);
                return;
            }
        }
    }

    apply_scenarios(executor, suite, step, ctx, Some(&response), result).await;

    run_hooks(
        "pre_assert",
        hooks.map(|h| h.pre_assert.as_slice()),
        ctx,
        &mut result.dynamic_assignments,
    )
    .await;
    if let Some(asserts) = &step.assertions {
        let view = ResponseView::of(&response);
        let block = resolve_assert_block(asserts, ctx);
        let outcomes = assertions::validate(&block, &view);
        result.assertions.extend(outcomes);
    }
    if result.assertions.iter().any(|a| !a.passed) {
        let failed = result.assertions.iter().filter(|a| !a.passed).count();
        mark_failure(
            result,
            ErrorCode::ASSERTION_FAILED,
            format!("{failed} assertion(s) failed"),
        );
    }
    run_hooks(
        "post_assert",
        hooks.map(|h| h.post_assert.as_slice()),
        ctx,
        &mut result.dynamic_assignments,
    )
    .await;

    run_hooks(
        "pre_capture",
        hooks.map(|h| h.pre_capture.as_slice()),
        ctx,
        &mut result.dynamic_assignments,
    )
    .await;
    if let Some(capture_block) = &step.captures {
        let view = ResponseView::of(&response);
        let (values, _records) = captures::evaluate(capture_block, ctx, Some(&view));
        ctx.set_many(&values);
        for (name, value) in values {
            result.captured.insert(name, value);
        }
    }
    run_hooks(
        "post_capture",
        hooks.map(|h| h.post_capture.as_slice()),
        ctx,
        &mut result.dynamic_assignments,
    )
    .await;

    // Inputs declared alongside a request run last; their captures merge
    // into this result.
    if let Some(input_spec) = &step.input {
        super::input::execute(executor, step, input_spec, ctx, result).await;
    }
}

/// Scenario-only strategy: evaluate guards against the previous step's
/// response, if any. An unmatched step is `skipped`.
pub(crate) async fn execute_scenario_only(
    executor: &StepExecutor,
    suite: &Suite,
    step: &Step,
    ctx: &mut VariableContext,
    prev_response: Option<&ResponseDetails>,
    result: &mut StepResult,
) {
    let matched = apply_scenarios(executor, suite, step, ctx, prev_response, result).await;
    if !matched && result.status == StepStatus::Success {
        result.status = StepStatus::Skipped;
        result.error_message = Some("no scenario matched".to_string());
    }
}

/// Select and apply scenario branches: variables, nested request, branch
/// assertions and captures all merge into the step result. Returns whether
/// a branch was selected.
pub(crate) async fn apply_scenarios(
    executor: &StepExecutor,
    suite: &Suite,
    step: &Step,
    ctx: &mut VariableContext,
    response: Option<&ResponseDetails>,
    result: &mut StepResult,
) -> bool {
    if step.scenarios.is_empty() {
        return false;
    }

    let view_holder = response.cloned();
    let view = view_holder.as_ref().map(ResponseView::of);
    let outcome = scenarios::process(
        &step.scenarios,
        ctx,
        view.as_ref(),
        executor.services.limits.max_scenario_depth,
    );
    result.scenario_meta = outcome.meta;
    let matched = !outcome.branches.is_empty();

    // The branch's own request response, when present, becomes the basis
    // for that branch's assertions and captures.
    let mut branch_response: Option<ResponseDetails> = None;

    for branch in &outcome.branches {
        if let Some(vars) = &branch.variables {
            for (name, value) in vars {
                let resolved = ctx.interpolate(value, false);
                ctx.set_runtime(name.clone(), resolved.clone());
                result.dynamic_assignments.insert(name.clone(), resolved);
            }
        }

        if let Some(branch_request) = &branch.request {
            let (details, sent) = perform_http(
                executor,
                suite,
                &result.qualified_step_id,
                branch_request,
                ctx,
            )
            .await;
            if result.request_details.is_none() {
                result.request_details = Some(details);
            }
            match sent {
                Ok(resp) => {
                    if result.response_details.is_none() {
                        result.response_details = Some(resp.clone());
                    }
                    branch_response = Some(resp);
                }
                Err(e) => {
                    mark_failure(result, e.code(), e.to_string());
                }
            }
        }

        let effective_holder = branch_response.clone().or_else(|| response.cloned());
        let effective_view = effective_holder.as_ref().map(ResponseView::of);

        if let Some(asserts) = &branch.assertions {
            let block = resolve_assert_block(asserts, ctx);
            let outcomes = match &effective_view {
                Some(view) => assertions::validate(&block, view),
                None => {
                    let empty_headers = JsonMap::new();
                    let null_body = Value::Null;
                    let synthetic = ResponseView {
                        status_code: 0,
                        headers: &empty_headers,
                        body: &null_body,
                        duration_ms: 0,
                    };
                    assertions::validate(&block, &synthetic)
                }
            };
            result.assertions.extend(outcomes);
        }

        if let Some(capture_block) = &branch.captures {
            let (values, _records) = captures::evaluate(capture_block, ctx, effective_view.as_ref());
            ctx.set_many(&values);
            for (name, value) in values {
                result.captured.insert(name, value);
            }
        }
    }

    if result.assertions.iter().any(|a| !a.passed) && result.status != StepStatus::Failure {
        let failed = result.assertions.iter().filter(|a| !a.passed).count();
        mark_failure(
            result,
            ErrorCode::ASSERTION_FAILED,
            format!("{failed} assertion(s) failed"),
        );
    }

    matched
}

/// Expected values inside an assert block may reference variables
/// (`{ equals: "{{account_id}}" }`); resolve them before evaluation.
fn resolve_assert_block(asserts: &JsonMap, ctx: &VariableContext) -> JsonMap {
    match ctx.interpolate(&Value::Object(asserts.clone()), false) {
        Value::Object(block) => block,
        _ => asserts.clone(),
    }
}

/// Interpolate a request spec, send it through the transport, and record a
/// performance datum for the attempt.
pub(crate) async fn perform_http(
    executor: &StepExecutor,
    suite: &Suite,
    step_label: &str,
    spec: &RequestSpec,
    ctx: &VariableContext,
) -> (RequestDetails, Result<ResponseDetails, TransportError>) {
    let raw_url = spec.url.clone();
    let mut url = stringified(&ctx.interpolate_string(&spec.url, false));

    if let Some(params) = &spec.params {
        let mut parts = Vec::with_capacity(params.len());
        for (key, value) in params {
            let rendered = stringified(&ctx.interpolate(value, false));
            parts.push(format!(
                "{}={}",
                urlencoding::encode(key),
                urlencoding::encode(&rendered)
            ));
        }
        if !parts.is_empty() {
            let separator = if url.contains('?') { '&' } else { '?' };
            url = format!("{url}{separator}{}", parts.join("&"));
        }
    }

    let mut headers = JsonMap::new();
    if let Some(declared) = &spec.headers {
        for (name, value) in declared {
            headers.insert(name.clone(), ctx.interpolate(value, false));
        }
    }
    match &spec.auth {
        Some(AuthSpec::Basic { username, password }) => {
            let user = stringified(&ctx.interpolate_string(username, false));
            let pass = stringified(&ctx.interpolate_string(password, false));
            let token = BASE64.encode(format!("{user}:{pass}"));
            headers.insert(
                "Authorization".to_string(),
                Value::String(format!("Basic {token}")),
            );
        }
        Some(AuthSpec::Bearer(token)) => {
            let token = stringified(&ctx.interpolate_string(token, false));
            headers.insert(
                "Authorization".to_string(),
                Value::String(format!("Bearer {token}")),
            );
        }
        None => {}
    }

    let body = spec.body.as_ref().map(|b| ctx.interpolate(b, false));
    // Suite-level TLS configuration applies when the request has none.
    let certificate = spec
        .certificate
        .clone()
        .or_else(|| suite.certificate.clone());
    let timeout = executor
        .services
        .limits
        .effective_step_timeout(spec.timeout_ms, suite.timeout_ms);

    let request = TransportRequest {
        method: spec.method.to_ascii_uppercase(),
        url: url.clone(),
        headers: headers.clone(),
        body: body.clone(),
        timeout,
        certificate,
    };

    let details = RequestDetails {
        method: request.method.clone(),
        url: url.clone(),
        raw_url,
        headers,
        body,
    };

    let started = Instant::now();
    let outcome = executor.services.transport.execute(step_label, &request).await;
    let elapsed = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(response) => {
            let response_time_ms = if response.duration_ms > 0 {
                response.duration_ms
            } else {
                elapsed
            };
            executor.services.perf.record(PerformanceDatum {
                method: request.method.clone(),
                url: url.clone(),
                response_time_ms,
                status_code: response.status_code,
                timestamp: Utc::now(),
            });
            (
                details,
                Ok(ResponseDetails {
                    status_code: response.status_code,
                    headers: response.headers,
                    body: response.body,
                    duration_ms: response.duration_ms,
                }),
            )
        }
        Err(e) => {
            executor.services.perf.record(PerformanceDatum {
                method: request.method.clone(),
                url: url.clone(),
                response_time_ms: elapsed,
                status_code: 0,
                timestamp: Utc::now(),
            });
            (details, Err(e))
        }
    }
}
