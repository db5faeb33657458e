//! # Call Service
//!
//! Executes a named step from another suite. The callee runs with an
//! isolated context by default (passed variables + its own suite variables +
//! the global registry); `isolate_context: false` additionally copies the
//! caller's runtime scope. Captured values propagate back to the caller,
//! optionally nested under an alias.
//!
//! A call stack of `(suite_id, step_id)` frames threads through nested
//! calls: a frame may not appear twice (loop detection) and total depth is
//! bounded by the engine limits. Loop and depth violations always fail the
//! step; `on_error` leniency applies only to the callee's own outcome.

use crate::context::VariableContext;
use crate::errors::ErrorCode;
use crate::protocol::{
    CallErrorMode, CallSpec, JsonMap, Step, StepResult, StepStatus, Suite,
};
use crate::steps::{mark_failure, StepExecutor};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// One frame of the call stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFrame {
    pub suite_id: String,
    pub step_id: String,
}

/// Immutable stack of currently-executing call frames.
#[derive(Debug, Clone, Default)]
pub struct CallStack {
    frames: Vec<CallFrame>,
}

impl CallStack {
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn contains(&self, frame: &CallFrame) -> bool {
        self.frames.contains(frame)
    }

    /// Extend the stack with a frame, enforcing the loop and depth bounds.
    pub fn push(&self, frame: CallFrame, max_depth: usize) -> Result<CallStack, (ErrorCode, String)> {
        if self.contains(&frame) {
            let chain: Vec<String> = self
                .frames
                .iter()
                .chain(std::iter::once(&frame))
                .map(|f| format!("{}::{}", f.suite_id, f.step_id))
                .collect();
            return Err((
                ErrorCode::CALL_LOOP_DETECTED,
                format!("call loop detected: {}", chain.join(" -> ")),
            ));
        }
        if self.frames.len() >= max_depth {
            return Err((
                ErrorCode::CALL_DEPTH_EXCEEDED,
                format!("call depth limit {max_depth} exceeded"),
            ));
        }
        let mut frames = self.frames.clone();
        frames.push(frame);
        Ok(CallStack { frames })
    }
}

pub(crate) async fn execute_call_step(
    executor: &StepExecutor,
    caller_suite: &Suite,
    _step: &Step,
    spec: &CallSpec,
    ctx: &mut VariableContext,
    stack: &CallStack,
    result: &mut StepResult,
) {
    let caller_dir = caller_suite
        .source_path
        .as_deref()
        .and_then(Path::parent);

    // Resolve the target suite by node id, then by confined path.
    let callee_suite = match executor.services.index.resolve(&spec.suite, caller_dir) {
        Some(suite) => suite,
        None => {
            mark_failure(
                result,
                ErrorCode::CALL_TARGET_NOT_FOUND,
                format!("call target suite '{}' not found", spec.suite),
            );
            return;
        }
    };

    let callee_step = match find_step(&callee_suite, &spec.step) {
        Some(step) => step,
        None => {
            mark_failure(
                result,
                ErrorCode::CALL_TARGET_NOT_FOUND,
                format!(
                    "suite '{}' has no step '{}'",
                    callee_suite.node_id, spec.step
                ),
            );
            return;
        }
    };

    let frame = CallFrame {
        suite_id: callee_suite.node_id.clone(),
        step_id: callee_step.effective_id(),
    };
    // Loop/depth violations bypass on_error: a cyclic call must always fail.
    let nested_stack = match stack.push(frame, executor.services.limits.max_call_depth) {
        Ok(stack) => stack,
        Err((code, message)) => {
            warn!(%message, "rejecting cross-suite call");
            mark_failure(result, code, message);
            return;
        }
    };

    // Assemble the callee's context.
    let mut callee_ctx = ctx.derive_for_callee(spec.isolate_context);
    callee_ctx.set_suite_vars(&callee_suite.variables);
    if let Some(passed) = &spec.variables {
        for (name, value) in passed {
            let resolved = ctx.interpolate(value, false);
            callee_ctx.set_runtime(name.clone(), resolved);
        }
    }

    debug!(
        callee = %format!("{}::{}", callee_suite.node_id, callee_step.effective_id()),
        depth = nested_stack.depth(),
        isolate = spec.isolate_context,
        "executing cross-suite call"
    );

    let callee_result = executor
        .execute_step_boxed(&callee_suite, callee_step, &mut callee_ctx, None, &nested_stack)
        .await;

    // Surface the callee's observable behaviour on the calling step.
    result.request_details = callee_result.request_details.clone();
    result.response_details = callee_result.response_details.clone();
    result.assertions.extend(callee_result.assertions.clone());

    // Propagate captured values, alias-nested when requested.
    let propagated = propagate(&callee_result, spec.alias.as_deref());
    for (name, value) in &propagated {
        ctx.set_runtime(name.clone(), value.clone());
    }
    merge_captures(result, &callee_result, spec.alias.as_deref());

    if callee_result.status == StepStatus::Failure {
        let callee_error = callee_result
            .error_message
            .clone()
            .unwrap_or_else(|| "callee failed".to_string());
        match spec.on_error {
            CallErrorMode::Fail => {
                mark_failure(
                    result,
                    ErrorCode::CALL_FAILED,
                    format!(
                        "call to {}::{} failed: {callee_error}",
                        callee_suite.node_id, spec.step
                    ),
                );
            }
            CallErrorMode::Continue => {
                result.error_message = Some(callee_error);
            }
            CallErrorMode::Warn => {
                warn!(
                    callee = %format!("{}::{}", callee_suite.node_id, spec.step),
                    error = %callee_error,
                    "call failed, continuing per on_error=warn"
                );
            }
        }
    }
}

fn find_step<'a>(suite: &'a Arc<Suite>, reference: &str) -> Option<&'a Step> {
    suite
        .steps
        .iter()
        .find(|s| s.effective_id() == reference || s.name == reference)
}

/// The caller-visible variable set: callee captures (and input/script
/// assignments), nested under the alias when one is given.
fn propagate(callee_result: &StepResult, alias: Option<&str>) -> JsonMap {
    let mut flat = JsonMap::new();
    for (name, value) in &callee_result.captured {
        flat.insert(name.clone(), value.clone());
    }
    for (name, value) in &callee_result.dynamic_assignments {
        flat.entry(name.clone()).or_insert_with(|| value.clone());
    }
    match alias {
        Some(alias) => {
            let mut out = JsonMap::new();
            out.insert(alias.to_string(), Value::Object(flat));
            out
        }
        None => flat,
    }
}

fn merge_captures(result: &mut StepResult, callee_result: &StepResult, alias: Option<&str>) {
    for (name, value) in &callee_result.captured {
        let key = match alias {
            Some(alias) => format!("{alias}.{name}"),
            None => name.clone(),
        };
        result.captured.insert(key, value.clone());
    }
}
