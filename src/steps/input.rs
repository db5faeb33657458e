//! Input strategy: prompt the operator, capture the answer as a runtime
//! variable. Prompting is a suspension point, so it races the run's
//! cancellation token through the step-level wrapper.

use super::{mark_failure, run_hooks, StepExecutor};
use crate::context::VariableContext;
use crate::errors::ErrorCode;
use crate::expressions::stringified;
use crate::protocol::{InputSpec, Step, StepResult};
use crate::redaction::REDACTED;
use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

/// How the engine asks a human (or a harness) for a value.
#[async_trait]
pub trait InputProvider: Send + Sync {
    /// Ask for the value described by `spec`. `rendered_prompt` has been
    /// interpolated already.
    async fn prompt(&self, rendered_prompt: &str, spec: &InputSpec) -> Result<Value, String>;
}

/// Reads one line from stdin on a blocking task.
pub struct StdinInput;

#[async_trait]
impl InputProvider for StdinInput {
    async fn prompt(&self, rendered_prompt: &str, spec: &InputSpec) -> Result<Value, String> {
        let prompt = rendered_prompt.to_string();
        let default = spec.default.clone();
        let answer = tokio::task::spawn_blocking(move || {
            use std::io::Write;
            let mut out = std::io::stdout();
            let _ = write!(out, "{prompt} ");
            let _ = out.flush();
            let mut line = String::new();
            std::io::stdin()
                .read_line(&mut line)
                .map(|_| line.trim_end_matches(['\n', '\r']).to_string())
        })
        .await
        .map_err(|e| format!("input task failed: {e}"))?
        .map_err(|e| format!("cannot read stdin: {e}"))?;

        if answer.is_empty() {
            return default.ok_or_else(|| "empty input and no default".to_string());
        }
        // Numeric and boolean answers keep their type.
        Ok(coerce(&answer))
    }
}

/// Non-interactive contexts (orchestrator, `--non-interactive`): the
/// declared default answers, or the step fails.
pub struct NonInteractiveInput;

#[async_trait]
impl InputProvider for NonInteractiveInput {
    async fn prompt(&self, _rendered_prompt: &str, spec: &InputSpec) -> Result<Value, String> {
        spec.default.clone().ok_or_else(|| {
            format!(
                "input '{}' has no default and the run is non-interactive",
                spec.variable
            )
        })
    }
}

fn coerce(raw: &str) -> Value {
    if let Ok(parsed) = serde_json::from_str::<Value>(raw) {
        match parsed {
            Value::Number(_) | Value::Bool(_) | Value::Null => return parsed,
            _ => {}
        }
    }
    Value::String(raw.to_string())
}

pub(crate) async fn execute(
    executor: &StepExecutor,
    step: &Step,
    spec: &InputSpec,
    ctx: &mut VariableContext,
    result: &mut StepResult,
) {
    let hooks = step.hooks.as_ref();
    run_hooks(
        "pre_input",
        hooks.map(|h| h.pre_input.as_slice()),
        ctx,
        &mut result.dynamic_assignments,
    )
    .await;

    let rendered = stringified(&ctx.interpolate_string(&spec.prompt, true));
    match executor.services.input.prompt(&rendered, spec).await {
        Ok(value) => {
            ctx.set_runtime(spec.variable.clone(), value.clone());
            // Masked answers stay usable in the runtime scope but never
            // appear in results.
            let reported = if spec.masked {
                Value::String(REDACTED.to_string())
            } else {
                value
            };
            result
                .captured
                .insert(spec.variable.clone(), reported.clone());
            result
                .dynamic_assignments
                .insert(spec.variable.clone(), reported);
        }
        Err(message) => {
            warn!(variable = %spec.variable, %message, "input failed");
            mark_failure(result, ErrorCode::INPUT_FAILED, message);
        }
    }

    run_hooks(
        "post_input",
        hooks.map(|h| h.post_input.as_slice()),
        ctx,
        &mut result.dynamic_assignments,
    )
    .await;
}

#[cfg(test)]
pub(crate) struct QueuedInput {
    answers: std::sync::Mutex<std::collections::VecDeque<Value>>,
}

#[cfg(test)]
impl QueuedInput {
    pub fn new(answers: Vec<Value>) -> Self {
        Self {
            answers: std::sync::Mutex::new(answers.into()),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl InputProvider for QueuedInput {
    async fn prompt(&self, _rendered_prompt: &str, spec: &InputSpec) -> Result<Value, String> {
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| spec.default.clone())
            .ok_or_else(|| format!("no queued answer for '{}'", spec.variable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::CallStack;
    use crate::protocol::{StepStatus, Suite};
    use crate::steps::testing::{context_for, executor_with, suite_fixture};
    use crate::transport::testing::StaticTransport;
    use serde_json::json;

    fn input_suite() -> Suite {
        suite_fixture(json!({
            "suite_name": "Inputs",
            "node_id": "inputs",
            "steps": [
                {
                    "name": "Ask code",
                    "input": {"prompt": "MFA code for {{user}}?", "variable": "mfa_code"}
                },
                {
                    "name": "Ask secret",
                    "input": {"prompt": "API secret?", "variable": "api_secret", "masked": true}
                },
                {
                    "name": "With default",
                    "input": {"prompt": "Region?", "variable": "region", "default": "eu-west-1"}
                }
            ]
        }))
    }

    #[tokio::test]
    async fn captures_answer_into_runtime_and_result() {
        let suite = input_suite();
        let executor = executor_with(StaticTransport::new(), vec![], vec![json!(123456)]);
        let mut ctx = context_for(&executor);
        ctx.set_runtime("user", json!("ada"));
        let stack = CallStack::default();

        let result = executor
            .execute_step(&suite, &suite.steps[0], &mut ctx, None, &stack)
            .await;
        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(ctx.get("mfa_code"), Some(json!(123456)));
        assert_eq!(result.captured.get("mfa_code"), Some(&json!(123456)));
    }

    #[tokio::test]
    async fn masked_answers_are_redacted_in_results_only() {
        let suite = input_suite();
        let executor = executor_with(StaticTransport::new(), vec![], vec![json!("s3cr3t")]);
        let mut ctx = context_for(&executor);
        let stack = CallStack::default();

        let result = executor
            .execute_step(&suite, &suite.steps[1], &mut ctx, None, &stack)
            .await;
        assert_eq!(ctx.get("api_secret"), Some(json!("s3cr3t")));
        assert_eq!(result.captured.get("api_secret"), Some(&json!(REDACTED)));
    }

    #[tokio::test]
    async fn default_answers_when_queue_is_empty() {
        let suite = input_suite();
        let executor = executor_with(StaticTransport::new(), vec![], vec![]);
        let mut ctx = context_for(&executor);
        let stack = CallStack::default();

        let result = executor
            .execute_step(&suite, &suite.steps[2], &mut ctx, None, &stack)
            .await;
        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(ctx.get("region"), Some(json!("eu-west-1")));
    }

    #[tokio::test]
    async fn missing_answer_without_default_fails_step() {
        let suite = input_suite();
        let executor = executor_with(StaticTransport::new(), vec![], vec![]);
        let mut ctx = context_for(&executor);
        let stack = CallStack::default();

        let result = executor
            .execute_step(&suite, &suite.steps[0], &mut ctx, None, &stack)
            .await;
        assert_eq!(result.status, StepStatus::Failure);
        assert_eq!(result.error_code.as_deref(), Some("E5003"));
    }

    #[test]
    fn stdin_coercion_keeps_types() {
        assert_eq!(coerce("42"), json!(42));
        assert_eq!(coerce("true"), json!(true));
        assert_eq!(coerce("plain words"), json!("plain words"));
        assert_eq!(coerce("[not json"), json!("[not json"));
    }

    #[test]
    fn non_interactive_uses_default_or_fails() {
        let spec: InputSpec = serde_json::from_value(json!({
            "prompt": "?", "variable": "v", "default": "d"
        }))
        .unwrap();
        let provider = NonInteractiveInput;
        let got = futures::executor::block_on(provider.prompt("?", &spec)).unwrap();
        assert_eq!(got, json!("d"));

        let bare: InputSpec =
            serde_json::from_value(json!({"prompt": "?", "variable": "v"})).unwrap();
        assert!(futures::executor::block_on(provider.prompt("?", &bare)).is_err());
    }
}
