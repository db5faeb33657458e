//! # Capture Evaluator
//!
//! Extracts named values from a response into the runtime scope so later
//! steps (and dependent suites, via exports) can use them:
//!
//! ```yaml
//! capture:
//!   auth_token: body.data.token        # path into the response
//!   status: status_code
//!   trace_id: headers.x-trace-id
//!   greeting: "Hello {{body.user.name}}"   # template expression
//! ```
//!
//! Capture errors never fail the step: the name is omitted, a warning is
//! logged, and the failure is visible in the returned record list.

use crate::assertions::ResponseView;
use crate::context::VariableContext;
use crate::protocol::JsonMap;
use serde_json::Value;
use tracing::{debug, warn};

/// Outcome of one capture rule, kept for report detail.
#[derive(Debug, Clone)]
pub struct CaptureRecord {
    pub name: String,
    pub expression: String,
    pub value: Option<Value>,
    pub error: Option<String>,
}

/// Evaluate every capture rule against the response. Returns the
/// successfully captured values (insertion order follows the `capture`
/// block) plus per-rule records.
pub fn evaluate(
    captures: &JsonMap,
    context: &VariableContext,
    response: Option<&ResponseView>,
) -> (JsonMap, Vec<CaptureRecord>) {
    let mut values = JsonMap::new();
    let mut records = Vec::with_capacity(captures.len());

    for (name, expression) in captures {
        let record = evaluate_single(name, expression, context, response);
        match (&record.value, &record.error) {
            (Some(value), _) => {
                debug!(capture = %name, "captured value");
                values.insert(name.clone(), value.clone());
            }
            (None, Some(error)) => {
                warn!(capture = %name, error = %error, "capture failed, name omitted");
            }
            (None, None) => {}
        }
        records.push(record);
    }

    (values, records)
}

fn evaluate_single(
    name: &str,
    expression: &Value,
    context: &VariableContext,
    response: Option<&ResponseView>,
) -> CaptureRecord {
    let rendered_expr = match expression {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    let value = match expression {
        Value::String(expr) => {
            if expr.contains("{{") {
                // Template form: interpolate with the response fields
                // overlaid so `{{body.x}}` and `{{status_code}}` resolve.
                let scoped = match response {
                    Some(view) => context.with_response(&view.to_details()),
                    None => context.clone(),
                };
                let resolved = scoped.interpolate(&Value::String(expr.clone()), true);
                match &resolved {
                    // Interpolation preserves unresolved placeholders; for a
                    // capture that means failure, not a literal.
                    Value::String(s) if s.contains("{{") => None,
                    other => Some(other.clone()),
                }
            } else {
                // Path form into the response, falling back to the variable
                // scopes for expressions like `user_id`.
                response
                    .and_then(|view| view.resolve_path(expr))
                    .or_else(|| context.get(expr))
            }
        }
        // Non-string rules capture the (interpolated) literal.
        other => Some(context.interpolate(other, true)),
    };

    match value {
        Some(value) => CaptureRecord {
            name: name.to_string(),
            expression: rendered_expr,
            value: Some(value),
            error: None,
        },
        None => CaptureRecord {
            name: name.to_string(),
            expression: rendered_expr.clone(),
            value: None,
            error: Some(format!("expression '{rendered_expr}' produced no value")),
        },
    }
}
