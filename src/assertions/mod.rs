//! # Assertion Evaluator
//!
//! Strategy-dispatched predicate evaluation over a response value tree.
//!
//! A step's `assert` block maps response paths to predicate nodes:
//!
//! ```yaml
//! assert:
//!   status_code: 200                 # shorthand for { equals: 200 }
//!   body.user.name: { equals: "Ada", type: string }
//!   body.items: { length: { greater_than: 0, less_than: 10 } }
//!   headers.content-type: { contains: json }
//! ```
//!
//! Each predicate key selects exactly one strategy; a single node may yield
//! multiple outcomes (nested `length` comparisons), appended in source order.
//! The step fails iff at least one outcome has `passed = false`. Evaluation
//! is pure: the same `(assert block, response)` pair always yields a
//! structurally identical outcome list.

use crate::expressions::{as_number, coercing_eq, stringified};
use crate::protocol::{AssertionOutcome, JsonMap, ResponseDetails};
use jsonschema::JSONSchema;
use regex::Regex;
use serde_json::Value;

/// Borrowed view of a response, with dotted-path resolution.
#[derive(Debug, Clone, Copy)]
pub struct ResponseView<'a> {
    pub status_code: u16,
    pub headers: &'a JsonMap,
    pub body: &'a Value,
    pub duration_ms: u64,
}

impl<'a> ResponseView<'a> {
    pub fn of(details: &'a ResponseDetails) -> Self {
        Self {
            status_code: details.status_code,
            headers: &details.headers,
            body: &details.body,
            duration_ms: details.duration_ms,
        }
    }

    /// Owned details, for building a response overlay context.
    pub fn to_details(&self) -> ResponseDetails {
        ResponseDetails {
            status_code: self.status_code,
            headers: self.headers.clone(),
            body: self.body.clone(),
            duration_ms: self.duration_ms,
        }
    }

    /// Resolve an assertion path. `status_code` and `duration_ms` address
    /// the envelope, `headers.<name>` addresses headers (case-insensitive),
    /// `body.<path>` or a bare path addresses the body. `None` means the
    /// path does not exist ("undefined").
    pub fn resolve_path(&self, path: &str) -> Option<Value> {
        match path {
            "status_code" => return Some(Value::Number(self.status_code.into())),
            "duration_ms" => return Some(Value::Number(self.duration_ms.into())),
            "body" => return Some(self.body.clone()),
            "headers" => return Some(Value::Object(self.headers.clone())),
            _ => {}
        }

        if let Some(rest) = path.strip_prefix("headers.") {
            return self
                .headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(rest))
                .map(|(_, v)| v.clone());
        }

        let body_path = path.strip_prefix("body.").unwrap_or(path);
        let mut current = self.body.clone();
        for segment in body_path.split('.') {
            current = match &current {
                Value::Object(map) => map.get(segment)?.clone(),
                Value::Array(items) => {
                    let index: usize = segment.parse().ok()?;
                    items.get(index)?.clone()
                }
                _ => return None,
            };
        }
        Some(current)
    }
}

/// Predicate keys the dispatcher recognises.
const KNOWN_PREDICATES: &[&str] = &[
    "equals",
    "not_equals",
    "contains",
    "not_contains",
    "regex",
    "pattern",
    "type",
    "exists",
    "greater_than",
    "less_than",
    "greater_than_or_equal",
    "less_than_or_equal",
    "in",
    "not_in",
    "length",
    "min_length",
    "minLength",
    "not_empty",
    "matches_schema",
];

/// Evaluate a whole `assert` block against a response.
pub fn validate(assertions: &JsonMap, view: &ResponseView) -> Vec<AssertionOutcome> {
    let mut outcomes = Vec::new();
    for (field_path, node) in assertions {
        let actual = view.resolve_path(field_path);
        match node {
            Value::Object(predicates)
                if predicates.keys().any(|k| KNOWN_PREDICATES.contains(&k.as_str())) =>
            {
                for (key, expected) in predicates {
                    evaluate_predicate(field_path, key, expected, actual.as_ref(), &mut outcomes);
                }
            }
            // Anything else is shorthand for equality.
            other => {
                outcomes.push(equals_outcome(field_path, other, actual.as_ref(), false));
            }
        }
    }
    outcomes
}

fn evaluate_predicate(
    field_path: &str,
    key: &str,
    expected: &Value,
    actual: Option<&Value>,
    outcomes: &mut Vec<AssertionOutcome>,
) {
    match key {
        "equals" => outcomes.push(equals_outcome(field_path, expected, actual, false)),
        "not_equals" => outcomes.push(equals_outcome(field_path, expected, actual, true)),
        "contains" => outcomes.push(contains_outcome(field_path, expected, actual, false)),
        "not_contains" => outcomes.push(contains_outcome(field_path, expected, actual, true)),
        "regex" | "pattern" => outcomes.push(regex_outcome(field_path, expected, actual)),
        "type" => outcomes.push(type_outcome(field_path, expected, actual)),
        "exists" => outcomes.push(exists_outcome(field_path, expected, actual)),
        "greater_than" | "less_than" | "greater_than_or_equal" | "less_than_or_equal" => {
            outcomes.push(ordering_outcome(field_path, key, expected, actual))
        }
        "in" => outcomes.push(membership_outcome(field_path, expected, actual, false)),
        "not_in" => outcomes.push(membership_outcome(field_path, expected, actual, true)),
        "length" => length_outcomes(field_path, expected, actual, outcomes),
        "min_length" | "minLength" => outcomes.push(min_length_outcome(field_path, expected, actual)),
        "not_empty" => outcomes.push(not_empty_outcome(field_path, expected, actual)),
        "matches_schema" => outcomes.push(schema_outcome(field_path, expected, actual)),
        unknown => outcomes.push(AssertionOutcome {
            field_path: field_path.to_string(),
            expected: expected.clone(),
            actual: actual.cloned().unwrap_or(Value::Null),
            passed: false,
            message: format!("unknown assertion predicate '{unknown}'"),
        }),
    }
}

fn actual_or_null(actual: Option<&Value>) -> Value {
    actual.cloned().unwrap_or(Value::Null)
}

fn equals_outcome(
    field_path: &str,
    expected: &Value,
    actual: Option<&Value>,
    negated: bool,
) -> AssertionOutcome {
    let actual_value = actual_or_null(actual);
    let equal = coercing_eq(&actual_value, expected);
    let passed = equal != negated;
    let verb = if negated { "not_equals" } else { "equals" };
    AssertionOutcome {
        field_path: field_path.to_string(),
        expected: expected.clone(),
        actual: actual_value.clone(),
        passed,
        message: if passed {
            format!("{field_path} {verb} {expected}")
        } else if negated {
            format!("{field_path} should differ from {expected}")
        } else {
            format!("{field_path} expected {expected}, got {actual_value}")
        },
    }
}

fn contains_outcome(
    field_path: &str,
    expected: &Value,
    actual: Option<&Value>,
    negated: bool,
) -> AssertionOutcome {
    let actual_value = actual_or_null(actual);
    let (holds, detail) = match &actual_value {
        Value::String(s) => (s.contains(&stringified(expected)), None),
        Value::Array(items) => (items.iter().any(|i| coercing_eq(i, expected)), None),
        Value::Object(map) => match expected.as_str() {
            Some(key) => (map.contains_key(key), None),
            None => (false, Some("mapping containment needs a string key")),
        },
        // Non-containers trivially do not contain; `not_contains` holds.
        _ => (
            false,
            Some(if negated {
                ""
            } else {
                "contains requires a string, sequence or mapping"
            }),
        ),
    };
    let trivially_ok = negated && matches!(detail, Some("") | None);
    let passed = if negated { trivially_ok && !holds } else { holds && detail.is_none() };
    let verb = if negated { "not_contains" } else { "contains" };
    AssertionOutcome {
        field_path: field_path.to_string(),
        expected: expected.clone(),
        actual: actual_value.clone(),
        passed,
        message: match detail {
            Some(d) if !d.is_empty() => format!("{field_path}: {d}"),
            _ if passed => format!("{field_path} {verb} {expected}"),
            _ => format!("{field_path} {verb} {expected} failed (got {actual_value})"),
        },
    }
}

fn regex_outcome(field_path: &str, expected: &Value, actual: Option<&Value>) -> AssertionOutcome {
    let actual_value = actual_or_null(actual);
    let pattern = match expected.as_str() {
        Some(p) => p,
        None => {
            return AssertionOutcome {
                field_path: field_path.to_string(),
                expected: expected.clone(),
                actual: actual_value,
                passed: false,
                message: format!("{field_path}: regex pattern must be a string"),
            }
        }
    };
    let re = match Regex::new(pattern) {
        Ok(re) => re,
        Err(e) => {
            return AssertionOutcome {
                field_path: field_path.to_string(),
                expected: expected.clone(),
                actual: actual_value,
                passed: false,
                message: format!("{field_path}: invalid regex '{pattern}': {e}"),
            }
        }
    };
    match &actual_value {
        Value::String(s) => {
            let passed = re.is_match(s);
            AssertionOutcome {
                field_path: field_path.to_string(),
                expected: expected.clone(),
                actual: actual_value.clone(),
                passed,
                message: if passed {
                    format!("{field_path} matches /{pattern}/")
                } else {
                    format!("{field_path} '{s}' does not match /{pattern}/")
                },
            }
        }
        other => AssertionOutcome {
            field_path: field_path.to_string(),
            expected: expected.clone(),
            actual: other.clone(),
            passed: false,
            message: format!("{field_path}: regex requires a string value, got {other}"),
        },
    }
}

/// Type name in the assertion vocabulary: distinguishes `array`, `object`,
/// `null` and `undefined` beyond the usual primitive set.
pub fn type_name(actual: Option<&Value>) -> &'static str {
    match actual {
        None => "undefined",
        Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "boolean",
        Some(Value::Number(_)) => "number",
        Some(Value::String(_)) => "string",
        Some(Value::Array(_)) => "array",
        Some(Value::Object(_)) => "object",
    }
}

fn type_outcome(field_path: &str, expected: &Value, actual: Option<&Value>) -> AssertionOutcome {
    let name = type_name(actual);
    let expected_name = expected.as_str().unwrap_or("");
    let passed = name == expected_name;
    AssertionOutcome {
        field_path: field_path.to_string(),
        expected: expected.clone(),
        actual: actual_or_null(actual),
        passed,
        message: if passed {
            format!("{field_path} is {name}")
        } else {
            format!("{field_path} expected type {expected_name}, got {name}")
        },
    }
}

fn exists_outcome(field_path: &str, expected: &Value, actual: Option<&Value>) -> AssertionOutcome {
    let present = matches!(actual, Some(v) if !v.is_null());
    let want_present = expected.as_bool().unwrap_or(true);
    let passed = present == want_present;
    AssertionOutcome {
        field_path: field_path.to_string(),
        expected: expected.clone(),
        actual: actual_or_null(actual),
        passed,
        message: if passed {
            format!("{field_path} existence is {present}")
        } else if want_present {
            format!("{field_path} should exist but is {}", type_name(actual))
        } else {
            format!("{field_path} should not exist")
        },
    }
}

fn ordering_outcome(
    field_path: &str,
    op: &str,
    expected: &Value,
    actual: Option<&Value>,
) -> AssertionOutcome {
    let actual_value = actual_or_null(actual);
    match (as_number(&actual_value), as_number(expected)) {
        (Some(a), Some(b)) => {
            let passed = match op {
                "greater_than" => a > b,
                "less_than" => a < b,
                "greater_than_or_equal" => a >= b,
                "less_than_or_equal" => a <= b,
                _ => false,
            };
            AssertionOutcome {
                field_path: field_path.to_string(),
                expected: expected.clone(),
                actual: actual_value.clone(),
                passed,
                message: if passed {
                    format!("{field_path} {op} {expected}")
                } else {
                    format!("{field_path} {op} {expected} failed (got {actual_value})")
                },
            }
        }
        _ => AssertionOutcome {
            field_path: field_path.to_string(),
            expected: expected.clone(),
            actual: actual_value.clone(),
            passed: false,
            message: format!("{field_path}: {op} requires numeric values (got {actual_value})"),
        },
    }
}

fn membership_outcome(
    field_path: &str,
    expected: &Value,
    actual: Option<&Value>,
    negated: bool,
) -> AssertionOutcome {
    let actual_value = actual_or_null(actual);
    let verb = if negated { "not_in" } else { "in" };
    match expected {
        Value::Array(options) => {
            let member = options.iter().any(|o| coercing_eq(o, &actual_value));
            let passed = member != negated;
            AssertionOutcome {
                field_path: field_path.to_string(),
                expected: expected.clone(),
                actual: actual_value.clone(),
                passed,
                message: if passed {
                    format!("{field_path} {verb} {expected}")
                } else {
                    format!("{field_path} {verb} {expected} failed (got {actual_value})")
                },
            }
        }
        other => AssertionOutcome {
            field_path: field_path.to_string(),
            expected: other.clone(),
            actual: actual_value,
            passed: false,
            message: format!("{field_path}: '{verb}' expects a sequence of options"),
        },
    }
}

/// Measured length of a value; strings count characters, sequences count
/// elements. Anything else is not measurable and fails with a distinct
/// message.
fn measured_length(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        _ => None,
    }
}

fn length_outcomes(
    field_path: &str,
    expected: &Value,
    actual: Option<&Value>,
    outcomes: &mut Vec<AssertionOutcome>,
) {
    let actual_value = actual_or_null(actual);
    let length = match measured_length(&actual_value) {
        Some(len) => len,
        None => {
            outcomes.push(AssertionOutcome {
                field_path: field_path.to_string(),
                expected: expected.clone(),
                actual: actual_value.clone(),
                passed: false,
                message: format!(
                    "{field_path}: length applies to strings and sequences, got {}",
                    type_name(Some(&actual_value))
                ),
            });
            return;
        }
    };
    let length_value = Value::Number(length.into());

    match expected {
        // Composite: a nested mapping of comparison predicates against the
        // measured length, evaluated in source order.
        Value::Object(comparisons) => {
            for (key, bound) in comparisons {
                let mut nested = Vec::new();
                evaluate_predicate(
                    &format!("{field_path}.length"),
                    key,
                    bound,
                    Some(&length_value),
                    &mut nested,
                );
                outcomes.append(&mut nested);
            }
        }
        // Scalar: equality on the measured length.
        other => outcomes.push(equals_outcome(
            &format!("{field_path}.length"),
            other,
            Some(&length_value),
            false,
        )),
    }
}

fn min_length_outcome(
    field_path: &str,
    expected: &Value,
    actual: Option<&Value>,
) -> AssertionOutcome {
    let actual_value = actual_or_null(actual);
    match (measured_length(&actual_value), as_number(expected)) {
        (Some(len), Some(min)) => {
            let passed = (len as f64) >= min;
            AssertionOutcome {
                field_path: field_path.to_string(),
                expected: expected.clone(),
                actual: Value::Number(len.into()),
                passed,
                message: if passed {
                    format!("{field_path} length {len} >= {min}")
                } else {
                    format!("{field_path} length {len} below minimum {min}")
                },
            }
        }
        _ => AssertionOutcome {
            field_path: field_path.to_string(),
            expected: expected.clone(),
            actual: actual_value.clone(),
            passed: false,
            message: format!(
                "{field_path}: min_length applies to strings and sequences, got {}",
                type_name(Some(&actual_value))
            ),
        },
    }
}

fn not_empty_outcome(
    field_path: &str,
    expected: &Value,
    actual: Option<&Value>,
) -> AssertionOutcome {
    let actual_value = actual_or_null(actual);
    let size = match &actual_value {
        Value::Object(map) => Some(map.len()),
        other => measured_length(other),
    };
    let want_non_empty = expected.as_bool().unwrap_or(true);
    match size {
        Some(len) => {
            let passed = (len > 0) == want_non_empty;
            AssertionOutcome {
                field_path: field_path.to_string(),
                expected: expected.clone(),
                actual: actual_value.clone(),
                passed,
                message: if passed {
                    format!("{field_path} emptiness check passed (size {len})")
                } else if want_non_empty {
                    format!("{field_path} should not be empty")
                } else {
                    format!("{field_path} should be empty, has size {len}")
                },
            }
        }
        None => AssertionOutcome {
            field_path: field_path.to_string(),
            expected: expected.clone(),
            actual: actual_value.clone(),
            passed: false,
            message: format!(
                "{field_path}: not_empty applies to strings, sequences and mappings, got {}",
                type_name(Some(&actual_value))
            ),
        },
    }
}

fn schema_outcome(field_path: &str, expected: &Value, actual: Option<&Value>) -> AssertionOutcome {
    let actual_value = actual_or_null(actual);
    let compiled = match JSONSchema::compile(expected) {
        Ok(schema) => schema,
        Err(e) => {
            return AssertionOutcome {
                field_path: field_path.to_string(),
                expected: expected.clone(),
                actual: actual_value,
                passed: false,
                message: format!("{field_path}: invalid JSON Schema: {e}"),
            }
        }
    };
    let result = match compiled.validate(&actual_value) {
        Ok(()) => AssertionOutcome {
            field_path: field_path.to_string(),
            expected: expected.clone(),
            actual: actual_value.clone(),
            passed: true,
            message: format!("{field_path} conforms to schema"),
        },
        Err(errors) => {
            let details: Vec<String> = errors
                .map(|e| format!("{} at {}", e, e.instance_path))
                .take(3)
                .collect();
            AssertionOutcome {
                field_path: field_path.to_string(),
                expected: expected.clone(),
                actual: actual_value.clone(),
                passed: false,
                message: format!("{field_path} schema violations: [{}]", details.join("; ")),
            }
        }
    };
    result
}
