//! # Scenario Processor
//!
//! Conditional branch selection inside a step. Scenarios are evaluated in
//! source order against a context exposing `status_code`, `headers`, `body`
//! and the current variable view; the first truthy guard consumes its `then`
//! branch. When no guard matches, the first scenario that declares an `else`
//! contributes that branch instead. A guard that fails to evaluate skips
//! only that scenario.
//!
//! A selected branch may contribute a nested request, assertions, captures
//! and variable assignments; nested scenarios are resolved here too, bounded
//! by the engine's scenario depth limit. The step dispatcher applies the
//! returned branches in order.

use crate::assertions::ResponseView;
use crate::context::VariableContext;
use crate::expressions::truthy;
use crate::protocol::{Scenario, ScenarioBranch, ScenarioMeta};
use tracing::{debug, warn};

/// Outcome of scenario selection: top-level bookkeeping plus the branches to
/// apply, outermost first.
#[derive(Debug, Default)]
pub struct ScenarioOutcome {
    pub meta: Option<ScenarioMeta>,
    pub branches: Vec<ScenarioBranch>,
}

impl ScenarioOutcome {
    /// True when no branch was selected at the top level.
    pub fn unmatched(&self) -> bool {
        self.branches.is_empty()
    }
}

/// Select the branches to apply for a step's scenarios.
pub fn process(
    scenarios: &[Scenario],
    context: &VariableContext,
    response: Option<&ResponseView>,
    max_depth: usize,
) -> ScenarioOutcome {
    let mut outcome = ScenarioOutcome::default();
    if scenarios.is_empty() {
        return outcome;
    }

    // Guards evaluate against the variable view with the response fields
    // overlaid when a response exists.
    let guard_context = match response {
        Some(view) => context.with_response(&view.to_details()),
        None => context.clone(),
    };

    let mut branches = Vec::new();
    let meta = select_level(scenarios, &guard_context, 0, max_depth, &mut branches);
    outcome.meta = Some(meta);
    outcome.branches = branches;
    outcome
}

fn select_level(
    scenarios: &[Scenario],
    guard_context: &VariableContext,
    depth: usize,
    max_depth: usize,
    branches: &mut Vec<ScenarioBranch>,
) -> ScenarioMeta {
    let engine = guard_context.extensions();
    let mut evaluated = 0usize;

    for (index, scenario) in scenarios.iter().enumerate() {
        evaluated += 1;
        match engine.engine.evaluate(&scenario.condition, guard_context) {
            Ok(value) if truthy(&value) => {
                debug!(condition = %scenario.condition, index, "scenario guard matched");
                if let Some(branch) = &scenario.then {
                    push_branch(branch, guard_context, depth, max_depth, branches);
                }
                return ScenarioMeta {
                    evaluated,
                    matched_index: Some(index),
                    branch: Some("then".to_string()),
                    condition: Some(scenario.condition.clone()),
                };
            }
            Ok(_) => {}
            // Evaluation errors skip only the offending scenario.
            Err(e) => {
                warn!(condition = %scenario.condition, error = %e, "scenario guard failed to evaluate, skipping scenario");
            }
        }
    }

    // No guard matched: the first declared `else` wins.
    for (index, scenario) in scenarios.iter().enumerate() {
        if let Some(branch) = &scenario.otherwise {
            debug!(index, "no scenario matched, taking first else branch");
            push_branch(branch, guard_context, depth, max_depth, branches);
            return ScenarioMeta {
                evaluated,
                matched_index: Some(index),
                branch: Some("else".to_string()),
                condition: Some(scenario.condition.clone()),
            };
        }
    }

    ScenarioMeta {
        evaluated,
        matched_index: None,
        branch: None,
        condition: None,
    }
}

fn push_branch(
    branch: &ScenarioBranch,
    guard_context: &VariableContext,
    depth: usize,
    max_depth: usize,
    branches: &mut Vec<ScenarioBranch>,
) {
    branches.push(branch.clone());
    if branch.scenarios.is_empty() {
        return;
    }
    if depth + 1 >= max_depth {
        warn!(
            depth = depth + 1,
            max_depth, "scenario nesting limit reached, ignoring deeper scenarios"
        );
        return;
    }
    select_level(
        &branch.scenarios,
        guard_context,
        depth + 1,
        max_depth,
        branches,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ExportRegistry, Extensions};
    use crate::protocol::JsonMap;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn ctx() -> VariableContext {
        VariableContext::new(ExportRegistry::new(), Arc::new(Extensions::default()))
    }

    fn scenarios_from(value: Value) -> Vec<Scenario> {
        serde_json::from_value(value).unwrap()
    }

    fn headers() -> JsonMap {
        JsonMap::new()
    }

    #[test]
    fn first_matching_guard_wins() {
        // §8 S4: a 404 response takes the second scenario; only its capture
        // is contributed.
        let scenarios = scenarios_from(json!([
            {"condition": "status_code == `200`", "then": {"capture": {"ok": "body.id"}}},
            {"condition": "status_code >= `400`", "then": {"capture": {"err": "body.message"}}}
        ]));
        let body = json!({"message": "not found"});
        let hdrs = headers();
        let view = ResponseView {
            status_code: 404,
            headers: &hdrs,
            body: &body,
            duration_ms: 5,
        };
        let outcome = process(&scenarios, &ctx(), Some(&view), 5);
        let meta = outcome.meta.unwrap();
        assert_eq!(meta.matched_index, Some(1));
        assert_eq!(meta.branch.as_deref(), Some("then"));
        assert_eq!(outcome.branches.len(), 1);
        let captures = outcome.branches[0].captures.as_ref().unwrap();
        assert!(captures.contains_key("err"));
        assert!(!captures.contains_key("ok"));
    }

    #[test]
    fn else_branch_when_nothing_matches() {
        let scenarios = scenarios_from(json!([
            {"condition": "status_code == `200`", "then": {"variables": {"a": 1}}},
            {
                "condition": "status_code == `201`",
                "then": {"variables": {"b": 2}},
                "else": {"variables": {"fallback": true}}
            }
        ]));
        let body = json!({});
        let hdrs = headers();
        let view = ResponseView {
            status_code: 500,
            headers: &hdrs,
            body: &body,
            duration_ms: 5,
        };
        let outcome = process(&scenarios, &ctx(), Some(&view), 5);
        let meta = outcome.meta.unwrap();
        assert_eq!(meta.branch.as_deref(), Some("else"));
        assert_eq!(meta.matched_index, Some(1));
        assert!(outcome.branches[0]
            .variables
            .as_ref()
            .unwrap()
            .contains_key("fallback"));
    }

    #[test]
    fn no_match_and_no_else_is_unmatched() {
        let scenarios = scenarios_from(json!([
            {"condition": "status_code == `200`", "then": {"variables": {"a": 1}}}
        ]));
        let body = json!({});
        let hdrs = headers();
        let view = ResponseView {
            status_code: 404,
            headers: &hdrs,
            body: &body,
            duration_ms: 5,
        };
        let outcome = process(&scenarios, &ctx(), Some(&view), 5);
        assert!(outcome.unmatched());
        let meta = outcome.meta.unwrap();
        assert_eq!(meta.matched_index, None);
        assert_eq!(meta.evaluated, 1);
    }

    #[test]
    fn broken_guard_skips_only_that_scenario() {
        // The first guard cannot be parsed; the second still matches.
        let scenarios = scenarios_from(json!([
            {"condition": "(((", "then": {"variables": {"a": 1}}},
            {"condition": "status_code >= `400`", "then": {"variables": {"b": 2}}}
        ]));
        let body = json!({});
        let hdrs = headers();
        let view = ResponseView {
            status_code: 404,
            headers: &hdrs,
            body: &body,
            duration_ms: 5,
        };
        let outcome = process(&scenarios, &ctx(), Some(&view), 5);
        let meta = outcome.meta.unwrap();
        assert_eq!(meta.matched_index, Some(1));
        assert!(outcome.branches[0]
            .variables
            .as_ref()
            .unwrap()
            .contains_key("b"));
    }

    #[test]
    fn guards_see_variables_and_body() {
        let mut context = ctx();
        context.set_runtime("env", json!("staging"));
        let scenarios = scenarios_from(json!([
            {"condition": "env == 'staging' && body.ready", "then": {"variables": {"go": true}}}
        ]));
        let body = json!({"ready": true});
        let hdrs = headers();
        let view = ResponseView {
            status_code: 200,
            headers: &hdrs,
            body: &body,
            duration_ms: 5,
        };
        let outcome = process(&scenarios, &context, Some(&view), 5);
        assert_eq!(outcome.branches.len(), 1);
    }

    #[test]
    fn nested_scenarios_are_bounded() {
        // Three levels declared, limit of two: the innermost is ignored.
        let scenarios = scenarios_from(json!([
            {"condition": "true", "then": {
                "variables": {"level": 1},
                "scenarios": [
                    {"condition": "true", "then": {
                        "variables": {"level": 2},
                        "scenarios": [
                            {"condition": "true", "then": {"variables": {"level": 3}}}
                        ]
                    }}
                ]
            }}
        ]));
        let outcome = process(&scenarios, &ctx(), None, 2);
        assert_eq!(outcome.branches.len(), 2);
    }

    #[test]
    fn scenario_only_context_without_response() {
        // Without a response the guard still sees plain variables.
        let mut context = ctx();
        context.set_runtime("retries", json!(3));
        let scenarios = scenarios_from(json!([
            {"condition": "retries > 2", "then": {"variables": {"alert": true}}}
        ]));
        let outcome = process(&scenarios, &context, None, 5);
        assert_eq!(outcome.branches.len(), 1);
    }
}
