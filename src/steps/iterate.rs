//! Iterate strategy: expand `over` (or `count`) to a finite sequence and
//! run the wrapped strategy once per element, sequentially. Child results
//! are aggregated under `iteration_results`.

use super::{mark_failure, StepExecutor};
use crate::calls::CallStack;
use crate::context::VariableContext;
use crate::errors::ErrorCode;
use crate::protocol::{Step, StepResult, StepStatus, Suite};
use serde_json::Value;
use tracing::warn;

pub(crate) async fn execute(
    executor: &StepExecutor,
    suite: &Suite,
    step: &Step,
    ctx: &mut VariableContext,
    stack: &CallStack,
    result: &mut StepResult,
) {
    let spec = step.iterate.as_ref().expect("classified as iterate");

    let mut items: Vec<Value> = if let Some(count) = spec.count {
        (0..count).map(|i| Value::Number(i.into())).collect()
    } else {
        let over = spec.over.as_ref().expect("validated at load");
        match ctx.interpolate(over, false) {
            Value::Array(items) => items,
            other => {
                mark_failure(
                    result,
                    ErrorCode::ITERATE_WITHOUT_SOURCE,
                    format!(
                        "iterate 'over' must resolve to a sequence, got {}",
                        crate::assertions::type_name(Some(&other))
                    ),
                );
                return;
            }
        }
    };

    let cap = executor.services.limits.max_iterations;
    if items.len() > cap {
        warn!(
            step = %result.qualified_step_id,
            declared = items.len(),
            cap,
            "iteration count exceeds the limit, truncating"
        );
        items.truncate(cap);
    }

    // The wrapped strategy is the step without its iterate wrapper.
    let mut inner = step.clone();
    inner.iterate = None;
    inner.variables = None; // already applied by the dispatcher

    let base_id = step.effective_id();
    let index_binding = format!("{}_index", spec.binding);
    let mut children = Vec::with_capacity(items.len());

    for (index, item) in items.into_iter().enumerate() {
        if executor.services.cancel.is_cancelled() {
            mark_failure(
                result,
                ErrorCode::CANCELLED,
                format!("iteration cancelled after {index} of {} elements", children.len()),
            );
            break;
        }

        ctx.set_runtime(spec.binding.clone(), item);
        ctx.set_runtime(index_binding.clone(), Value::Number(index.into()));

        let mut child = inner.clone();
        child.step_id = Some(format!("{base_id}_{index}"));
        child.name = format!("{} [{index}]", step.name);

        let child_result = executor
            .execute_step_boxed(suite, &child, ctx, None, stack)
            .await;
        children.push(child_result);
    }

    if children.iter().any(|c| c.status == StepStatus::Failure) {
        let failed = children
            .iter()
            .filter(|c| c.status == StepStatus::Failure)
            .count();
        mark_failure(
            result,
            ErrorCode::ASSERTION_FAILED,
            format!("{failed} of {} iterations failed", children.len()),
        );
    } else if !children.is_empty() && children.iter().all(|c| c.status == StepStatus::Skipped) {
        result.status = StepStatus::Skipped;
    }

    // Captures from every iteration surface on the wrapper.
    for child in &children {
        for (name, value) in &child.captured {
            result.captured.insert(name.clone(), value.clone());
        }
    }
    result.iteration_results = Some(children);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::testing::{context_for, executor_with, suite_fixture};
    use crate::transport::testing::StaticTransport;
    use serde_json::json;

    fn iterate_suite(steps: serde_json::Value) -> Suite {
        suite_fixture(json!({
            "suite_name": "Loops",
            "node_id": "loops",
            "steps": steps
        }))
    }

    #[tokio::test]
    async fn iterates_over_an_inline_sequence() {
        let transport = StaticTransport::new().respond("/users/", 200, json!({"ok": true}));
        let suite = iterate_suite(json!([{
            "name": "Fetch each",
            "iterate": {"over": ["ada", "bob"], "as": "login"},
            "request": {"method": "GET", "url": "http://api/users/{{login}}"},
            "assert": {"status_code": 200}
        }]));
        let executor = executor_with(transport, vec![], vec![]);
        let mut ctx = context_for(&executor);
        let stack = CallStack::default();

        let result = executor
            .execute_step(&suite, &suite.steps[0], &mut ctx, None, &stack)
            .await;
        assert_eq!(result.status, StepStatus::Success);
        let children = result.iteration_results.unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].step_id, "fetch_each_0");
        let urls: Vec<String> = executor
            .services
            .perf
            .snapshot()
            .iter()
            .map(|d| d.url.clone())
            .collect();
        assert_eq!(urls, ["http://api/users/ada", "http://api/users/bob"]);
    }

    #[tokio::test]
    async fn count_expands_to_index_sequence() {
        let transport = StaticTransport::new().respond("/ping", 200, json!({}));
        let suite = iterate_suite(json!([{
            "name": "Ping thrice",
            "iterate": {"count": 3},
            "request": {"method": "GET", "url": "http://api/ping?n={{item}}"}
        }]));
        let executor = executor_with(transport, vec![], vec![]);
        let mut ctx = context_for(&executor);
        let stack = CallStack::default();
        let result = executor
            .execute_step(&suite, &suite.steps[0], &mut ctx, None, &stack)
            .await;
        assert_eq!(result.iteration_results.unwrap().len(), 3);
        // The loop binding and its index are visible afterwards.
        assert_eq!(ctx.get("item"), Some(json!(2)));
        assert_eq!(ctx.get("item_index"), Some(json!(2)));
    }

    #[tokio::test]
    async fn over_expression_resolves_from_variables() {
        let transport = StaticTransport::new().respond("/u/", 200, json!({}));
        let suite = iterate_suite(json!([{
            "name": "From var",
            "iterate": {"over": "{{user_ids}}", "as": "uid"},
            "request": {"method": "GET", "url": "http://api/u/{{uid}}"}
        }]));
        let executor = executor_with(transport, vec![], vec![]);
        let mut ctx = context_for(&executor);
        ctx.set_runtime("user_ids", json!([7, 9]));
        let stack = CallStack::default();
        let result = executor
            .execute_step(&suite, &suite.steps[0], &mut ctx, None, &stack)
            .await;
        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(result.iteration_results.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn non_sequence_over_fails() {
        let suite = iterate_suite(json!([{
            "name": "Bad",
            "iterate": {"over": "{{not_a_list}}"},
            "request": {"method": "GET", "url": "http://api/x"}
        }]));
        let executor = executor_with(StaticTransport::new(), vec![], vec![]);
        let mut ctx = context_for(&executor);
        ctx.set_runtime("not_a_list", json!(5));
        let stack = CallStack::default();
        let result = executor
            .execute_step(&suite, &suite.steps[0], &mut ctx, None, &stack)
            .await;
        assert_eq!(result.status, StepStatus::Failure);
        assert_eq!(result.error_code.as_deref(), Some("E1009"));
    }

    #[tokio::test]
    async fn failing_iteration_fails_the_wrapper() {
        let transport = StaticTransport::new()
            .respond_once("/seq", 200, json!({}))
            .respond("/seq", 500, json!({}));
        let suite = iterate_suite(json!([{
            "name": "Seq",
            "iterate": {"count": 2},
            "request": {"method": "GET", "url": "http://api/seq"},
            "assert": {"status_code": 200}
        }]));
        let executor = executor_with(transport, vec![], vec![]);
        let mut ctx = context_for(&executor);
        let stack = CallStack::default();
        let result = executor
            .execute_step(&suite, &suite.steps[0], &mut ctx, None, &stack)
            .await;
        assert_eq!(result.status, StepStatus::Failure);
        let children = result.iteration_results.unwrap();
        assert_eq!(children[0].status, StepStatus::Success);
        assert_eq!(children[1].status, StepStatus::Failure);
    }

    #[tokio::test]
    async fn iteration_cap_truncates() {
        let transport = StaticTransport::new().respond("/n", 200, json!({}));
        let suite = iterate_suite(json!([{
            "name": "Many",
            "iterate": {"count": 10_000},
            "request": {"method": "GET", "url": "http://api/n"}
        }]));
        let executor = executor_with(transport, vec![], vec![]);
        let cap = executor.services.limits.max_iterations;
        let mut ctx = context_for(&executor);
        let stack = CallStack::default();
        let result = executor
            .execute_step(&suite, &suite.steps[0], &mut ctx, None, &stack)
            .await;
        assert_eq!(result.iteration_results.unwrap().len(), cap);
    }
}
