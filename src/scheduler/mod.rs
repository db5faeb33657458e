//! # Execution Scheduler
//!
//! Runs the planner's waves either strictly serially or with a bounded pool
//! of concurrent suites. The next wave begins only when the previous one has
//! quiesced, which preserves the happens-before between a dependency's
//! exported variables and its dependents.
//!
//! Also implements the run-level policies: suite retry with delay backoff,
//! fail-fast when a required-priority suite fails, skipping dependents of
//! failed required dependencies, edge guard conditions, cached-result replay
//! on orchestrator re-execution, and cancellation.

use crate::context::{ExportRegistry, Extensions, VariableContext};
use crate::discovery::{ExecutionMode, RunConfig, SuiteIndex};
use crate::events::{EventKind, RunEvents};
use crate::expressions::truthy;
use crate::limits::EngineLimits;
use crate::planner::ExecutionPlan;
use crate::protocol::{JsonMap, Priority, RetryPolicy, Suite, SuiteResult, SuiteStatus};
use crate::steps::StepExecutor;
use crate::suite::{run_suite, SuiteSeed};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Run-level execution policy.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub mode: ExecutionMode,
    pub max_parallel: usize,
    pub suite_retry: RetryPolicy,
    pub fail_fast_on_required: bool,
    pub required_priorities: Vec<Priority>,
}

impl SchedulerOptions {
    pub fn from_config(config: &RunConfig, limits: &EngineLimits) -> Self {
        let required_priorities = config
            .required_priority_names()
            .iter()
            .filter_map(|name| match name.as_str() {
                "critical" => Some(Priority::Critical),
                "high" => Some(Priority::High),
                "medium" => Some(Priority::Medium),
                "low" => Some(Priority::Low),
                other => {
                    warn!(priority = other, "unknown required priority, ignoring");
                    None
                }
            })
            .collect();
        Self {
            mode: config.mode,
            max_parallel: config.max_parallel.unwrap_or(limits.max_parallel).max(1),
            suite_retry: config.retry.unwrap_or_default(),
            fail_fast_on_required: config.fail_fast_on_required,
            required_priorities,
        }
    }
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Sequential,
            max_parallel: 4,
            suite_retry: RetryPolicy::default(),
            fail_fast_on_required: false,
            required_priorities: vec![Priority::Critical],
        }
    }
}

/// What the scheduler decided to do with one suite before running it.
enum Disposition {
    Run(SuiteSeed),
    Skip(String),
    Replay(SuiteResult),
}

/// Execute the whole plan. Results come back in wave order.
#[allow(clippy::too_many_arguments)]
pub async fn execute(
    executor: &StepExecutor,
    index: &SuiteIndex,
    plan: &ExecutionPlan,
    registry: Arc<ExportRegistry>,
    extensions: Arc<Extensions>,
    options: &SchedulerOptions,
    globals: &JsonMap,
    environment: &JsonMap,
    events: Option<&RunEvents>,
    prior_results: Option<&HashMap<String, SuiteResult>>,
) -> Vec<SuiteResult> {
    let mut results: Vec<SuiteResult> = Vec::with_capacity(plan.suite_count());
    let mut statuses: HashMap<String, SuiteStatus> = HashMap::new();
    let mut halted: Option<String> = None;

    for (wave_index, wave) in plan.waves.iter().enumerate() {
        if executor.services.cancel.is_cancelled() && halted.is_none() {
            halted = Some("run cancelled".to_string());
        }
        if let Some(reason) = &halted {
            for node_id in wave {
                if let Some(suite) = index.get(node_id) {
                    let result = SuiteResult::skipped(&suite, reason.clone());
                    statuses.insert(node_id.clone(), result.status);
                    results.push(result);
                }
            }
            continue;
        }

        info!(wave = wave_index, suites = wave.len(), mode = ?options.mode, "starting wave");
        let mut wave_results: Vec<(usize, SuiteResult)> = Vec::with_capacity(wave.len());

        match options.mode {
            ExecutionMode::Sequential => {
                for (position, node_id) in wave.iter().enumerate() {
                    let suite = match index.get(node_id) {
                        Some(suite) => suite,
                        None => continue,
                    };
                    let result = match dispose(
                        &suite, plan, &statuses, &registry, &extensions, globals, environment,
                        prior_results,
                    ) {
                        Disposition::Skip(reason) => SuiteResult::skipped(&suite, reason),
                        Disposition::Replay(result) => {
                            replay_exports(&suite, &result, &registry);
                            result
                        }
                        Disposition::Run(seed) => {
                            run_with_retry(
                                executor,
                                &suite,
                                Arc::clone(&registry),
                                Arc::clone(&extensions),
                                seed,
                                &options.suite_retry,
                                events,
                                wave_index,
                            )
                            .await
                        }
                    };
                    statuses.insert(node_id.clone(), result.status);
                    wave_results.push((position, result));
                }
            }
            ExecutionMode::Parallel => {
                let semaphore = Arc::new(Semaphore::new(options.max_parallel));
                let mut tasks = JoinSet::new();
                for (position, node_id) in wave.iter().enumerate() {
                    let suite = match index.get(node_id) {
                        Some(suite) => suite,
                        None => continue,
                    };
                    match dispose(
                        &suite, plan, &statuses, &registry, &extensions, globals, environment,
                        prior_results,
                    ) {
                        Disposition::Skip(reason) => {
                            wave_results.push((position, SuiteResult::skipped(&suite, reason)));
                        }
                        Disposition::Replay(result) => {
                            replay_exports(&suite, &result, &registry);
                            wave_results.push((position, result));
                        }
                        Disposition::Run(seed) => {
                            let executor = executor.clone();
                            let registry = Arc::clone(&registry);
                            let extensions = Arc::clone(&extensions);
                            let retry = options.suite_retry;
                            let events = events.cloned();
                            let semaphore = Arc::clone(&semaphore);
                            tasks.spawn(async move {
                                let _permit =
                                    semaphore.acquire().await.expect("scheduler semaphore");
                                let result = run_with_retry(
                                    &executor,
                                    &suite,
                                    registry,
                                    extensions,
                                    seed,
                                    &retry,
                                    events.as_ref(),
                                    wave_index,
                                )
                                .await;
                                (position, result)
                            });
                        }
                    }
                }
                while let Some(joined) = tasks.join_next().await {
                    match joined {
                        Ok(entry) => wave_results.push(entry),
                        Err(e) => warn!(error = %e, "suite task aborted"),
                    }
                }
            }
        }

        wave_results.sort_by_key(|(position, _)| *position);
        for (_, result) in wave_results {
            statuses.insert(result.node_id.clone(), result.status);
            if options.fail_fast_on_required
                && result.status == SuiteStatus::Failure
                && halted.is_none()
            {
                if let Some(suite) = index.get(&result.node_id) {
                    if options.required_priorities.contains(&suite.priority) {
                        warn!(suite = %result.node_id, "required suite failed, halting remaining waves");
                        halted = Some(format!(
                            "not started: required suite '{}' failed",
                            result.node_id
                        ));
                    }
                }
            }
            results.push(result);
        }
    }

    results
}

/// Decide how to treat one suite: skip (failed required dependency), replay
/// from a cached prior result, or run with its imported scopes seeded.
#[allow(clippy::too_many_arguments)]
fn dispose(
    suite: &Arc<Suite>,
    plan: &ExecutionPlan,
    statuses: &HashMap<String, SuiteStatus>,
    registry: &Arc<ExportRegistry>,
    extensions: &Arc<Extensions>,
    globals: &JsonMap,
    environment: &JsonMap,
    prior_results: Option<&HashMap<String, SuiteResult>>,
) -> Disposition {
    // Guard context for edge conditions: globals + environment only.
    let mut guard_ctx = VariableContext::new(Arc::clone(registry), Arc::clone(extensions));
    guard_ctx.set_global_vars(globals);
    guard_ctx.set_environment_vars(environment);

    let mut imported = Vec::new();

    for edge in plan.dependencies_of(&suite.node_id) {
        // A falsy guard drops the edge entirely.
        if let Some(condition) = &edge.condition {
            match extensions.engine.evaluate(condition, &guard_ctx) {
                Ok(value) if !truthy(&value) => continue,
                Ok(_) => {}
                Err(e) => {
                    // Keep the edge when the guard cannot be evaluated;
                    // dropping a required dependency on a typo is worse.
                    warn!(edge = %format!("{} -> {}", edge.from, edge.to), error = %e, "edge guard failed to evaluate, keeping edge");
                }
            }
        }

        match statuses.get(&edge.to) {
            Some(SuiteStatus::Success) => {
                if let Some(exports) = registry.producer(&edge.to) {
                    imported.push((edge.to.clone(), exports));
                }
            }
            Some(_) if edge.required => {
                return Disposition::Skip(format!(
                    "required dependency '{}' did not succeed",
                    edge.to
                ));
            }
            _ => {}
        }
    }

    // Cached replay on re-execution: a suite is a cacheable dependency when
    // every edge pointing at it opts in (`cache: true`) and its prior run
    // succeeded.
    if let Some(prior) = prior_results {
        let dependent_edges: Vec<_> = plan
            .edges
            .iter()
            .filter(|e| e.to == suite.node_id)
            .collect();
        if !dependent_edges.is_empty() && dependent_edges.iter().all(|e| e.cache) {
            if let Some(previous) = prior.get(&suite.node_id) {
                if previous.status == SuiteStatus::Success {
                    let mut replayed = previous.clone();
                    replayed.error_message = Some("replayed from cached result".to_string());
                    return Disposition::Replay(replayed);
                }
            }
        }
    }

    Disposition::Run(SuiteSeed {
        globals: globals.clone(),
        environment: environment.clone(),
        imported,
    })
}

/// Re-materialise a replayed suite's exports so dependents can import them.
fn replay_exports(suite: &Suite, result: &SuiteResult, registry: &Arc<ExportRegistry>) {
    for name in &suite.exports {
        if let Some(value) = result.variables_captured.get(name) {
            registry.set(&suite.node_id, name, value.clone());
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_with_retry(
    executor: &StepExecutor,
    suite: &Arc<Suite>,
    registry: Arc<ExportRegistry>,
    extensions: Arc<Extensions>,
    seed: SuiteSeed,
    retry: &RetryPolicy,
    events: Option<&RunEvents>,
    wave: usize,
) -> SuiteResult {
    if let Some(events) = events {
        events.emit(EventKind::SuiteStarted {
            node_id: suite.node_id.clone(),
            suite_name: suite.suite_name.clone(),
            wave,
        });
    }

    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0u32;
    let result = loop {
        attempt += 1;
        // Each attempt starts from fresh step results.
        let result = run_suite(
            executor,
            suite,
            Arc::clone(&registry),
            Arc::clone(&extensions),
            seed.clone(),
            events,
        )
        .await;
        if result.status != SuiteStatus::Failure
            || attempt >= max_attempts
            || executor.services.cancel.is_cancelled()
        {
            break result;
        }
        info!(
            suite = %suite.node_id,
            attempt,
            max_attempts,
            delay_ms = retry.delay_ms,
            "suite failed, retrying"
        );
        tokio::time::sleep(std::time::Duration::from_millis(retry.delay_ms)).await;
    };

    if let Some(events) = events {
        events.emit(EventKind::SuiteCompleted {
            node_id: suite.node_id.clone(),
            status: result.status,
            duration_ms: result.duration_ms,
            steps_failed: result.steps_failed,
        });
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner;
    use crate::steps::testing::{harness, suite_fixture};
    use crate::transport::testing::StaticTransport;
    use serde_json::json;

    fn indexed(suites: Vec<Suite>) -> SuiteIndex {
        let mut suites = suites;
        for (i, suite) in suites.iter_mut().enumerate() {
            suite.source_index = i;
        }
        SuiteIndex::build(&std::env::temp_dir(), suites).unwrap()
    }

    fn scope() -> JsonMap {
        JsonMap::new()
    }

    async fn run_plan(
        executor: &StepExecutor,
        index: &SuiteIndex,
        options: &SchedulerOptions,
        prior: Option<&HashMap<String, SuiteResult>>,
    ) -> Vec<SuiteResult> {
        let plan = planner::plan(index).unwrap();
        let registry = ExportRegistry::new();
        let extensions = Arc::new(Extensions::default());
        execute(
            executor,
            index,
            &plan,
            registry,
            extensions,
            options,
            &scope(),
            &scope(),
            None,
            prior,
        )
        .await
    }

    fn seed_and_use() -> Vec<Suite> {
        vec![
            suite_fixture(json!({
                "suite_name": "Seed",
                "node_id": "seed",
                "exports": ["user_id"],
                "steps": [{
                    "name": "Make",
                    "request": {"method": "GET", "url": "http://api/seed"},
                    "capture": {"user_id": "body.id"}
                }]
            })),
            suite_fixture(json!({
                "suite_name": "Use",
                "node_id": "use",
                "depends": ["seed"],
                "steps": [{
                    "name": "Fetch",
                    "request": {"method": "GET", "url": "http://api/u/{{seed.user_id}}"},
                    "assert": {"status_code": 200}
                }]
            })),
        ]
    }

    #[tokio::test]
    async fn exports_are_visible_to_dependents_in_parallel_mode() {
        // §8 S5: `use` always observes the exported value 42.
        let transport = StaticTransport::new()
            .respond("/seed", 200, json!({"id": 42}))
            .respond("/u/42", 200, json!({}));
        let (executor, transport) = harness(transport, vec![], vec![]);
        let index = indexed(seed_and_use());
        let options = SchedulerOptions {
            mode: ExecutionMode::Parallel,
            max_parallel: 4,
            ..SchedulerOptions::default()
        };

        let results = run_plan(&executor, &index, &options, None).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == SuiteStatus::Success));
        let urls: Vec<String> = transport.requests().iter().map(|r| r.url.clone()).collect();
        assert_eq!(urls, ["http://api/seed", "http://api/u/42"]);
    }

    #[tokio::test]
    async fn failed_required_dependency_skips_dependent() {
        let transport = StaticTransport::new().respond("/seed", 500, json!({}));
        let (executor, transport) = harness(transport, vec![], vec![]);
        let mut suites = seed_and_use();
        // Make the seed fail its assertion.
        suites[0].steps[0].assertions =
            Some(json!({"status_code": 200}).as_object().unwrap().clone());
        let index = indexed(suites);

        let results = run_plan(&executor, &index, &SchedulerOptions::default(), None).await;
        assert_eq!(results[0].status, SuiteStatus::Failure);
        assert_eq!(results[1].status, SuiteStatus::Skipped);
        assert!(results[1]
            .error_message
            .as_ref()
            .unwrap()
            .contains("required dependency"));
        // The dependent never hit the transport.
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn optional_dependency_failure_does_not_skip() {
        let transport = StaticTransport::new()
            .respond("/seed", 500, json!({}))
            .respond("/u/", 200, json!({}));
        let (executor, _) = harness(transport, vec![], vec![]);
        let mut suites = seed_and_use();
        suites[0].steps[0].assertions =
            Some(json!({"status_code": 200}).as_object().unwrap().clone());
        suites[1].depends = serde_json::from_value(json!([
            {"node_id": "seed", "required": false}
        ]))
        .unwrap();
        // The dependent no longer references the export.
        suites[1].steps[0].request.as_mut().unwrap().url = "http://api/u/any".to_string();
        let index = indexed(suites);

        let results = run_plan(&executor, &index, &SchedulerOptions::default(), None).await;
        assert_eq!(results[0].status, SuiteStatus::Failure);
        assert_eq!(results[1].status, SuiteStatus::Success);
    }

    #[tokio::test]
    async fn falsy_edge_guard_drops_the_edge() {
        let transport = StaticTransport::new()
            .respond("/seed", 500, json!({}))
            .respond("/u/", 200, json!({}));
        let (executor, _) = harness(transport, vec![], vec![]);
        let mut suites = seed_and_use();
        suites[0].steps[0].assertions =
            Some(json!({"status_code": 200}).as_object().unwrap().clone());
        suites[1].depends = serde_json::from_value(json!([
            {"node_id": "seed", "condition": "env_name == 'staging'"}
        ]))
        .unwrap();
        suites[1].steps[0].request.as_mut().unwrap().url = "http://api/u/any".to_string();
        let index = indexed(suites);

        // env_name is unset, so the guard is falsy and the dependent runs
        // despite the failed dependency.
        let results = run_plan(&executor, &index, &SchedulerOptions::default(), None).await;
        assert_eq!(results[1].status, SuiteStatus::Success);
    }

    #[tokio::test]
    async fn suite_retry_reruns_failed_suites() {
        let transport = StaticTransport::new()
            .respond_once("/flaky", 500, json!({}))
            .respond("/flaky", 200, json!({}));
        let (executor, transport) = harness(transport, vec![], vec![]);
        let index = indexed(vec![suite_fixture(json!({
            "suite_name": "Flaky",
            "node_id": "flaky",
            "steps": [{
                "name": "Try",
                "request": {"method": "GET", "url": "http://api/flaky"},
                "assert": {"status_code": 200}
            }]
        }))]);
        let options = SchedulerOptions {
            suite_retry: RetryPolicy {
                max_attempts: 2,
                delay_ms: 0,
            },
            ..SchedulerOptions::default()
        };

        let results = run_plan(&executor, &index, &options, None).await;
        assert_eq!(results[0].status, SuiteStatus::Success);
        assert_eq!(transport.request_count(), 2);
        // The retried attempt produced fresh step results.
        assert_eq!(results[0].steps.len(), 1);
        assert_eq!(results[0].steps_failed, 0);
    }

    #[tokio::test]
    async fn fail_fast_halts_remaining_waves() {
        let transport = StaticTransport::new()
            .respond("/gate", 500, json!({}))
            .respond("/after", 200, json!({}));
        let (executor, transport) = harness(transport, vec![], vec![]);
        let index = indexed(vec![
            suite_fixture(json!({
                "suite_name": "Gate",
                "node_id": "gate",
                "priority": "critical",
                "steps": [{
                    "name": "Check",
                    "request": {"method": "GET", "url": "http://api/gate"},
                    "assert": {"status_code": 200}
                }]
            })),
            suite_fixture(json!({
                "suite_name": "After",
                "node_id": "after",
                "depends": [{"node_id": "gate", "required": false}],
                "steps": [{
                    "name": "Later",
                    "request": {"method": "GET", "url": "http://api/after"}
                }]
            })),
        ]);
        let options = SchedulerOptions {
            fail_fast_on_required: true,
            ..SchedulerOptions::default()
        };

        let results = run_plan(&executor, &index, &options, None).await;
        assert_eq!(results[0].status, SuiteStatus::Failure);
        assert_eq!(results[1].status, SuiteStatus::Skipped);
        assert!(results[1]
            .error_message
            .as_ref()
            .unwrap()
            .contains("not started"));
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn cancellation_skips_unstarted_waves() {
        let transport = StaticTransport::new().respond("/seed", 200, json!({"id": 1}));
        let (executor, _) = harness(transport, vec![], vec![]);
        executor.services.cancel.cancel();
        let index = indexed(seed_and_use());

        let results = run_plan(&executor, &index, &SchedulerOptions::default(), None).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == SuiteStatus::Skipped));
    }

    #[tokio::test]
    async fn cached_dependency_replays_on_reexecution() {
        let transport = StaticTransport::new()
            .respond("/seed", 200, json!({"id": 42}))
            .respond("/u/42", 200, json!({}));
        let (executor, transport) = harness(transport, vec![], vec![]);
        let mut suites = seed_and_use();
        suites[1].depends =
            serde_json::from_value(json!([{"node_id": "seed", "cache": true}])).unwrap();
        let index = indexed(suites);

        let first = run_plan(&executor, &index, &SchedulerOptions::default(), None).await;
        assert!(first.iter().all(|r| r.status == SuiteStatus::Success));
        assert_eq!(transport.request_count(), 2);

        let prior: HashMap<String, SuiteResult> = first
            .iter()
            .map(|r| (r.node_id.clone(), r.clone()))
            .collect();
        let second = run_plan(&executor, &index, &SchedulerOptions::default(), Some(&prior)).await;
        // Seed was replayed (no new request); the dependent re-executed and
        // still observed the export.
        assert_eq!(transport.request_count(), 3);
        assert!(second
            .iter()
            .find(|r| r.node_id == "seed")
            .unwrap()
            .error_message
            .as_ref()
            .unwrap()
            .contains("replayed"));
        assert_eq!(
            second.iter().find(|r| r.node_id == "use").unwrap().status,
            SuiteStatus::Success
        );
    }
}
