//! # Suite Discovery
//!
//! Walks a directory tree for `*.flow.yaml`, `*.flow.yml` and `*.flow.json`
//! documents, parses them, and validates their structure before planning.
//! Validation collects every problem in a document instead of stopping at
//! the first; a document with any load error is excluded from the run and
//! reported.
//!
//! Also loads the optional `flowrunner.yaml` run configuration at the
//! discovery root.

use crate::errors::{LoadError, PlanError};
use crate::limits::EngineLimits;
use crate::protocol::{JsonMap, RetryPolicy, Scenario, Step, Suite};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const SUITE_SUFFIXES: &[&str] = &[".flow.yaml", ".flow.yml", ".flow.json"];

/// HTTP methods accepted in request steps (RFC 7231 + PATCH).
pub const VALID_HTTP_METHODS: &[&str] =
    &["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

// ============================================================================
// RUN CONFIGURATION
// ============================================================================

/// Execution mode for waves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

/// `flowrunner.yaml` at the discovery root, all fields optional.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RunConfig {
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub max_parallel: Option<usize>,
    /// Suite-level retry policy applied by the scheduler.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub fail_fast_on_required: bool,
    /// Priorities that participate in fail-fast (default: `[critical]`).
    #[serde(default)]
    pub required_priorities: Option<Vec<String>>,
    /// Seed for the global scope.
    #[serde(default)]
    pub globals: JsonMap,
    /// Seed for the environment scope.
    #[serde(default)]
    pub environment: JsonMap,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl RunConfig {
    /// Load `flowrunner.yaml` from the root when present.
    pub fn load(root: &Path) -> Self {
        let path = root.join("flowrunner.yaml");
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_yaml_ng::from_str(&raw) {
                Ok(config) => {
                    debug!(path = %path.display(), "run configuration loaded");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "invalid run configuration, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn required_priority_names(&self) -> Vec<String> {
        self.required_priorities
            .clone()
            .unwrap_or_else(|| vec!["critical".to_string()])
    }
}

// ============================================================================
// DISCOVERY
// ============================================================================

/// Result of walking a tree: parsed suites plus per-document load errors.
#[derive(Debug, Default)]
pub struct Discovery {
    pub suites: Vec<Suite>,
    pub errors: Vec<LoadError>,
}

/// Walk `root` and load every suite document, depth-first, in sorted path
/// order so `source_index` is stable across runs.
pub fn discover(root: &Path, limits: &EngineLimits) -> Discovery {
    let mut files = Vec::new();
    collect_suite_files(root, &mut files);
    files.sort();

    let mut discovery = Discovery::default();
    for (index, path) in files.iter().enumerate() {
        match load_suite(path) {
            Ok(mut suite) => {
                suite.source_index = index;
                let problems = validate_suite(&suite, limits);
                if problems.is_empty() {
                    discovery.suites.push(suite);
                } else {
                    // Load errors are fatal for the document, not the run.
                    warn!(path = %path.display(), count = problems.len(), "suite excluded by validation");
                    discovery.errors.extend(problems);
                }
            }
            Err(e) => discovery.errors.push(e),
        }
    }
    discovery
}

fn collect_suite_files(dir: &Path, files: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "cannot read directory during discovery");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        if path.is_dir() {
            collect_suite_files(&path, files);
        } else if SUITE_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            files.push(path);
        }
    }
}

/// Parse one suite document (YAML or JSON by extension).
pub fn load_suite(path: &Path) -> Result<Suite, LoadError> {
    let raw = std::fs::read_to_string(path).map_err(|e| LoadError::Unreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut suite: Suite = if path.extension().map(|e| e == "json").unwrap_or(false) {
        serde_json::from_str(&raw).map_err(|e| LoadError::InvalidDocument {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
    } else {
        serde_yaml_ng::from_str(&raw).map_err(|e| LoadError::InvalidDocument {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
    };
    suite.source_path = Some(path.to_path_buf());
    Ok(suite)
}

// ============================================================================
// STRUCTURAL VALIDATION
// ============================================================================

/// Validate one suite, collecting every problem.
pub fn validate_suite(suite: &Suite, limits: &EngineLimits) -> Vec<LoadError> {
    let mut errors = Vec::new();

    if suite.steps.is_empty() {
        errors.push(LoadError::EmptySuite {
            node_id: suite.node_id.clone(),
        });
        return errors;
    }

    if suite.steps.len() > limits.max_steps_per_suite {
        errors.push(LoadError::LimitExceeded {
            message: format!(
                "suite '{}' declares {} steps, limit is {}",
                suite.node_id,
                suite.steps.len(),
                limits.max_steps_per_suite
            ),
        });
    }

    let mut seen_ids = HashSet::new();
    for step in &suite.steps {
        let step_id = step.effective_id();
        if !seen_ids.insert(step_id.clone()) {
            errors.push(LoadError::DuplicateStepId {
                node_id: suite.node_id.clone(),
                step_id: step_id.clone(),
            });
        }
        validate_step(suite, step, &step_id, limits, &mut errors);
    }

    errors
}

fn validate_step(
    suite: &Suite,
    step: &Step,
    step_id: &str,
    limits: &EngineLimits,
    errors: &mut Vec<LoadError>,
) {
    let has_request = step.request.is_some();
    let has_input = step.input.is_some();
    let has_call = step.call.is_some();
    let has_iterate = step.iterate.is_some();
    let has_scenarios = !step.scenarios.is_empty();

    if !(has_request || has_input || has_call || has_iterate || has_scenarios) {
        errors.push(LoadError::MissingPrimaryAction {
            node_id: suite.node_id.clone(),
            step_id: step_id.to_string(),
        });
    }

    // A call step must stand alone.
    if has_call && (has_request || has_input || has_iterate || has_scenarios) {
        errors.push(LoadError::AmbiguousPrimaryAction {
            node_id: suite.node_id.clone(),
            step_id: step_id.to_string(),
            detail: "a call step cannot carry request, input, iterate or scenarios".to_string(),
        });
    }

    // Iterate wraps a request, input or scenario body; it cannot be empty.
    if has_iterate && !(has_request || has_input || has_scenarios) {
        errors.push(LoadError::AmbiguousPrimaryAction {
            node_id: suite.node_id.clone(),
            step_id: step_id.to_string(),
            detail: "iterate needs a request, input or scenarios to wrap".to_string(),
        });
    }

    if let Some(iterate) = &step.iterate {
        if iterate.over.is_none() && iterate.count.is_none() {
            errors.push(LoadError::IterateWithoutSource {
                node_id: suite.node_id.clone(),
                step_id: step_id.to_string(),
            });
        }
    }

    if let Some(request) = &step.request {
        let method = request.method.to_ascii_uppercase();
        if !VALID_HTTP_METHODS.contains(&method.as_str()) {
            errors.push(LoadError::InvalidHttpMethod {
                node_id: suite.node_id.clone(),
                step_id: step_id.to_string(),
                method: request.method.clone(),
            });
        }
    }

    let depth = scenario_depth(&step.scenarios);
    if depth > limits.max_scenario_depth {
        errors.push(LoadError::ScenarioDepthExceeded {
            node_id: suite.node_id.clone(),
            step_id: step_id.to_string(),
            max: limits.max_scenario_depth,
        });
    }
}

fn scenario_depth(scenarios: &[Scenario]) -> usize {
    if scenarios.is_empty() {
        return 0;
    }
    let mut deepest = 1;
    for scenario in scenarios {
        for branch in [&scenario.then, &scenario.otherwise].into_iter().flatten() {
            deepest = deepest.max(1 + scenario_depth(&branch.scenarios));
        }
    }
    deepest
}

// ============================================================================
// SUITE INDEX
// ============================================================================

/// Lookup service over discovered suites, used by the planner and the call
/// service. Resolves references by `node_id` first, then by filesystem path
/// (literal, caller-relative, root-relative) confined to the discovery root.
#[derive(Debug)]
pub struct SuiteIndex {
    root: PathBuf,
    by_id: HashMap<String, Arc<Suite>>,
    by_path: HashMap<PathBuf, Arc<Suite>>,
    ordered: Vec<Arc<Suite>>,
}

impl SuiteIndex {
    /// Build the index; duplicate `node_id`s are a planning error.
    pub fn build(root: &Path, suites: Vec<Suite>) -> Result<Self, PlanError> {
        let root = root
            .canonicalize()
            .unwrap_or_else(|_| root.to_path_buf());
        let mut by_id: HashMap<String, Arc<Suite>> = HashMap::new();
        let mut by_path = HashMap::new();
        let mut ordered = Vec::new();
        for suite in suites {
            let suite = Arc::new(suite);
            if let Some(existing) = by_id.get(&suite.node_id) {
                return Err(PlanError::DuplicateNodeId {
                    node_id: suite.node_id.clone(),
                    first: source_label(existing),
                    second: source_label(&suite),
                });
            }
            by_id.insert(suite.node_id.clone(), Arc::clone(&suite));
            if let Some(path) = &suite.source_path {
                let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
                by_path.insert(canonical, Arc::clone(&suite));
            }
            ordered.push(suite);
        }
        Ok(Self {
            root,
            by_id,
            by_path,
            ordered,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Suite>> {
        self.ordered.iter()
    }

    pub fn get(&self, node_id: &str) -> Option<Arc<Suite>> {
        self.by_id.get(node_id).cloned()
    }

    /// Resolve a reference: `node_id`, else path candidates relative to the
    /// caller's file and the discovery root. Paths escaping the root are
    /// rejected.
    pub fn resolve(&self, reference: &str, caller_dir: Option<&Path>) -> Option<Arc<Suite>> {
        if let Some(suite) = self.by_id.get(reference) {
            return Some(Arc::clone(suite));
        }

        let mut candidates = vec![PathBuf::from(reference)];
        if let Some(dir) = caller_dir {
            candidates.push(dir.join(reference));
        }
        candidates.push(self.root.join(reference));

        for candidate in candidates {
            let canonical = match candidate.canonicalize() {
                Ok(c) => c,
                Err(_) => continue,
            };
            if !canonical.starts_with(&self.root) {
                warn!(reference, path = %canonical.display(), "suite reference escapes the discovery root, ignored");
                continue;
            }
            if let Some(suite) = self.by_path.get(&canonical) {
                return Some(Arc::clone(suite));
            }
        }
        None
    }
}

fn source_label(suite: &Suite) -> String {
    suite
        .source_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<memory>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn temp_root(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("flowrunner-{tag}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn suite_from(value: serde_json::Value) -> Suite {
        serde_json::from_value(value).unwrap()
    }

    const MINIMAL: &str = r#"
suite_name: Seed
node_id: seed
steps:
  - name: Ping
    request: { method: GET, url: "http://api/ping" }
"#;

    #[test]
    fn discovers_nested_documents_in_stable_order() {
        let root = temp_root("discover");
        write(&root.join("b/second.flow.yaml"), MINIMAL);
        write(
            &root.join("a/first.flow.json"),
            r#"{"suite_name":"A","node_id":"a","steps":[{"name":"Ping","request":{"method":"GET","url":"http://api/ping"}}]}"#,
        );
        write(&root.join("ignored.txt"), "not a suite");

        let discovery = discover(&root, &EngineLimits::default());
        assert_eq!(discovery.suites.len(), 2);
        assert!(discovery.errors.is_empty());
        assert_eq!(discovery.suites[0].node_id, "a");
        assert_eq!(discovery.suites[0].source_index, 0);
        assert_eq!(discovery.suites[1].node_id, "seed");
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn invalid_document_is_excluded_and_reported() {
        let root = temp_root("invalid");
        write(&root.join("bad.flow.yaml"), "suite_name: [unclosed");
        write(&root.join("good.flow.yaml"), MINIMAL);

        let discovery = discover(&root, &EngineLimits::default());
        assert_eq!(discovery.suites.len(), 1);
        assert_eq!(discovery.errors.len(), 1);
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn empty_suite_is_a_load_error() {
        let suite = suite_from(json!({"suite_name": "E", "node_id": "e", "steps": []}));
        let errors = validate_suite(&suite, &EngineLimits::default());
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], LoadError::EmptySuite { .. }));
    }

    #[test]
    fn duplicate_step_ids_detected() {
        let suite = suite_from(json!({
            "suite_name": "D", "node_id": "d",
            "steps": [
                {"name": "Same Name", "request": {"method": "GET", "url": "/a"}},
                {"name": "Same Name", "request": {"method": "GET", "url": "/b"}}
            ]
        }));
        let errors = validate_suite(&suite, &EngineLimits::default());
        assert!(errors
            .iter()
            .any(|e| matches!(e, LoadError::DuplicateStepId { .. })));
    }

    #[test]
    fn call_exclusivity_enforced() {
        let suite = suite_from(json!({
            "suite_name": "C", "node_id": "c",
            "steps": [{
                "name": "Bad",
                "call": {"suite": "x", "step": "y"},
                "request": {"method": "GET", "url": "/a"}
            }]
        }));
        let errors = validate_suite(&suite, &EngineLimits::default());
        assert!(errors
            .iter()
            .any(|e| matches!(e, LoadError::AmbiguousPrimaryAction { .. })));
    }

    #[test]
    fn request_plus_input_is_allowed() {
        let suite = suite_from(json!({
            "suite_name": "RI", "node_id": "ri",
            "steps": [{
                "name": "Ask",
                "request": {"method": "GET", "url": "/a"},
                "input": {"prompt": "code?", "variable": "code"}
            }]
        }));
        assert!(validate_suite(&suite, &EngineLimits::default()).is_empty());
    }

    #[test]
    fn missing_primary_action_detected() {
        let suite = suite_from(json!({
            "suite_name": "M", "node_id": "m",
            "steps": [{"name": "Nothing", "assert": {"status_code": 200}}]
        }));
        let errors = validate_suite(&suite, &EngineLimits::default());
        assert!(errors
            .iter()
            .any(|e| matches!(e, LoadError::MissingPrimaryAction { .. })));
    }

    #[test]
    fn iterate_needs_a_body_and_a_source() {
        let suite = suite_from(json!({
            "suite_name": "I", "node_id": "i",
            "steps": [{"name": "Loop", "iterate": {}}]
        }));
        let errors = validate_suite(&suite, &EngineLimits::default());
        assert!(errors
            .iter()
            .any(|e| matches!(e, LoadError::IterateWithoutSource { .. })));
        assert!(errors
            .iter()
            .any(|e| matches!(e, LoadError::AmbiguousPrimaryAction { .. })));
    }

    #[test]
    fn invalid_method_detected() {
        let suite = suite_from(json!({
            "suite_name": "V", "node_id": "v",
            "steps": [{"name": "Bad", "request": {"method": "FETCH", "url": "/a"}}]
        }));
        let errors = validate_suite(&suite, &EngineLimits::default());
        assert!(errors
            .iter()
            .any(|e| matches!(e, LoadError::InvalidHttpMethod { .. })));
    }

    #[test]
    fn scenario_nesting_depth_is_bounded() {
        let mut limits = EngineLimits::default();
        limits.max_scenario_depth = 2;
        let suite = suite_from(json!({
            "suite_name": "S", "node_id": "s",
            "steps": [{
                "name": "Deep",
                "scenarios": [{"condition": "true", "then": {"scenarios": [
                    {"condition": "true", "then": {"scenarios": [
                        {"condition": "true", "then": {}}
                    ]}}
                ]}}]
            }]
        }));
        let errors = validate_suite(&suite, &limits);
        assert!(errors
            .iter()
            .any(|e| matches!(e, LoadError::ScenarioDepthExceeded { .. })));
    }

    #[test]
    fn index_resolves_by_id_and_path_confined_to_root() {
        let root = temp_root("index");
        write(&root.join("auth/login.flow.yaml"), MINIMAL);
        let discovery = discover(&root, &EngineLimits::default());
        let index = SuiteIndex::build(&root, discovery.suites).unwrap();

        assert!(index.get("seed").is_some());
        assert!(index.resolve("seed", None).is_some());
        assert!(index.resolve("auth/login.flow.yaml", None).is_some());
        let caller_dir = root.join("auth");
        assert!(index.resolve("login.flow.yaml", Some(&caller_dir)).is_some());
        // Escaping the root is rejected even when the file exists.
        assert!(index.resolve("../../etc/hosts", Some(&caller_dir)).is_none());
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn duplicate_node_ids_fail_index_build() {
        let a = suite_from(json!({
            "suite_name": "A", "node_id": "dup",
            "steps": [{"name": "s", "request": {"method": "GET", "url": "/"}}]
        }));
        let b = suite_from(json!({
            "suite_name": "B", "node_id": "dup",
            "steps": [{"name": "s", "request": {"method": "GET", "url": "/"}}]
        }));
        let err = SuiteIndex::build(Path::new("/tmp"), vec![a, b]).unwrap_err();
        assert!(matches!(err, PlanError::DuplicateNodeId { .. }));
    }

    #[test]
    fn run_config_defaults_when_absent() {
        let root = temp_root("config");
        let config = RunConfig::load(&root);
        assert_eq!(config.mode, ExecutionMode::Sequential);
        assert_eq!(config.required_priority_names(), vec!["critical"]);
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn run_config_parses_fields() {
        let root = temp_root("config2");
        write(
            &root.join("flowrunner.yaml"),
            r#"
project_name: Demo
mode: parallel
max_parallel: 8
fail_fast_on_required: true
globals: { api_url: "http://api" }
"#,
        );
        let config = RunConfig::load(&root);
        assert_eq!(config.project_name.as_deref(), Some("Demo"));
        assert_eq!(config.mode, ExecutionMode::Parallel);
        assert_eq!(config.max_parallel, Some(8));
        assert!(config.fail_fast_on_required);
        assert_eq!(config.globals.get("api_url"), Some(&json!("http://api")));
        std::fs::remove_dir_all(&root).ok();
    }
}
