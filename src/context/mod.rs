//! # Variable Context
//!
//! Five-scope hierarchical variable store with `{{…}}` interpolation.
//!
//! Lookup precedence, highest first: `runtime`, `suite`, `imported[flow_id]`,
//! `global`, `environment`. Dotted names resolve against the first scope in
//! which the full path resolves, so a runtime scalar named `auth` does not
//! shadow `auth.token` provided by an imported flow.
//!
//! Expressions inside `{{…}}`:
//!
//! - bare or dotted names — scope walk as above;
//! - `$env.NAME` — process environment, absent becomes literal `null`;
//! - `faker.…` / `$faker.…` — fake-data provider; failures leave the
//!   placeholder verbatim and warn;
//! - `js:EXPR` / `$js.EXPR` — expression engine; failures leave the
//!   placeholder verbatim and warn;
//! - `producer.name` — additionally searched in the exported registry.
//!
//! Interpolation never throws on a missing variable: the placeholder text is
//! preserved and a single warning per name is emitted (unless suppressed).

use crate::expressions::{
    stringified, BuiltinEngine, BuiltinFaker, ExpressionEngine, FakeDataProvider, Scope,
};
use crate::protocol::{JsonMap, ResponseDetails};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tracing::warn;

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{([^{}]+)\}\}").expect("valid placeholder regex"));

// ============================================================================
// EXPORTED-VARIABLE REGISTRY
// ============================================================================

/// Process-wide mapping of `(producer_node_id, variable_name)` to value.
///
/// Writes happen only after a suite completes successfully (at a wave
/// boundary), reads happen from any dependent via `{producer}.{name}`.
/// Created at run start, dropped at run end.
#[derive(Debug, Default)]
pub struct ExportRegistry {
    inner: RwLock<HashMap<String, JsonMap>>,
}

impl ExportRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, producer: &str, name: &str, value: Value) {
        let mut inner = self.inner.write().expect("registry lock");
        inner
            .entry(producer.to_string())
            .or_default()
            .insert(name.to_string(), value);
    }

    pub fn get(&self, producer: &str, name: &str) -> Option<Value> {
        let inner = self.inner.read().expect("registry lock");
        inner.get(producer).and_then(|m| m.get(name)).cloned()
    }

    /// All values exported by one producer.
    pub fn producer(&self, producer: &str) -> Option<JsonMap> {
        let inner = self.inner.read().expect("registry lock");
        inner.get(producer).cloned()
    }

    /// Flat snapshot keyed `{producer}.{name}`, used in the aggregated
    /// result.
    pub fn snapshot(&self) -> JsonMap {
        let inner = self.inner.read().expect("registry lock");
        let mut producers: Vec<&String> = inner.keys().collect();
        producers.sort();
        let mut out = JsonMap::new();
        for producer in producers {
            for (name, value) in &inner[producer] {
                out.insert(format!("{producer}.{name}"), value.clone());
            }
        }
        out
    }
}

// ============================================================================
// EXTENSION WIRING
// ============================================================================

/// The pluggable evaluators interpolation delegates to.
pub struct Extensions {
    pub engine: Box<dyn ExpressionEngine>,
    pub faker: Box<dyn FakeDataProvider>,
}

impl Default for Extensions {
    fn default() -> Self {
        Self {
            engine: Box::new(BuiltinEngine),
            faker: Box::new(BuiltinFaker),
        }
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Extensions")
    }
}

// ============================================================================
// VARIABLE CONTEXT
// ============================================================================

/// The per-suite variable store. The set of scopes is fixed; only their
/// contents mutate.
#[derive(Debug)]
pub struct VariableContext {
    runtime: JsonMap,
    suite: JsonMap,
    /// Ordered `(flow_id, variables)` pairs.
    imported: Vec<(String, JsonMap)>,
    global: JsonMap,
    environment: JsonMap,
    registry: Arc<ExportRegistry>,
    extensions: Arc<Extensions>,
    /// Names already warned about, so each unresolved name logs once.
    warned: Mutex<HashSet<String>>,
}

impl Clone for VariableContext {
    fn clone(&self) -> Self {
        Self {
            runtime: self.runtime.clone(),
            suite: self.suite.clone(),
            imported: self.imported.clone(),
            global: self.global.clone(),
            environment: self.environment.clone(),
            registry: Arc::clone(&self.registry),
            extensions: Arc::clone(&self.extensions),
            warned: Mutex::new(self.warned.lock().expect("warned lock").clone()),
        }
    }
}

impl Scope for VariableContext {
    fn lookup(&self, path: &str) -> Option<Value> {
        self.get(path)
    }
}

impl VariableContext {
    pub fn new(registry: Arc<ExportRegistry>, extensions: Arc<Extensions>) -> Self {
        Self {
            runtime: JsonMap::new(),
            suite: JsonMap::new(),
            imported: Vec::new(),
            global: JsonMap::new(),
            environment: JsonMap::new(),
            registry,
            extensions,
            warned: Mutex::new(HashSet::new()),
        }
    }

    pub fn registry(&self) -> Arc<ExportRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn extensions(&self) -> Arc<Extensions> {
        Arc::clone(&self.extensions)
    }

    // ------------------------------------------------------------------
    // Mutators. Clears never touch `global` or `environment`.
    // ------------------------------------------------------------------

    pub fn set_runtime(&mut self, name: impl Into<String>, value: Value) {
        self.runtime.insert(name.into(), value);
    }

    pub fn set_many(&mut self, entries: &JsonMap) {
        for (k, v) in entries {
            self.runtime.insert(k.clone(), v.clone());
        }
    }

    pub fn set_suite_vars(&mut self, entries: &JsonMap) {
        for (k, v) in entries {
            self.suite.insert(k.clone(), v.clone());
        }
    }

    pub fn set_global_vars(&mut self, entries: &JsonMap) {
        for (k, v) in entries {
            self.global.insert(k.clone(), v.clone());
        }
    }

    pub fn set_environment_vars(&mut self, entries: &JsonMap) {
        for (k, v) in entries {
            self.environment.insert(k.clone(), v.clone());
        }
    }

    pub fn add_imported(&mut self, flow_id: impl Into<String>, entries: JsonMap) {
        let flow_id = flow_id.into();
        if let Some(slot) = self.imported.iter_mut().find(|(id, _)| *id == flow_id) {
            for (k, v) in entries {
                slot.1.insert(k, v);
            }
        } else {
            self.imported.push((flow_id, entries));
        }
    }

    pub fn clear_runtime(&mut self) {
        self.runtime.clear();
    }

    pub fn clear_suite(&mut self) {
        self.suite.clear();
    }

    pub fn clear_non_global(&mut self) {
        self.runtime.clear();
        self.suite.clear();
        self.imported.clear();
    }

    /// Promote the current value of `name` into the registry under
    /// `producer_id`. Returns false when the name has no value; callers warn
    /// but do not fail.
    pub fn export(&self, producer_id: &str, name: &str) -> bool {
        match self.get(name) {
            Some(value) => {
                self.registry.set(producer_id, name, value);
                true
            }
            None => false,
        }
    }

    pub fn runtime_snapshot(&self) -> JsonMap {
        self.runtime.clone()
    }

    /// Context for a cross-suite callee. Global and environment scopes (and
    /// the registry) are always visible; the caller's runtime is copied in
    /// only when isolation is off. Suite and imported scopes start empty:
    /// the callee brings its own.
    pub fn derive_for_callee(&self, isolate: bool) -> VariableContext {
        let mut callee = VariableContext::new(Arc::clone(&self.registry), Arc::clone(&self.extensions));
        callee.global = self.global.clone();
        callee.environment = self.environment.clone();
        if !isolate {
            callee.runtime = self.runtime.clone();
        }
        callee
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Scope walk. A path matches the first scope where the *full* path
    /// resolves; the exported registry is consulted last for
    /// `{producer}.{name}` references.
    pub fn get(&self, path: &str) -> Option<Value> {
        let segments: Vec<&str> = path.split('.').collect();

        if let Some(v) = resolve_in_map(&self.runtime, &segments) {
            return Some(v);
        }
        if let Some(v) = resolve_in_map(&self.suite, &segments) {
            return Some(v);
        }
        for (flow_id, vars) in &self.imported {
            // An imported flow is addressable both by `flow_id.name` and by
            // bare `name`.
            if flow_id == segments[0] {
                if segments.len() == 1 {
                    return Some(Value::Object(vars.clone()));
                }
                if let Some(v) = resolve_in_map(vars, &segments[1..]) {
                    return Some(v);
                }
            }
            if let Some(v) = resolve_in_map(vars, &segments) {
                return Some(v);
            }
        }
        if let Some(v) = resolve_in_map(&self.global, &segments) {
            return Some(v);
        }
        if let Some(v) = resolve_in_map(&self.environment, &segments) {
            return Some(v);
        }
        if segments.len() >= 2 {
            if let Some(root) = self.registry.get(segments[0], segments[1]) {
                let mut current = root;
                for seg in &segments[2..] {
                    current = descend(&current, seg)?;
                }
                return Some(current);
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Interpolation
    // ------------------------------------------------------------------

    /// Walk any JSON-like input, replacing every `{{expr}}` occurrence in
    /// string positions. Non-string positions pass through unchanged; arrays
    /// and mappings are traversed depth-first.
    pub fn interpolate(&self, template: &Value, suppress_warnings: bool) -> Value {
        match template {
            Value::String(s) => self.interpolate_string(s, suppress_warnings),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.interpolate(item, suppress_warnings))
                    .collect(),
            ),
            Value::Object(map) => {
                let mut out = JsonMap::new();
                for (k, v) in map {
                    out.insert(k.clone(), self.interpolate(v, suppress_warnings));
                }
                Value::Object(out)
            }
            other => other.clone(),
        }
    }

    /// Interpolate a single string. A string that is exactly one placeholder
    /// resolves to the typed value; embedded placeholders stringify.
    pub fn interpolate_string(&self, input: &str, suppress_warnings: bool) -> Value {
        // Whole-string placeholder: preserve the resolved value's type.
        if let Some(caps) = PLACEHOLDER_RE.captures(input) {
            let whole = caps.get(0).expect("group 0");
            if whole.start() == 0 && whole.end() == input.len() {
                let expr = caps.get(1).expect("group 1").as_str().trim();
                return match self.resolve_expr(expr, suppress_warnings) {
                    Some(value) => value,
                    None => Value::String(input.to_string()),
                };
            }
        }

        let mut out = String::new();
        let mut last = 0;
        for caps in PLACEHOLDER_RE.captures_iter(input) {
            let whole = caps.get(0).expect("group 0");
            let expr = caps.get(1).expect("group 1").as_str().trim();
            out.push_str(&input[last..whole.start()]);
            match self.resolve_expr(expr, suppress_warnings) {
                Some(value) => out.push_str(&stringified(&value)),
                None => out.push_str(whole.as_str()),
            }
            last = whole.end();
        }
        out.push_str(&input[last..]);
        Value::String(out)
    }

    /// Resolve one `{{…}}` expression. `None` means: keep the placeholder.
    fn resolve_expr(&self, expr: &str, suppress_warnings: bool) -> Option<Value> {
        if let Some(name) = expr.strip_prefix("$env.") {
            return Some(match std::env::var(name) {
                Ok(v) => Value::String(v),
                Err(_) => Value::Null,
            });
        }

        let faker_spec = expr
            .strip_prefix("$faker.")
            .or_else(|| expr.strip_prefix("faker."));
        if let Some(spec) = faker_spec {
            return match self.extensions.faker.generate(spec) {
                Ok(value) => Some(value),
                Err(e) => {
                    self.warn_unresolved(expr, suppress_warnings, &format!("faker: {e}"));
                    None
                }
            };
        }

        let script = expr
            .strip_prefix("js:")
            .or_else(|| expr.strip_prefix("$js."));
        if let Some(script) = script {
            return match self.extensions.engine.evaluate(script, self) {
                Ok(value) => Some(value),
                Err(e) => {
                    self.warn_unresolved(expr, suppress_warnings, &format!("script: {e}"));
                    None
                }
            };
        }

        match self.get(expr) {
            Some(value) => Some(value),
            None => {
                self.warn_unresolved(expr, suppress_warnings, "no value in any scope");
                None
            }
        }
    }

    fn warn_unresolved(&self, name: &str, suppress: bool, reason: &str) {
        if suppress {
            return;
        }
        let mut warned = self.warned.lock().expect("warned lock");
        if warned.insert(name.to_string()) {
            warn!(variable = %name, reason = %reason, "unresolved interpolation placeholder");
        }
    }

    // ------------------------------------------------------------------
    // Response overlay
    // ------------------------------------------------------------------

    /// A clone whose runtime scope additionally exposes `status_code`,
    /// `headers`, `body` and `duration_ms`, for scenario guards and capture
    /// expressions.
    pub fn with_response(&self, response: &ResponseDetails) -> VariableContext {
        let mut overlay = self.clone();
        overlay.set_runtime("status_code", Value::Number(response.status_code.into()));
        overlay.set_runtime("headers", Value::Object(response.headers.clone()));
        overlay.set_runtime("body", response.body.clone());
        overlay.set_runtime("duration_ms", Value::Number(response.duration_ms.into()));
        overlay
    }
}

fn resolve_in_map(map: &JsonMap, segments: &[&str]) -> Option<Value> {
    let mut current = map.get(segments[0])?.clone();
    for seg in &segments[1..] {
        current = descend(&current, seg)?;
    }
    Some(current)
}

fn descend(value: &Value, segment: &str) -> Option<Value> {
    match value {
        Value::Object(map) => map.get(segment).cloned(),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|i| items.get(i).cloned()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> VariableContext {
        VariableContext::new(ExportRegistry::new(), Arc::new(Extensions::default()))
    }

    fn as_map(value: Value) -> JsonMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("fixture must be an object"),
        }
    }

    #[test]
    fn scope_precedence_runtime_wins() {
        let mut c = ctx();
        c.set_environment_vars(&as_map(json!({"name": "env"})));
        c.set_global_vars(&as_map(json!({"name": "global"})));
        c.set_suite_vars(&as_map(json!({"name": "suite"})));
        c.set_runtime("name", json!("runtime"));

        assert_eq!(c.interpolate(&json!("{{name}}"), false), json!("runtime"));
        c.clear_runtime();
        assert_eq!(c.interpolate(&json!("{{name}}"), false), json!("suite"));
        c.clear_suite();
        assert_eq!(c.interpolate(&json!("{{name}}"), false), json!("global"));
    }

    #[test]
    fn hierarchy_wins_end_to_end() {
        // §8 S1: template mixing all scopes.
        let mut c = ctx();
        c.set_global_vars(&as_map(json!({"api_url": "https://a.test"})));
        c.set_suite_vars(&as_map(json!({"user_id": 123})));
        c.set_runtime("auth", json!("T"));
        c.add_imported("auth", as_map(json!({"token": "xyz"})));

        let out = c.interpolate(
            &json!("{{api_url}}/u/{{user_id}}?t={{auth.token}}&a={{auth}}"),
            false,
        );
        assert_eq!(out, json!("https://a.test/u/123?t=xyz&a=T"));
    }

    #[test]
    fn falsy_values_interpolate_as_text() {
        let mut c = ctx();
        c.set_runtime("zero", json!(0));
        c.set_runtime("no", json!(false));
        c.set_runtime("empty", json!(""));
        let out = c.interpolate(&json!("v={{zero}},{{no}},[{{empty}}]"), false);
        assert_eq!(out, json!("v=0,false,[]"));
    }

    #[test]
    fn unknown_name_preserves_placeholder() {
        let c = ctx();
        assert_eq!(c.interpolate(&json!("{{x}}"), false), json!("{{x}}"));
        assert_eq!(
            c.interpolate(&json!("before {{x}} after"), false),
            json!("before {{x}} after")
        );
    }

    #[test]
    fn interpolation_is_idempotent_for_resolvable_names() {
        let mut c = ctx();
        c.set_runtime("a", json!("one"));
        let template = json!({"x": "{{a}}", "y": ["{{a}}-{{a}}"], "z": 7});
        let once = c.interpolate(&template, false);
        let twice = c.interpolate(&once, false);
        assert_eq!(once, twice);
    }

    #[test]
    fn whole_string_placeholder_keeps_type() {
        let mut c = ctx();
        c.set_runtime("user", json!({"id": 9}));
        c.set_runtime("count", json!(4));
        assert_eq!(c.interpolate(&json!("{{user}}"), false), json!({"id": 9}));
        assert_eq!(c.interpolate(&json!("{{count}}"), false), json!(4));
        // Embedded: stringified.
        assert_eq!(c.interpolate(&json!("n={{count}}"), false), json!("n=4"));
    }

    #[test]
    fn env_lookup_and_absent_env_is_null() {
        std::env::set_var("FLOWRUNNER_TEST_TOKEN", "s3cr3t");
        let c = ctx();
        assert_eq!(
            c.interpolate(&json!("{{$env.FLOWRUNNER_TEST_TOKEN}}"), false),
            json!("s3cr3t")
        );
        assert_eq!(
            c.interpolate(&json!("{{$env.FLOWRUNNER_TEST_MISSING_VAR}}"), false),
            Value::Null
        );
    }

    #[test]
    fn faker_failure_leaves_placeholder() {
        let c = ctx();
        assert_eq!(
            c.interpolate(&json!("{{faker.animal.cat}}"), false),
            json!("{{faker.animal.cat}}")
        );
        // A valid category resolves.
        let email = c.interpolate(&json!("{{faker.internet.email}}"), false);
        assert!(email.as_str().unwrap().contains('@'));
    }

    #[test]
    fn js_expression_evaluates_against_scopes() {
        let mut c = ctx();
        c.set_runtime("n", json!(2));
        assert_eq!(c.interpolate(&json!("{{js:n + 3}}"), false), json!(5));
        assert_eq!(
            c.interpolate(&json!("{{js:((broken}}"), false),
            json!("{{js:((broken}}")
        );
    }

    #[test]
    fn registry_reference_resolves() {
        let c = ctx();
        c.registry().set("seed", "user_id", json!(42));
        assert_eq!(c.interpolate(&json!("{{seed.user_id}}"), false), json!(42));
        assert_eq!(
            c.interpolate(&json!("/u/{{seed.user_id}}"), false),
            json!("/u/42")
        );
    }

    #[test]
    fn clears_never_touch_global_or_environment() {
        let mut c = ctx();
        c.set_global_vars(&as_map(json!({"g": 1})));
        c.set_environment_vars(&as_map(json!({"e": 2})));
        c.set_runtime("r", json!(3));
        c.set_suite_vars(&as_map(json!({"s": 4})));
        c.add_imported("f", as_map(json!({"i": 5})));

        c.clear_non_global();
        assert_eq!(c.get("g"), Some(json!(1)));
        assert_eq!(c.get("e"), Some(json!(2)));
        assert_eq!(c.get("r"), None);
        assert_eq!(c.get("s"), None);
        assert_eq!(c.get("i"), None);
    }

    #[test]
    fn export_promotes_current_value() {
        let mut c = ctx();
        c.set_runtime("token", json!("abc"));
        assert!(c.export("auth", "token"));
        assert!(!c.export("auth", "missing"));
        assert_eq!(c.registry().get("auth", "token"), Some(json!("abc")));
    }

    #[test]
    fn registry_snapshot_is_flat_and_sorted() {
        let registry = ExportRegistry::new();
        registry.set("b", "y", json!(2));
        registry.set("a", "x", json!(1));
        let snapshot = registry.snapshot();
        let keys: Vec<&String> = snapshot.keys().collect();
        assert_eq!(keys, ["a.x", "b.y"]);
    }

    #[test]
    fn response_overlay_exposes_response_fields() {
        let c = ctx();
        let response = ResponseDetails {
            status_code: 404,
            headers: as_map(json!({"content-type": "application/json"})),
            body: json!({"message": "nope"}),
            duration_ms: 12,
        };
        let overlay = c.with_response(&response);
        assert_eq!(overlay.get("status_code"), Some(json!(404)));
        assert_eq!(overlay.get("body.message"), Some(json!("nope")));
        assert_eq!(
            overlay.get("headers.content-type"),
            Some(json!("application/json"))
        );
    }

    #[test]
    fn interpolation_traverses_nested_structures() {
        let mut c = ctx();
        c.set_runtime("id", json!(7));
        let template = json!({
            "url": "/users/{{id}}",
            "body": {"ids": ["{{id}}", 8], "flag": true}
        });
        let out = c.interpolate(&template, false);
        assert_eq!(
            out,
            json!({"url": "/users/7", "body": {"ids": [7, 8], "flag": true}})
        );
    }
}
