//! # Dependency Planner
//!
//! Builds the directed graph over discovered suites, rejects cycles and
//! unresolved required dependencies, and partitions the suites into waves
//! (Kahn levels): wave 0 has no dependencies, wave k+1 depends only on
//! waves <= k. The wave boundary is what gives dependents a happens-before
//! on their dependencies' exported variables.
//!
//! Within a wave, order is a stable tiebreak: priority (`critical` first),
//! then discovery order. The planner also renders the discovery diagram as
//! Mermaid text with node styling by priority and dashed optional edges.

use crate::discovery::SuiteIndex;
use crate::errors::PlanError;
use crate::protocol::Suite;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// A dependency edge after reference resolution. `from` depends on `to`.
#[derive(Debug, Clone)]
pub struct ResolvedEdge {
    pub from: String,
    pub to: String,
    pub required: bool,
    pub condition: Option<String>,
    pub cache: bool,
}

/// The executable plan: wave partition plus the resolved edge list.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub waves: Vec<Vec<String>>,
    pub edges: Vec<ResolvedEdge>,
    pub warnings: Vec<String>,
}

impl ExecutionPlan {
    /// Edges whose dependent is `node_id`.
    pub fn dependencies_of<'a>(
        &'a self,
        node_id: &'a str,
    ) -> impl Iterator<Item = &'a ResolvedEdge> {
        self.edges.iter().filter(move |e| e.from == node_id)
    }

    pub fn wave_of(&self, node_id: &str) -> Option<usize> {
        self.waves
            .iter()
            .position(|wave| wave.iter().any(|n| n == node_id))
    }

    pub fn suite_count(&self) -> usize {
        self.waves.iter().map(Vec::len).sum()
    }
}

/// Build the plan over every suite in the index.
pub fn plan(index: &SuiteIndex) -> Result<ExecutionPlan, PlanError> {
    let mut edges = Vec::new();
    let mut warnings = Vec::new();

    // Resolve references: node_id first, then confined path candidates.
    for suite in index.iter() {
        let caller_dir = suite.source_path.as_deref().and_then(Path::parent);
        for declared in &suite.depends {
            let reference = declared
                .node_id
                .clone()
                .or_else(|| declared.path.clone())
                .unwrap_or_default();
            match index.resolve(&reference, caller_dir) {
                Some(target) => edges.push(ResolvedEdge {
                    from: suite.node_id.clone(),
                    to: target.node_id.clone(),
                    required: declared.required,
                    condition: declared.condition.clone(),
                    cache: declared.cache,
                }),
                None if declared.required => {
                    return Err(PlanError::UnresolvedRequired {
                        node_id: suite.node_id.clone(),
                        reference,
                    });
                }
                None => {
                    let message = format!(
                        "suite '{}': optional dependency '{reference}' not found, ignoring",
                        suite.node_id
                    );
                    warn!("{message}");
                    warnings.push(message);
                }
            }
        }
    }

    detect_cycles(index, &edges)?;

    let waves = layer_waves(index, &edges);
    check_export_conflicts(index, &waves)?;

    Ok(ExecutionPlan {
        waves,
        edges,
        warnings,
    })
}

/// Depth-first cycle detection with node coloring; reports the cycle path.
fn detect_cycles(index: &SuiteIndex, edges: &[ResolvedEdge]) -> Result<(), PlanError> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        adjacency
            .entry(edge.from.as_str())
            .or_default()
            .push(edge.to.as_str());
    }

    // 0 = unvisited, 1 = on the current path, 2 = done.
    let mut color: HashMap<&str, u8> = HashMap::new();
    for suite in index.iter() {
        color.insert(suite.node_id.as_str(), 0);
    }

    fn visit<'a>(
        node: &'a str,
        adjacency: &HashMap<&'a str, Vec<&'a str>>,
        color: &mut HashMap<&'a str, u8>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        color.insert(node, 1);
        path.push(node);
        if let Some(next) = adjacency.get(node) {
            for &target in next {
                match color.get(target) {
                    Some(1) => {
                        let start = path.iter().position(|n| *n == target).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|n| n.to_string()).collect();
                        cycle.push(target.to_string());
                        return Some(cycle);
                    }
                    Some(0) => {
                        if let Some(cycle) = visit(target, adjacency, color, path) {
                            return Some(cycle);
                        }
                    }
                    _ => {}
                }
            }
        }
        path.pop();
        color.insert(node, 2);
        None
    }

    let nodes: Vec<&str> = index.iter().map(|s| s.node_id.as_str()).collect();
    for node in nodes {
        if color.get(node) == Some(&0) {
            let mut path = Vec::new();
            if let Some(cycle) = visit(node, &adjacency, &mut color, &mut path) {
                return Err(PlanError::Cycle { cycle });
            }
        }
    }
    Ok(())
}

/// Kahn layering with the in-wave priority/source-order tiebreak.
fn layer_waves(index: &SuiteIndex, edges: &[ResolvedEdge]) -> Vec<Vec<String>> {
    let mut remaining: HashMap<String, HashSet<String>> = HashMap::new();
    for suite in index.iter() {
        remaining.insert(suite.node_id.clone(), HashSet::new());
    }
    for edge in edges {
        if let Some(deps) = remaining.get_mut(&edge.from) {
            deps.insert(edge.to.clone());
        }
    }

    let mut placed: HashSet<String> = HashSet::new();
    let mut waves = Vec::new();
    while placed.len() < remaining.len() {
        let mut wave: Vec<Arc<Suite>> = index
            .iter()
            .filter(|s| !placed.contains(&s.node_id))
            .filter(|s| remaining[&s.node_id].iter().all(|d| placed.contains(d)))
            .cloned()
            .collect();
        // Cycle detection ran first, so progress is guaranteed.
        assert!(!wave.is_empty(), "wave computation stalled without a cycle");
        wave.sort_by_key(|s| (s.priority.rank(), s.source_index));
        waves.push(wave.iter().map(|s| s.node_id.clone()).collect::<Vec<_>>());
        for suite in wave {
            placed.insert(suite.node_id.clone());
        }
    }
    waves
}

/// Two suites in the same wave exporting the same name would race bare-name
/// imports; reject the plan.
fn check_export_conflicts(index: &SuiteIndex, waves: &[Vec<String>]) -> Result<(), PlanError> {
    for wave in waves {
        let mut seen: HashMap<String, String> = HashMap::new();
        for node_id in wave {
            let suite = match index.get(node_id) {
                Some(suite) => suite,
                None => continue,
            };
            for name in &suite.exports {
                if let Some(first) = seen.get(name) {
                    if first != node_id {
                        return Err(PlanError::ExportConflict {
                            first: first.clone(),
                            second: node_id.clone(),
                            name: name.clone(),
                        });
                    }
                }
                seen.insert(name.clone(), node_id.clone());
            }
        }
    }
    Ok(())
}

// ============================================================================
// DISCOVERY DIAGRAM
// ============================================================================

/// Render the dependency graph as Mermaid: nodes styled by priority, dashed
/// edges for optional dependencies, arrows pointing from dependency to
/// dependent (execution order).
pub fn mermaid(index: &SuiteIndex, plan: &ExecutionPlan) -> String {
    let mut out = String::from("graph TD\n");
    for suite in index.iter() {
        out.push_str(&format!(
            "    {}[\"{}\"]:::{}\n",
            sanitize(&suite.node_id),
            suite.suite_name.replace('"', "'"),
            suite.priority.as_str()
        ));
    }
    for edge in &plan.edges {
        let arrow = if edge.required { "-->" } else { "-.->" };
        out.push_str(&format!(
            "    {} {} {}\n",
            sanitize(&edge.to),
            arrow,
            sanitize(&edge.from)
        ));
    }
    out.push_str("    classDef critical fill:#7f1d1d,color:#fff\n");
    out.push_str("    classDef high fill:#9a3412,color:#fff\n");
    out.push_str("    classDef medium fill:#1e3a8a,color:#fff\n");
    out.push_str("    classDef low fill:#374151,color:#fff\n");
    out
}

fn sanitize(node_id: &str) -> String {
    node_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn suite(node_id: &str, priority: &str, depends: serde_json::Value, index: usize) -> Suite {
        let mut suite: Suite = serde_json::from_value(json!({
            "suite_name": node_id.to_uppercase(),
            "node_id": node_id,
            "priority": priority,
            "depends": depends,
            "steps": [{"name": "s", "request": {"method": "GET", "url": "/x"}}]
        }))
        .unwrap();
        suite.source_index = index;
        suite
    }

    fn index_of(suites: Vec<Suite>) -> SuiteIndex {
        SuiteIndex::build(&std::env::temp_dir(), suites).unwrap()
    }

    #[test]
    fn waves_are_a_topological_layering() {
        // §8 invariant 4: a dependency's wave index is strictly less than
        // its dependent's.
        let index = index_of(vec![
            suite("seed", "medium", json!([]), 0),
            suite("auth", "medium", json!(["seed"]), 1),
            suite("orders", "medium", json!(["auth", "seed"]), 2),
            suite("independent", "medium", json!([]), 3),
        ]);
        let plan = plan(&index).unwrap();

        assert_eq!(plan.waves.len(), 3);
        for edge in &plan.edges {
            let dependent = plan.wave_of(&edge.from).unwrap();
            let dependency = plan.wave_of(&edge.to).unwrap();
            assert!(
                dependency < dependent,
                "{} must run before {}",
                edge.to,
                edge.from
            );
        }
        assert_eq!(plan.wave_of("independent"), Some(0));
    }

    #[test]
    fn in_wave_order_is_priority_then_source_order() {
        let index = index_of(vec![
            suite("late-low", "low", json!([]), 0),
            suite("crit", "critical", json!([]), 1),
            suite("med-a", "medium", json!([]), 2),
            suite("med-b", "medium", json!([]), 3),
        ]);
        let plan = plan(&index).unwrap();
        assert_eq!(plan.waves[0], ["crit", "med-a", "med-b", "late-low"]);
    }

    #[test]
    fn cycle_is_reported_with_its_path() {
        let index = index_of(vec![
            suite("a", "medium", json!(["c"]), 0),
            suite("b", "medium", json!(["a"]), 1),
            suite("c", "medium", json!(["b"]), 2),
        ]);
        let err = plan(&index).unwrap_err();
        match err {
            PlanError::Cycle { cycle } => {
                assert!(cycle.len() >= 3);
                assert_eq!(cycle.first(), cycle.last());
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let index = index_of(vec![suite("a", "medium", json!(["a"]), 0)]);
        assert!(matches!(plan(&index).unwrap_err(), PlanError::Cycle { .. }));
    }

    #[test]
    fn unresolved_required_fails_planning() {
        let index = index_of(vec![suite("a", "medium", json!(["ghost"]), 0)]);
        let err = plan(&index).unwrap_err();
        assert!(matches!(err, PlanError::UnresolvedRequired { .. }));
    }

    #[test]
    fn unresolved_optional_warns_and_continues() {
        let index = index_of(vec![suite(
            "a",
            "medium",
            json!([{"node_id": "ghost", "required": false}]),
            0,
        )]);
        let plan = plan(&index).unwrap();
        assert_eq!(plan.warnings.len(), 1);
        assert!(plan.edges.is_empty());
        assert_eq!(plan.waves, vec![vec!["a".to_string()]]);
    }

    #[test]
    fn same_wave_export_name_conflict_is_rejected() {
        let mut first = suite("a", "medium", json!([]), 0);
        first.exports = vec!["token".to_string()];
        let mut second = suite("b", "medium", json!([]), 1);
        second.exports = vec!["token".to_string()];
        let index = index_of(vec![first, second]);
        let err = plan(&index).unwrap_err();
        assert!(matches!(err, PlanError::ExportConflict { .. }));
    }

    #[test]
    fn exports_in_different_waves_do_not_conflict() {
        let mut first = suite("a", "medium", json!([]), 0);
        first.exports = vec!["token".to_string()];
        let mut second = suite("b", "medium", json!(["a"]), 1);
        second.exports = vec!["token".to_string()];
        let index = index_of(vec![first, second]);
        assert!(plan(&index).is_ok());
    }

    #[test]
    fn edge_metadata_survives_resolution() {
        let index = index_of(vec![
            suite("dep", "medium", json!([]), 0),
            suite(
                "top",
                "medium",
                json!([{"node_id": "dep", "condition": "env == 'ci'", "cache": true}]),
                1,
            ),
        ]);
        let plan = plan(&index).unwrap();
        let edge = plan.dependencies_of("top").next().unwrap();
        assert_eq!(edge.to, "dep");
        assert!(edge.cache);
        assert_eq!(edge.condition.as_deref(), Some("env == 'ci'"));
    }

    #[test]
    fn mermaid_diagram_styles_nodes_and_optional_edges() {
        let index = index_of(vec![
            suite("seed", "critical", json!([]), 0),
            suite(
                "extra",
                "low",
                json!([{"node_id": "seed", "required": false}]),
                1,
            ),
        ]);
        let built = plan(&index).unwrap();
        let diagram = mermaid(&index, &built);
        assert!(diagram.starts_with("graph TD"));
        assert!(diagram.contains("seed[\"SEED\"]:::critical"));
        assert!(diagram.contains("seed -.-> extra"));
        assert!(diagram.contains("classDef critical"));
    }
}
