//! # Result Aggregator
//!
//! Collects per-attempt HTTP timings, rolls suite results up into the
//! run-level aggregate, and writes the report files: `{output_dir}/latest.json`
//! plus a timestamped sibling. Everything written to disk passes through
//! redaction first.

use crate::protocol::{
    AggregatedResult, EndpointTiming, JsonMap, PerformanceDatum, PerformanceSummary, RunStatus,
    RunTotals, StepStatus, SuiteResult, SuiteStatus,
};
use crate::redaction;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

// ============================================================================
// PERFORMANCE COLLECTION
// ============================================================================

/// Run-wide sink for one datum per HTTP attempt. Shared by every suite task;
/// recording is a short lock append.
#[derive(Debug, Default)]
pub struct PerfCollector {
    data: Mutex<Vec<PerformanceDatum>>,
}

impl PerfCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, datum: PerformanceDatum) {
        self.data.lock().expect("perf lock").push(datum);
    }

    pub fn len(&self) -> usize {
        self.data.lock().expect("perf lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<PerformanceDatum> {
        self.data.lock().expect("perf lock").clone()
    }

    /// Build the summary over everything recorded so far. `None` when no
    /// HTTP attempt was made.
    pub fn summary(&self, run_duration_ms: u64) -> Option<PerformanceSummary> {
        let data = self.data.lock().expect("perf lock");
        build_summary(&data, run_duration_ms)
    }
}

/// Percentile over a sorted sample (nearest-rank).
fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn build_summary(data: &[PerformanceDatum], run_duration_ms: u64) -> Option<PerformanceSummary> {
    if data.is_empty() {
        return None;
    }

    let mut times: Vec<u64> = data.iter().map(|d| d.response_time_ms).collect();
    times.sort_unstable();
    let count = times.len();
    let total: u64 = times.iter().sum();

    // Group by endpoint for the slowest list, keyed `(method, url)`.
    let mut by_endpoint: HashMap<(String, String), (u64, usize)> = HashMap::new();
    for datum in data {
        let entry = by_endpoint
            .entry((datum.method.clone(), datum.url.clone()))
            .or_insert((0, 0));
        entry.0 += datum.response_time_ms;
        entry.1 += 1;
    }
    let mut slowest: Vec<EndpointTiming> = by_endpoint
        .into_iter()
        .map(|((method, url), (sum, hits))| EndpointTiming {
            method,
            url,
            mean_ms: sum as f64 / hits as f64,
            hits,
        })
        .collect();
    slowest.sort_by(|a, b| {
        b.mean_ms
            .partial_cmp(&a.mean_ms)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.url.cmp(&b.url))
    });
    slowest.truncate(10);

    let throughput = if run_duration_ms == 0 {
        count as f64
    } else {
        count as f64 / (run_duration_ms as f64 / 1000.0)
    };

    Some(PerformanceSummary {
        request_count: count,
        min_ms: times[0],
        avg_ms: total as f64 / count as f64,
        max_ms: times[count - 1],
        median_ms: percentile(&times, 50.0),
        p95_ms: percentile(&times, 95.0),
        p99_ms: percentile(&times, 99.0),
        throughput_rps: throughput.max(0.0),
        slowest_endpoints: slowest,
    })
}

// ============================================================================
// AGGREGATION
// ============================================================================

/// Roll suite results up into the aggregated run result.
pub fn aggregate(
    project_name: &str,
    run_id: &str,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    suites: Vec<SuiteResult>,
    global_variables_final_state: JsonMap,
    performance_summary: Option<PerformanceSummary>,
) -> AggregatedResult {
    let mut totals = RunTotals {
        suites: suites.len(),
        ..RunTotals::default()
    };
    for suite in &suites {
        match suite.status {
            SuiteStatus::Success => totals.suites_successful += 1,
            SuiteStatus::Failure => totals.suites_failed += 1,
            SuiteStatus::Skipped => totals.suites_skipped += 1,
        }
        for step in &suite.steps {
            totals.steps += 1;
            match step.status {
                StepStatus::Success => totals.steps_successful += 1,
                StepStatus::Failure => totals.steps_failed += 1,
                StepStatus::Skipped => totals.steps_skipped += 1,
            }
        }
    }

    let status = if totals.suites_failed == 0 {
        RunStatus::Success
    } else {
        RunStatus::Failure
    };
    let executed = totals.suites - totals.suites_skipped;
    let success_rate = if executed == 0 {
        if status == RunStatus::Success {
            1.0
        } else {
            0.0
        }
    } else {
        totals.suites_successful as f64 / executed as f64
    };

    AggregatedResult {
        project_name: project_name.to_string(),
        run_id: run_id.to_string(),
        start_time,
        end_time,
        total_duration_ms: (end_time - start_time).num_milliseconds().max(0) as u64,
        status,
        totals,
        success_rate,
        suites,
        global_variables_final_state,
        performance_summary,
    }
}

// ============================================================================
// REPORT FILES
// ============================================================================

/// Write the redacted aggregate to `latest.json` and a timestamped sibling.
/// Returns the timestamped path.
pub fn write_report(output_dir: &Path, result: &AggregatedResult) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(output_dir)?;

    let redacted: Value = redaction::redact_document(result)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let rendered = serde_json::to_string_pretty(&redacted)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let latest = output_dir.join("latest.json");
    std::fs::write(&latest, &rendered)?;

    let stamped = output_dir.join(format!(
        "report-{}.json",
        result.start_time.format("%Y%m%dT%H%M%S%3fZ")
    ));
    std::fs::write(&stamped, &rendered)?;

    info!(path = %latest.display(), "report written");
    Ok(stamped)
}

/// Load a previously written aggregate (the `report` CLI command).
pub fn read_report(path: &Path) -> std::io::Result<AggregatedResult> {
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{StepResult, Suite};
    use serde_json::json;

    fn datum(method: &str, url: &str, ms: u64) -> PerformanceDatum {
        PerformanceDatum {
            method: method.to_string(),
            url: url.to_string(),
            response_time_ms: ms,
            status_code: 200,
            timestamp: Utc::now(),
        }
    }

    fn suite_fixture(node_id: &str) -> Suite {
        serde_json::from_value(json!({
            "suite_name": node_id,
            "node_id": node_id,
            "steps": [{"name": "s", "request": {"method": "GET", "url": "/x"}}]
        }))
        .unwrap()
    }

    #[test]
    fn summary_percentiles_and_extremes() {
        let collector = PerfCollector::new();
        for ms in [10, 20, 30, 40, 50, 60, 70, 80, 90, 100] {
            collector.record(datum("GET", "/a", ms));
        }
        let summary = collector.summary(1_000).unwrap();
        assert_eq!(summary.request_count, 10);
        assert_eq!(summary.min_ms, 10);
        assert_eq!(summary.max_ms, 100);
        assert_eq!(summary.median_ms, 50);
        assert_eq!(summary.p95_ms, 100);
        assert_eq!(summary.p99_ms, 100);
        assert!((summary.avg_ms - 55.0).abs() < f64::EPSILON);
        assert!((summary.throughput_rps - 10.0).abs() < 1e-9);
    }

    #[test]
    fn summary_empty_is_none() {
        let collector = PerfCollector::new();
        assert!(collector.summary(1_000).is_none());
    }

    #[test]
    fn slowest_endpoints_sorted_by_mean_capped_at_ten() {
        let collector = PerfCollector::new();
        for i in 0..12 {
            collector.record(datum("GET", &format!("/e{i}"), (i + 1) * 10));
        }
        // Two hits on one endpoint to exercise the mean.
        collector.record(datum("GET", "/e0", 30));
        let summary = collector.summary(1_000).unwrap();
        assert_eq!(summary.slowest_endpoints.len(), 10);
        assert_eq!(summary.slowest_endpoints[0].url, "/e11");
        let e0 = summary
            .slowest_endpoints
            .iter()
            .find(|e| e.url == "/e0");
        if let Some(e0) = e0 {
            assert_eq!(e0.hits, 2);
            assert!((e0.mean_ms - 20.0).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn aggregate_totals_and_status() {
        let suite = suite_fixture("a");
        let ok_steps = vec![{
            let mut s = StepResult::skipped("s", "a::s", "");
            s.status = StepStatus::Success;
            s
        }];
        let bad_steps = vec![{
            let mut s = StepResult::skipped("s", "b::s", "");
            s.status = StepStatus::Failure;
            s
        }];
        let now = Utc::now();
        let ok = SuiteResult::from_steps(&suite, now, now, ok_steps, None);
        let suite_b = suite_fixture("b");
        let bad = SuiteResult::from_steps(&suite_b, now, now, bad_steps, None);

        let result = aggregate(
            "demo",
            "run-1",
            now,
            now,
            vec![ok, bad],
            JsonMap::new(),
            None,
        );
        assert_eq!(result.status, RunStatus::Failure);
        assert_eq!(result.totals.suites, 2);
        assert_eq!(result.totals.suites_failed, 1);
        assert_eq!(result.totals.steps, 2);
        assert!((result.success_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn written_report_is_redacted_and_readable() {
        let dir = std::env::temp_dir().join(format!("flowrunner-report-{}", uuid::Uuid::new_v4()));
        let suite = suite_fixture("a");
        let now = Utc::now();
        let mut step = StepResult::skipped("s", "a::s", "");
        step.status = StepStatus::Success;
        step.captured
            .insert("auth_token".to_string(), json!("sup3r-secret"));
        let suite_result = SuiteResult::from_steps(&suite, now, now, vec![step], None);
        let result = aggregate(
            "demo",
            "run-1",
            now,
            now,
            vec![suite_result],
            JsonMap::new(),
            None,
        );

        write_report(&dir, &result).unwrap();
        let raw = std::fs::read_to_string(dir.join("latest.json")).unwrap();
        assert!(!raw.contains("sup3r-secret"));
        assert!(raw.contains("[REDACTED]"));

        // Round-trips through the reader.
        let loaded = read_report(&dir.join("latest.json")).unwrap();
        assert_eq!(loaded.project_name, "demo");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn throughput_never_negative() {
        let collector = PerfCollector::new();
        collector.record(datum("GET", "/a", 5));
        let summary = collector.summary(0).unwrap();
        assert!(summary.throughput_rps >= 0.0);
    }
}
