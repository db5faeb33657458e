//! # Engine Limits
//!
//! Hard bounds that keep a malformed or adversarial suite tree from taking
//! the engine down: suite/step counts, parallelism, call and scenario depth,
//! iteration counts and timeouts. All limits have safe defaults and can be
//! overridden through `FLOWRUNNER_*` environment variables.

use crate::errors::LoadError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_MAX_SUITES: usize = 200;
pub const DEFAULT_MAX_STEPS_PER_SUITE: usize = 100;
pub const DEFAULT_MAX_PARALLEL: usize = 4;
pub const DEFAULT_MAX_CALL_DEPTH: usize = 10;
pub const DEFAULT_MAX_SCENARIO_DEPTH: usize = 5;
pub const DEFAULT_MAX_ITERATIONS: usize = 100;
pub const DEFAULT_RUN_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_SCRIPT_BUDGET_MS: u64 = 1_000;

/// Execution limits, applied at load/plan time (counts, depths) and at run
/// time (timeouts, parallelism).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineLimits {
    /// Maximum number of discovered suites accepted into one run.
    pub max_suites: usize,

    /// Maximum steps in a single suite.
    pub max_steps_per_suite: usize,

    /// Upper bound on concurrently running suites in parallel mode.
    pub max_parallel: usize,

    /// Maximum cross-suite call stack depth.
    pub max_call_depth: usize,

    /// Maximum scenario nesting depth.
    pub max_scenario_depth: usize,

    /// Maximum expansions of a single `iterate` step.
    pub max_iterations: usize,

    /// Wall-clock bound for the whole run.
    pub run_timeout: Duration,

    /// Default per-step timeout when neither the step nor the suite sets one.
    pub step_timeout: Duration,

    /// Execution budget for one pre/post script evaluation.
    pub script_budget: Duration,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_suites: DEFAULT_MAX_SUITES,
            max_steps_per_suite: DEFAULT_MAX_STEPS_PER_SUITE,
            max_parallel: DEFAULT_MAX_PARALLEL,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            max_scenario_depth: DEFAULT_MAX_SCENARIO_DEPTH,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            run_timeout: Duration::from_secs(DEFAULT_RUN_TIMEOUT_SECS),
            step_timeout: Duration::from_millis(DEFAULT_STEP_TIMEOUT_MS),
            script_budget: Duration::from_millis(DEFAULT_SCRIPT_BUDGET_MS),
        }
    }
}

impl EngineLimits {
    /// Build limits from the environment, falling back to defaults.
    ///
    /// Supported variables: `FLOWRUNNER_MAX_SUITES`,
    /// `FLOWRUNNER_MAX_STEPS_PER_SUITE`, `FLOWRUNNER_MAX_PARALLEL`,
    /// `FLOWRUNNER_MAX_CALL_DEPTH`, `FLOWRUNNER_MAX_SCENARIO_DEPTH`,
    /// `FLOWRUNNER_MAX_ITERATIONS`, `FLOWRUNNER_RUN_TIMEOUT_SECS`,
    /// `FLOWRUNNER_STEP_TIMEOUT_MS`, `FLOWRUNNER_SCRIPT_BUDGET_MS`.
    pub fn from_env() -> Self {
        let mut limits = Self::default();

        if let Some(n) = env_usize("FLOWRUNNER_MAX_SUITES") {
            limits.max_suites = n;
        }
        if let Some(n) = env_usize("FLOWRUNNER_MAX_STEPS_PER_SUITE") {
            limits.max_steps_per_suite = n;
        }
        if let Some(n) = env_usize("FLOWRUNNER_MAX_PARALLEL") {
            limits.max_parallel = n;
        }
        if let Some(n) = env_usize("FLOWRUNNER_MAX_CALL_DEPTH") {
            limits.max_call_depth = n;
        }
        if let Some(n) = env_usize("FLOWRUNNER_MAX_SCENARIO_DEPTH") {
            limits.max_scenario_depth = n;
        }
        if let Some(n) = env_usize("FLOWRUNNER_MAX_ITERATIONS") {
            limits.max_iterations = n;
        }
        if let Some(n) = env_u64("FLOWRUNNER_RUN_TIMEOUT_SECS") {
            limits.run_timeout = Duration::from_secs(n);
        }
        if let Some(n) = env_u64("FLOWRUNNER_STEP_TIMEOUT_MS") {
            limits.step_timeout = Duration::from_millis(n);
        }
        if let Some(n) = env_u64("FLOWRUNNER_SCRIPT_BUDGET_MS") {
            limits.script_budget = Duration::from_millis(n);
        }

        limits
    }

    /// Tight limits for tests.
    pub fn strict() -> Self {
        Self {
            max_suites: 10,
            max_steps_per_suite: 10,
            max_parallel: 2,
            max_call_depth: 3,
            max_scenario_depth: 2,
            max_iterations: 5,
            run_timeout: Duration::from_secs(30),
            step_timeout: Duration::from_secs(5),
            script_budget: Duration::from_millis(200),
        }
    }

    /// Check discovered counts against the configured bounds.
    pub fn validate_counts(
        &self,
        suite_count: usize,
        max_suite_steps: usize,
    ) -> Result<(), LoadError> {
        if suite_count > self.max_suites {
            return Err(LoadError::LimitExceeded {
                message: format!(
                    "{} suites discovered, limit is {}",
                    suite_count, self.max_suites
                ),
            });
        }
        if max_suite_steps > self.max_steps_per_suite {
            return Err(LoadError::LimitExceeded {
                message: format!(
                    "a suite declares {} steps, limit is {}",
                    max_suite_steps, self.max_steps_per_suite
                ),
            });
        }
        Ok(())
    }

    /// Effective timeout for one step: the smallest of the step override,
    /// the suite override and the engine default.
    pub fn effective_step_timeout(
        &self,
        step_timeout_ms: Option<u64>,
        suite_timeout_ms: Option<u64>,
    ) -> Duration {
        let mut timeout = self.step_timeout;
        if let Some(ms) = suite_timeout_ms {
            timeout = timeout.min(Duration::from_millis(ms));
        }
        if let Some(ms) = step_timeout_ms {
            timeout = timeout.min(Duration::from_millis(ms));
        }
        timeout
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
