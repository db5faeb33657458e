//! # Structured Error Codes
//!
//! Every failure the engine reports carries a code of the form `E<cat><nnn>`
//! so CI pipelines and dashboards can act on the category without parsing
//! messages.
//!
//! | Range  | Category     | Meaning                                  |
//! |--------|--------------|------------------------------------------|
//! | E1xxx  | Load         | suite document invalid, discovery failed |
//! | E2xxx  | Plan         | dependency graph unbuildable             |
//! | E3xxx  | Transport    | HTTP/network/TLS failure                 |
//! | E4xxx  | Assertion    | response did not match expectations      |
//! | E5xxx  | Script/Hook  | pre/post script or hook failure          |
//! | E6xxx  | Call         | cross-suite call failure                 |
//! | E7xxx  | Interrupt    | cancellation or timeout                  |
//!
//! Load and plan errors are fatal for the run and map to dedicated CLI exit
//! codes; the rest surface in step results and roll up into suite results.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// ERROR CODE
// ============================================================================

/// Structured error code: first digit is the category, the rest the specific
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(u16);

impl ErrorCode {
    // E1xxx: load / discovery
    pub const EMPTY_SUITE: Self = Self(1001);
    pub const DUPLICATE_STEP_ID: Self = Self(1002);
    pub const MISSING_PRIMARY_ACTION: Self = Self(1003);
    pub const AMBIGUOUS_PRIMARY_ACTION: Self = Self(1004);
    pub const INVALID_HTTP_METHOD: Self = Self(1005);
    pub const SCENARIO_DEPTH_EXCEEDED: Self = Self(1006);
    pub const INVALID_DOCUMENT: Self = Self(1007);
    pub const LIMIT_EXCEEDED: Self = Self(1008);
    pub const ITERATE_WITHOUT_SOURCE: Self = Self(1009);

    // E2xxx: planning
    pub const DEPENDENCY_CYCLE: Self = Self(2001);
    pub const UNRESOLVED_DEPENDENCY: Self = Self(2002);
    pub const DUPLICATE_NODE_ID: Self = Self(2003);
    pub const EXPORT_CONFLICT: Self = Self(2004);

    // E3xxx: transport
    pub const CONNECTION_FAILED: Self = Self(3001);
    pub const TLS_FAILED: Self = Self(3002);
    pub const INVALID_REQUEST: Self = Self(3003);
    pub const TRANSPORT_TIMEOUT: Self = Self(3004);

    // E4xxx: assertions
    pub const ASSERTION_FAILED: Self = Self(4001);

    // E5xxx: scripts, hooks and interactive input
    pub const SCRIPT_FAILED: Self = Self(5001);
    pub const SCRIPT_TIMEOUT: Self = Self(5002);
    pub const INPUT_FAILED: Self = Self(5003);

    // E6xxx: cross-suite calls
    pub const CALL_LOOP_DETECTED: Self = Self(6001);
    pub const CALL_DEPTH_EXCEEDED: Self = Self(6002);
    pub const CALL_TARGET_NOT_FOUND: Self = Self(6003);
    pub const CALL_OUTSIDE_ROOT: Self = Self(6004);
    pub const CALL_FAILED: Self = Self(6005);

    // E7xxx: cancellation / timeout
    pub const CANCELLED: Self = Self(7001);
    pub const STEP_TIMEOUT: Self = Self(7002);

    pub fn code(&self) -> u16 {
        self.0
    }

    /// `"E4001"` style rendering used in results and logs.
    pub fn formatted(&self) -> String {
        format!("E{:04}", self.0)
    }

    pub fn category(&self) -> ErrorCategory {
        match self.0 / 1000 {
            1 => ErrorCategory::Load,
            2 => ErrorCategory::Plan,
            3 => ErrorCategory::Transport,
            4 => ErrorCategory::Assertion,
            5 => ErrorCategory::Script,
            6 => ErrorCategory::Call,
            7 => ErrorCategory::Interrupt,
            _ => ErrorCategory::Unknown,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.formatted())
    }
}

/// Coarse error category, derived from the leading digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Load,
    Plan,
    Transport,
    Assertion,
    Script,
    Call,
    Interrupt,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Load => "load",
            Self::Plan => "plan",
            Self::Transport => "transport",
            Self::Assertion => "assertion",
            Self::Script => "script",
            Self::Call => "call",
            Self::Interrupt => "interrupt",
            Self::Unknown => "unknown",
        };
        write!(f, "{label}")
    }
}

// ============================================================================
// LOAD ERRORS
// ============================================================================

/// Problems found while parsing or validating a suite document. Collected
/// per document; a document with any load error is excluded from planning.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("{path}: cannot read suite file: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("{path}: invalid suite document: {reason}")]
    InvalidDocument { path: PathBuf, reason: String },

    #[error("suite '{node_id}': no steps defined")]
    EmptySuite { node_id: String },

    #[error("suite '{node_id}': duplicate step id '{step_id}'")]
    DuplicateStepId { node_id: String, step_id: String },

    #[error("suite '{node_id}' step '{step_id}': no primary action (request, input, call, iterate or scenarios required)")]
    MissingPrimaryAction { node_id: String, step_id: String },

    #[error("suite '{node_id}' step '{step_id}': {detail}")]
    AmbiguousPrimaryAction {
        node_id: String,
        step_id: String,
        detail: String,
    },

    #[error("suite '{node_id}' step '{step_id}': invalid HTTP method '{method}'")]
    InvalidHttpMethod {
        node_id: String,
        step_id: String,
        method: String,
    },

    #[error("suite '{node_id}' step '{step_id}': scenarios nest deeper than {max}")]
    ScenarioDepthExceeded {
        node_id: String,
        step_id: String,
        max: usize,
    },

    #[error("suite '{node_id}' step '{step_id}': iterate needs 'over' or 'count'")]
    IterateWithoutSource { node_id: String, step_id: String },

    #[error("{message}")]
    LimitExceeded { message: String },
}

impl LoadError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Unreadable { .. } | Self::InvalidDocument { .. } => ErrorCode::INVALID_DOCUMENT,
            Self::EmptySuite { .. } => ErrorCode::EMPTY_SUITE,
            Self::DuplicateStepId { .. } => ErrorCode::DUPLICATE_STEP_ID,
            Self::MissingPrimaryAction { .. } => ErrorCode::MISSING_PRIMARY_ACTION,
            Self::AmbiguousPrimaryAction { .. } => ErrorCode::AMBIGUOUS_PRIMARY_ACTION,
            Self::InvalidHttpMethod { .. } => ErrorCode::INVALID_HTTP_METHOD,
            Self::ScenarioDepthExceeded { .. } => ErrorCode::SCENARIO_DEPTH_EXCEEDED,
            Self::IterateWithoutSource { .. } => ErrorCode::ITERATE_WITHOUT_SOURCE,
            Self::LimitExceeded { .. } => ErrorCode::LIMIT_EXCEEDED,
        }
    }
}

// ============================================================================
// PLAN ERRORS
// ============================================================================

/// Problems building the execution plan. Fatal for the run.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("dependency cycle: {}", cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },

    #[error("suite '{node_id}': required dependency '{reference}' cannot be resolved")]
    UnresolvedRequired { node_id: String, reference: String },

    #[error("duplicate node_id '{node_id}' ({first} and {second})")]
    DuplicateNodeId {
        node_id: String,
        first: String,
        second: String,
    },

    #[error("suites '{first}' and '{second}' in the same wave both export '{name}'")]
    ExportConflict {
        first: String,
        second: String,
        name: String,
    },
}

impl PlanError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Cycle { .. } => ErrorCode::DEPENDENCY_CYCLE,
            Self::UnresolvedRequired { .. } => ErrorCode::UNRESOLVED_DEPENDENCY,
            Self::DuplicateNodeId { .. } => ErrorCode::DUPLICATE_NODE_ID,
            Self::ExportConflict { .. } => ErrorCode::EXPORT_CONFLICT,
        }
    }
}

// ============================================================================
// RUN-LEVEL ERRORS & EXIT CODES
// ============================================================================

/// Exit code 0 is reserved for a fully successful run; execution failures
/// exit 1; the fatal categories get their own codes.
pub const EXIT_EXECUTION_FAILURE: i32 = 1;
pub const EXIT_DISCOVERY_ERROR: i32 = 2;
pub const EXIT_PLAN_ERROR: i32 = 3;
pub const EXIT_CANCELLED: i32 = 4;

/// Fatal, run-level failures surfaced by the CLI.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("run cancelled")]
    Cancelled,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Discovery(_) => EXIT_DISCOVERY_ERROR,
            Self::Plan(_) => EXIT_PLAN_ERROR,
            Self::Cancelled => EXIT_CANCELLED,
            Self::Io(_) => EXIT_EXECUTION_FAILURE,
        }
    }
}
