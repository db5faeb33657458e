//! # flowrunner
//!
//! Declarative API-testing engine. Suites are authored as
//! `*.flow.{yaml,json}` documents describing HTTP requests, assertions,
//! variable captures, conditional scenarios and inter-suite dependencies;
//! the engine discovers them across a tree, plans the dependency graph,
//! executes it in waves with bounded parallelism and writes machine-readable
//! reports. `serve` starts the long-lived orchestrator with a live event
//! stream for a dashboard.
//!
//! ```bash
//! flowrunner run ./flows --parallel
//! flowrunner list ./flows
//! flowrunner graph ./flows > flows.mmd
//! flowrunner report ./flows/reports/latest.json
//! flowrunner serve ./flows --port 4680
//! ```

mod assertions;
mod calls;
mod captures;
mod context;
mod discovery;
mod errors;
mod events;
mod expressions;
mod limits;
mod orchestrator;
mod planner;
mod protocol;
mod redaction;
mod report;
mod scenarios;
mod scheduler;
mod steps;
mod suite;
mod telemetry;
mod transport;

use clap::{Parser, Subcommand};
use discovery::{ExecutionMode, RunConfig, SuiteIndex};
use errors::{EngineError, EXIT_CANCELLED, EXIT_EXECUTION_FAILURE};
use limits::EngineLimits;
use orchestrator::{run_once, OrchestratorState, RunHandles};
use protocol::RunStatus;
use std::path::PathBuf;
use std::sync::Arc;
use steps::input::{NonInteractiveInput, StdinInput};
use telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "flowrunner")]
#[command(about = "Declarative API-testing engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover, plan and execute every suite under a directory.
    Run {
        /// Discovery root.
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Report directory (default: `<root>/reports` or the config).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Run each wave with a bounded pool instead of serially.
        #[arg(long)]
        parallel: bool,

        /// Concurrent suites per wave in parallel mode.
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Stop scheduling new waves when a required-priority suite fails.
        #[arg(long)]
        fail_fast: bool,

        /// Answer input steps from their defaults instead of stdin.
        #[arg(long)]
        non_interactive: bool,

        /// Export spans to an OTLP collector.
        #[arg(long)]
        otel: bool,

        /// OTLP endpoint (default `$OTEL_EXPORTER_OTLP_ENDPOINT` or
        /// localhost:4317).
        #[arg(long)]
        otel_endpoint: Option<String>,

        /// Debug-level logging.
        #[arg(short, long)]
        verbose: bool,

        /// Errors only; for CI.
        #[arg(short = 's', long)]
        silent: bool,

        /// Externally supplied run id (defaults to a fresh UUID).
        #[arg(long)]
        run_id: Option<String>,
    },

    /// List discovered suites with priority and dependencies.
    List {
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Print the dependency graph as Mermaid.
    Graph {
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Summarise a previously written report.
    Report {
        /// Report file, or a directory containing `latest.json`.
        #[arg(default_value = "reports")]
        path: PathBuf,
    },

    /// Start the live orchestrator (HTTP API + SSE event stream).
    Serve {
        #[arg(default_value = ".")]
        path: PathBuf,

        #[arg(long, default_value = "4680")]
        port: u16,

        #[arg(short, long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run {
            path,
            output,
            parallel,
            max_parallel,
            fail_fast,
            non_interactive,
            otel,
            otel_endpoint,
            verbose,
            silent,
            run_id,
        } => {
            init_logging(verbose, silent, otel, otel_endpoint);
            let code = run_command(
                path,
                output,
                parallel,
                max_parallel,
                fail_fast,
                non_interactive,
                run_id,
                silent,
            )
            .await;
            shutdown_telemetry();
            code
        }
        Commands::List { path } => {
            init_logging(false, true, false, None);
            list_command(&path)
        }
        Commands::Graph { path } => {
            init_logging(false, true, false, None);
            graph_command(&path)
        }
        Commands::Report { path } => {
            init_logging(false, true, false, None);
            report_command(&path)
        }
        Commands::Serve {
            path,
            port,
            verbose,
        } => {
            init_logging(verbose, false, false, None);
            serve_command(path, port).await
        }
    };
    std::process::exit(code);
}

fn init_logging(verbose: bool, silent: bool, otel: bool, otel_endpoint: Option<String>) {
    let mut config = TelemetryConfig::from_env();
    config.log_level = if silent {
        Level::ERROR
    } else if verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    if otel {
        if let Some(endpoint) = otel_endpoint {
            config.otlp_endpoint = Some(endpoint);
        } else if config.otlp_endpoint.is_none() {
            config.otlp_endpoint = Some("http://localhost:4317".to_string());
        }
    } else {
        config.otlp_endpoint = None;
    }
    if let Err(e) = init_telemetry(config) {
        eprintln!("warning: cannot initialise telemetry: {e}");
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_command(
    path: PathBuf,
    output: Option<PathBuf>,
    parallel: bool,
    max_parallel: Option<usize>,
    fail_fast: bool,
    non_interactive: bool,
    run_id: Option<String>,
    silent: bool,
) -> i32 {
    let run_id = run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let limits = Arc::new(EngineLimits::from_env());

    let mut config = RunConfig::load(&path);
    if parallel {
        config.mode = ExecutionMode::Parallel;
    }
    if let Some(n) = max_parallel {
        config.max_parallel = Some(n);
    }
    if fail_fast {
        config.fail_fast_on_required = true;
    }
    if let Some(dir) = output {
        config.output_dir = Some(dir);
    }

    // Ctrl-C cancels in-flight work at its next suspension point; a second
    // Ctrl-C kills the process the usual way.
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("cancellation requested, stopping after in-flight steps");
            signal_token.cancel();
        }
    });

    let handles = RunHandles {
        input: if non_interactive {
            Arc::new(NonInteractiveInput)
        } else {
            Arc::new(StdinInput)
        },
        cancel: cancel.clone(),
    };

    match run_once(&path, &config, limits, &run_id, None, None, handles).await {
        Ok(result) => {
            if !silent {
                print_summary(&result);
            }
            if cancel.is_cancelled() {
                EXIT_CANCELLED
            } else if result.status == RunStatus::Success {
                0
            } else {
                EXIT_EXECUTION_FAILURE
            }
        }
        Err(e) => {
            error!(error = %e, "run aborted");
            e.exit_code()
        }
    }
}

fn print_summary(result: &protocol::AggregatedResult) {
    println!(
        "{}: {} — {}/{} suites successful ({:.1}%), {} steps, {}ms",
        result.project_name,
        match result.status {
            RunStatus::Success => "passed",
            RunStatus::Failure => "failed",
        },
        result.totals.suites_successful,
        result.totals.suites,
        result.success_rate * 100.0,
        result.totals.steps,
        result.total_duration_ms,
    );
    for suite in &result.suites {
        println!(
            "  [{}] {} ({} steps, {}ms){}",
            match suite.status {
                protocol::SuiteStatus::Success => "ok",
                protocol::SuiteStatus::Failure => "fail",
                protocol::SuiteStatus::Skipped => "skip",
            },
            suite.node_id,
            suite.steps.len(),
            suite.duration_ms,
            suite
                .error_message
                .as_deref()
                .map(|m| format!(" — {m}"))
                .unwrap_or_default(),
        );
    }
    if let Some(perf) = &result.performance_summary {
        println!(
            "  http: {} requests, avg {:.0}ms, p95 {}ms, {:.1} req/s",
            perf.request_count, perf.avg_ms, perf.p95_ms, perf.throughput_rps
        );
    }
}

fn load_index(path: &PathBuf) -> Result<SuiteIndex, EngineError> {
    let limits = EngineLimits::from_env();
    let discovered = discovery::discover(path, &limits);
    for problem in &discovered.errors {
        eprintln!("warning: {problem}");
    }
    if discovered.suites.is_empty() {
        return Err(EngineError::Discovery(format!(
            "no suites under {}",
            path.display()
        )));
    }
    Ok(SuiteIndex::build(path, discovered.suites)?)
}

fn list_command(path: &PathBuf) -> i32 {
    match load_index(path) {
        Ok(index) => {
            for suite in index.iter() {
                let depends: Vec<String> = suite
                    .depends
                    .iter()
                    .filter_map(|d| d.node_id.clone().or_else(|| d.path.clone()))
                    .collect();
                println!(
                    "{:<24} {:<8} steps={:<3} depends=[{}] {}",
                    suite.node_id,
                    suite.priority.as_str(),
                    suite.steps.len(),
                    depends.join(", "),
                    suite
                        .source_path
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default(),
                );
            }
            0
        }
        Err(e) => {
            eprintln!("{e}");
            e.exit_code()
        }
    }
}

fn graph_command(path: &PathBuf) -> i32 {
    let index = match load_index(path) {
        Ok(index) => index,
        Err(e) => {
            eprintln!("{e}");
            return e.exit_code();
        }
    };
    match planner::plan(&index) {
        Ok(plan) => {
            print!("{}", planner::mermaid(&index, &plan));
            0
        }
        Err(e) => {
            let e = EngineError::from(e);
            eprintln!("{e}");
            e.exit_code()
        }
    }
}

fn report_command(path: &PathBuf) -> i32 {
    let file = if path.is_dir() {
        path.join("latest.json")
    } else {
        path.clone()
    };
    match report::read_report(&file) {
        Ok(result) => {
            print_summary(&result);
            if result.status == RunStatus::Success {
                0
            } else {
                EXIT_EXECUTION_FAILURE
            }
        }
        Err(e) => {
            eprintln!("cannot read report {}: {e}", file.display());
            EXIT_EXECUTION_FAILURE
        }
    }
}

async fn serve_command(path: PathBuf, port: u16) -> i32 {
    let state = OrchestratorState::new(path, EngineLimits::from_env());
    match orchestrator::serve(state, port).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "orchestrator stopped");
            EXIT_EXECUTION_FAILURE
        }
    }
}
