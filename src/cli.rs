//! CLI surface: `run`, `describe`, `list` over a [`FlowRegistry`].
//!
//! Hosts delegate their `main` here:
//!
//! ```rust,ignore
//! fn main() {
//!     weft::isolated::worker_main();
//!     let mut registry = weft::FlowRegistry::new();
//!     registry.register("pipelines", my_flow());
//!     std::process::exit(weft::cli::run(std::env::args(), &registry));
//! }
//! ```
//!
//! Exit codes: `0` success, `1` flow failure, `2` invalid input.

use std::ffi::OsString;

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::{json, Value};

use crate::context::Params;
use crate::error::WeftError;
use crate::flow::RunOptions;
use crate::logging;
use crate::registry::FlowRegistry;
use crate::scheduler::FailurePolicy;

#[derive(Parser)]
#[command(name = "weft")]
#[command(about = "Run and inspect weft flows")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a flow and print the hydrated result as JSON
    Run {
        /// Flow path, `module:flow`
        flow: String,

        /// fail_fast, continue, or aggregate
        #[arg(long, default_value = "fail_fast")]
        failure_policy: String,

        /// Maximum number of concurrently running tasks (> 0)
        #[arg(long)]
        max_concurrency: Option<i64>,

        /// Run parameters as a JSON object
        #[arg(long)]
        params: Option<String>,

        /// Emit one structured JSON log line per task
        #[arg(long)]
        structured_logs: bool,
    },

    /// Print the JSON DAG description of a flow
    Describe {
        /// Flow path, `module:flow`
        flow: String,

        /// Build parameters as a JSON object
        #[arg(long)]
        params: Option<String>,
    },

    /// List flows registered under a module with their node counts
    List {
        module: String,
    },
}

/// Parse `argv` and execute against `registry`. Returns the process exit
/// code; errors go to stderr, results to stdout.
pub fn run<I, T>(argv: I, registry: &FlowRegistry) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = match Cli::try_parse_from(argv) {
        Ok(cli) => cli,
        Err(err) => {
            let code = err.exit_code();
            let _ = err.print();
            return code;
        }
    };

    let outcome = match cli.command {
        Commands::Run {
            flow,
            failure_policy,
            max_concurrency,
            params,
            structured_logs,
        } => cmd_run(
            registry,
            &flow,
            &failure_policy,
            max_concurrency,
            params.as_deref(),
            structured_logs,
        )
        .map(|result| result.to_string()),
        Commands::Describe { flow, params } => cmd_describe(registry, &flow, params.as_deref())
            .map(|desc| serde_json::to_string_pretty(&desc).unwrap_or_else(|_| desc.to_string())),
        Commands::List { module } => cmd_list(registry, &module)
            .map(|out| serde_json::to_string_pretty(&out).unwrap_or_else(|_| out.to_string())),
    };

    match outcome {
        Ok(text) => {
            println!("{}", text);
            0
        }
        Err(err) => {
            eprintln!("{} {}", "Error:".red().bold(), err);
            err.exit_code()
        }
    }
}

fn cmd_run(
    registry: &FlowRegistry,
    flow_path: &str,
    failure_policy: &str,
    max_concurrency: Option<i64>,
    params: Option<&str>,
    structured_logs: bool,
) -> Result<Value, WeftError> {
    let policy: FailurePolicy = failure_policy.parse()?;
    let max_concurrency = match max_concurrency {
        Some(n) if n <= 0 => {
            return Err(WeftError::Validation(format!(
                "max-concurrency must be positive (got {})",
                n
            )))
        }
        Some(n) => Some(n as usize),
        None => None,
    };
    let params = parse_params(params)?;
    let flow = registry
        .get(flow_path)
        .ok_or_else(|| WeftError::Validation(format!("unknown flow '{}'", flow_path)))?;

    if structured_logs {
        logging::register_structured_logging();
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| WeftError::Build(format!("failed to start runtime: {}", e)))?;
    runtime.block_on(flow.run(
        params,
        RunOptions {
            failure_policy: policy,
            max_concurrency,
        },
    ))
}

fn cmd_describe(
    registry: &FlowRegistry,
    flow_path: &str,
    params: Option<&str>,
) -> Result<Value, WeftError> {
    let params = parse_params(params)?;
    let flow = registry
        .get(flow_path)
        .ok_or_else(|| WeftError::Validation(format!("unknown flow '{}'", flow_path)))?;
    flow.describe(&params)
}

fn cmd_list(registry: &FlowRegistry, module: &str) -> Result<Value, WeftError> {
    let mut out = serde_json::Map::new();
    for flow in registry.module_flows(module) {
        let desc = flow.describe(&Params::new())?;
        out.insert(
            flow.name().to_string(),
            desc.get("count").cloned().unwrap_or(json!(0)),
        );
    }
    Ok(Value::Object(out))
}

fn parse_params(params: Option<&str>) -> Result<Params, WeftError> {
    let Some(raw) = params else {
        return Ok(Params::new());
    };
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| WeftError::Validation(format!("params is not valid JSON: {}", e)))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(WeftError::Validation(
            "params must be a JSON object".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_params_accepts_objects_only() {
        assert!(parse_params(None).unwrap().is_empty());
        let parsed = parse_params(Some("{\"n\": 3}")).unwrap();
        assert_eq!(parsed["n"], json!(3));
        assert!(parse_params(Some("[1, 2]")).is_err());
        assert!(parse_params(Some("{broken")).is_err());
    }

    #[test]
    fn unknown_flow_is_a_validation_error() {
        let registry = FlowRegistry::new();
        let err = cmd_describe(&registry, "mod:missing", None).unwrap_err();
        assert!(matches!(err, WeftError::Validation(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn non_positive_concurrency_is_rejected() {
        let registry = FlowRegistry::new();
        let err = cmd_run(&registry, "m:f", "fail_fast", Some(0), None, false).unwrap_err();
        assert!(matches!(err, WeftError::Validation(_)));
        let err = cmd_run(&registry, "m:f", "fail_fast", Some(-2), None, false).unwrap_err();
        assert!(matches!(err, WeftError::Validation(_)));
    }

    #[test]
    fn bad_failure_policy_is_rejected_before_lookup() {
        let registry = FlowRegistry::new();
        let err = cmd_run(&registry, "m:f", "explode", None, None, false).unwrap_err();
        assert!(err.to_string().contains("failure policy"));
    }
}
