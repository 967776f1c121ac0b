use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use stint_executor::config::HarnessConfig;
use stint_executor::diagnostics::NullDiagnostics;
use stint_executor::execute::{ExecutionRequest, Executor};
use stint_executor::planner::BenchmarkId;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Execution stage of the stint performance harness")]
struct Cli {
    /// Path to the harness config
    #[arg(short, long)]
    config: PathBuf,

    /// Override the number of launches from the config
    #[arg(long)]
    launches: Option<u32>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match HarnessConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load {}: {e}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };
    if config.preflight_checks() {
        return ExitCode::FAILURE;
    }

    let launches = cli.launches.unwrap_or(config.launches);
    let executor = Executor::new();
    let diagnostics = NullDiagnostics;
    let env: Vec<(String, String)> = config
        .env
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    let mut failed = false;

    for launch_index in 1..=launches {
        let request = ExecutionRequest {
            benchmark: BenchmarkId::new(&config.benchmark.name),
            variant: config.variant(),
            artifact: config.artifact(),
            args_tail: config.benchmark.args.clone(),
            acknowledgments: config.acknowledgments,
            affinity: config.affinity.clone(),
            env: env.clone(),
            diagnostics: &diagnostics,
            launch_index,
        };

        match executor.execute(&request) {
            Ok(result) => {
                for line in &result.results {
                    println!("{line}");
                }
                if let Some(hint) = &result.diagnostic_hint {
                    error!("{hint}");
                }
                match (result.success, result.exit_code) {
                    (true, Some(0)) => info!(
                        launch = launch_index,
                        measurements = result.results.len(),
                        "Launch finished"
                    ),
                    (true, Some(code)) => {
                        warn!(launch = launch_index, code, "Launch exited abnormally");
                        failed = true;
                    }
                    (true, None) => {
                        // timed out or killed by a signal, the exit code was
                        // never reported
                        warn!(launch = launch_index, "Launch never reported an exit code");
                        failed = true;
                    }
                    (false, _) => {
                        failed = true;
                    }
                }
            }
            Err(e) => {
                error!(launch = launch_index, "Launch could not be started: {e}");
                failed = true;
            }
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
