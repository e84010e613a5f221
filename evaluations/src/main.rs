use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use evaluations::helpers::setup_logging;
use evaluations::{Args, report, run_evaluation};
use tokio_util::sync::CancellationToken;
use tracing::error;
use uuid::Uuid;
use waza_core::engine::EchoEngine;
use waza_core::spec::EvalSpec;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let job_id = Uuid::now_v7();
    if let Err(e) = setup_logging(args.format) {
        error!(error = %e, "Failed to set up logging");
        return ExitCode::from(report::EXIT_RUN_ERROR as u8);
    }

    let spec = match EvalSpec::load_from_path(&args.spec) {
        Ok(spec) => Arc::new(spec),
        Err(e) => {
            error!(error = %e, "Failed to load spec");
            return ExitCode::from(report::EXIT_RUN_ERROR as u8);
        }
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    // The agent runtime is an external capability; the bundled echo
    // engine exists for spec smoke-testing. Real deployments embed
    // `run_evaluation` with their own `AgentEngine`.
    let engine = Arc::new(EchoEngine);

    let writer = std::io::stdout();
    match run_evaluation(&args, spec, engine, job_id, cancel, writer).await {
        Ok(outcome) => ExitCode::from(report::exit_code(&outcome) as u8),
        Err(e) => {
            error!(error = %e, "Run failed");
            ExitCode::from(report::EXIT_RUN_ERROR as u8)
        }
    }
}
