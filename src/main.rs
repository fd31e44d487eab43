mod aggregator;
mod cli;
mod engine;
mod error;
mod logging;
mod metrics;
mod model;
mod orchestrator;
mod partition;
mod report;
mod storage;
mod store;
mod text_summary;
#[cfg(feature = "tui")]
mod tui;

use clap::Parser;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::Cli::parse();

    match cli::run(args).await {
        Ok(cli::RunStatus::Completed) => ExitCode::SUCCESS,
        // Same code a shell reports for SIGINT.
        Ok(cli::RunStatus::Cancelled) => ExitCode::from(130),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
