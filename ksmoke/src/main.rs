//! ksmoke - Kafka smoke-test producer
//!
//! Reads its target from the environment, sends `TIMES` messages whose payloads are
//! `0..TIMES`, logs one line per delivery report and exits once every message has
//! been acknowledged.

use clap::Parser;
use ksmoke::args::Args;
use ksmoke::{coordinator, DeliverySummary, ProducerHandle, Settings};
use std::process::ExitCode;
use tracing::{error, info};

/// Initialize tracing subscriber for structured logging
fn setup_logging(quiet: bool) {
    let default_level = if quiet { "error" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::filter::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(default_level)),
        )
        .init();
}

/// Resolves settings from the environment, then runs the smoke test
async fn run_smoke(args: &Args) -> ksmoke::Result<DeliverySummary> {
    let settings = Settings::from_env()?;
    smoke(args, &settings).await
}

/// Connects, sends every message and waits for every acknowledgment
async fn smoke(args: &Args, settings: &Settings) -> ksmoke::Result<DeliverySummary> {
    let address = settings.bootstrap_address()?;
    info!(
        "Sending {} messages to '{}' via {}",
        settings.message_count.max(0),
        settings.topic_name,
        address
    );

    let producer = ProducerHandle::connect(&address, &args.producer_options()).await?;
    coordinator::run(producer, &settings.topic_name, settings.message_count).await
}

/// Logs the outcome once and maps it to the process exit status
fn exit_status(outcome: ksmoke::Result<DeliverySummary>) -> ExitCode {
    match outcome {
        Ok(summary) => {
            info!(
                "Done: {} delivered, {} failed, {} unrecognized events",
                summary.delivered, summary.failed, summary.unrecognized
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    setup_logging(args.quiet);

    exit_status(run_smoke(&args).await)
}
