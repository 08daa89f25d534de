//! reconforge CLI entry point.
//!
//! Initializes logging and delegates to the CLI module for the pipeline run.

use std::process::ExitCode;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Parse CLI arguments first to get log_level
    let cli = reconforge::cli::parse_cli();

    // Priority: RUST_LOG env var > --log-level CLI arg > default "info"
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone());

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)))
        .init();

    reconforge::cli::run_with_cli(cli).await
}
