//! `pool` CLI entry point.
//!
//! Initializes logging and delegates to the CLI module for command handling.

use pool_orchestrator::OrchestratorError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = pool_orchestrator::cli::parse_cli();

    // Priority: RUST_LOG env var > --log-level CLI arg > default "info"
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone());

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)))
        .init();

    match pool_orchestrator::cli::run_with_cli(cli).await {
        Ok(()) => Ok(()),
        Err(err) => match err.downcast_ref::<OrchestratorError>() {
            Some(e) => {
                eprintln!("error[{}]: {:#}", e.code(), err);
                std::process::exit(e.exit_code());
            }
            None => Err(err),
        },
    }
}
