//! Webfleet entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load config from `WF_*` env vars
//!   3. Init logger at the configured level
//!   4. Dispatch the sub-command (one-shot client call, or `serve` which
//!      runs services until SIGTERM/Ctrl-C)

use tracing::debug;

use webfleet::{cli, config, error, logger};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), error::AppError> {
    // Load .env if present — ignore errors (file is optional).
    let _ = dotenvy::dotenv();

    let config = config::load()?;
    logger::init(&config.log_level)?;

    debug!(
        app_id = %config.app_id,
        scheduler = %config.scheduler_address,
        "config loaded"
    );

    let args: Vec<String> = std::env::args().skip(1).collect();
    cli::run(&config, &args).await
}
