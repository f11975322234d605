//! openwork - workspace session orchestrator.
//!
//! Boots, supervises, and exposes a control plane for the sidecar
//! services that make up one user workspace session.

use clap::Parser;
use std::process::ExitCode;

mod cli;
mod config;
mod error;
mod health;
mod logging;
mod router;
mod session;
mod sidecar;
mod supervise;

use cli::Commands;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Commands::parse();

    let config = match args.config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let _guard = match logging::init(&config.log_dir()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let json_output = config.json_output;
    match args.run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            if json_output {
                println!("{}", serde_json::json!({ "error": e.to_string() }));
            } else {
                eprintln!("Error: {}", e);
            }
            ExitCode::FAILURE
        }
    }
}
