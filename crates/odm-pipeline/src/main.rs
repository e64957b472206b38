//! ODM - Main entry point

use clap::Parser;
use odm_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use odm_pipeline::Cli;
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let defaults = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .log_file_prefix("odm")
        .build();

    // environment variables take precedence
    let log_config = defaults.clone().merge_env().unwrap_or(defaults);

    let _guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {}", e);
            None
        },
    };

    if let Err(e) = odm_pipeline::cli::execute(&cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        // exit skips destructors, flush file logging first
        drop(_guard);
        process::exit(1);
    }
}
