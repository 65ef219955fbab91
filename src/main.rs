use anyhow::Context;
use clap::Parser;
use flowmirror::cli::{commands, Cli};
use flowmirror::config::Options;
use std::process;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let options = match Options::load(cli.config.as_deref()).context("Failed to load options") {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    };

    let log_level = if cli.verbose || options.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting flowmirror v{}", flowmirror::VERSION);

    let result = commands::handle_command(cli.command, options)
        .await
        .context("flowmirror failed");

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
