//! Resilience kernel daemon.
//!
//! Runs the health aggregator and recovery orchestrator against the breakers
//! declared in the config file, hot-reloading settings on file change or
//! SIGHUP, until SIGINT/SIGTERM.

use std::path::PathBuf;

use clap::Parser;

use resilience_kernel::lifecycle::startup;

#[derive(Parser)]
#[command(name = "resilience-kernel")]
#[command(about = "Circuit breaker health aggregation and automated recovery daemon", long_about = None)]
struct Args {
    /// Path to the TOML configuration file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    startup::run(args.config).await?;
    Ok(())
}
