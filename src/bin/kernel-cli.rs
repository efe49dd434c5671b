use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;

use resilience_kernel::config::{load_config, BreakerServiceConfig, ConfigError, KernelConfig};
use resilience_kernel::recovery::{RecoveryPolicy, RecoveryState, RecoveryStrategy};
use resilience_kernel::ResilienceKernel;

#[derive(Parser)]
#[command(name = "kernel-cli")]
#[command(about = "Operator CLI for the resilience kernel", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file and print the effective settings
    CheckConfig {
        path: PathBuf,
    },
    /// Print the retry delay schedule for a strategy
    Backoff {
        /// immediate, linear, exponential or manual
        #[arg(short, long, default_value = "exponential")]
        strategy: RecoveryStrategy,
        #[arg(short, long, default_value_t = 3)]
        attempts: u32,
        #[arg(long, default_value_t = 1000)]
        initial_ms: u64,
        #[arg(long, default_value_t = 2.0)]
        multiplier: f64,
        #[arg(long, default_value_t = 60_000)]
        max_ms: u64,
    },
    /// Force a breaker open, watch health degrade, then recover it
    Drill {
        /// Breaker to force open
        #[arg(short, long, default_value = "policy_registry")]
        target: String,
        /// Additional healthy breakers to register alongside the target
        #[arg(short, long, default_value_t = 1)]
        peers: usize,
        /// How long the forced-open window lasts
        #[arg(long, default_value_t = 5)]
        duration_secs: u64,
    },
}

#[derive(Serialize)]
struct BackoffStep {
    attempt: u32,
    delay_ms: u128,
    cumulative_ms: u128,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig { path } => match load_config(&path) {
            Ok(config) => {
                println!("{} is valid", path.display());
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            Err(ConfigError::Validation(errors)) => {
                eprintln!("{} has {} error(s):", path.display(), errors.len());
                for error in errors {
                    eprintln!("  - {error}");
                }
                std::process::exit(1);
            }
            Err(e) => {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        },
        Commands::Backoff {
            strategy,
            attempts,
            initial_ms,
            multiplier,
            max_ms,
        } => {
            let policy = RecoveryPolicy::new(
                attempts,
                multiplier,
                Duration::from_millis(initial_ms),
                Duration::from_millis(max_ms),
            );
            policy.validate()?;

            let mut cumulative = Duration::ZERO;
            let steps: Vec<BackoffStep> = (1..=attempts)
                .map(|attempt| {
                    let delay = policy.delay_for(strategy, attempt);
                    cumulative = cumulative.saturating_add(delay);
                    BackoffStep {
                        attempt,
                        delay_ms: delay.as_millis(),
                        cumulative_ms: cumulative.as_millis(),
                    }
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&steps)?);
        }
        Commands::Drill {
            target,
            peers,
            duration_secs,
        } => drill(&target, peers, Duration::from_secs(duration_secs)).await?,
    }

    Ok(())
}

async fn drill(target: &str, peers: usize, duration: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = KernelConfig::default();
    config.health.check_interval_ms = 50;
    config.recovery.tick_ms = 10;
    config.recovery.auto_recover = false;
    config.breakers.services = std::iter::once(target.to_string())
        .chain((1..=peers).map(|i| format!("peer_{i}")))
        .map(|name| BreakerServiceConfig {
            name,
            fail_max: None,
            reset_timeout_ms: None,
        })
        .collect();

    let kernel = ResilienceKernel::from_config(&config)?;
    kernel.start();

    let scenario = kernel.chaos().force_circuit_open(target, duration, &[])?;
    println!("scenario: {}", serde_json::to_string_pretty(&scenario)?);
    println!("health: {}", serde_json::to_string_pretty(&kernel.aggregator().poll_now())?);

    let policy = kernel
        .orchestrator()
        .get_recovery_policy(target)
        .with_health_check(|| async { true });
    kernel
        .orchestrator()
        .schedule_recovery(target, RecoveryStrategy::ExponentialBackoff, 0, Some(policy))?;

    let deadline = tokio::time::Instant::now() + duration;
    let outcome = loop {
        let history = kernel.orchestrator().get_recovery_history(None);
        if let Some(result) = history.into_iter().rev().find(|r| r.service_name == target) {
            break Some(result);
        }
        if tokio::time::Instant::now() >= deadline {
            break None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    match &outcome {
        Some(result) => println!("recovery: {}", serde_json::to_string_pretty(result)?),
        None => println!("recovery: did not finish before the forced-open window expired"),
    }
    println!("health: {}", serde_json::to_string_pretty(&kernel.aggregator().get_system_health())?);

    kernel.shutdown().await;
    if !matches!(outcome, Some(ref r) if r.state == RecoveryState::Succeeded) {
        std::process::exit(1);
    }
    Ok(())
}
