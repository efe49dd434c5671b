//! Shared utilities for integration tests.

use std::future::Future;
use std::time::Duration;

use resilience_kernel::config::{BreakerServiceConfig, KernelConfig};
use resilience_kernel::ResilienceKernel;

/// Config with short intervals so loops react within milliseconds.
pub fn fast_config(services: &[&str]) -> KernelConfig {
    let mut config = KernelConfig::default();
    config.health.check_interval_ms = 10;
    config.recovery.tick_ms = 5;
    config.recovery.initial_delay_ms = 5;
    config.recovery.max_delay_ms = 40;
    config.breakers.fail_max = 2;
    config.breakers.services = services
        .iter()
        .map(|name| BreakerServiceConfig {
            name: name.to_string(),
            fail_max: None,
            reset_timeout_ms: None,
        })
        .collect();
    config
}

/// Build a kernel from [`fast_config`] without starting it.
pub fn fast_kernel(services: &[&str], auto_recover: bool) -> ResilienceKernel {
    let mut config = fast_config(services);
    config.recovery.auto_recover = auto_recover;
    ResilienceKernel::from_config(&config).unwrap()
}

/// Poll `condition` until it holds or `timeout` elapses.
#[allow(dead_code)]
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Health check that flips to healthy after `failures` calls.
#[allow(dead_code)]
pub fn flaky_check(
    failures: u32,
    calls: std::sync::Arc<std::sync::atomic::AtomicU32>,
) -> impl Fn() -> std::pin::Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync + 'static {
    move || {
        let calls = calls.clone();
        Box::pin(async move { calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) >= failures })
    }
}
