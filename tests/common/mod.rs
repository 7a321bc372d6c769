//! Shared test helpers for integration tests

use cadence::scenarios::Log;
use cadence::{Completion, Scheduler, SchedulerConfig, Value};
use std::sync::Once;

static INIT_LOGGING: Once = Once::new();

/// Install a tracing subscriber that writes through the test harness.
///
/// Safe to call multiple times; only initializes once. `RUST_LOG` overrides
/// the default `warn` level.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_ansi(false)
            .try_init();
    });
}

/// Scheduler on the default (virtual) clock, with logging initialized
pub fn scheduler() -> Scheduler {
    init_test_logging();
    Scheduler::new()
}

/// Scheduler with a custom configuration
#[allow(dead_code)]
pub fn scheduler_with(config: SchedulerConfig) -> Scheduler {
    init_test_logging();
    Scheduler::with_config(config)
}

/// Callback that appends `line` to `log`
#[allow(dead_code)]
pub fn record(log: &Log, line: &'static str) -> impl FnOnce(&Scheduler) -> Completion + 'static {
    let log = log.clone();
    move |_| {
        log.push(line);
        Ok(Value::Undefined)
    }
}

/// Settlement handler that appends `prefix: value` to `log`
#[allow(dead_code)]
pub fn record_value(
    log: &Log,
    prefix: &'static str,
) -> impl FnOnce(&Scheduler, Value) -> Completion + 'static {
    let log = log.clone();
    move |_, value| {
        log.push(format!("{}: {}", prefix, value));
        Ok(value)
    }
}
