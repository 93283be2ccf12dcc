/// Periodic task runner with failure tracking
///
/// Runs one iteration of a task on a fixed interval until shutdown. Failures
/// are counted and logged with an exponentially growing (capped) backoff so a
/// broken dependency does not spin the loop.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Backoff configuration for a periodic task
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Consecutive failures after which the runner logs at error level
    pub alert_after_failures: u32,
    /// Delay after the first failure
    pub initial_retry_delay: Duration,
    /// Maximum delay between failed iterations
    pub max_retry_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            alert_after_failures: 3,
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct FailureState {
    consecutive_failures: u32,
    current_retry_delay: Duration,
}

impl FailureState {
    fn new(initial_delay: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            current_retry_delay: initial_delay,
        }
    }

    fn record_failure(&mut self, initial_delay: Duration, max_delay: Duration) -> Duration {
        self.consecutive_failures += 1;
        let delay = self.current_retry_delay;
        self.current_retry_delay = std::cmp::min(
            self.current_retry_delay.saturating_mul(2).max(initial_delay),
            max_delay,
        );
        delay.min(max_delay)
    }

    fn reset(&mut self, initial_delay: Duration) {
        self.consecutive_failures = 0;
        self.current_retry_delay = initial_delay;
    }
}

/// Outcome of one task iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskControl {
    Continue,
    Stop,
}

/// Run `task_fn` every `interval` until `shutdown` flips to true or the
/// task returns `TaskControl::Stop`.
///
/// The first iteration runs immediately. After a failure the next iteration
/// waits for the backoff delay instead of the interval.
pub async fn run_periodic<F, Fut>(
    task_name: &str,
    interval: Duration,
    config: BackoffConfig,
    mut shutdown: watch::Receiver<bool>,
    mut task_fn: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<TaskControl, String>>,
{
    let mut state = FailureState::new(config.initial_retry_delay);
    info!("Task '{}' started (interval {:?})", task_name, interval);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let wait = match task_fn().await {
            Ok(TaskControl::Continue) => {
                if state.consecutive_failures > 0 {
                    warn!(
                        "Task '{}' recovered after {} failures",
                        task_name, state.consecutive_failures
                    );
                }
                state.reset(config.initial_retry_delay);
                interval
            }
            Ok(TaskControl::Stop) => {
                debug!("Task '{}' asked to stop", task_name);
                break;
            }
            Err(e) => {
                let delay = state.record_failure(config.initial_retry_delay, config.max_retry_delay);
                if state.consecutive_failures >= config.alert_after_failures {
                    error!(
                        "Task '{}' failed {} times in a row: {}",
                        task_name, state.consecutive_failures, e
                    );
                } else {
                    warn!(
                        "Task '{}' failed (attempt {}): {}",
                        task_name, state.consecutive_failures, e
                    );
                }
                warn!("Task '{}' will retry in {:?}", task_name, delay);
                delay
            }
        };

        tokio::select! {
            _ = sleep(wait) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    // Sender gone: nobody can stop us anymore, keep the cadence
                    sleep(wait).await;
                }
            }
        }
    }

    info!("Task '{}' stopped", task_name);
}
