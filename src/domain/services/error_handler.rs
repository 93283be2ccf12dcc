//! Error classification and bounded retry.
//!
//! `ErrorHandler` is the one place where an `EngineError`'s severity turns into
//! control flow. Both the REST client and the stream supervisor go through it:
//!
//! - **Critical**: recorded, logged at `error!`, caller must stop
//! - **Recoverable**: retried with exponential backoff when a retry function is given
//! - **Warning**: recorded, logged, caller continues
//!
//! Every `handle` call appends exactly one `ErrorRecord` to a bounded ring buffer.

use crate::domain::errors::{EngineError, EngineResult, ErrorCategory, Severity};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_ERROR_BUFFER_CAPACITY: usize = 100;

/// Backoff schedule: `base_delay * 2^(attempt-1)`, capped at `max_delay`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub category: ErrorCategory,
    pub context: String,
    pub message: String,
}

/// Outcome of handling one error
#[derive(Debug)]
pub struct Handled<T> {
    pub should_continue: bool,
    pub result: Option<T>,
    /// None when no error was involved
    pub severity: Option<Severity>,
    /// Error that decided the outcome, if the operation did not succeed
    pub error: Option<EngineError>,
}

impl<T> Handled<T> {
    fn proceed(result: Option<T>, severity: Option<Severity>, error: Option<EngineError>) -> Self {
        Self {
            should_continue: true,
            result,
            severity,
            error,
        }
    }

    fn halt(severity: Severity, error: EngineError) -> Self {
        Self {
            should_continue: false,
            result: None,
            severity: Some(severity),
            error: Some(error),
        }
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Some(Severity::Critical)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    pub critical: u64,
    pub recoverable: u64,
    pub warning: u64,
    pub total: u64,
    pub recent: Vec<ErrorRecord>,
}

pub struct ErrorHandler {
    policy: RetryPolicy,
    capacity: usize,
    records: Mutex<VecDeque<ErrorRecord>>,
    critical: AtomicU64,
    recoverable: AtomicU64,
    warning: AtomicU64,
    shutdown: Option<watch::Receiver<bool>>,
}

impl ErrorHandler {
    pub fn new(policy: RetryPolicy, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            policy,
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            critical: AtomicU64::new(0),
            recoverable: AtomicU64::new(0),
            warning: AtomicU64::new(0),
            shutdown: None,
        }
    }

    /// Abandon retries at the next backoff boundary once `shutdown` flips to true
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn classify(&self, error: &EngineError) -> (Severity, ErrorCategory) {
        error.classify()
    }

    /// Record and log an error without retrying it
    pub fn report(&self, error: &EngineError, context: &str) -> Handled<()> {
        let severity = self.record(error, context);
        match severity {
            Severity::Critical => Handled::halt(severity, error.clone()),
            _ => Handled::proceed(None, Some(severity), Some(error.clone())),
        }
    }

    /// Handle a failure, retrying through `retry` when the error is Recoverable.
    pub async fn handle<T, F, Fut>(
        &self,
        error: EngineError,
        context: &str,
        retry: Option<F>,
    ) -> Handled<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let severity = self.record(&error, context);
        match (severity, retry) {
            (Severity::Critical, _) => Handled::halt(severity, error),
            (Severity::Warning, _) | (Severity::Recoverable, None) => {
                Handled::proceed(None, Some(severity), Some(error))
            }
            (Severity::Recoverable, Some(retry)) => self.retry(context, retry, error).await,
        }
    }

    /// Call `op` once; on failure hand the error and `op` itself to `handle`.
    pub async fn run<T, F, Fut>(&self, context: &str, mut op: F) -> Handled<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        match op().await {
            Ok(value) => Handled::proceed(Some(value), None, None),
            Err(e) => self.handle(e, context, Some(op)).await,
        }
    }

    /// Bound a broker call; an elapsed deadline becomes a Recoverable `Timeout`
    pub async fn with_timeout<T, Fut>(limit: Duration, fut: Fut) -> EngineResult<T>
    where
        Fut: Future<Output = EngineResult<T>>,
    {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(limit)),
        }
    }

    pub fn error_summary(&self) -> ErrorSummary {
        let critical = self.critical.load(Ordering::Relaxed);
        let recoverable = self.recoverable.load(Ordering::Relaxed);
        let warning = self.warning.load(Ordering::Relaxed);
        let recent = match self.records.lock() {
            Ok(records) => records.iter().cloned().collect(),
            Err(_) => Vec::new(),
        };
        ErrorSummary {
            critical,
            recoverable,
            warning,
            total: critical + recoverable + warning,
            recent,
        }
    }

    async fn retry<T, F, Fut>(&self, context: &str, mut retry: F, first: EngineError) -> Handled<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let max = self.policy.max_retries;
        let mut last = first;
        for attempt in 1..=max {
            let delay = self.policy.delay_for(attempt);
            warn!(
                "[{}] Retry attempt {}/{} in {:?}",
                context, attempt, max, delay
            );
            if !self.backoff(delay).await {
                info!("[{}] Shutdown requested, abandoning retries", context);
                return Handled::halt(Severity::Recoverable, last);
            }

            match retry().await {
                Ok(value) => {
                    info!("[{}] Succeeded on retry attempt {}", context, attempt);
                    return Handled::proceed(Some(value), Some(Severity::Recoverable), None);
                }
                Err(e) if e.is_critical() => {
                    error!(
                        "[{}] CRITICAL error on retry attempt {}: {}",
                        context, attempt, e
                    );
                    return Handled::halt(Severity::Critical, e);
                }
                Err(e) => {
                    warn!("[{}] Retry attempt {}/{} failed: {}", context, attempt, max, e);
                    last = e;
                }
            }
        }

        error!("[{}] Retries exhausted after {} attempts", context, max);
        Handled::halt(Severity::Recoverable, last)
    }

    /// Sleep for `delay`; false if shutdown was requested first
    async fn backoff(&self, delay: Duration) -> bool {
        let Some(mut shutdown) = self.shutdown.clone() else {
            sleep(delay).await;
            return true;
        };
        if *shutdown.borrow() {
            return false;
        }
        let stopped = tokio::select! {
            _ = sleep(delay) => return true,
            changed = shutdown.wait_for(|stop| *stop) => changed.is_ok(),
        };
        if stopped {
            return false;
        }
        // Sender gone: nobody can request shutdown any more
        sleep(delay).await;
        true
    }

    fn record(&self, error: &EngineError, context: &str) -> Severity {
        let (severity, category) = error.classify();
        match severity {
            Severity::Critical => {
                self.critical.fetch_add(1, Ordering::Relaxed);
                error!("[{}] CRITICAL ({:?}): {}", context, category, error);
            }
            Severity::Recoverable => {
                self.recoverable.fetch_add(1, Ordering::Relaxed);
                warn!("[{}] Recoverable ({:?}): {}", context, category, error);
            }
            Severity::Warning => {
                self.warning.fetch_add(1, Ordering::Relaxed);
                warn!("[{}] Warning ({:?}): {}", context, category, error);
            }
        }

        if let Ok(mut records) = self.records.lock() {
            if records.len() == self.capacity {
                records.pop_front();
            }
            records.push_back(ErrorRecord {
                timestamp: Utc::now(),
                severity,
                category,
                context: context.to_string(),
                message: error.to_string(),
            });
        }
        severity
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), DEFAULT_ERROR_BUFFER_CAPACITY)
    }
}
