//! Order-to-trade ratio (OTR) compliance monitor.
//!
//! OTR = (placed + modified + cancelled) / executed. While executed is zero the
//! ratio is undefined and the check is skipped. Crossing the threshold trips a
//! fixed cooldown during which new entries are refused; exits are never gated here.

use crate::domain::services::exit_rules::exchange_now;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

pub const DEFAULT_OTR_THRESHOLD: f64 = 20.0;
pub const DEFAULT_WARNING_FRACTION: f64 = 0.75;
pub const DEFAULT_THROTTLE_COOLDOWN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleConfig {
    pub threshold: f64,
    /// Fraction of `threshold` above which a warning is logged
    pub warning_fraction: f64,
    pub cooldown: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_OTR_THRESHOLD,
            warning_fraction: DEFAULT_WARNING_FRACTION,
            cooldown: DEFAULT_THROTTLE_COOLDOWN,
        }
    }
}

#[derive(Debug)]
struct Counters {
    placed: u64,
    modified: u64,
    cancelled: u64,
    executed: u64,
    reset_at: DateTime<Utc>,
    trading_day: NaiveDate,
    throttle_until: Option<Instant>,
}

impl Counters {
    fn new(trading_day: NaiveDate) -> Self {
        Self {
            placed: 0,
            modified: 0,
            cancelled: 0,
            executed: 0,
            reset_at: Utc::now(),
            trading_day,
            throttle_until: None,
        }
    }

    fn ratio(&self) -> Option<f64> {
        if self.executed == 0 {
            return None;
        }
        let actions = self.placed + self.modified + self.cancelled;
        Some(actions as f64 / self.executed as f64)
    }
}

/// Point-in-time view of the counters for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct ThrottleSnapshot {
    pub placed: u64,
    pub modified: u64,
    pub cancelled: u64,
    pub executed: u64,
    pub ratio: Option<f64>,
    pub threshold: f64,
    pub throttled: bool,
    pub throttle_remaining_secs: Option<u64>,
    pub reset_at: DateTime<Utc>,
    pub trading_day: NaiveDate,
}

pub struct OrderThrottleMonitor {
    config: ThrottleConfig,
    state: Mutex<Counters>,
}

impl OrderThrottleMonitor {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            state: Mutex::new(Counters::new(exchange_now().date_naive())),
        }
    }

    pub fn record_placed(&self) {
        let mut state = self.state();
        state.placed += 1;
        self.evaluate(&mut state, "placed");
    }

    pub fn record_modified(&self) {
        let mut state = self.state();
        state.modified += 1;
        self.evaluate(&mut state, "modified");
    }

    pub fn record_cancelled(&self) {
        let mut state = self.state();
        state.cancelled += 1;
        self.evaluate(&mut state, "cancelled");
    }

    pub fn record_executed(&self) {
        self.state().executed += 1;
    }

    /// True while the cooldown window is active. Clears itself once it has passed.
    pub fn is_throttled(&self) -> bool {
        let mut state = self.state();
        match state.throttle_until {
            Some(until) if Instant::now() > until => {
                state.throttle_until = None;
                info!("OTR throttle window elapsed, new orders allowed again");
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn ratio(&self) -> Option<f64> {
        self.state().ratio()
    }

    /// Zero all counters and clear the throttle
    pub fn reset_daily(&self) {
        let mut state = self.state();
        let day = state.trading_day;
        *state = Counters::new(day);
        info!("OTR counters reset for trading day {}", day);
    }

    /// Reset when `today` is a new trading day. Returns true if a reset happened.
    pub fn roll_day(&self, today: NaiveDate) -> bool {
        let mut state = self.state();
        if state.trading_day == today {
            return false;
        }
        *state = Counters::new(today);
        info!("OTR counters reset for new trading day {}", today);
        true
    }

    pub fn snapshot(&self) -> ThrottleSnapshot {
        let state = self.state();
        let remaining = state
            .throttle_until
            .and_then(|until| until.checked_duration_since(Instant::now()));
        ThrottleSnapshot {
            placed: state.placed,
            modified: state.modified,
            cancelled: state.cancelled,
            executed: state.executed,
            ratio: state.ratio(),
            threshold: self.config.threshold,
            throttled: remaining.is_some(),
            throttle_remaining_secs: remaining.map(|d| d.as_secs()),
            reset_at: state.reset_at,
            trading_day: state.trading_day,
        }
    }

    fn evaluate(&self, state: &mut Counters, action: &str) {
        let Some(ratio) = state.ratio() else {
            return;
        };

        if ratio > self.config.threshold {
            if state.throttle_until.is_none() {
                state.throttle_until = Some(Instant::now() + self.config.cooldown);
                error!(
                    "OTR {:.2} exceeds threshold {:.2} after order {}; throttling new orders for {:?}",
                    ratio, self.config.threshold, action, self.config.cooldown
                );
            }
        } else if ratio > self.config.threshold * self.config.warning_fraction {
            warn!(
                "OTR {:.2} approaching threshold {:.2}",
                ratio, self.config.threshold
            );
        }
    }

    fn state(&self) -> MutexGuard<'_, Counters> {
        // Counters stay consistent even if a holder panicked
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for OrderThrottleMonitor {
    fn default() -> Self {
        Self::new(ThrottleConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(cooldown: Duration) -> OrderThrottleMonitor {
        OrderThrottleMonitor::new(ThrottleConfig {
            threshold: 2.0,
            warning_fraction: 0.75,
            cooldown,
        })
    }

    #[test]
    fn test_ratio_undefined_without_executions() {
        let monitor = OrderThrottleMonitor::default();
        for _ in 0..50 {
            monitor.record_placed();
        }
        assert_eq!(monitor.ratio(), None);
        assert!(!monitor.is_throttled());
    }

    #[test]
    fn test_ratio_matches_counters() {
        let monitor = OrderThrottleMonitor::default();
        monitor.record_executed();
        monitor.record_executed();
        monitor.record_placed();
        monitor.record_placed();
        monitor.record_modified();
        monitor.record_cancelled();
        monitor.record_cancelled();
        assert_eq!(monitor.ratio(), Some(2.5));
    }

    #[test]
    fn test_next_placement_over_threshold_throttles() {
        let monitor = monitor(Duration::from_secs(60));
        monitor.record_executed();
        monitor.record_placed();
        monitor.record_placed();
        assert!(!monitor.is_throttled());

        monitor.record_placed();
        assert!(monitor.is_throttled());
        let snapshot = monitor.snapshot();
        assert!(snapshot.throttled);
        assert_eq!(snapshot.placed, 3);
    }

    #[test]
    fn test_throttle_clears_after_cooldown() {
        let monitor = monitor(Duration::from_millis(20));
        monitor.record_executed();
        for _ in 0..3 {
            monitor.record_placed();
        }
        assert!(monitor.is_throttled());

        std::thread::sleep(Duration::from_millis(40));
        assert!(!monitor.is_throttled());
    }

    #[test]
    fn test_reset_daily_zeroes_everything() {
        let monitor = monitor(Duration::from_secs(60));
        monitor.record_executed();
        for _ in 0..5 {
            monitor.record_cancelled();
        }
        assert!(monitor.is_throttled());

        monitor.reset_daily();
        let snapshot = monitor.snapshot();
        assert_eq!(
            (snapshot.placed, snapshot.modified, snapshot.cancelled, snapshot.executed),
            (0, 0, 0, 0)
        );
        assert!(!monitor.is_throttled());
    }

    #[test]
    fn test_roll_day_resets_only_on_new_day() {
        let monitor = OrderThrottleMonitor::default();
        monitor.record_placed();
        let today = monitor.snapshot().trading_day;

        assert!(!monitor.roll_day(today));
        assert_eq!(monitor.snapshot().placed, 1);

        let tomorrow = today.succ_opt().unwrap();
        assert!(monitor.roll_day(tomorrow));
        assert_eq!(monitor.snapshot().placed, 0);
        assert_eq!(monitor.snapshot().trading_day, tomorrow);
    }
}
