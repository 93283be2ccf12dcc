//! Pure exit evaluation: stop-loss, target, trailing stop and end-of-session
//! square-off. Nothing here mutates state; the engine acts on the decision.

use crate::domain::entities::position::{Direction, Position};
use crate::domain::entities::trade::ExitReason;
use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Asia::Kolkata;
use chrono_tz::Tz;

/// Current time on the exchange clock
pub fn exchange_now() -> DateTime<Tz> {
    Utc::now().with_timezone(&Kolkata)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitDecision {
    Hold,
    /// Tighten the stop to this price without leaving the position
    TrailTo(f64),
    Exit(ExitReason),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitRules {
    /// Trailing distance as a fraction of price; 0 disables trailing
    pub trailing_stop_pct: f64,
    pub tick_size: f64,
    /// Exchange-local time after which every position is flattened
    pub square_off: NaiveTime,
}

impl Default for ExitRules {
    fn default() -> Self {
        Self {
            trailing_stop_pct: 0.01,
            tick_size: 0.05,
            square_off: NaiveTime::from_hms_opt(15, 15, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

impl ExitRules {
    pub fn evaluate(&self, position: &Position, price: f64) -> ExitDecision {
        if position.stop_hit(price) {
            return ExitDecision::Exit(ExitReason::StopLoss);
        }
        if position.target_hit(price) {
            return ExitDecision::Exit(ExitReason::Target);
        }
        match self.trailing_stop(position, price) {
            Some(stop) => ExitDecision::TrailTo(stop),
            None => ExitDecision::Hold,
        }
    }

    /// Candidate trailing stop, if it is strictly tighter than the current one.
    ///
    /// The stop stays at least one tick on the losing side of entry so the
    /// `stop < entry < target` ordering (mirrored for shorts) always holds.
    pub fn trailing_stop(&self, position: &Position, price: f64) -> Option<f64> {
        if self.trailing_stop_pct <= 0.0 || self.tick_size <= 0.0 || !price.is_finite() {
            return None;
        }

        match position.direction {
            Direction::Long => {
                let raw = price * (1.0 - self.trailing_stop_pct);
                let candidate = self
                    .floor_to_tick(raw)
                    .min(position.entry_price - self.tick_size);
                let candidate = snap(candidate);
                (candidate > position.stop_loss).then_some(candidate)
            }
            Direction::Short => {
                let raw = price * (1.0 + self.trailing_stop_pct);
                let candidate = self
                    .ceil_to_tick(raw)
                    .max(position.entry_price + self.tick_size);
                let candidate = snap(candidate);
                (candidate < position.stop_loss).then_some(candidate)
            }
        }
    }

    pub fn square_off_due(&self, now: DateTime<Tz>) -> bool {
        now.time() >= self.square_off
    }

    fn floor_to_tick(&self, price: f64) -> f64 {
        ((price / self.tick_size) + 1e-9).floor() * self.tick_size
    }

    fn ceil_to_tick(&self, price: f64) -> f64 {
        ((price / self.tick_size) - 1e-9).ceil() * self.tick_size
    }
}

/// Drop floating-point noise left by tick arithmetic
fn snap(price: f64) -> f64 {
    (price * 1e6).round() / 1e6
}
