use crate::domain::entities::exchange::Instrument;
use crate::domain::entities::order::OrderSide;
use crate::domain::errors::PositionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Side of the order that opens a position in this direction
    pub fn entry_side(&self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }

    /// Side of the order that flattens a position in this direction
    pub fn exit_side(&self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionStatus::Open => write!(f, "OPEN"),
            PositionStatus::Closing => write!(f, "CLOSING"),
            PositionStatus::Closed => write!(f, "CLOSED"),
        }
    }
}

/// An open intraday position.
///
/// Levels always satisfy `stop < entry < target` for longs and
/// `stop > entry > target` for shorts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub instrument: Instrument,
    pub direction: Direction,
    pub entry_price: f64,
    pub quantity: u32,
    pub stop_loss: f64,
    pub target: f64,
    pub opened_at: DateTime<Utc>,
    pub status: PositionStatus,
    pub signal_id: Option<String>,
    pub broker_order_id: Option<String>,
}

impl Position {
    pub fn new(
        instrument: Instrument,
        direction: Direction,
        entry_price: f64,
        quantity: u32,
        stop_loss: f64,
        target: f64,
    ) -> Result<Self, PositionError> {
        let symbol = instrument.trading_symbol.clone();
        if quantity == 0 {
            return Err(PositionError::InvalidLevels {
                symbol,
                reason: "quantity must be positive".to_string(),
            });
        }
        validate_levels(&symbol, direction, entry_price, stop_loss, target)?;

        Ok(Self {
            symbol,
            instrument,
            direction,
            entry_price,
            quantity,
            stop_loss,
            target,
            opened_at: Utc::now(),
            status: PositionStatus::Open,
            signal_id: None,
            broker_order_id: None,
        })
    }

    pub fn with_signal_id(mut self, signal_id: impl Into<String>) -> Self {
        self.signal_id = Some(signal_id.into());
        self
    }

    pub fn with_broker_order_id(mut self, order_id: impl Into<String>) -> Self {
        self.broker_order_id = Some(order_id.into());
        self
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn stop_hit(&self, price: f64) -> bool {
        match self.direction {
            Direction::Long => price <= self.stop_loss,
            Direction::Short => price >= self.stop_loss,
        }
    }

    pub fn target_hit(&self, price: f64) -> bool {
        match self.direction {
            Direction::Long => price >= self.target,
            Direction::Short => price <= self.target,
        }
    }

    /// True if `proposed` is at least as protective as the current stop
    pub fn tightens_stop(&self, proposed: f64) -> bool {
        match self.direction {
            Direction::Long => proposed >= self.stop_loss,
            Direction::Short => proposed <= self.stop_loss,
        }
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        let per_unit = match self.direction {
            Direction::Long => price - self.entry_price,
            Direction::Short => self.entry_price - price,
        };
        per_unit * f64::from(self.quantity)
    }
}

/// Check the direction-aware ordering of stop, entry and target
pub fn validate_levels(
    symbol: &str,
    direction: Direction,
    entry: f64,
    stop_loss: f64,
    target: f64,
) -> Result<(), PositionError> {
    let finite = entry.is_finite() && stop_loss.is_finite() && target.is_finite();
    if !finite || entry <= 0.0 || stop_loss <= 0.0 || target <= 0.0 {
        return Err(PositionError::InvalidLevels {
            symbol: symbol.to_string(),
            reason: "prices must be positive and finite".to_string(),
        });
    }

    let ordered = match direction {
        Direction::Long => stop_loss < entry && entry < target,
        Direction::Short => stop_loss > entry && entry > target,
    };
    if !ordered {
        return Err(PositionError::InvalidLevels {
            symbol: symbol.to_string(),
            reason: format!(
                "{} requires stop {:.2} / entry {:.2} / target {:.2} in order",
                direction, stop_loss, entry, target
            ),
        });
    }
    Ok(())
}
