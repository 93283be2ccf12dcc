use crate::domain::entities::position::Position;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a position was flattened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    Target,
    SquareOff,
    Manual,
    /// Fill landed outside the position's protective levels
    RiskBreach,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::Target => "target",
            ExitReason::SquareOff => "square_off",
            ExitReason::Manual => "manual",
            ExitReason::RiskBreach => "risk_breach",
        };
        write!(f, "{}", s)
    }
}

/// A position after its exit order filled, as written to the activity log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub position: Position,
    pub exit_price: f64,
    pub exit_reason: ExitReason,
    pub exit_order_id: Option<String>,
    pub closed_at: DateTime<Utc>,
    pub realized_pnl: f64,
}

impl ClosedTrade {
    pub fn new(
        position: Position,
        exit_price: f64,
        exit_reason: ExitReason,
        exit_order_id: Option<String>,
    ) -> Self {
        let realized_pnl = position.unrealized_pnl(exit_price);
        Self {
            position,
            exit_price,
            exit_reason,
            exit_order_id,
            closed_at: Utc::now(),
            realized_pnl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::exchange::{Exchange, Instrument};
    use crate::domain::entities::position::Direction;

    #[test]
    fn test_closed_trade_realizes_pnl() {
        let position = Position::new(
            Instrument::new(Exchange::Nse, "3045", "SBIN-EQ"),
            Direction::Long,
            100.0,
            10,
            98.0,
            106.0,
        )
        .unwrap();
        let trade = ClosedTrade::new(position, 107.0, ExitReason::Target, Some("ord-9".into()));
        assert_eq!(trade.realized_pnl, 70.0);
        assert_eq!(trade.exit_reason.to_string(), "target");
    }
}
