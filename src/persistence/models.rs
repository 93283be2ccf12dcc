//! Database Models
//!
//! Row types for the activity log and their conversion to domain entities.

use crate::domain::entities::exchange::{Exchange, Instrument};
use crate::domain::entities::position::{validate_levels, Direction, Position, PositionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Position record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PositionRecord {
    pub id: i64,
    pub account_id: String,
    pub symbol: String,
    pub exchange: String,
    pub token: String,
    pub direction: String, // "long" or "short"
    pub entry_price: f64,
    pub quantity: i64,
    pub stop_loss: f64,
    pub target: f64,
    pub status: String, // "open" or "closed"
    pub signal_id: Option<String>,
    pub broker_order_id: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Closed trade record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TradeRecord {
    pub id: i64,
    pub account_id: String,
    pub symbol: String,
    pub exchange: String,
    pub direction: String,
    pub quantity: i64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub exit_reason: String,
    pub entry_order_id: Option<String>,
    pub exit_order_id: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

pub fn direction_to_db(direction: Direction) -> &'static str {
    match direction {
        Direction::Long => "long",
        Direction::Short => "short",
    }
}

fn exchange_from_db(name: &str) -> Option<Exchange> {
    match name {
        "NSE" => Some(Exchange::Nse),
        "BSE" => Some(Exchange::Bse),
        "NFO" => Some(Exchange::Nfo),
        "BFO" => Some(Exchange::Bfo),
        "MCX" => Some(Exchange::Mcx),
        "CDS" => Some(Exchange::Cds),
        _ => None,
    }
}

impl TryFrom<PositionRecord> for Position {
    type Error = String;

    fn try_from(record: PositionRecord) -> Result<Self, Self::Error> {
        let exchange = exchange_from_db(&record.exchange)
            .ok_or_else(|| format!("unknown exchange '{}'", record.exchange))?;
        let direction = match record.direction.as_str() {
            "long" => Direction::Long,
            "short" => Direction::Short,
            other => return Err(format!("unknown direction '{}'", other)),
        };
        let quantity = u32::try_from(record.quantity)
            .ok()
            .filter(|q| *q > 0)
            .ok_or_else(|| format!("invalid quantity {}", record.quantity))?;
        validate_levels(
            &record.symbol,
            direction,
            record.entry_price,
            record.stop_loss,
            record.target,
        )
        .map_err(|e| e.to_string())?;

        Ok(Position {
            instrument: Instrument::new(exchange, &record.token, &record.symbol),
            symbol: record.symbol,
            direction,
            entry_price: record.entry_price,
            quantity,
            stop_loss: record.stop_loss,
            target: record.target,
            opened_at: record.opened_at,
            status: PositionStatus::Open,
            signal_id: record.signal_id,
            broker_order_id: record.broker_order_id,
        })
    }
}
