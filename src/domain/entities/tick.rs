use crate::domain::entities::exchange::Exchange;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Open/high/low/close of the current bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ohlc {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// One market data update for one instrument. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub exchange: Exchange,
    /// Broker instrument token the feed keys updates by
    pub token: String,
    pub last_price: f64,
    pub volume: Option<u64>,
    pub ohlc: Option<Ohlc>,
    pub exchange_timestamp: DateTime<Utc>,
    pub sequence: u64,
}

impl Tick {
    pub fn ltp(exchange: Exchange, token: &str, last_price: f64) -> Self {
        Self {
            exchange,
            token: token.to_string(),
            last_price,
            volume: None,
            ohlc: None,
            exchange_timestamp: Utc::now(),
            sequence: 0,
        }
    }

    pub fn feed_key(&self) -> (Exchange, String) {
        (self.exchange, self.token.clone())
    }
}
