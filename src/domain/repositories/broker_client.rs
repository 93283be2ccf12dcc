//! Broker Client Trait
//!
//! This module defines the `BrokerClient` trait, the single seam between the
//! execution engine and the broker's REST trading API. The engine never talks
//! HTTP directly; it calls this trait through the retry handler.
//!
//! ## Contract
//! - Every call returns `EngineResult`, so failures can be classified
//! - Implementations enforce their own per-request timeout
//! - A `status:false` envelope becomes `EngineError::Broker` (or a more specific variant)

use crate::domain::entities::exchange::Instrument;
use crate::domain::entities::order::{OrderAck, OrderRequest, OrderStatus, Variety};
use crate::domain::errors::EngineResult;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Candle resolution accepted by the historical data endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandleInterval {
    #[serde(rename = "ONE_MINUTE")]
    OneMinute,
    #[serde(rename = "FIVE_MINUTE")]
    FiveMinute,
    #[serde(rename = "FIFTEEN_MINUTE")]
    FifteenMinute,
    #[serde(rename = "ONE_HOUR")]
    OneHour,
    #[serde(rename = "ONE_DAY")]
    OneDay,
}

impl CandleInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandleInterval::OneMinute => "ONE_MINUTE",
            CandleInterval::FiveMinute => "FIVE_MINUTE",
            CandleInterval::FifteenMinute => "FIFTEEN_MINUTE",
            CandleInterval::OneHour => "ONE_HOUR",
            CandleInterval::OneDay => "ONE_DAY",
        }
    }
}

/// Historical OHLCV bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// Credentials the streaming feed needs; distinct from the REST session token.
#[derive(Clone)]
pub struct FeedCredentials {
    pub jwt_token: Zeroizing<String>,
    pub feed_token: Zeroizing<String>,
    pub api_key: Zeroizing<String>,
    pub client_code: String,
}

impl std::fmt::Debug for FeedCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedCredentials")
            .field("client_code", &self.client_code)
            .field("jwt_token", &"<redacted>")
            .field("feed_token", &"<redacted>")
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Broker REST API as seen by the engine
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Get the name of this broker
    fn name(&self) -> &str;

    /// Place an order
    ///
    /// # Returns
    /// The broker-assigned identifiers of the accepted order
    async fn place_order(&self, order: &OrderRequest) -> EngineResult<OrderAck>;

    /// Modify an open order in place
    async fn modify_order(&self, order_id: &str, order: &OrderRequest) -> EngineResult<OrderAck>;

    /// Cancel an open order
    async fn cancel_order(&self, order_id: &str, variety: Variety) -> EngineResult<()>;

    /// Current status of a placed order, used to confirm fills
    async fn order_status(&self, ack: &OrderAck) -> EngineResult<OrderStatus>;

    /// Last traded price for an instrument
    async fn quote(&self, instrument: &Instrument) -> EngineResult<f64>;

    /// Historical candles between two exchange-local timestamps
    async fn candles(
        &self,
        instrument: &Instrument,
        interval: CandleInterval,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> EngineResult<Vec<Candle>>;

    /// Exchange the refresh token for a fresh session
    async fn refresh_session(&self) -> EngineResult<()>;

    /// Credentials for (re)authenticating the streaming connection
    async fn feed_credentials(&self) -> EngineResult<FeedCredentials>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candle_interval_names() {
        assert_eq!(CandleInterval::FiveMinute.as_str(), "FIVE_MINUTE");
        let json = serde_json::to_string(&CandleInterval::OneDay).unwrap();
        assert_eq!(json, "\"ONE_DAY\"");
    }

    #[test]
    fn test_feed_credentials_debug_is_redacted() {
        let creds = FeedCredentials {
            jwt_token: Zeroizing::new("jwt-secret".to_string()),
            feed_token: Zeroizing::new("feed-secret".to_string()),
            api_key: Zeroizing::new("key-secret".to_string()),
            client_code: "A123".to_string(),
        };
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("A123"));
        assert!(!rendered.contains("secret"));
    }
}
