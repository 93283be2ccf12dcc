//! SmartStream wire format.
//!
//! Outbound: JSON subscribe/unsubscribe frames keyed by exchange type and token.
//! Inbound: little-endian binary tick frames with prices in paise.
//!
//! Tick frame layout (byte offsets):
//!
//! | field              | range     | type        |
//! |--------------------|-----------|-------------|
//! | mode               | 0         | u8          |
//! | exchange type      | 1         | u8          |
//! | token              | 2..27     | NUL-padded  |
//! | sequence number    | 27..35    | i64         |
//! | exchange timestamp | 35..43    | i64 (ms)    |
//! | last traded price  | 43..51    | i64 (paise) |
//! | last traded qty    | 51..59    | i64         |
//! | average price      | 59..67    | i64 (paise) |
//! | volume             | 67..75    | i64         |
//! | total buy qty      | 75..83    | f64         |
//! | total sell qty     | 83..91    | f64         |
//! | open/high/low/close| 91..123   | 4 x i64     |

use crate::domain::entities::exchange::Exchange;
use crate::domain::entities::tick::{Ohlc, Tick};
use chrono::DateTime;
use serde_json::json;
use thiserror::Error;

pub const HEARTBEAT_REQUEST: &str = "ping";
pub const HEARTBEAT_RESPONSE: &str = "pong";

pub const LTP_FRAME_LEN: usize = 51;
pub const QUOTE_FRAME_LEN: usize = 123;

const TOKEN_RANGE: std::ops::Range<usize> = 2..27;
const PAISE_PER_RUPEE: f64 = 100.0;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    #[error("Frame too short: {len} bytes, need at least {need}")]
    TooShort { len: usize, need: usize },

    #[error("Unknown exchange type {0}")]
    UnknownExchange(u8),

    #[error("Unknown subscription mode {0}")]
    UnknownMode(u8),

    #[error("Token is not valid UTF-8")]
    InvalidToken,

    #[error("Invalid exchange timestamp {0}")]
    InvalidTimestamp(i64),

    #[error("Invalid last traded price {0} paise")]
    InvalidPrice(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionMode {
    Ltp = 1,
    Quote = 2,
    SnapQuote = 3,
}

impl SubscriptionMode {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: u8) -> Result<Self, CodecError> {
        match code {
            1 => Ok(SubscriptionMode::Ltp),
            2 => Ok(SubscriptionMode::Quote),
            3 => Ok(SubscriptionMode::SnapQuote),
            other => Err(CodecError::UnknownMode(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
    Unsubscribe = 0,
    Subscribe = 1,
}

/// Tokens of one exchange segment, as sent in `tokenList`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGroup {
    pub exchange: Exchange,
    pub tokens: Vec<String>,
}

impl TokenGroup {
    pub fn new(exchange: Exchange, tokens: Vec<String>) -> Self {
        Self { exchange, tokens }
    }
}

pub fn encode_subscription(
    correlation_id: &str,
    action: SubscriptionAction,
    mode: SubscriptionMode,
    groups: &[TokenGroup],
) -> String {
    let token_list: Vec<_> = groups
        .iter()
        .filter(|group| !group.tokens.is_empty())
        .map(|group| {
            json!({
                "exchangeType": group.exchange.feed_code(),
                "tokens": group.tokens,
            })
        })
        .collect();

    json!({
        "correlationID": correlation_id,
        "action": action as u8,
        "params": {
            "mode": mode.code(),
            "tokenList": token_list,
        }
    })
    .to_string()
}

pub fn decode_tick(frame: &[u8]) -> Result<Tick, CodecError> {
    if frame.len() < LTP_FRAME_LEN {
        return Err(CodecError::TooShort {
            len: frame.len(),
            need: LTP_FRAME_LEN,
        });
    }

    let mode = SubscriptionMode::from_code(frame[0])?;
    let exchange = Exchange::from_feed_code(frame[1]).ok_or(CodecError::UnknownExchange(frame[1]))?;

    let token_bytes = &frame[TOKEN_RANGE];
    let end = token_bytes.iter().position(|b| *b == 0).unwrap_or(token_bytes.len());
    let token = std::str::from_utf8(&token_bytes[..end])
        .map_err(|_| CodecError::InvalidToken)?
        .to_string();
    if token.is_empty() {
        return Err(CodecError::InvalidToken);
    }

    let sequence = read_i64(frame, 27);
    let timestamp_ms = read_i64(frame, 35);
    let exchange_timestamp = DateTime::from_timestamp_millis(timestamp_ms)
        .ok_or(CodecError::InvalidTimestamp(timestamp_ms))?;

    let ltp_paise = read_i64(frame, 43);
    if ltp_paise <= 0 {
        return Err(CodecError::InvalidPrice(ltp_paise));
    }

    let mut tick = Tick {
        exchange,
        token,
        last_price: paise(ltp_paise),
        volume: None,
        ohlc: None,
        exchange_timestamp,
        sequence: sequence.max(0) as u64,
    };

    if mode != SubscriptionMode::Ltp && frame.len() >= QUOTE_FRAME_LEN {
        tick.volume = Some(read_i64(frame, 67).max(0) as u64);
        tick.ohlc = Some(Ohlc {
            open: paise(read_i64(frame, 91)),
            high: paise(read_i64(frame, 99)),
            low: paise(read_i64(frame, 107)),
            close: paise(read_i64(frame, 115)),
        });
    }

    Ok(tick)
}

fn read_i64(frame: &[u8], offset: usize) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&frame[offset..offset + 8]);
    i64::from_le_bytes(buf)
}

fn paise(value: i64) -> f64 {
    value as f64 / PAISE_PER_RUPEE
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a tick frame the way the feed does
    pub(crate) fn frame(mode: u8, exchange: u8, token: &str, ltp_paise: i64) -> Vec<u8> {
        let len = if mode == 1 { LTP_FRAME_LEN } else { QUOTE_FRAME_LEN };
        let mut buf = vec![0u8; len];
        buf[0] = mode;
        buf[1] = exchange;
        buf[2..2 + token.len()].copy_from_slice(token.as_bytes());
        buf[27..35].copy_from_slice(&7i64.to_le_bytes());
        buf[35..43].copy_from_slice(&1_700_000_000_000i64.to_le_bytes());
        buf[43..51].copy_from_slice(&ltp_paise.to_le_bytes());
        if mode != 1 {
            buf[67..75].copy_from_slice(&12_500i64.to_le_bytes());
            buf[91..99].copy_from_slice(&10_000i64.to_le_bytes());
            buf[99..107].copy_from_slice(&10_800i64.to_le_bytes());
            buf[107..115].copy_from_slice(&9_900i64.to_le_bytes());
            buf[115..123].copy_from_slice(&10_050i64.to_le_bytes());
        }
        buf
    }

    #[test]
    fn test_decode_ltp_frame() {
        let tick = decode_tick(&frame(1, 1, "3045", 10_725)).unwrap();
        assert_eq!(tick.exchange, Exchange::Nse);
        assert_eq!(tick.token, "3045");
        assert_eq!(tick.last_price, 107.25);
        assert_eq!(tick.sequence, 7);
        assert_eq!(tick.exchange_timestamp.timestamp_millis(), 1_700_000_000_000);
        assert!(tick.ohlc.is_none());
    }

    #[test]
    fn test_decode_quote_frame() {
        let tick = decode_tick(&frame(2, 2, "43210", 10_050)).unwrap();
        assert_eq!(tick.exchange, Exchange::Nfo);
        assert_eq!(tick.volume, Some(12_500));
        let ohlc = tick.ohlc.unwrap();
        assert_eq!(ohlc.high, 108.0);
        assert_eq!(ohlc.low, 99.0);
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        assert!(matches!(
            decode_tick(&[1, 1, 0]),
            Err(CodecError::TooShort { len: 3, .. })
        ));
        assert_eq!(
            decode_tick(&frame(1, 9, "1", 100)),
            Err(CodecError::UnknownExchange(9))
        );
        assert_eq!(
            decode_tick(&frame(7, 1, "1", 100)),
            Err(CodecError::UnknownMode(7))
        );
        assert_eq!(decode_tick(&frame(1, 1, "1", 0)), Err(CodecError::InvalidPrice(0)));
        assert_eq!(decode_tick(&frame(1, 1, "", 100)), Err(CodecError::InvalidToken));
    }

    #[test]
    fn test_encode_subscription_frame() {
        let groups = vec![
            TokenGroup::new(Exchange::Nse, vec!["3045".to_string(), "1594".to_string()]),
            TokenGroup::new(Exchange::Bse, vec![]),
        ];
        let encoded = encode_subscription(
            "abc123defg",
            SubscriptionAction::Subscribe,
            SubscriptionMode::Ltp,
            &groups,
        );
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["correlationID"], "abc123defg");
        assert_eq!(value["action"], 1);
        assert_eq!(value["params"]["mode"], 1);
        let list = value["params"]["tokenList"].as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["exchangeType"], 1);
        assert_eq!(list[0]["tokens"][1], "1594");
    }
}
