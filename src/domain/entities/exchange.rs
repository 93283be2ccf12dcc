use serde::{Deserialize, Serialize};

/// Exchange segment an instrument trades on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Exchange {
    Nse,
    Bse,
    Nfo,
    Bfo,
    Mcx,
    Cds,
}

impl Exchange {
    /// Segment name used by the REST API
    pub fn name(&self) -> &'static str {
        match self {
            Exchange::Nse => "NSE",
            Exchange::Bse => "BSE",
            Exchange::Nfo => "NFO",
            Exchange::Bfo => "BFO",
            Exchange::Mcx => "MCX",
            Exchange::Cds => "CDS",
        }
    }

    /// Numeric exchange type used by the streaming feed
    pub fn feed_code(&self) -> u8 {
        match self {
            Exchange::Nse => 1,
            Exchange::Nfo => 2,
            Exchange::Bse => 3,
            Exchange::Bfo => 4,
            Exchange::Mcx => 5,
            Exchange::Cds => 13,
        }
    }

    pub fn from_feed_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Exchange::Nse),
            2 => Some(Exchange::Nfo),
            3 => Some(Exchange::Bse),
            4 => Some(Exchange::Bfo),
            5 => Some(Exchange::Mcx),
            13 => Some(Exchange::Cds),
            _ => None,
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A tradable instrument: exchange segment plus the broker's numeric token
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    pub exchange: Exchange,
    pub token: String,
    pub trading_symbol: String,
}

impl Instrument {
    pub fn new(exchange: Exchange, token: &str, trading_symbol: &str) -> Self {
        Self {
            exchange,
            token: token.to_string(),
            trading_symbol: trading_symbol.to_string(),
        }
    }

    /// Key used to route feed ticks back to a symbol
    pub fn feed_key(&self) -> (Exchange, String) {
        (self.exchange, self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_name() {
        assert_eq!(Exchange::Nse.name(), "NSE");
        assert_eq!(Exchange::Mcx.to_string(), "MCX");
    }

    #[test]
    fn test_feed_code_mapping_is_reversible() {
        for exchange in [
            Exchange::Nse,
            Exchange::Bse,
            Exchange::Nfo,
            Exchange::Bfo,
            Exchange::Mcx,
            Exchange::Cds,
        ] {
            assert_eq!(Exchange::from_feed_code(exchange.feed_code()), Some(exchange));
        }
        assert_eq!(Exchange::from_feed_code(99), None);
    }

    #[test]
    fn test_exchange_serde_uses_api_names() {
        let json = serde_json::to_string(&Exchange::Nfo).unwrap();
        assert_eq!(json, "\"NFO\"");
        let parsed: Exchange = serde_json::from_str("\"BSE\"").unwrap();
        assert_eq!(parsed, Exchange::Bse);
    }
}
