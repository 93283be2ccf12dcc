use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result alias used at every broker, stream and store seam
pub type EngineResult<T> = Result<T, EngineError>;

/// Broker error codes that mean the session itself is gone
const SESSION_ERROR_CODES: &[&str] = &[
    "AG8001", // Invalid token
    "AG8002", // Token expired
    "AG8003", // Token missing
    "AB1010", // Session expired
    "AB1011", // Client not logged in
    "AB8050", // Invalid refresh token
    "AB8051", // Refresh token expired
];

/// How bad a failure is, and therefore what the caller must do about it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Cannot self-heal: stop the engine
    Critical,
    /// Transient: retry with backoff
    Recoverable,
    /// Degraded but survivable: log and continue
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Critical => write!(f, "CRITICAL"),
            Severity::Recoverable => write!(f, "RECOVERABLE"),
            Severity::Warning => write!(f, "WARNING"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Session,
    Configuration,
    State,
    Network,
    Timeout,
    RateLimit,
    OrderRejected,
    Stream,
    Data,
    Persistence,
    Validation,
    Unknown,
}

/// Every failure the broker API, the market stream or the store can surface
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("Invalid session: {0}")]
    InvalidSession(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Corrupted state: {0}")]
    CorruptedState(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Broker error {code}: {message}")]
    Broker { code: String, message: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Stream disconnected: {0}")]
    StreamDisconnected(String),

    #[error("Slow fetch: {0}")]
    SlowFetch(String),

    #[error("Missing data: {0}")]
    MissingData(String),

    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Map an error to its severity and category.
    ///
    /// Unclassified errors fail closed as Critical.
    pub fn classify(&self) -> (Severity, ErrorCategory) {
        match self {
            EngineError::InvalidSession(_) => (Severity::Critical, ErrorCategory::Session),
            EngineError::InvalidConfiguration(_) => {
                (Severity::Critical, ErrorCategory::Configuration)
            }
            EngineError::CorruptedState(_) => (Severity::Critical, ErrorCategory::State),
            EngineError::Network(_) => (Severity::Recoverable, ErrorCategory::Network),
            EngineError::Timeout(_) => (Severity::Recoverable, ErrorCategory::Timeout),
            EngineError::RateLimited(_) => (Severity::Recoverable, ErrorCategory::RateLimit),
            EngineError::Broker { code, .. } => {
                if SESSION_ERROR_CODES.contains(&code.as_str()) {
                    (Severity::Critical, ErrorCategory::Session)
                } else {
                    (Severity::Warning, ErrorCategory::OrderRejected)
                }
            }
            EngineError::MalformedResponse(_) => (Severity::Recoverable, ErrorCategory::Data),
            EngineError::StreamDisconnected(_) => (Severity::Recoverable, ErrorCategory::Stream),
            EngineError::SlowFetch(_) => (Severity::Warning, ErrorCategory::Network),
            EngineError::MissingData(_) => (Severity::Warning, ErrorCategory::Data),
            EngineError::Persistence(_) => (Severity::Warning, ErrorCategory::Persistence),
            EngineError::InvalidSignal(_) => (Severity::Warning, ErrorCategory::Validation),
            EngineError::Other(_) => (Severity::Critical, ErrorCategory::Unknown),
        }
    }

    pub fn severity(&self) -> Severity {
        self.classify().0
    }

    pub fn is_critical(&self) -> bool {
        self.severity() == Severity::Critical
    }

    /// Build an error from a broker `status:false` envelope
    pub fn from_broker(code: &str, message: &str) -> Self {
        if message.to_lowercase().contains("access rate") {
            return EngineError::RateLimited(message.to_string());
        }
        if code.is_empty() {
            return EngineError::Broker {
                code: "UNKNOWN".to_string(),
                message: message.to_string(),
            };
        }
        EngineError::Broker {
            code: code.to_string(),
            message: message.to_string(),
        }
    }
}

/// Errors raised by the position book when an operation would break its invariants
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PositionError {
    #[error("Position already open for {0}")]
    AlreadyOpen(String),

    #[error("No open position for {0}")]
    NotFound(String),

    #[error("Invalid levels for {symbol}: {reason}")]
    InvalidLevels { symbol: String, reason: String },

    #[error("Stop-loss {proposed:.2} for {symbol} would loosen current stop {current:.2}")]
    StopLossLoosened {
        symbol: String,
        current: f64,
        proposed: f64,
    },

    #[error("Position {symbol} is {status}, expected OPEN")]
    InvalidStatus { symbol: String, status: String },

    #[error("Position book lock poisoned")]
    LockPoisoned,
}

impl From<PositionError> for EngineError {
    fn from(error: PositionError) -> Self {
        match error {
            PositionError::LockPoisoned => EngineError::CorruptedState(error.to_string()),
            other => EngineError::InvalidSignal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_failures_are_critical() {
        let error = EngineError::InvalidSession("expired".to_string());
        assert_eq!(error.classify(), (Severity::Critical, ErrorCategory::Session));

        let error = EngineError::from_broker("AG8002", "Token expired");
        assert_eq!(error.severity(), Severity::Critical);
    }

    #[test]
    fn test_transient_failures_are_recoverable() {
        assert_eq!(
            EngineError::Timeout(Duration::from_secs(5)).severity(),
            Severity::Recoverable
        );
        assert_eq!(
            EngineError::Network("connection reset".to_string()).severity(),
            Severity::Recoverable
        );
        let error = EngineError::from_broker("", "Access denied because of exceeding access rate");
        assert!(matches!(error, EngineError::RateLimited(_)));
        assert_eq!(error.severity(), Severity::Recoverable);
    }

    #[test]
    fn test_degraded_conditions_are_warnings() {
        assert_eq!(
            EngineError::MissingData("one candle".to_string()).severity(),
            Severity::Warning
        );
        assert_eq!(
            EngineError::Persistence("disk full".to_string()).severity(),
            Severity::Warning
        );
        let rejection = EngineError::from_broker("AB4008", "Order rejected by RMS");
        assert_eq!(rejection.classify().1, ErrorCategory::OrderRejected);
        assert_eq!(rejection.severity(), Severity::Warning);
    }

    #[test]
    fn test_unknown_errors_fail_closed() {
        let error = EngineError::Other("something odd".to_string());
        assert_eq!(error.classify(), (Severity::Critical, ErrorCategory::Unknown));
    }

    #[test]
    fn test_position_error_display() {
        let error = PositionError::StopLossLoosened {
            symbol: "SBIN-EQ".to_string(),
            current: 98.0,
            proposed: 97.5,
        };
        assert_eq!(
            error.to_string(),
            "Stop-loss 97.50 for SBIN-EQ would loosen current stop 98.00"
        );
    }
}
