use crate::domain::errors::EngineError;
use crate::domain::services::error_handler::RetryPolicy;
use crate::domain::services::exit_rules::ExitRules;
use crate::domain::services::order_throttle::{ThrottleConfig, DEFAULT_WARNING_FRACTION};
use chrono::NaiveTime;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration for one engine instance (one trading account)
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub account_id: String,
    pub smartapi_base_url: String,
    pub smartstream_url: String,
    pub http_timeout_ms: u64,
    pub broker_requests_per_second: u32,

    // Retry policy
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub error_buffer_capacity: usize,

    // OTR compliance
    pub otr_threshold: f64,
    pub throttle_cooldown_secs: u64,

    // Exits
    pub scan_interval_secs: u64,
    pub square_off_time: NaiveTime, // Exchange-local (Asia/Kolkata)
    pub trailing_stop_pct: f64,
    pub tick_size: f64,

    // Entries
    pub min_signal_confidence: f64,
    pub fill_poll_attempts: u32,
    pub fill_poll_interval_ms: u64,
    pub tick_queue_capacity: usize,

    pub database_url: String,
    pub status_addr: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            account_id: "default".to_string(),
            smartapi_base_url: "https://apiconnect.angelone.in".to_string(),
            smartstream_url: "wss://smartapisocket.angelone.in/smart-stream".to_string(),
            http_timeout_ms: 10_000,
            broker_requests_per_second: 10,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            error_buffer_capacity: 100,
            otr_threshold: 20.0,
            throttle_cooldown_secs: 300, // 5 minute cooldown
            scan_interval_secs: 300,     // Scan every 5 minutes
            square_off_time: NaiveTime::from_hms_opt(15, 15, 0).unwrap_or(NaiveTime::MIN),
            trailing_stop_pct: 0.01,
            tick_size: 0.05,
            min_signal_confidence: 0.6,
            fill_poll_attempts: 10,
            fill_poll_interval_ms: 500,
            tick_queue_capacity: 1024,
            database_url: "sqlite://intraday_engine.db".to_string(),
            status_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Invalid values are logged and the default is kept.
    pub fn from_env() -> EngineConfig {
        let mut config = EngineConfig::default();

        if let Ok(account_id) = std::env::var("ACCOUNT_ID") {
            if !account_id.trim().is_empty() {
                config.account_id = account_id.trim().to_string();
            }
        }
        if let Ok(url) = std::env::var("SMARTAPI_BASE_URL") {
            config.smartapi_base_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(url) = std::env::var("SMARTSTREAM_URL") {
            config.smartstream_url = url;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(addr) = std::env::var("STATUS_ADDR") {
            config.status_addr = addr;
        }

        override_from_env("HTTP_TIMEOUT_MS", &mut config.http_timeout_ms, |v| {
            (100..=120_000).contains(v)
        });
        override_from_env(
            "BROKER_REQUESTS_PER_SECOND",
            &mut config.broker_requests_per_second,
            |v| (1..=100).contains(v),
        );
        override_from_env("MAX_RETRIES", &mut config.max_retries, |v| *v <= 10);
        override_from_env("RETRY_BASE_DELAY_MS", &mut config.retry_base_delay_ms, |v| {
            (1..=60_000).contains(v)
        });
        override_from_env("RETRY_MAX_DELAY_MS", &mut config.retry_max_delay_ms, |v| {
            (1..=600_000).contains(v)
        });
        override_from_env("ERROR_BUFFER_CAPACITY", &mut config.error_buffer_capacity, |v| {
            (1..=10_000).contains(v)
        });
        override_from_env("OTR_THRESHOLD", &mut config.otr_threshold, |v| {
            *v > 1.0 && *v <= 1_000.0
        });
        override_from_env(
            "THROTTLE_COOLDOWN_SECS",
            &mut config.throttle_cooldown_secs,
            |v| (1..=3_600).contains(v),
        );
        override_from_env("SCAN_INTERVAL_SECS", &mut config.scan_interval_secs, |v| {
            (1..=3_600).contains(v)
        });
        override_from_env("TRAILING_STOP_PCT", &mut config.trailing_stop_pct, |v| {
            (0.0..0.5).contains(v)
        });
        override_from_env("TICK_SIZE", &mut config.tick_size, |v| *v > 0.0 && *v <= 10.0);
        override_from_env(
            "MIN_SIGNAL_CONFIDENCE",
            &mut config.min_signal_confidence,
            |v| (0.0..=1.0).contains(v),
        );
        override_from_env("FILL_POLL_ATTEMPTS", &mut config.fill_poll_attempts, |v| {
            (1..=120).contains(v)
        });
        override_from_env(
            "FILL_POLL_INTERVAL_MS",
            &mut config.fill_poll_interval_ms,
            |v| (10..=10_000).contains(v),
        );
        override_from_env("TICK_QUEUE_CAPACITY", &mut config.tick_queue_capacity, |v| {
            (16..=1_000_000).contains(v)
        });

        if let Ok(time) = std::env::var("SQUARE_OFF_TIME") {
            match NaiveTime::parse_from_str(time.trim(), "%H:%M") {
                Ok(value) => config.square_off_time = value,
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse SQUARE_OFF_TIME '{}': {} (expected HH:MM), using default: {}",
                        time,
                        e,
                        config.square_off_time
                    );
                }
            }
        }

        config
    }

    /// Reject settings that cannot work together
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.account_id.trim().is_empty() {
            return Err(EngineError::InvalidConfiguration(
                "ACCOUNT_ID must not be empty".to_string(),
            ));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(EngineError::InvalidConfiguration(format!(
                "RETRY_BASE_DELAY_MS ({}) exceeds RETRY_MAX_DELAY_MS ({})",
                self.retry_base_delay_ms, self.retry_max_delay_ms
            )));
        }
        if self.otr_threshold <= 0.0 || self.tick_size <= 0.0 {
            return Err(EngineError::InvalidConfiguration(
                "OTR_THRESHOLD and TICK_SIZE must be positive".to_string(),
            ));
        }
        for (key, value) in [
            ("SMARTAPI_BASE_URL", &self.smartapi_base_url),
            ("SMARTSTREAM_URL", &self.smartstream_url),
        ] {
            url::Url::parse(value).map_err(|e| {
                EngineError::InvalidConfiguration(format!("{} '{}' is invalid: {}", key, value, e))
            })?;
        }
        self.status_socket_addr()?;
        Ok(())
    }

    pub fn status_socket_addr(&self) -> Result<SocketAddr, EngineError> {
        self.status_addr.parse().map_err(|e| {
            EngineError::InvalidConfiguration(format!(
                "STATUS_ADDR '{}' is invalid: {}",
                self.status_addr, e
            ))
        })
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn throttle_config(&self) -> ThrottleConfig {
        ThrottleConfig {
            threshold: self.otr_threshold,
            warning_fraction: DEFAULT_WARNING_FRACTION,
            cooldown: Duration::from_secs(self.throttle_cooldown_secs),
        }
    }

    pub fn exit_rules(&self) -> ExitRules {
        ExitRules {
            trailing_stop_pct: self.trailing_stop_pct,
            tick_size: self.tick_size,
            square_off: self.square_off_time,
        }
    }
}

/// Replace `target` with the parsed env value when it passes `valid`
fn override_from_env<T>(key: &str, target: &mut T, valid: impl Fn(&T) -> bool)
where
    T: FromStr + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    let Ok(raw) = std::env::var(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => *target = value,
        Ok(value) => {
            tracing::warn!(
                "Invalid {} value: {} (out of range), using default: {}",
                key,
                value,
                target
            );
        }
        Err(e) => {
            tracing::warn!(
                "Failed to parse {} '{}': {}, using default: {}",
                key,
                raw,
                e,
                target
            );
        }
    }
}
