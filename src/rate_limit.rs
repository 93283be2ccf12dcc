use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::domain::errors::EngineError;

/// Rate limiter configuration
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    /// Sustained requests per second
    pub requests_per_second: u32,
    /// Requests allowed back-to-back before pacing kicks in
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10, // SmartAPI order endpoints allow ~10/s
            burst: 10,
        }
    }
}

/// Shared rate limiter
pub type GlobalRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// Create a new rate limiter
pub fn create_rate_limiter(config: RateLimiterConfig) -> Result<GlobalRateLimiter, EngineError> {
    let rate = NonZeroU32::new(config.requests_per_second).ok_or_else(|| {
        EngineError::InvalidConfiguration("requests per second must be non-zero".to_string())
    })?;
    let burst = NonZeroU32::new(config.burst.max(1)).unwrap_or(rate);
    let quota = Quota::per_second(rate).allow_burst(burst);
    Ok(Arc::new(RateLimiter::direct(quota)))
}

/// Middleware to apply rate limiting to the status surface
pub async fn rate_limit_middleware(
    State(limiter): State<GlobalRateLimiter>,
    request: Request,
    next: Next,
) -> Response {
    if limiter.check().is_err() {
        tracing::warn!(
            "Status request throttled: {} {}",
            request.method(),
            request.uri().path()
        );
        return (StatusCode::TOO_MANY_REQUESTS, "Too many requests, retry shortly").into_response();
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_creation() {
        let config = RateLimiterConfig {
            requests_per_second: 5,
            burst: 2,
        };
        let limiter = create_rate_limiter(config).unwrap();

        // Burst of two, then refused until the next slot
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());
    }

    #[test]
    fn test_zero_rate_rejected() {
        let config = RateLimiterConfig {
            requests_per_second: 0,
            burst: 1,
        };
        assert!(matches!(
            create_rate_limiter(config),
            Err(EngineError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_default_config() {
        let config = RateLimiterConfig::default();
        assert_eq!(config.requests_per_second, 10);
    }
}
