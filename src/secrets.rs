//! Broker credential handling
//!
//! Session and feed tokens are issued out of band (TOTP login is not done here).
//! They are read from the environment into `Zeroizing<String>` so they are wiped
//! from memory on drop, and never printed by `Debug`.

use crate::domain::errors::EngineError;
use crate::domain::repositories::broker_client::FeedCredentials;
use std::env;
use tracing::{info, warn};
use zeroize::Zeroizing;

/// Error type for secret loading operations
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),

    #[error("Secret validation failed: {0}")]
    ValidationFailed(String),
}

impl From<SecretError> for EngineError {
    fn from(error: SecretError) -> Self {
        EngineError::InvalidConfiguration(error.to_string())
    }
}

/// Everything needed to call the REST API and open the stream
#[derive(Clone)]
pub struct BrokerCredentials {
    pub api_key: Zeroizing<String>,
    pub client_code: String,
    pub jwt_token: Zeroizing<String>,
    pub refresh_token: Zeroizing<String>,
    pub feed_token: Zeroizing<String>,
}

impl std::fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerCredentials")
            .field("client_code", &self.client_code)
            .finish_non_exhaustive()
    }
}

impl BrokerCredentials {
    /// Load credentials from `SMARTAPI_*` environment variables
    pub fn from_env() -> Result<Self, SecretError> {
        let api_key = load_from_env("SMARTAPI_API_KEY")?;
        validate_secret_strength(&api_key, 6)?;
        let client_code = load_from_env("SMARTAPI_CLIENT_CODE")?.to_string();
        let jwt_token = load_from_env("SMARTAPI_JWT")?;
        let feed_token = load_from_env("SMARTAPI_FEED_TOKEN")?;

        let refresh_token = match load_from_env("SMARTAPI_REFRESH_TOKEN") {
            Ok(token) => token,
            Err(_) => {
                warn!("SMARTAPI_REFRESH_TOKEN not set; session refresh will fail");
                Zeroizing::new(String::new())
            }
        };

        info!("✓ Loaded broker credentials for client {}", client_code);
        Ok(Self {
            api_key,
            client_code,
            jwt_token,
            refresh_token,
            feed_token,
        })
    }

    pub fn feed_credentials(&self) -> FeedCredentials {
        FeedCredentials {
            jwt_token: self.jwt_token.clone(),
            feed_token: self.feed_token.clone(),
            api_key: self.api_key.clone(),
            client_code: self.client_code.clone(),
        }
    }
}

/// Load a secret from environment variable (wrapped in Zeroizing)
fn load_from_env(env_var_name: &str) -> Result<Zeroizing<String>, SecretError> {
    let value = env::var(env_var_name)
        .map(Zeroizing::new)
        .map_err(|_| SecretError::EnvVarNotSet(env_var_name.to_string()))?;
    if value.trim().is_empty() {
        return Err(SecretError::ValidationFailed(format!(
            "{} is empty",
            env_var_name
        )));
    }
    Ok(value)
}

/// Validate that a secret meets minimum shape requirements
pub fn validate_secret_strength(secret: &str, min_length: usize) -> Result<(), SecretError> {
    if secret.len() < min_length {
        return Err(SecretError::ValidationFailed(format!(
            "Secret too short: {} characters (minimum: {})",
            secret.len(),
            min_length
        )));
    }
    if secret.chars().any(char::is_whitespace) {
        return Err(SecretError::ValidationFailed(
            "Secret contains whitespace".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_secret_strength() {
        assert!(validate_secret_strength("short", 32).is_err());
        assert!(validate_secret_strength("has space inside", 4).is_err());
        assert!(validate_secret_strength(&"a".repeat(32), 32).is_ok());
    }

    #[test]
    fn test_load_from_env() {
        env::set_var("TEST_SMARTAPI_SECRET", "feed_token_value");
        let result = load_from_env("TEST_SMARTAPI_SECRET");
        assert_eq!(*result.unwrap(), "feed_token_value");
        env::remove_var("TEST_SMARTAPI_SECRET");
    }

    #[test]
    fn test_load_from_env_missing_or_empty() {
        assert!(matches!(
            load_from_env("TEST_SMARTAPI_NONEXISTENT"),
            Err(SecretError::EnvVarNotSet(_))
        ));

        env::set_var("TEST_SMARTAPI_EMPTY", "  ");
        assert!(matches!(
            load_from_env("TEST_SMARTAPI_EMPTY"),
            Err(SecretError::ValidationFailed(_))
        ));
        env::remove_var("TEST_SMARTAPI_EMPTY");
    }

    #[test]
    fn test_debug_hides_tokens() {
        let creds = BrokerCredentials {
            api_key: Zeroizing::new("apikey123".into()),
            client_code: "A123".into(),
            jwt_token: Zeroizing::new("jwt-token".into()),
            refresh_token: Zeroizing::new("refresh-token".into()),
            feed_token: Zeroizing::new("feed-token".into()),
        };
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("A123"));
        assert!(!rendered.contains("token"));
        assert_eq!(creds.feed_credentials().client_code, "A123");
    }

    #[test]
    fn test_secret_error_is_critical_configuration() {
        let error: EngineError = SecretError::EnvVarNotSet("SMARTAPI_JWT".into()).into();
        assert!(error.is_critical());
    }
}
