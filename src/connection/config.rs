//! Connection configuration, validated at construction

use std::time::Duration;

use super::protocol::SessionConfig;
use super::ConnectionError;

/// Default realtime endpoint (model is appended as a query parameter)
pub const DEFAULT_ENDPOINT: &str = "wss://api.openai.com/v1/realtime";

/// Default remote model
pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview-2024-12-17";

/// Timeout for establishing the WebSocket
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum reconnect attempts after an unexpected close
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Base delay for exponential backoff (doubles each attempt)
const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Minimum length of the credential body after the `sk-` prefix
const MIN_CREDENTIAL_BODY_LEN: usize = 20;

/// Connection parameters
///
/// Construction validates everything; once handed to a `ConnectionManager`
/// the config is never mutated.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    endpoint: String,
    credential: String,
    model: String,
    max_reconnect_attempts: u32,
    reconnect_base_delay: Duration,
    connection_timeout: Duration,
    handshake: SessionConfig,
}

impl ConnectionConfig {
    /// Validate and build a config with default retry/timeout tuning
    ///
    /// # Errors
    /// * `Config` - endpoint or model missing, endpoint not ws:// or wss://,
    ///   model id not safe to embed in a query string
    /// * `Authentication` - credential missing the `sk-` shape
    pub fn new(
        endpoint: impl Into<String>,
        credential: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, ConnectionError> {
        let endpoint = endpoint.into().trim().to_string();
        let credential = credential.into().trim().to_string();
        let model = model.into().trim().to_string();

        if endpoint.is_empty() {
            return Err(ConnectionError::Config("endpoint is required".to_string()));
        }
        if !(endpoint.starts_with("wss://") || endpoint.starts_with("ws://")) {
            return Err(ConnectionError::Config(format!(
                "endpoint must be a ws:// or wss:// URL, got {:?}",
                endpoint
            )));
        }
        if model.is_empty() {
            return Err(ConnectionError::Config("model is required".to_string()));
        }
        if !model
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
        {
            return Err(ConnectionError::Config(format!(
                "model id {:?} may only contain letters, digits, '-', '_', '.' and ':'",
                model
            )));
        }
        if credential.is_empty() {
            return Err(ConnectionError::Config("credential is required".to_string()));
        }
        validate_credential(&credential)?;

        Ok(Self {
            endpoint,
            credential,
            model,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay: DEFAULT_RECONNECT_BASE_DELAY,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            handshake: SessionConfig::translation(),
        })
    }

    pub fn with_reconnect(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.max_reconnect_attempts = max_attempts;
        self.reconnect_base_delay = base_delay;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Session configuration sent as the handshake after every connect
    pub fn with_handshake(mut self, handshake: SessionConfig) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn max_reconnect_attempts(&self) -> u32 {
        self.max_reconnect_attempts
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        self.reconnect_base_delay
    }

    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    pub fn handshake(&self) -> &SessionConfig {
        &self.handshake
    }

    /// Endpoint with the model embedded as a query parameter
    pub fn target_url(&self) -> String {
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}model={}", self.endpoint, separator, self.model)
    }

    /// Delay before reconnect attempt `attempt` (1-based): base × 2^(attempt−1)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.reconnect_base_delay.saturating_mul(1u32 << exponent)
    }
}

fn validate_credential(credential: &str) -> Result<(), ConnectionError> {
    let body = credential.strip_prefix("sk-").ok_or_else(|| {
        ConnectionError::Authentication("credential must start with \"sk-\"".to_string())
    })?;

    if body.len() < MIN_CREDENTIAL_BODY_LEN {
        return Err(ConnectionError::Authentication(
            "credential is too short".to_string(),
        ));
    }
    if !body
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ConnectionError::Authentication(
            "credential contains invalid characters".to_string(),
        ));
    }
    Ok(())
}

/// Get the API key from environment
pub fn get_api_key() -> Option<String> {
    std::env::var("OPENAI_API_KEY")
        .ok()
        .filter(|k| !k.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "sk-test_0123456789abcdefghij";

    #[test]
    fn test_valid_config_defaults() {
        let config = ConnectionConfig::new(DEFAULT_ENDPOINT, KEY, DEFAULT_MODEL).unwrap();

        assert_eq!(config.max_reconnect_attempts(), 5);
        assert_eq!(config.reconnect_base_delay(), Duration::from_secs(1));
        assert_eq!(config.connection_timeout(), Duration::from_secs(10));
        assert_eq!(
            config.target_url(),
            "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview-2024-12-17"
        );
    }

    #[test]
    fn test_target_url_with_existing_query() {
        let config =
            ConnectionConfig::new("wss://example.test/rt?region=eu", KEY, "m1").unwrap();
        assert_eq!(config.target_url(), "wss://example.test/rt?region=eu&model=m1");
    }

    #[test]
    fn test_missing_fields_are_config_errors() {
        assert!(matches!(
            ConnectionConfig::new("", KEY, "m"),
            Err(ConnectionError::Config(_))
        ));
        assert!(matches!(
            ConnectionConfig::new("https://example.test", KEY, "m"),
            Err(ConnectionError::Config(_))
        ));
        assert!(matches!(
            ConnectionConfig::new(DEFAULT_ENDPOINT, KEY, "  "),
            Err(ConnectionError::Config(_))
        ));
        assert!(matches!(
            ConnectionConfig::new(DEFAULT_ENDPOINT, "", "m"),
            Err(ConnectionError::Config(_))
        ));
    }

    #[test]
    fn test_model_ids_that_break_the_query_are_rejected() {
        for bad in ["gpt&x=1", "gpt#frag", "gpt 4o", "gpt/../x"] {
            assert!(
                matches!(
                    ConnectionConfig::new(DEFAULT_ENDPOINT, KEY, bad),
                    Err(ConnectionError::Config(_))
                ),
                "{} should be rejected",
                bad
            );
        }

        let config = ConnectionConfig::new(DEFAULT_ENDPOINT, KEY, "ft:gpt-4o.v2_x").unwrap();
        assert!(config.target_url().ends_with("?model=ft:gpt-4o.v2_x"));
    }

    #[test]
    fn test_malformed_credentials_are_auth_errors() {
        for bad in ["pk-0123456789abcdefghijkl", "sk-short", "sk-0123456789 abcdefghijkl"] {
            assert!(
                matches!(
                    ConnectionConfig::new(DEFAULT_ENDPOINT, bad, DEFAULT_MODEL),
                    Err(ConnectionError::Authentication(_))
                ),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let config = ConnectionConfig::new(DEFAULT_ENDPOINT, KEY, DEFAULT_MODEL)
            .unwrap()
            .with_reconnect(5, Duration::from_millis(100));

        assert_eq!(config.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(config.backoff_delay(4), Duration::from_millis(800));
    }

    #[test]
    fn test_get_api_key_does_not_panic() {
        let _ = get_api_key();
    }
}
