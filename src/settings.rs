use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::{
    ConnectionConfig, ConnectionError, SessionConfig, DEFAULT_ENDPOINT, DEFAULT_MODEL,
};
use crate::performance::PerformanceConfig;
use crate::session::write_atomic;
use crate::streaming::StreamingConfig;

const APP_DIR_NAME: &str = "live-translate";
const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub connection: ConnectionSettings,
    pub streaming: StreamingConfig,
    pub performance: PerformanceConfig,
}

/// Connection tuning persisted in settings.json (the credential never is)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Realtime endpoint; must be ws:// or wss://
    pub endpoint: String,

    pub model: String,

    /// Reconnect attempts after an unexpected close before giving up.
    pub max_reconnect_attempts: u32,

    /// First reconnect delay; doubles on each further attempt.
    pub reconnect_base_delay_ms: u64,

    pub connection_timeout_ms: u64,

    /// Session configuration sent in the handshake.
    pub session: SessionConfig,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 1000,
            connection_timeout_ms: 10_000,
            session: SessionConfig::translation(),
        }
    }
}

impl ConnectionSettings {
    /// Build a validated `ConnectionConfig` using `credential`
    pub fn to_config(&self, credential: &str) -> Result<ConnectionConfig, ConnectionError> {
        Ok(ConnectionConfig::new(&self.endpoint, credential, &self.model)?
            .with_reconnect(
                self.max_reconnect_attempts,
                Duration::from_millis(self.reconnect_base_delay_ms),
            )
            .with_connection_timeout(Duration::from_millis(self.connection_timeout_ms))
            .with_handshake(self.session.clone()))
    }
}

/// Default settings location under the user's config directory
pub fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or("Could not determine config directory")?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load settings from the default location
pub fn load_settings() -> Settings {
    match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            Settings::default()
        }
    }
}

/// Load settings from `path`; missing or unreadable files yield defaults
pub fn load_settings_from(path: &Path) -> Settings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<Settings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                Settings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Settings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            Settings::default()
        }
    }
}

pub fn save_settings(settings: &Settings) -> Result<(), String> {
    save_settings_to(&settings_path()?, settings)
}

/// Write settings atomically: temp file in the same directory, then rename
pub fn save_settings_to(path: &Path, settings: &Settings) -> Result<(), String> {
    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    write_atomic(path, &contents).map_err(|e| format!("Write settings {:?}: {}", path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "sk-test_0123456789abcdefghij";

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live-translate").join(SETTINGS_FILE_NAME);

        let mut settings = Settings::default();
        settings.streaming.chunk_size_ms = 40;
        settings.connection.max_reconnect_attempts = 2;
        settings.performance.max_memory_mb = 256;

        save_settings_to(&path, &settings).unwrap();
        assert_eq!(load_settings_from(&path), settings);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            load_settings_from(&dir.path().join("absent.json")),
            Settings::default()
        );
    }

    #[test]
    fn test_corrupt_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "{ this is not json").unwrap();

        assert_eq!(load_settings_from(&path), Settings::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{"streaming":{"chunk_size_ms":20}}"#).unwrap();

        let settings = load_settings_from(&path);
        assert_eq!(settings.streaming.chunk_size_ms, 20);
        assert_eq!(settings.streaming.sample_rate, 24000);
        assert_eq!(settings.connection, ConnectionSettings::default());
    }

    #[test]
    fn test_connection_settings_to_config() {
        let mut connection = ConnectionSettings::default();
        connection.max_reconnect_attempts = 3;
        connection.reconnect_base_delay_ms = 250;

        let config = connection.to_config(KEY).unwrap();
        assert_eq!(config.max_reconnect_attempts(), 3);
        assert_eq!(config.backoff_delay(3), Duration::from_secs(1));
        assert!(config.target_url().ends_with(&format!("?model={}", DEFAULT_MODEL)));

        connection.endpoint = "https://example.test".to_string();
        assert!(matches!(
            connection.to_config(KEY),
            Err(ConnectionError::Config(_))
        ));
    }
}
