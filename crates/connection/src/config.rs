//! Configuration for the connection engine.
//!
//! Settings load from TOML; every section and field is optional and falls
//! back to the defaults the devices are known to tolerate.

use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejected configuration values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("connect.timeout_secs must be between 1 and 300, got {0}")]
    InvalidConnectTimeout(u64),

    #[error("connect.max_attempts must be at least 1, got {0}")]
    InvalidMaxConnectionAttempts(u32),

    #[error("reconnect.max_attempts must be at most 100, got {0}")]
    InvalidMaxReconnectAttempts(u32),

    #[error("send.retries must be between 1 and 10, got {0}")]
    InvalidSendRetries(u32),

    #[error("errors.threshold must be at least 1, got {0}")]
    InvalidErrorThreshold(u32),

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Top-level configuration for one device connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Transport connect settings.
    pub connect: ConnectSettings,

    /// Reconnect policy after an unexpected drop.
    pub reconnect: ReconnectSettings,

    /// Outbound write retry settings.
    pub send: SendSettings,

    /// Recovered-error accounting.
    pub errors: ErrorSettings,

    /// Logging and payload dump options.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectSettings {
    /// Transport connect timeout in seconds.
    pub timeout_secs: u64,

    /// Connect calls allowed before giving up; the counter resets on
    /// authentication.
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectSettings {
    /// Reconnect automatically after an unexpected drop.
    pub enabled: bool,

    /// Reconnect rounds before giving up.
    pub max_attempts: u32,

    /// Delay before the first reconnect round, in seconds.
    pub initial_delay_secs: u64,

    /// Added to the delay for every further round, in seconds.
    pub delay_step_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SendSettings {
    /// Write retries after the first failed write.
    pub retries: u32,

    /// Retry `n` waits `n * retry_delay_step_ms`.
    pub retry_delay_step_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ErrorSettings {
    /// Recovered errors tolerated on one link before it is dropped.
    pub threshold: u32,
}

/// Logging options. The dump flags add hex dumps at debug level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing level when `RUST_LOG` is unset.
    pub level: String,

    /// Log handshake steps and connection internals.
    pub connection_debug: bool,

    /// Dump raw frames as received from and written to the transport.
    pub encrypted_payloads: bool,

    /// Dump decrypted packet bytes.
    pub decrypted_payloads: bool,

    /// Log every decoded packet header.
    pub packets: bool,
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            max_attempts: 10,
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 2,
            initial_delay_secs: 10,
            delay_step_secs: 10,
        }
    }
}

impl Default for SendSettings {
    fn default() -> Self {
        Self {
            retries: 4,
            retry_delay_step_ms: 1000,
        }
    }
}

impl Default for ErrorSettings {
    fn default() -> Self {
        Self { threshold: 5 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            connection_debug: false,
            encrypted_payloads: false,
            decrypted_payloads: false,
            packets: false,
        }
    }
}

impl ConnectionConfig {
    /// Sets the transport connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect.timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Sets the connect attempt limit.
    pub fn max_connection_attempts(mut self, attempts: u32) -> Self {
        self.connect.max_attempts = attempts;
        self
    }

    /// Enables or disables automatic reconnect.
    pub fn reconnect_enabled(mut self, enabled: bool) -> Self {
        self.reconnect.enabled = enabled;
        self
    }

    /// Sets the reconnect round limit.
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect.max_attempts = attempts;
        self
    }

    /// Sets the recovered-error threshold.
    pub fn error_threshold(mut self, threshold: u32) -> Self {
        self.errors.threshold = threshold;
        self
    }

    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connect.timeout_secs)
    }

    pub fn reconnect_initial_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect.initial_delay_secs)
    }

    pub fn reconnect_delay_step(&self) -> Duration {
        Duration::from_secs(self.reconnect.delay_step_secs)
    }

    pub fn send_retry_delay_step(&self) -> Duration {
        Duration::from_millis(self.send.retry_delay_step_ms)
    }

    /// Overlay `EFBLE_*` environment variables.
    ///
    /// `EFBLE_LOG_LEVEL`, `EFBLE_RECONNECT_ENABLED` and
    /// `EFBLE_CONNECT_TIMEOUT_SECS` are read. Empty values are skipped and
    /// unparsable ones are logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(level) = env_value("EFBLE_LOG_LEVEL") {
            tracing::info!(%level, "log level taken from environment");
            self.logging.level = level;
        }
        if let Some(enabled) = env_parsed::<bool>("EFBLE_RECONNECT_ENABLED") {
            tracing::info!(enabled, "reconnect.enabled taken from environment");
            self.reconnect.enabled = enabled;
        }
        if let Some(secs) = env_parsed::<u64>("EFBLE_CONNECT_TIMEOUT_SECS") {
            tracing::info!(secs, "connect.timeout_secs taken from environment");
            self.connect.timeout_secs = secs;
        }
    }

    /// Check every field against its accepted range.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.connect.timeout_secs == 0 || self.connect.timeout_secs > 300 {
            return Err(ConfigError::InvalidConnectTimeout(self.connect.timeout_secs));
        }

        if self.connect.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxConnectionAttempts(
                self.connect.max_attempts,
            ));
        }

        if self.reconnect.max_attempts > 100 {
            return Err(ConfigError::InvalidMaxReconnectAttempts(
                self.reconnect.max_attempts,
            ));
        }

        if self.send.retries == 0 || self.send.retries > 10 {
            return Err(ConfigError::InvalidSendRetries(self.send.retries));
        }

        if self.errors.threshold == 0 {
            return Err(ConfigError::InvalidErrorThreshold(self.errors.threshold));
        }

        let level = self.logging.level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Read settings from `path`. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text)
                .with_context(|| format!("config at {} is not usable", path.display())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("cannot read config at {}", path.display()))),
        }
    }

    /// Parse and validate settings.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|err| {
            let location = err
                .span()
                .map(|span| format!(" (bytes {}..{})", span.start, span.end))
                .unwrap_or_default();
            anyhow::anyhow!("Invalid TOML configuration: {}{}", err.message(), location)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write settings to `path`, creating missing directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("cannot create {}", dir.display()))?;
        }
        fs::write(path, self.to_toml()?)
            .with_context(|| format!("cannot write config at {}", path.display()))?;
        tracing::debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("config does not serialize to TOML")
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_parsed<T: FromStr>(name: &str) -> Option<T> {
    let value = env_value(name)?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(name, %value, "ignoring unparsable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = ConnectionConfig::default();

        assert_eq!(config.connect.timeout_secs, 20);
        assert_eq!(config.connect.max_attempts, 10);
        assert!(config.reconnect.enabled);
        assert_eq!(config.reconnect.max_attempts, 2);
        assert_eq!(config.reconnect.initial_delay_secs, 10);
        assert_eq!(config.reconnect.delay_step_secs, 10);
        assert_eq!(config.send.retries, 4);
        assert_eq!(config.send.retry_delay_step_ms, 1000);
        assert_eq!(config.errors.threshold, 5);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.encrypted_payloads);
    }

    #[test]
    fn test_duration_accessors() {
        let config = ConnectionConfig::default();
        assert_eq!(config.connect_timeout_duration(), Duration::from_secs(20));
        assert_eq!(config.reconnect_initial_delay(), Duration::from_secs(10));
        assert_eq!(config.reconnect_delay_step(), Duration::from_secs(10));
        assert_eq!(config.send_retry_delay_step(), Duration::from_secs(1));
    }

    #[test]
    fn test_builder_setters() {
        let config = ConnectionConfig::default()
            .connect_timeout(Duration::from_secs(5))
            .max_connection_attempts(3)
            .reconnect_enabled(false)
            .max_reconnect_attempts(1)
            .error_threshold(9);

        assert_eq!(config.connect.timeout_secs, 5);
        assert_eq!(config.connect.max_attempts, 3);
        assert!(!config.reconnect.enabled);
        assert_eq!(config.reconnect.max_attempts, 1);
        assert_eq!(config.errors.threshold, 9);
    }

    #[test]
    fn test_from_toml_empty() {
        let config = ConnectionConfig::from_toml("").unwrap();
        assert_eq!(config, ConnectionConfig::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[reconnect]
enabled = false

[logging]
level = "debug"
decrypted_payloads = true
"#;
        let config = ConnectionConfig::from_toml(toml).unwrap();

        assert!(!config.reconnect.enabled);
        assert_eq!(config.reconnect.max_attempts, 2);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.decrypted_payloads);
        assert_eq!(config.connect, ConnectSettings::default());
    }

    #[test]
    fn test_from_toml_invalid() {
        let err = ConnectionConfig::from_toml("[connect\ntimeout_secs = 1").unwrap_err();
        assert!(err.to_string().contains("Invalid TOML configuration"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let err = ConnectionConfig::from_toml("[send]\nretries = \"four\"").unwrap_err();
        assert!(err.to_string().contains("Invalid TOML configuration"));
    }

    #[test]
    fn test_from_toml_rejects_out_of_range_values() {
        let err = ConnectionConfig::from_toml("[errors]\nthreshold = 0").unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::InvalidErrorThreshold(0))
        );

        let err = ConnectionConfig::from_toml("[send]\nretries = 0").unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::InvalidSendRetries(0))
        );
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("connection.toml");
        fs::write(&path, "[connect]\nmax_attempts = 0\n").unwrap();

        let err = ConnectionConfig::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("connect.max_attempts"));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = ConnectionConfig::load(dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, ConnectionConfig::default());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("connection.toml");

        let config = ConnectionConfig::default()
            .max_reconnect_attempts(4)
            .error_threshold(8);
        config.save(&path).unwrap();

        let loaded = ConnectionConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_invalid_file_mentions_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "not = [valid").unwrap();

        let err = ConnectionConfig::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("broken.toml"));
    }

    #[test]
    fn test_validate_default_config() {
        assert!(ConnectionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_connect_timeout() {
        let mut config = ConnectionConfig::default();
        config.connect.timeout_secs = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidConnectTimeout(0))
        );
        config.connect.timeout_secs = 301;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidConnectTimeout(301))
        );
    }

    #[test]
    fn test_validate_attempt_limits() {
        let config = ConnectionConfig::default().max_connection_attempts(0);
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidMaxConnectionAttempts(0))
        );

        let config = ConnectionConfig::default().max_reconnect_attempts(101);
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidMaxReconnectAttempts(101))
        );

        let config = ConnectionConfig::default().max_reconnect_attempts(0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_send_retries() {
        let mut config = ConnectionConfig::default();
        config.send.retries = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidSendRetries(0)));
    }

    #[test]
    fn test_validate_error_threshold() {
        let config = ConnectionConfig::default().error_threshold(0);
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidErrorThreshold(0))
        );
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = ConnectionConfig::default();
        config.logging.level = "WARN".to_string();
        assert!(config.validate().is_ok());

        config.logging.level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::set_var("EFBLE_LOG_LEVEL", "trace");
        let mut config = ConnectionConfig::default();
        config.apply_env_overrides();
        std::env::remove_var("EFBLE_LOG_LEVEL");

        assert_eq!(config.logging.level, "trace");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("EFBLE_LOG_LEVEL", "");
        let mut config = ConnectionConfig::default();
        config.apply_env_overrides();
        std::env::remove_var("EFBLE_LOG_LEVEL");

        assert_eq!(config.logging.level, "info");
    }

    #[test]
    #[serial]
    fn test_env_override_reconnect_enabled() {
        std::env::set_var("EFBLE_RECONNECT_ENABLED", "false");
        let mut config = ConnectionConfig::default();
        config.apply_env_overrides();
        std::env::remove_var("EFBLE_RECONNECT_ENABLED");

        assert!(!config.reconnect.enabled);
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_values_ignored() {
        std::env::set_var("EFBLE_RECONNECT_ENABLED", "maybe");
        std::env::set_var("EFBLE_CONNECT_TIMEOUT_SECS", "soon");
        let mut config = ConnectionConfig::default();
        config.apply_env_overrides();
        std::env::remove_var("EFBLE_RECONNECT_ENABLED");
        std::env::remove_var("EFBLE_CONNECT_TIMEOUT_SECS");

        assert_eq!(config, ConnectionConfig::default());
    }

    #[test]
    #[serial]
    fn test_env_override_connect_timeout() {
        std::env::set_var("EFBLE_CONNECT_TIMEOUT_SECS", "45");
        let mut config = ConnectionConfig::default();
        config.apply_env_overrides();
        std::env::remove_var("EFBLE_CONNECT_TIMEOUT_SECS");

        assert_eq!(config.connect.timeout_secs, 45);
    }
}
