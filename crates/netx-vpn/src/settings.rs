//! Client settings
//!
//! Loaded from TOML or JSON. Every timing knob has a default, so a file
//! only needs the account and device identity:
//!
//! ```toml
//! account_id = "abcdefghijkl"
//! device_id = "3f2a0c"
//! device_tag = "a1b2c3"
//!
//! [timing]
//! start_timeout_ms = 3000
//! ```

use netx_runtime::TrackerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Everything configurable about the tunnel client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetxSettings {
    pub account_id: String,
    /// Platform-reported device id
    pub device_id: String,
    /// Backend-assigned device tag (DNS address derivation)
    pub device_tag: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Session file; in-memory session when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
    #[serde(default)]
    pub timing: TimingSettings,
    #[serde(default)]
    pub tracker: TrackerSettings,
}

fn default_user_agent() -> String {
    format!("netx/{}", env!("CARGO_PKG_VERSION"))
}

/// Timeouts and retry budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingSettings {
    /// Wait for `connected` after a platform start
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,
    /// Extra start attempts after a timeout
    #[serde(default = "default_start_retries")]
    pub start_retries: u32,
    /// Wait for `disconnected` after a platform stop
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// Round trip to the tunnel process
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    /// Delay before the single `report` retry
    #[serde(default = "default_report_retry_delay_ms")]
    pub report_retry_delay_ms: u64,
    /// Debounce of user-driven queues
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Limit for one backend call
    #[serde(default = "default_backend_timeout_ms")]
    pub backend_timeout_ms: u64,
}

fn default_start_timeout_ms() -> u64 {
    3_000
}

fn default_start_retries() -> u32 {
    1
}

fn default_stop_timeout_ms() -> u64 {
    15_000
}

fn default_message_timeout_ms() -> u64 {
    5_000
}

fn default_report_retry_delay_ms() -> u64 {
    3_000
}

fn default_debounce_ms() -> u64 {
    300
}

fn default_backend_timeout_ms() -> u64 {
    10_000
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            start_timeout_ms: default_start_timeout_ms(),
            start_retries: default_start_retries(),
            stop_timeout_ms: default_stop_timeout_ms(),
            message_timeout_ms: default_message_timeout_ms(),
            report_retry_delay_ms: default_report_retry_delay_ms(),
            debounce_ms: default_debounce_ms(),
            backend_timeout_ms: default_backend_timeout_ms(),
        }
    }
}

impl TimingSettings {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    pub fn report_retry_delay(&self) -> Duration {
        Duration::from_millis(self.report_retry_delay_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    /// Upper bound for a whole `turnOn`, all start attempts included
    pub fn turn_on_budget(&self) -> Duration {
        let attempts = self.start_retries + 1;
        self.start_timeout() * attempts + self.backend_timeout() + self.message_timeout()
    }

    /// Upper bound for a whole `turnOff`
    pub fn turn_off_budget(&self) -> Duration {
        self.stop_timeout() + self.message_timeout()
    }
}

/// Connectivity issue derivation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerSettings {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_timeout_threshold")]
    pub timeout_threshold: usize,
}

fn default_window_secs() -> u64 {
    30
}

fn default_timeout_threshold() -> usize {
    3
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            timeout_threshold: default_timeout_threshold(),
        }
    }
}

impl From<TrackerSettings> for TrackerConfig {
    fn from(settings: TrackerSettings) -> Self {
        TrackerConfig {
            window: Duration::from_secs(settings.window_secs),
            timeout_threshold: settings.timeout_threshold,
            ..TrackerConfig::default()
        }
    }
}

impl NetxSettings {
    pub fn new(
        account_id: impl Into<String>,
        device_id: impl Into<String>,
        device_tag: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            device_id: device_id.into(),
            device_tag: device_tag.into(),
            user_agent: default_user_agent(),
            store_path: None,
            timing: TimingSettings::default(),
            tracker: TrackerSettings::default(),
        }
    }

    /// Load from a `.toml` or `.json` file
    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_file(path),
            Some("json") => Self::from_json_file(path),
            _ => Err(SettingsError::UnsupportedFormat),
        }
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, SettingsError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| SettingsError::IoError(e.to_string()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let settings: Self =
            toml::from_str(content).map_err(|e| SettingsError::ParseError(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, SettingsError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| SettingsError::IoError(e.to_string()))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, SettingsError> {
        let settings: Self =
            serde_json::from_str(content).map_err(|e| SettingsError::ParseError(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.account_id.is_empty() {
            return Err(SettingsError::Invalid("account_id is empty".into()));
        }
        if self.device_tag.is_empty() {
            return Err(SettingsError::Invalid("device_tag is empty".into()));
        }

        let t = &self.timing;
        let timeouts = [
            ("start_timeout_ms", t.start_timeout_ms),
            ("stop_timeout_ms", t.stop_timeout_ms),
            ("message_timeout_ms", t.message_timeout_ms),
            ("backend_timeout_ms", t.backend_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            return Err(SettingsError::Invalid(format!("{} must be positive", name)));
        }
        if self.tracker.window_secs == 0 {
            return Err(SettingsError::Invalid("tracker.window_secs must be positive".into()));
        }

        Ok(())
    }
}

/// Settings errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Unsupported settings format")]
    UnsupportedFormat,

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_toml_gets_defaults() {
        let settings = NetxSettings::from_toml(
            r#"
            account_id = "abcdefghijkl"
            device_id = "dev-1"
            device_tag = "a1b2c3"
            "#,
        )
        .unwrap();

        assert_eq!(settings.timing, TimingSettings::default());
        assert_eq!(settings.timing.start_timeout(), Duration::from_secs(3));
        assert_eq!(settings.timing.stop_timeout(), Duration::from_secs(15));
        assert_eq!(settings.tracker.timeout_threshold, 3);
        assert!(settings.store_path.is_none());
    }

    #[test]
    fn test_partial_timing_table() {
        let settings = NetxSettings::from_toml(
            r#"
            account_id = "abcdefghijkl"
            device_id = "dev-1"
            device_tag = "a1b2c3"

            [timing]
            start_timeout_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(settings.timing.start_timeout_ms, 500);
        assert_eq!(settings.timing.start_retries, 1);
    }

    #[test]
    fn test_toml_json_roundtrip() {
        let mut settings = NetxSettings::new("acc", "dev", "abc1234ef56");
        settings.store_path = Some(PathBuf::from("/tmp/netx/session.json"));

        assert_eq!(NetxSettings::from_toml(&settings.to_toml()).unwrap(), settings);
        assert_eq!(NetxSettings::from_json(&settings.to_json()).unwrap(), settings);
    }

    #[test]
    fn test_validation() {
        let mut settings = NetxSettings::new("acc", "dev", "");
        assert!(settings.validate().is_err());

        settings.device_tag = "a1b2c3".into();
        settings.timing.stop_timeout_ms = 0;
        assert_eq!(
            settings.validate(),
            Err(SettingsError::Invalid("stop_timeout_ms must be positive".into()))
        );
    }

    #[test]
    fn test_tracker_config_conversion() {
        let config: TrackerConfig = TrackerSettings::default().into();
        assert_eq!(config.window, Duration::from_secs(30));
        assert_eq!(config.timeout_threshold, 3);
    }
}
