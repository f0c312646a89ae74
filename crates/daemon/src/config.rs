//! Configuration management for the wireless helper daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/wireless-helper/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use discovery::{
    DirectoryConfig, ScanConfig, DEFAULT_SERVICE_TYPE, DEFAULT_TYPE_FILTER, LEGACY_DISCOVERY_PORT,
    PRIMARY_DISCOVERY_PORT, SERVICE_PORT, TRIGGER_PORT,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::strategy::{ConnectionMode, RelayPolicy};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("{0} port must not be 0")]
    InvalidPort(&'static str),

    #[error("probe_timeout_ms must be between 50 and 10000, got {0}")]
    InvalidProbeTimeout(u64),

    #[error("max_concurrency must be between 1 and 1024, got {0}")]
    InvalidConcurrency(usize),

    #[error("rescan_delay_secs must be greater than 0, got {0}")]
    InvalidRescanDelay(u64),

    #[error("cooldown_secs must be between 1 and 3600, got {0}")]
    InvalidCooldown(u64),

    #[error("{0} must be greater than 0")]
    InvalidTimeout(&'static str),

    #[error("poll_interval_secs must be greater than 0, got {0}")]
    InvalidPollInterval(u64),

    #[error("service_type must end with '.local.', got {0}")]
    InvalidServiceType(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the wireless helper daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Well-known TCP ports.
    pub ports: PortsConfig,

    /// Active scanner settings.
    pub scan: ScanSettings,

    /// Service directory settings.
    pub directory: DirectorySettings,

    /// Launch coordinator settings.
    pub launch: LaunchConfig,

    /// Platform handoff settings.
    pub handoff: HandoffConfig,

    /// Connection-status oracle settings.
    pub status: StatusConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Connection mode used by `run` when none is given on the command line.
    pub mode: ConnectionMode,
}

/// Ports used at the network boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PortsConfig {
    /// Primary discovery port, probed first.
    pub discovery: u16,

    /// Legacy discovery port, probed second.
    pub legacy: u16,

    /// Port the trigger listener binds.
    pub trigger: u16,

    /// Port of the projection service handed to the consumer.
    pub service: u16,
}

/// Active scanner settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScanSettings {
    /// Connect timeout of a single probe, in milliseconds.
    pub probe_timeout_ms: u64,

    /// Pause between fruitless scan passes, in seconds.
    pub rescan_delay_secs: u64,

    /// Maximum subnet probes in flight.
    pub max_concurrency: usize,
}

/// Service directory settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DirectorySettings {
    /// Service type to browse.
    pub service_type: String,

    /// Case-sensitive substring announcement types must contain.
    pub type_filter: String,
}

/// Launch coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LaunchConfig {
    /// How long the guard stays held after a handoff without a confirmed
    /// connection, in seconds.
    pub cooldown_secs: u64,

    /// Whether to hand off through the local relay.
    pub relay: RelayPolicy,

    /// Check whether the headunit is already serving a client before the
    /// handoff.
    pub busy_check: bool,

    /// Busy check connect timeout, in milliseconds.
    pub busy_connect_timeout_ms: u64,

    /// Busy check read timeout, in milliseconds.
    pub busy_read_timeout_ms: u64,
}

/// Platform handoff settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct HandoffConfig {
    /// Program run on handoff, with `{host}`, `{port}` and `{interface}`
    /// placeholders. Empty means log only.
    pub command: Vec<String>,
}

/// Connection-status oracle settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StatusConfig {
    /// Program whose zero exit status means a session is active. Empty means
    /// the status is never known to be connected.
    pub command: Vec<String>,

    /// How often the oracle is polled, in seconds.
    pub poll_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            mode: ConnectionMode::default(),
        }
    }
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            discovery: PRIMARY_DISCOVERY_PORT,
            legacy: LEGACY_DISCOVERY_PORT,
            trigger: TRIGGER_PORT,
            service: SERVICE_PORT,
        }
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 300,
            rescan_delay_secs: 10,
            max_concurrency: 128,
        }
    }
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self {
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            type_filter: DEFAULT_TYPE_FILTER.to_string(),
        }
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 30,
            relay: RelayPolicy::Auto,
            busy_check: true,
            busy_connect_timeout_ms: 1000,
            busy_read_timeout_ms: 500,
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            poll_interval_secs: 5,
        }
    }
}

impl ScanSettings {
    /// Scanner configuration for the given discovery ports.
    pub fn scan_config(&self, ports: &PortsConfig) -> ScanConfig {
        ScanConfig {
            ports: vec![ports.discovery, ports.legacy],
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            max_concurrency: self.max_concurrency,
        }
    }

    pub fn rescan_delay(&self) -> Duration {
        Duration::from_secs(self.rescan_delay_secs)
    }
}

impl DirectorySettings {
    pub fn directory_config(&self) -> DirectoryConfig {
        DirectoryConfig {
            service_type: self.service_type.clone(),
            type_filter: self.type_filter.clone(),
        }
    }
}

impl LaunchConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn busy_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_connect_timeout_ms)
    }

    pub fn busy_read_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_read_timeout_ms)
    }
}

impl StatusConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("wireless-helper")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - WIRELESS_HELPER_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - WIRELESS_HELPER_MODE: Override connection mode (shared-network, phone-hotspot,
    ///   tablet-hotspot, wifi-direct)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("WIRELESS_HELPER_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(mode) = std::env::var("WIRELESS_HELPER_MODE") {
            if !mode.is_empty() {
                match mode.parse::<ConnectionMode>() {
                    Ok(mode) => {
                        tracing::info!("Overriding mode from environment: {}", mode);
                        self.daemon.mode = mode;
                    }
                    Err(e) => tracing::warn!("Ignoring WIRELESS_HELPER_MODE: {}", e),
                }
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        for (name, port) in [
            ("discovery", self.ports.discovery),
            ("legacy", self.ports.legacy),
            ("trigger", self.ports.trigger),
            ("service", self.ports.service),
        ] {
            if port == 0 {
                return Err(ConfigError::InvalidPort(name));
            }
        }

        if !(50..=10_000).contains(&self.scan.probe_timeout_ms) {
            return Err(ConfigError::InvalidProbeTimeout(self.scan.probe_timeout_ms));
        }

        if !(1..=1024).contains(&self.scan.max_concurrency) {
            return Err(ConfigError::InvalidConcurrency(self.scan.max_concurrency));
        }

        if self.scan.rescan_delay_secs == 0 {
            return Err(ConfigError::InvalidRescanDelay(self.scan.rescan_delay_secs));
        }

        if !self.directory.service_type.ends_with(".local.") {
            return Err(ConfigError::InvalidServiceType(
                self.directory.service_type.clone(),
            ));
        }

        if !(1..=3600).contains(&self.launch.cooldown_secs) {
            return Err(ConfigError::InvalidCooldown(self.launch.cooldown_secs));
        }

        if self.launch.busy_connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout("busy_connect_timeout_ms"));
        }

        if self.launch.busy_read_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout("busy_read_timeout_ms"));
        }

        if self.status.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidPollInterval(
                self.status.poll_interval_secs,
            ));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.daemon.mode, ConnectionMode::SharedNetwork);
        assert_eq!(config.ports.discovery, 5289);
        assert_eq!(config.ports.legacy, 5277);
        assert_eq!(config.ports.trigger, 5289);
        assert_eq!(config.ports.service, 5288);
        assert_eq!(config.scan.probe_timeout_ms, 300);
        assert_eq!(config.scan.rescan_delay_secs, 10);
        assert_eq!(config.launch.cooldown_secs, 30);
        assert_eq!(config.launch.relay, RelayPolicy::Auto);
        assert!(config.launch.busy_check);
        assert!(config.handoff.command.is_empty());
        assert!(config.status.command.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_scan_config_port_order() {
        let config = Config::default();
        let scan = config.scan.scan_config(&config.ports);

        assert_eq!(scan.ports, vec![5289, 5277]);
        assert_eq!(scan.probe_timeout, Duration::from_millis(300));
        assert_eq!(scan.max_concurrency, 128);
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[daemon]
log_level = "debug"
mode = "phone-hotspot"

[launch]
relay = "never"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.daemon.mode, ConnectionMode::PhoneHotspot);
        assert_eq!(config.launch.relay, RelayPolicy::Never);
        // Other values should be defaults
        assert_eq!(config.launch.cooldown_secs, 30);
        assert_eq!(config.ports.service, 5288);
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
log_level = "trace"
mode = "tablet-hotspot"

[ports]
discovery = 6000
legacy = 6001
trigger = 6002
service = 6003

[scan]
probe_timeout_ms = 500
rescan_delay_secs = 20
max_concurrency = 64

[directory]
service_type = "_custom._tcp.local."
type_filter = "custom"

[launch]
cooldown_secs = 45
relay = "always"
busy_check = false
busy_connect_timeout_ms = 2000
busy_read_timeout_ms = 750

[handoff]
command = ["am", "start", "--host", "{host}"]

[status]
command = ["check-session"]
poll_interval_secs = 3
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.mode, ConnectionMode::TabletHotspot);
        assert_eq!(config.ports.trigger, 6002);
        assert_eq!(config.scan.max_concurrency, 64);
        assert_eq!(config.directory.type_filter, "custom");
        assert_eq!(config.launch.relay, RelayPolicy::Always);
        assert!(!config.launch.busy_check);
        assert_eq!(config.launch.busy_read_timeout(), Duration::from_millis(750));
        assert_eq!(config.handoff.command.len(), 4);
        assert_eq!(config.status.poll_interval(), Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[daemon
log_level = "debug"
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_unknown_mode() {
        let toml = r#"
[daemon]
mode = "bluetooth"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_to_toml_roundtrip() {
        let mut original = Config::default();
        original.daemon.mode = ConnectionMode::WifiDirect;
        original.launch.relay = RelayPolicy::Always;
        original.handoff.command = vec!["launch".to_string(), "{host}:{port}".to_string()];

        let toml = original.to_toml().unwrap();
        assert!(toml.contains("[launch]"));
        assert!(toml.contains("wifi-direct"));

        let loaded = Config::from_toml(&toml).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.scan.rescan_delay_secs = 15;
        original.launch.busy_check = false;

        original.save(&config_path).unwrap();
        let loaded = Config::load(&config_path).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("wireless-helper"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.daemon.log_level = "loud".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("loud".to_string()))
        );

        let mut config = Config::default();
        config.ports.service = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPort("service")));

        let mut config = Config::default();
        config.scan.probe_timeout_ms = 10;
        assert_eq!(config.validate(), Err(ConfigError::InvalidProbeTimeout(10)));

        let mut config = Config::default();
        config.scan.max_concurrency = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidConcurrency(0)));

        let mut config = Config::default();
        config.launch.cooldown_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidCooldown(0)));

        let mut config = Config::default();
        config.launch.busy_read_timeout_ms = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTimeout("busy_read_timeout_ms"))
        );

        let mut config = Config::default();
        config.directory.service_type = "_aawireless._tcp".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidServiceType(_))
        ));
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::remove_var("WIRELESS_HELPER_MODE");
        std::env::set_var("WIRELESS_HELPER_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.daemon.log_level, "debug");

        std::env::remove_var("WIRELESS_HELPER_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("WIRELESS_HELPER_LOG_LEVEL", "");
        std::env::set_var("WIRELESS_HELPER_MODE", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());

        std::env::remove_var("WIRELESS_HELPER_LOG_LEVEL");
        std::env::remove_var("WIRELESS_HELPER_MODE");
    }

    #[test]
    #[serial]
    fn test_env_override_mode() {
        std::env::remove_var("WIRELESS_HELPER_LOG_LEVEL");
        std::env::set_var("WIRELESS_HELPER_MODE", "wifi-direct");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.daemon.mode, ConnectionMode::WifiDirect);

        std::env::remove_var("WIRELESS_HELPER_MODE");
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_mode_ignored() {
        std::env::remove_var("WIRELESS_HELPER_LOG_LEVEL");
        std::env::set_var("WIRELESS_HELPER_MODE", "carrier-pigeon");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.daemon.mode, ConnectionMode::SharedNetwork);

        std::env::remove_var("WIRELESS_HELPER_MODE");
    }
}
