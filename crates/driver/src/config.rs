//! Driver configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use transport::SessionConfig;

/// System-wide fallback location
const SYSTEM_CONFIG_PATH: &str = "/etc/hci-usb/driver.toml";

/// Accepted range for `transport.buffer_size`
const MIN_BUFFER_SIZE: usize = 64;
const MAX_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub driver: DriverSettings,
    #[serde(default)]
    pub transport: TransportSettings,
    /// What to do when the radio disappears
    #[serde(default)]
    pub recovery: RecoverySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverSettings {
    #[serde(default = "DriverSettings::default_log_level")]
    pub log_level: String,
    /// Send warnings and errors to the controlling process as log packets
    #[serde(default = "DriverSettings::default_forward_logs")]
    pub forward_logs: bool,
    /// Also forward info and debug lines
    #[serde(default)]
    pub forward_debug: bool,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            forward_logs: Self::default_forward_logs(),
            forward_debug: false,
        }
    }
}

impl DriverSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_forward_logs() -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Transfers kept per endpoint
    #[serde(default = "TransportSettings::default_slots")]
    pub slots_per_endpoint: usize,
    #[serde(default = "TransportSettings::default_buffer_size")]
    pub buffer_size: usize,
    /// Event pump iterations allowed for cancelled transfers on shutdown
    #[serde(default = "TransportSettings::default_teardown_budget")]
    pub teardown_budget: u32,
    /// Upper bound of one dispatch step, in milliseconds
    #[serde(default = "TransportSettings::default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "TransportSettings::default_reset_on_open")]
    pub reset_on_open: bool,
    /// USB configuration to select before claiming the interface
    #[serde(default)]
    pub configuration: Option<u8>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            slots_per_endpoint: Self::default_slots(),
            buffer_size: Self::default_buffer_size(),
            teardown_budget: Self::default_teardown_budget(),
            poll_interval_ms: Self::default_poll_interval(),
            reset_on_open: Self::default_reset_on_open(),
            configuration: None,
        }
    }
}

impl TransportSettings {
    fn default_slots() -> usize {
        transport::DEFAULT_SLOTS_PER_ENDPOINT
    }

    fn default_buffer_size() -> usize {
        transport::HCI_MAX_BUFFER_SIZE
    }

    fn default_teardown_budget() -> u32 {
        transport::DEFAULT_TEARDOWN_BUDGET
    }

    fn default_poll_interval() -> u64 {
        10
    }

    fn default_reset_on_open() -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySettings {
    /// Reopen the radio after it was unplugged instead of exiting
    #[serde(default)]
    pub restart_on_loss: bool,
    #[serde(default = "RecoverySettings::default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "RecoverySettings::default_restart_delay")]
    pub restart_delay_ms: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            restart_on_loss: false,
            max_restarts: Self::default_max_restarts(),
            restart_delay_ms: Self::default_restart_delay(),
        }
    }
}

impl RecoverySettings {
    fn default_max_restarts() -> u32 {
        3
    }

    fn default_restart_delay() -> u64 {
        1000
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

impl DriverConfig {
    /// Load configuration from file
    ///
    /// Without an explicit path the user config directory is tried first,
    /// then `/etc/hci-usb/driver.toml`.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![Self::default_path(), PathBuf::from(SYSTEM_CONFIG_PATH)];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: DriverConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("hci-usb").join("driver.toml")
        } else {
            PathBuf::from(SYSTEM_CONFIG_PATH)
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.driver.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.driver.log_level,
                valid_levels.join(", ")
            ));
        }

        let transport = &self.transport;
        if transport.slots_per_endpoint == 0 {
            return Err(anyhow!("transport.slots_per_endpoint must be at least 1"));
        }
        // Slot indices are stored as u8
        if transport.slots_per_endpoint > usize::from(u8::MAX) {
            return Err(anyhow!(
                "transport.slots_per_endpoint must be at most {}",
                u8::MAX
            ));
        }
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&transport.buffer_size) {
            return Err(anyhow!(
                "transport.buffer_size {} out of range {}..={}",
                transport.buffer_size,
                MIN_BUFFER_SIZE,
                MAX_BUFFER_SIZE
            ));
        }
        if transport.teardown_budget == 0 {
            return Err(anyhow!("transport.teardown_budget must be at least 1"));
        }
        if transport.poll_interval_ms == 0 {
            return Err(anyhow!("transport.poll_interval_ms must be at least 1"));
        }

        Ok(())
    }

    /// Session tunables derived from `[transport]`
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            slots_per_endpoint: self.transport.slots_per_endpoint,
            buffer_size: self.transport.buffer_size,
            teardown_budget: self.transport.teardown_budget,
            reset_on_open: self.transport.reset_on_open,
            configuration: self.transport.configuration,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.transport.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = DriverConfig::default();
        assert_eq!(config.driver.log_level, "info");
        assert!(config.driver.forward_logs);
        assert!(!config.driver.forward_debug);
        assert_eq!(config.transport.slots_per_endpoint, 4);
        assert_eq!(config.transport.buffer_size, 256);
        assert_eq!(config.transport.teardown_budget, 20);
        assert_eq!(config.poll_interval(), Duration::from_millis(10));
        assert!(!config.recovery.restart_on_loss);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_matches_session_defaults() {
        assert_eq!(
            DriverConfig::default().session_config(),
            SessionConfig::default()
        );
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: DriverConfig = toml::from_str("").unwrap();
        assert_eq!(config, DriverConfig::default());
    }

    #[test]
    fn test_partial_section() {
        let config: DriverConfig = toml::from_str(
            r#"
[transport]
buffer_size = 1024
configuration = 1
"#,
        )
        .unwrap();

        let session = config.session_config();
        assert_eq!(session.buffer_size, 1024);
        assert_eq!(session.configuration, Some(1));
        assert_eq!(session.slots_per_endpoint, 4);
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = DriverConfig::default();
        config.driver.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_transport_limits() {
        let mut config = DriverConfig::default();
        config.transport.slots_per_endpoint = 0;
        assert!(config.validate().is_err());

        let mut config = DriverConfig::default();
        config.transport.buffer_size = 32;
        assert!(config.validate().is_err());

        let mut config = DriverConfig::default();
        config.transport.buffer_size = 8192;
        assert!(config.validate().is_err());

        let mut config = DriverConfig::default();
        config.transport.teardown_budget = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("driver.toml");

        let mut config = DriverConfig::default();
        config.driver.log_level = "debug".to_string();
        config.recovery.restart_on_loss = true;
        config.save(&path).unwrap();

        let loaded = DriverConfig::load(Some(path)).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_rejects_invalid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("driver.toml");
        fs::write(&path, "[transport]\nslots_per_endpoint = 0\n").unwrap();

        assert!(DriverConfig::load(Some(path)).is_err());
    }

    fn captured_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
        use std::sync::{Arc, Mutex};

        #[derive(Clone, Default)]
        struct Buffer(Arc<Mutex<Vec<u8>>>);

        impl std::io::Write for Buffer {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let buffer = Buffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let value = tracing::subscriber::with_default(subscriber, f);
        let text = String::from_utf8_lossy(&buffer.0.lock().unwrap()).into_owned();
        (value, text)
    }

    #[test]
    fn test_load_reports_where_config_came_from() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("driver.toml");
        DriverConfig::default().save(&path).unwrap();

        let (loaded, logs) = captured_logs(|| DriverConfig::load(Some(path)));
        assert!(loaded.is_ok());
        assert!(logs.contains("Loaded configuration from"), "logs: {}", logs);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(DriverConfig::load(Some(dir.path().join("absent.toml"))).is_err());
    }
}
