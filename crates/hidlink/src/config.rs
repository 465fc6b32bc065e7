//! Configuration management

use crate::ble::BleSettings;
use crate::coordinator::CoordinatorSettings;
use crate::usb::UsbTransportSettings;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HidlinkConfig {
    pub general: GeneralSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub ble: BleConfig,
    #[serde(default)]
    pub queue: QueueSettings,
    /// How long `open` waits for a transport before giving up
    #[serde(default = "HidlinkConfig::default_open_timeout")]
    pub open_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralSettings {
    pub log_level: String,
    /// Identity store file; `~` is expanded. Default under the data dir.
    #[serde(default)]
    pub identity_store: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsbSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// VID:PID filters ("0x045e:*"); empty allows every HID interface
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default = "UsbSettings::default_read_timeout")]
    pub read_timeout_ms: u64,
    #[serde(default = "UsbSettings::default_write_timeout")]
    pub write_timeout_ms: u64,
    /// Hot-plug polling interval (0 = enumerate once at startup)
    #[serde(default = "UsbSettings::default_hotplug_poll")]
    pub hotplug_poll_ms: u64,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            filters: Vec::new(),
            read_timeout_ms: Self::default_read_timeout(),
            write_timeout_ms: Self::default_write_timeout(),
            hotplug_poll_ms: Self::default_hotplug_poll(),
        }
    }
}

impl UsbSettings {
    fn default_read_timeout() -> u64 {
        100
    }

    fn default_write_timeout() -> u64 {
        1000
    }

    fn default_hotplug_poll() -> u64 {
        1000
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BleConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "BleConfig::default_watchdog_interval")]
    pub watchdog_interval_secs: u64,
    /// Reconnects when discovery misses the vendor service
    #[serde(default = "BleConfig::default_discovery_retries")]
    pub discovery_retries: u32,
    #[serde(default = "BleConfig::default_operation_retries")]
    pub operation_retries: u32,
    #[serde(default = "BleConfig::default_operation_timeout")]
    pub operation_timeout_ms: u64,
    #[serde(default = "BleConfig::default_max_watchdog_cycles")]
    pub max_watchdog_cycles: u32,
    /// Scan duration at startup
    #[serde(default = "BleConfig::default_scan_secs")]
    pub scan_secs: u64,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            watchdog_interval_secs: Self::default_watchdog_interval(),
            discovery_retries: Self::default_discovery_retries(),
            operation_retries: Self::default_operation_retries(),
            operation_timeout_ms: Self::default_operation_timeout(),
            max_watchdog_cycles: Self::default_max_watchdog_cycles(),
            scan_secs: Self::default_scan_secs(),
        }
    }
}

impl BleConfig {
    fn default_watchdog_interval() -> u64 {
        10
    }

    fn default_discovery_retries() -> u32 {
        1
    }

    fn default_operation_retries() -> u32 {
        2
    }

    fn default_operation_timeout() -> u64 {
        5000
    }

    fn default_max_watchdog_cycles() -> u32 {
        3
    }

    fn default_scan_secs() -> u64 {
        5
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Input reports buffered per device
    #[serde(default = "QueueSettings::default_capacity")]
    pub capacity: usize,
    #[serde(default = "QueueSettings::default_pool_max_buffers")]
    pub pool_max_buffers: usize,
    #[serde(default = "QueueSettings::default_pool_max_buffer_size")]
    pub pool_max_buffer_size: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: Self::default_capacity(),
            pool_max_buffers: Self::default_pool_max_buffers(),
            pool_max_buffer_size: Self::default_pool_max_buffer_size(),
        }
    }
}

impl QueueSettings {
    fn default_capacity() -> usize {
        common::input_queue::DEFAULT_QUEUE_CAPACITY
    }

    fn default_pool_max_buffers() -> usize {
        common::buffer_pool::DEFAULT_MAX_BUFFERS
    }

    fn default_pool_max_buffer_size() -> usize {
        common::buffer_pool::DEFAULT_MAX_BUFFER_SIZE
    }
}

fn default_true() -> bool {
    true
}

impl Default for HidlinkConfig {
    fn default() -> Self {
        Self {
            general: GeneralSettings {
                log_level: "info".to_string(),
                identity_store: None,
            },
            usb: UsbSettings::default(),
            ble: BleConfig::default(),
            queue: QueueSettings::default(),
            open_timeout_ms: Self::default_open_timeout(),
        }
    }
}

impl HidlinkConfig {
    fn default_open_timeout() -> u64 {
        10_000
    }

    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/hidlink/hidlink.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HidlinkConfig = toml::from_str(&content)
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

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("hidlink").join("hidlink.toml")
        } else {
            PathBuf::from(".config/hidlink/hidlink.toml")
        }
    }

    /// Identity store location with `~` expanded
    pub fn identity_store_path(&self) -> PathBuf {
        match &self.general.identity_store {
            Some(path) => PathBuf::from(shellexpand::tilde(path).as_ref()),
            None => common::IdentityStore::default_path(),
        }
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn hotplug_poll(&self) -> Option<Duration> {
        (self.usb.hotplug_poll_ms > 0).then(|| Duration::from_millis(self.usb.hotplug_poll_ms))
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            queue_capacity: self.queue.capacity,
            usb: UsbTransportSettings {
                read_timeout: Duration::from_millis(self.usb.read_timeout_ms),
                write_timeout: Duration::from_millis(self.usb.write_timeout_ms),
            },
            ble: BleSettings {
                watchdog_interval: Duration::from_secs(self.ble.watchdog_interval_secs),
                discovery_retries: self.ble.discovery_retries,
                operation_retries: self.ble.operation_retries,
                operation_timeout: Duration::from_millis(self.ble.operation_timeout_ms),
                max_watchdog_cycles: self.ble.max_watchdog_cycles,
            },
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.general.log_level,
                valid_levels.join(", ")
            ));
        }

        for filter in &self.usb.filters {
            Self::validate_filter(filter)?;
        }

        let nonzero = [
            ("usb.read_timeout_ms", self.usb.read_timeout_ms),
            ("usb.write_timeout_ms", self.usb.write_timeout_ms),
            ("ble.watchdog_interval_secs", self.ble.watchdog_interval_secs),
            ("ble.operation_timeout_ms", self.ble.operation_timeout_ms),
            ("queue.capacity", self.queue.capacity as u64),
            ("open_timeout_ms", self.open_timeout_ms),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(anyhow!("{} must be greater than 0", name));
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x045e:0x028e' or '0x045e:*')",
                filter
            ));
        }

        let (vid, pid) = (parts[0], parts[1]);
        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }
        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    /// Validate a hex ID (VID or PID)
    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x045e')",
                name,
                id
            ));
        };

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }
}
