//! Integration tests for configuration parsing
//!
//! Tests hidlink configuration parsing, including:
//! - Minimal and full configuration files
//! - Defaults for omitted sections
//! - Load/save round trip through the filesystem
//! - Invalid configuration handling

use hidlink::HidlinkConfig;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::tempdir;

const MINIMAL_CONFIG: &str = r#"
[general]
log_level = "info"
"#;

const FULL_CONFIG: &str = r#"
open_timeout_ms = 2500

[general]
log_level = "debug"
identity_store = "~/hid/identities.json"

[usb]
enabled = true
filters = ["0x045e:*", "0x28de:0x1142"]
read_timeout_ms = 50
write_timeout_ms = 500
hotplug_poll_ms = 0

[ble]
enabled = true
watchdog_interval_secs = 5
discovery_retries = 2
operation_retries = 4
operation_timeout_ms = 1500
max_watchdog_cycles = 6
scan_secs = 3

[queue]
capacity = 16
pool_max_buffers = 32
pool_max_buffer_size = 512
"#;

// ============================================================================
// Parsing
// ============================================================================

mod parsing {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: HidlinkConfig = toml::from_str(MINIMAL_CONFIG).unwrap();

        assert_eq!(config, HidlinkConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.open_timeout(), Duration::from_secs(10));
        assert_eq!(config.hotplug_poll(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_full_config() {
        let config: HidlinkConfig = toml::from_str(FULL_CONFIG).unwrap();
        assert!(config.validate().is_ok());

        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.usb.filters.len(), 2);
        assert_eq!(config.hotplug_poll(), None);
        assert!(config.ble.enabled);
        assert_eq!(config.open_timeout(), Duration::from_millis(2500));

        let settings = config.coordinator_settings();
        assert_eq!(settings.queue_capacity, 16);
        assert_eq!(settings.usb.read_timeout, Duration::from_millis(50));
        assert_eq!(settings.usb.write_timeout, Duration::from_millis(500));
        assert_eq!(settings.ble.watchdog_interval, Duration::from_secs(5));
        assert_eq!(settings.ble.discovery_retries, 2);
        assert_eq!(settings.ble.operation_retries, 4);
        assert_eq!(settings.ble.operation_timeout, Duration::from_millis(1500));
        assert_eq!(settings.ble.max_watchdog_cycles, 6);
    }

    #[test]
    fn test_identity_store_tilde_expanded() {
        let config: HidlinkConfig = toml::from_str(FULL_CONFIG).unwrap();
        let path = config.identity_store_path();

        assert!(!path.to_string_lossy().starts_with('~'));
        assert!(path.ends_with("hid/identities.json"));
    }

    #[test]
    fn test_missing_general_section_rejected() {
        let result: Result<HidlinkConfig, _> = toml::from_str("[usb]\nenabled = false\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_wrong_type_rejected() {
        let result: Result<HidlinkConfig, _> =
            toml::from_str("[general]\nlog_level = \"info\"\n[queue]\ncapacity = \"many\"\n");
        assert!(result.is_err());
    }
}

// ============================================================================
// Validation
// ============================================================================

mod validation {
    use super::*;

    fn parse(extra: &str) -> HidlinkConfig {
        toml::from_str(&format!("{}{}", MINIMAL_CONFIG, extra)).unwrap()
    }

    #[test]
    fn test_invalid_filter() {
        let config = parse("[usb]\nfilters = [\"045e:028e\"]\n");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("045e"));
    }

    #[test]
    fn test_wildcard_filters_accepted() {
        let config = parse("[usb]\nfilters = [\"*:*\", \"*:0x028e\"]\n");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        for (section, key) in [
            ("usb", "read_timeout_ms"),
            ("usb", "write_timeout_ms"),
            ("ble", "watchdog_interval_secs"),
            ("ble", "operation_timeout_ms"),
        ] {
            let config = parse(&format!("[{}]\n{} = 0\n", section, key));
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains(key), "{} not reported", key);
        }
    }

    #[test]
    fn test_zero_retries_allowed() {
        let config = parse("[ble]\ndiscovery_retries = 0\noperation_retries = 0\n");
        assert!(config.validate().is_ok());
    }
}

// ============================================================================
// Filesystem
// ============================================================================

mod filesystem {
    use super::*;

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("hidlink.toml");

        let mut config = HidlinkConfig::default();
        config.general.log_level = "warn".to_string();
        config.usb.filters = vec!["0x045e:*".to_string()];
        config.queue.capacity = 8;
        config.save(&path).unwrap();

        let loaded = HidlinkConfig::load(Some(path)).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hidlink.toml");
        std::fs::write(&path, "[general]\nlog_level = \"chatty\"\n").unwrap();

        let err = HidlinkConfig::load(Some(path)).unwrap_err();
        assert!(format!("{:#}", err).contains("chatty"));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let path = PathBuf::from("/nonexistent/hidlink/hidlink.toml");
        assert!(HidlinkConfig::load(Some(path)).is_err());
    }
}
