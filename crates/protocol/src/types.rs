//! Device and report type definitions
//!
//! This module defines the types shared between the coordinator, the
//! transports and the upstream consumer: device identifiers, lifecycle
//! states, transport identities and input/output reports.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable device identifier (coordinator-assigned)
///
/// Allocated the first time a physical identity is discovered and kept for
/// that identity for as long as the identity store lives. IDs are never
/// handed out to a different identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Token correlating an asynchronous write or feature request with its
/// completion callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestToken(pub u64);

/// Physical transport a device is reached through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// USB host stack (bulk/interrupt endpoints + control transfers)
    Usb,
    /// Bluetooth Low Energy GATT
    Ble,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Usb => write!(f, "USB"),
            TransportKind::Ble => write!(f, "BLE"),
        }
    }
}

/// Lifecycle state of a device record
///
/// Only the coordinator moves a record between states. Transports report
/// what happened to them and the coordinator decides the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    /// Known to the coordinator, never opened
    Discovered,
    /// Waiting for the platform to grant access (USB only)
    PendingPermission,
    /// Transport is being established
    Opening,
    /// Transport is up and delivering reports
    Open,
    /// Transport teardown in progress
    Closing,
    /// Transport torn down; the record and its ID are retained
    Closed,
}

impl DeviceState {
    /// States in which a second `open` is a no-op
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DeviceState::PendingPermission | DeviceState::Opening | DeviceState::Open
        )
    }

    /// States from which `open` may start a new transport
    pub fn can_open(&self) -> bool {
        matches!(self, DeviceState::Discovered | DeviceState::Closed)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Discovered => "Discovered",
            DeviceState::PendingPermission => "PendingPermission",
            DeviceState::Opening => "Opening",
            DeviceState::Open => "Open",
            DeviceState::Closing => "Closing",
            DeviceState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// Transport-specific identity of a physical device
///
/// The identity is what survives a disconnect/reconnect of the same device,
/// so it must not contain anything that changes between plug-ins other than
/// the port path fallback used when a USB device has no serial number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceIdentity {
    Usb {
        vendor_id: u16,
        product_id: u16,
        /// Serial number string, when the device exposes one
        serial: Option<String>,
        /// Bus/port path (e.g. "1-4.2"), used only when there is no serial
        path: String,
        /// HID interface number on the device
        interface: u8,
    },
    Ble {
        /// Bluetooth device address, upper-case colon separated
        address: String,
    },
}

impl DeviceIdentity {
    pub fn usb(
        vendor_id: u16,
        product_id: u16,
        serial: Option<String>,
        path: impl Into<String>,
        interface: u8,
    ) -> Self {
        DeviceIdentity::Usb {
            vendor_id,
            product_id,
            serial: serial.filter(|s| !s.trim().is_empty()),
            path: path.into(),
            interface,
        }
    }

    pub fn ble(address: impl AsRef<str>) -> Self {
        DeviceIdentity::Ble {
            address: address.as_ref().to_ascii_uppercase(),
        }
    }

    /// Transport this identity belongs to
    pub fn kind(&self) -> TransportKind {
        match self {
            DeviceIdentity::Usb { .. } => TransportKind::Usb,
            DeviceIdentity::Ble { .. } => TransportKind::Ble,
        }
    }

    /// Persistent key used by the identity store
    ///
    /// USB devices with a serial number are keyed by vendor/product/serial
    /// so they keep their ID when moved to another port.
    pub fn key(&self) -> String {
        match self {
            DeviceIdentity::Usb {
                vendor_id,
                product_id,
                serial: Some(serial),
                interface,
                ..
            } => format!("usb:{vendor_id:04x}:{product_id:04x}:sn={serial}:if{interface}"),
            DeviceIdentity::Usb {
                vendor_id,
                product_id,
                serial: None,
                path,
                interface,
            } => format!("usb:{vendor_id:04x}:{product_id:04x}:path={path}:if{interface}"),
            DeviceIdentity::Ble { address } => format!("ble:{address}"),
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Descriptive metadata reported at discovery time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    /// Human readable name (product string or advertised BLE name)
    pub name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub serial_number: Option<String>,
}

/// Report directions supported by an open device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub input_reports: bool,
    pub output_reports: bool,
    pub feature_reports: bool,
}

impl Capabilities {
    pub const ALL: Capabilities = Capabilities {
        input_reports: true,
        output_reports: true,
        feature_reports: true,
    };
}

/// Snapshot of a device handed to the upstream consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub kind: TransportKind,
    pub name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub serial_number: Option<String>,
    pub capabilities: Capabilities,
    pub state: DeviceState,
}

/// An input, output or feature report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub device_id: DeviceId,
    pub bytes: Vec<u8>,
    pub is_feature: bool,
}

impl Report {
    pub fn input(device_id: DeviceId, bytes: Vec<u8>) -> Self {
        Self {
            device_id,
            bytes,
            is_feature: false,
        }
    }
}

/// Per-device input queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Reports pushed since the device was opened
    pub received: u64,
    /// Reports evicted because the queue was full
    pub dropped: u64,
    /// Reports currently waiting to be read
    pub buffered: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usb_identity_prefers_serial() {
        let a = DeviceIdentity::usb(0x28de, 0x1142, Some("ABC123".into()), "1-4", 0);
        let b = DeviceIdentity::usb(0x28de, 0x1142, Some("ABC123".into()), "3-1.2", 0);
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key(), "usb:28de:1142:sn=ABC123:if0");
    }

    #[test]
    fn test_usb_identity_without_serial_uses_path() {
        let a = DeviceIdentity::usb(0x045e, 0x028e, None, "1-4", 0);
        let b = DeviceIdentity::usb(0x045e, 0x028e, Some("  ".into()), "1-5", 0);
        assert_ne!(a.key(), b.key());
        assert!(a.key().contains("path=1-4"));
    }

    #[test]
    fn test_ble_identity_normalizes_address() {
        let a = DeviceIdentity::ble("aa:bb:cc:dd:ee:ff");
        assert_eq!(a.key(), "ble:AA:BB:CC:DD:EE:FF");
        assert_eq!(a.kind(), TransportKind::Ble);
    }

    #[test]
    fn test_device_state_classes() {
        assert!(DeviceState::Open.is_active());
        assert!(DeviceState::PendingPermission.is_active());
        assert!(!DeviceState::Closed.is_active());
        assert!(DeviceState::Closed.can_open());
        assert!(DeviceState::Discovered.can_open());
        assert!(!DeviceState::Closing.can_open());
    }

    #[test]
    fn test_device_id_display() {
        assert_eq!(DeviceId(7).to_string(), "#7");
    }
}
