//! Shared types for hidlink
//!
//! This crate defines the vocabulary shared by the coordinator, the USB and
//! BLE transports and upstream consumers: device identifiers and states,
//! transport identities, reports, the error taxonomy, and the fixed HID/GATT
//! wire conventions (control-transfer layout, vendor service UUIDs).
//!
//! # Example
//!
//! ```
//! use protocol::{DeviceIdentity, TransportKind};
//! use protocol::hid::{ControlSetup, ReportType};
//!
//! let identity = DeviceIdentity::ble("aa:bb:cc:dd:ee:ff");
//! assert_eq!(identity.kind(), TransportKind::Ble);
//!
//! let setup = ControlSetup::set_report(ReportType::Feature, 1, 0);
//! assert_eq!(setup.value, 0x0301);
//! ```

pub mod error;
pub mod gatt;
pub mod hid;
pub mod types;

pub use error::{GattError, HidError, Result, UsbError};
pub use gatt::{GattOperationKind, LinkPreference, LinkState};
pub use types::{
    Capabilities, DeviceId, DeviceIdentity, DeviceInfo, DeviceMetadata, DeviceState, QueueStats,
    Report, RequestToken, TransportKind,
};
