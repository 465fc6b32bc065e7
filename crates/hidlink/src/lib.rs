//! hidlink: HID transport and lifecycle coordinator
//!
//! Discovers HID devices over USB and Bluetooth LE, gives each physical
//! device a stable ID, drives its transport through open and close, and
//! routes input, output and feature reports between the hardware and one
//! upstream consumer.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{RecordingConsumer, mock_metadata, mock_usb_identity};
//! use hidlink::DeviceCoordinator;
//! use protocol::DeviceState;
//! use std::sync::Arc;
//!
//! let consumer = Arc::new(RecordingConsumer::new());
//! let coordinator = DeviceCoordinator::builder(consumer).build();
//!
//! let id = coordinator
//!     .on_device_discovered(mock_usb_identity(1), mock_metadata("pad", 0x045e, 0x028e))
//!     .unwrap();
//! assert_eq!(coordinator.state(id), Some(DeviceState::Discovered));
//! ```

pub mod ble;
pub mod config;
pub mod coordinator;
pub mod sink;
pub mod test_utils;
pub mod usb;

pub use config::HidlinkConfig;
pub use coordinator::{CoordinatorBuilder, CoordinatorSettings, DeviceCoordinator};
pub use sink::ReportSink;
