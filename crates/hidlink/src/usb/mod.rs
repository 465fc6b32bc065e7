//! USB subsystem
//!
//! - `backend`: host stack traits (enumeration, permission, device handles)
//! - `rusb_backend`: libusb binding
//! - `discovery`: VID:PID filtering and hot-plug polling
//! - `transport`: one claimed HID interface and its read worker thread
//! - `transfers`: output/feature report transfers and the report ID convention
//!
//! Reads run in a dedicated thread per device so blocking transfers never
//! stall the tokio runtime.

pub mod backend;
pub mod discovery;
pub mod rusb_backend;
pub mod transfers;
pub mod transport;

pub use backend::{EndpointInfo, EndpointKind, UsbBackend, UsbConnection, UsbInterfaceInfo};
pub use discovery::{DeviceFilter, UsbDiscovery, spawn_hotplug_monitor};
pub use rusb_backend::RusbBackend;
pub use transport::{UsbTransport, UsbTransportSettings};
