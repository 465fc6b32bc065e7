//! BLE subsystem
//!
//! - `gatt`: host stack traits and the event vocabulary
//! - `queue`: serialized GATT operations with retry
//! - `transport`: per-device task (connect, discovery, report mode, watchdog)
//! - `btleplug_backend`: btleplug binding (feature `btleplug`)

#[cfg(feature = "btleplug")]
pub mod btleplug_backend;
pub mod gatt;
pub mod queue;
pub mod transport;

#[cfg(feature = "btleplug")]
pub use btleplug_backend::BtleplugBackend;
pub use gatt::{
    BleBackend, BlePeripheralInfo, GattClient, GattEvent, GattEventSender, GattService,
};
pub use queue::{Finished, GattOperation, GattOperationQueue};
pub use transport::{BleSettings, BleTransport};
