//! Vendor GATT layout for BLE HID controllers
//!
//! The controller exposes one vendor service with two characteristics:
//! an input characteristic that pushes reports via notifications, and a
//! report characteristic used for output/feature reports and the mode
//! switch handshake.

use uuid::Uuid;

/// Vendor HID service
pub const VENDOR_SERVICE_UUID: Uuid = Uuid::from_u128(0x100F6C32_1735_4313_B402_38567131E5F3);

/// Notify-only characteristic carrying input reports
pub const INPUT_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x100F6C33_1735_4313_B402_38567131E5F3);

/// Read/write characteristic for output and feature reports
pub const REPORT_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x100F6C34_1735_4313_B402_38567131E5F3);

/// Mode switch written after notifications are enabled; the controller
/// only starts streaming HID reports once it has seen this
pub const ENTER_REPORT_MODE: [u8; 6] = [0xC0, 0x87, 0x03, 0x08, 0x07, 0x00];

/// Kind of GATT request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GattOperationKind {
    Read,
    Write,
    EnableNotify,
}

/// Link-layer transport requested when connecting
///
/// Dual-mode stacks may otherwise silently fall back to BR/EDR, which the
/// controller does not serve GATT over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPreference {
    LowEnergy,
}

/// Link state as reported by the platform stack (not by our callbacks)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}
