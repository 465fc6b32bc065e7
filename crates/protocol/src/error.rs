//! Error types
//!
//! `HidError` is the taxonomy surfaced to the upstream consumer. `UsbError`
//! and `GattError` are the platform-level failures the transports see; they
//! are folded into `HidError::TransportFailure` at the coordinator boundary
//! unless they carry a more specific meaning (timeouts, access denied).

use crate::types::{DeviceId, DeviceState};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the coordinator
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HidError {
    /// Platform refused access to the device
    #[error("permission denied")]
    PermissionDenied,

    /// Device is not in the `Open` state
    #[error("device {0} is not open")]
    NotOpen(DeviceId),

    /// USB interface exposes no usable input endpoint
    #[error("no usable input endpoint on interface")]
    NoEndpoints,

    /// BLE device does not expose the vendor service
    #[error("vendor GATT service not found")]
    NoService,

    /// Operation did not complete in time
    #[error("operation timed out")]
    Timeout,

    /// Unexpected disconnect or transfer error
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// Input queue overflowed (counted, never returned from a public call)
    #[error("input queue overflow")]
    QueueOverflow,

    /// No record exists for this ID
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),

    /// Request not valid in the record's current state
    #[error("device {id} is {state}")]
    InvalidState { id: DeviceId, state: DeviceState },

    /// No unused device ID is left for a new identity
    #[error("device ID space exhausted")]
    IdsExhausted,
}

impl From<UsbError> for HidError {
    fn from(err: UsbError) -> Self {
        match err {
            UsbError::Timeout => HidError::Timeout,
            UsbError::Access => HidError::PermissionDenied,
            other => HidError::TransportFailure(other.to_string()),
        }
    }
}

impl From<GattError> for HidError {
    fn from(err: GattError) -> Self {
        match err {
            GattError::Timeout => HidError::Timeout,
            other => HidError::TransportFailure(other.to_string()),
        }
    }
}

/// USB error types
///
/// Maps to libusb error codes. See rusb::Error for details.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum UsbError {
    /// Transfer timed out
    #[error("transfer timed out")]
    Timeout,
    /// Endpoint stalled (protocol error)
    #[error("endpoint stalled")]
    Pipe,
    /// Device was disconnected
    #[error("device disconnected")]
    NoDevice,
    /// Device or endpoint not found
    #[error("device or endpoint not found")]
    NotFound,
    /// Device is busy
    #[error("device busy")]
    Busy,
    /// Buffer overflow
    #[error("transfer overflow")]
    Overflow,
    /// I/O error
    #[error("I/O error")]
    Io,
    /// Transfer was cancelled by the host
    #[error("transfer interrupted")]
    Interrupted,
    /// Invalid parameter
    #[error("invalid parameter")]
    InvalidParam,
    /// Access denied (permissions)
    #[error("access denied")]
    Access,
    /// Other error with message
    #[error("{message}")]
    Other { message: String },
}

impl UsbError {
    /// Errors the read loop retries on its next iteration
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UsbError::Timeout
                | UsbError::Pipe
                | UsbError::Overflow
                | UsbError::Io
                | UsbError::Busy
                | UsbError::Interrupted
        )
    }
}

/// GATT operation failures reported by the BLE stack
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GattError {
    /// The stack rejected the request outright
    #[error("GATT request rejected: {0}")]
    Rejected(String),
    /// The request completed with a non-success status
    #[error("GATT status {0:#04x}")]
    Status(u8),
    /// No completion arrived within the operation timeout
    #[error("GATT operation timed out")]
    Timeout,
    /// Characteristic is not present on the connected device
    #[error("characteristic {0} not found")]
    UnknownCharacteristic(uuid::Uuid),
    /// The link went down with the operation outstanding
    #[error("GATT link disconnected")]
    Disconnected,
}

/// Type alias for coordinator results
pub type Result<T> = std::result::Result<T, HidError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HidError::InvalidState {
            id: DeviceId(3),
            state: DeviceState::Closing,
        };
        assert_eq!(err.to_string(), "device #3 is Closing");
        assert_eq!(HidError::NotOpen(DeviceId(1)).to_string(), "device #1 is not open");
    }

    #[test]
    fn test_usb_error_mapping() {
        assert_eq!(HidError::from(UsbError::Timeout), HidError::Timeout);
        assert_eq!(HidError::from(UsbError::Access), HidError::PermissionDenied);
        assert!(matches!(
            HidError::from(UsbError::NoDevice),
            HidError::TransportFailure(msg) if msg == "device disconnected"
        ));
    }

    #[test]
    fn test_usb_error_transient() {
        assert!(UsbError::Timeout.is_transient());
        assert!(UsbError::Io.is_transient());
        assert!(!UsbError::NoDevice.is_transient());
        assert!(!UsbError::Access.is_transient());
    }

    #[test]
    fn test_gatt_error_mapping() {
        assert_eq!(HidError::from(GattError::Timeout), HidError::Timeout);
        assert!(matches!(
            HidError::from(GattError::Status(0x85)),
            HidError::TransportFailure(_)
        ));
    }
}
