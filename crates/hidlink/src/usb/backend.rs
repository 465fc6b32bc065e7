//! USB host stack abstraction
//!
//! `UsbBackend` enumerates HID interfaces and opens devices; `UsbConnection`
//! is one opened device. All calls are blocking and are made from the
//! per-device read worker or from `spawn_blocking`, never from an async task
//! directly.

use protocol::hid::ControlSetup;
use protocol::{DeviceIdentity, DeviceMetadata, UsbError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Transfer type of a non-control endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Bulk,
    Interrupt,
    Isochronous,
}

/// Endpoint descriptor of the claimed interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    /// Endpoint address, bit 7 set for IN
    pub address: u8,
    pub kind: EndpointKind,
    pub max_packet_size: u16,
}

impl EndpointInfo {
    pub fn is_in(&self) -> bool {
        (self.address & 0x80) != 0
    }

    /// Bulk or interrupt; the only kinds a HID report travels over
    pub fn carries_reports(&self) -> bool {
        matches!(self.kind, EndpointKind::Bulk | EndpointKind::Interrupt)
    }
}

/// A HID interface found during enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbInterfaceInfo {
    pub identity: DeviceIdentity,
    pub metadata: DeviceMetadata,
}

/// Platform USB host stack
pub trait UsbBackend: Send + Sync {
    /// HID (and known vendor game controller) interfaces currently attached
    fn enumerate(&self) -> Result<Vec<UsbInterfaceInfo>, UsbError>;

    /// Whether the platform already allows opening this device
    fn has_permission(&self, identity: &DeviceIdentity) -> bool;

    /// Ask the platform (or the user) for access
    ///
    /// Must not block; the decision is delivered through `reply`. Dropping
    /// `reply` counts as a denial.
    fn request_permission(&self, identity: &DeviceIdentity, reply: oneshot::Sender<bool>);

    /// Open the device holding the interface named by `identity`
    fn open_device(&self, identity: &DeviceIdentity) -> Result<Arc<dyn UsbConnection>, UsbError>;
}

/// One opened USB device
///
/// Methods take `&self`: the read worker reads while other threads write
/// and issue control transfers on the same handle.
pub trait UsbConnection: Send + Sync {
    /// Endpoints of `interface` (first alternate setting)
    fn endpoints(&self, interface: u8) -> Result<Vec<EndpointInfo>, UsbError>;

    fn claim_interface(&self, interface: u8) -> Result<(), UsbError>;

    fn release_interface(&self, interface: u8) -> Result<(), UsbError>;

    /// Read one report from an IN endpoint
    fn read(&self, endpoint: &EndpointInfo, buf: &mut [u8], timeout: Duration)
    -> Result<usize, UsbError>;

    /// Write one report to an OUT endpoint
    fn write(&self, endpoint: &EndpointInfo, data: &[u8], timeout: Duration)
    -> Result<usize, UsbError>;

    fn control_in(
        &self,
        setup: ControlSetup,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;

    fn control_out(
        &self,
        setup: ControlSetup,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;

    /// Abort a read blocked in another thread, if the stack supports it
    fn cancel_pending(&self);

    /// Close the handle; later calls fail with `UsbError::NoDevice`
    fn close(&self);
}
