//! libusb binding through rusb
//!
//! Enumeration opens each candidate device briefly to read its string
//! descriptors. Desktop libusb has no permission prompt: access is decided
//! by the OS when the device is opened, so `has_permission` always answers
//! yes and a refusal surfaces from `open_device` as `UsbError::Access`.

use crate::usb::backend::{
    EndpointInfo, EndpointKind, UsbBackend, UsbConnection, UsbInterfaceInfo,
};
use parking_lot::{Mutex, RwLock};
use protocol::hid::{ControlSetup, is_hid_interface};
use protocol::{DeviceIdentity, DeviceMetadata, UsbError};
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, UsbContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// USB host stack backed by libusb
pub struct RusbBackend {
    context: Context,
}

impl RusbBackend {
    pub fn new() -> Result<Self, UsbError> {
        let context = Context::new().map_err(map_rusb_error)?;
        Ok(Self { context })
    }

    fn find_device(&self, identity: &DeviceIdentity) -> Result<Device<Context>, UsbError> {
        let DeviceIdentity::Usb {
            vendor_id,
            product_id,
            serial,
            path,
            ..
        } = identity
        else {
            return Err(UsbError::InvalidParam);
        };

        let devices = self.context.devices().map_err(map_rusb_error)?;
        for device in devices.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            if descriptor.vendor_id() != *vendor_id || descriptor.product_id() != *product_id {
                continue;
            }

            let matches = match serial {
                Some(serial) => {
                    read_strings(&device, &descriptor).2.as_deref() == Some(serial.as_str())
                }
                None => device_path(&device) == *path,
            };
            if matches {
                return Ok(device);
            }
        }

        Err(UsbError::NotFound)
    }
}

impl UsbBackend for RusbBackend {
    fn enumerate(&self) -> Result<Vec<UsbInterfaceInfo>, UsbError> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        let mut found = Vec::new();

        for device in devices.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            let config = match device.active_config_descriptor() {
                Ok(config) => config,
                Err(e) => {
                    debug!(
                        "Skipping {:04x}:{:04x}: no active configuration ({})",
                        descriptor.vendor_id(),
                        descriptor.product_id(),
                        e
                    );
                    continue;
                }
            };

            let hid_interfaces: Vec<u8> = config
                .interfaces()
                .filter_map(|interface| {
                    let setting = interface.descriptors().next()?;
                    is_hid_interface(
                        setting.class_code(),
                        setting.sub_class_code(),
                        setting.protocol_code(),
                    )
                    .then(|| interface.number())
                })
                .collect();
            if hid_interfaces.is_empty() {
                continue;
            }

            let (manufacturer, product, serial) = read_strings(&device, &descriptor);
            let path = device_path(&device);
            let metadata = DeviceMetadata {
                name: product.unwrap_or_else(|| {
                    format!(
                        "USB HID {:04x}:{:04x}",
                        descriptor.vendor_id(),
                        descriptor.product_id()
                    )
                }),
                vendor_id: descriptor.vendor_id(),
                product_id: descriptor.product_id(),
                manufacturer,
                serial_number: serial.clone(),
            };

            for interface in hid_interfaces {
                found.push(UsbInterfaceInfo {
                    identity: DeviceIdentity::usb(
                        descriptor.vendor_id(),
                        descriptor.product_id(),
                        serial.clone(),
                        path.clone(),
                        interface,
                    ),
                    metadata: metadata.clone(),
                });
            }
        }

        debug!("Enumerated {} HID interfaces", found.len());
        Ok(found)
    }

    fn has_permission(&self, _identity: &DeviceIdentity) -> bool {
        true
    }

    fn request_permission(&self, _identity: &DeviceIdentity, reply: oneshot::Sender<bool>) {
        let _ = reply.send(true);
    }

    fn open_device(&self, identity: &DeviceIdentity) -> Result<Arc<dyn UsbConnection>, UsbError> {
        let device = self.find_device(identity)?;
        let handle = device.open().map_err(|e| {
            warn!("Failed to open {}: {}", identity, e);
            map_rusb_error(e)
        })?;
        debug!("Opened {}", identity);

        Ok(Arc::new(RusbConnection {
            device,
            handle: RwLock::new(Some(handle)),
            detached: Mutex::new(Vec::new()),
        }))
    }
}

/// Opened libusb device handle
pub struct RusbConnection {
    device: Device<Context>,
    /// `None` once closed
    handle: RwLock<Option<DeviceHandle<Context>>>,
    /// Interfaces whose kernel driver we detached
    detached: Mutex<Vec<u8>>,
}

impl RusbConnection {
    fn with_handle<T>(
        &self,
        f: impl FnOnce(&DeviceHandle<Context>) -> rusb::Result<T>,
    ) -> Result<T, UsbError> {
        let guard = self.handle.read();
        let handle = guard.as_ref().ok_or(UsbError::NoDevice)?;
        f(handle).map_err(map_rusb_error)
    }
}

impl UsbConnection for RusbConnection {
    fn endpoints(&self, interface: u8) -> Result<Vec<EndpointInfo>, UsbError> {
        let config = self
            .device
            .active_config_descriptor()
            .map_err(map_rusb_error)?;
        let interface = config
            .interfaces()
            .find(|i| i.number() == interface)
            .ok_or(UsbError::NotFound)?;
        let setting = interface.descriptors().next().ok_or(UsbError::NotFound)?;

        Ok(setting
            .endpoint_descriptors()
            .map(|endpoint| EndpointInfo {
                address: endpoint.address(),
                kind: match endpoint.transfer_type() {
                    rusb::TransferType::Bulk => EndpointKind::Bulk,
                    rusb::TransferType::Interrupt => EndpointKind::Interrupt,
                    _ => EndpointKind::Isochronous,
                },
                max_packet_size: endpoint.max_packet_size(),
            })
            .collect())
    }

    fn claim_interface(&self, interface: u8) -> Result<(), UsbError> {
        let mut guard = self.handle.write();
        let handle = guard.as_mut().ok_or(UsbError::NoDevice)?;

        match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                match handle.detach_kernel_driver(interface) {
                    Ok(()) => self.detached.lock().push(interface),
                    Err(e) => warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    ),
                }
            }
            Ok(false) => {}
            Err(e) => debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            ),
        }

        handle.claim_interface(interface).map_err(map_rusb_error)
    }

    fn release_interface(&self, interface: u8) -> Result<(), UsbError> {
        let mut guard = self.handle.write();
        let handle = guard.as_mut().ok_or(UsbError::NoDevice)?;

        let result = handle.release_interface(interface).map_err(map_rusb_error);

        let mut detached = self.detached.lock();
        if let Some(pos) = detached.iter().position(|i| *i == interface) {
            detached.remove(pos);
            if let Err(e) = handle.attach_kernel_driver(interface) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                );
            }
        }

        result
    }

    fn read(
        &self,
        endpoint: &EndpointInfo,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        self.with_handle(|handle| match endpoint.kind {
            EndpointKind::Bulk => handle.read_bulk(endpoint.address, buf, timeout),
            _ => handle.read_interrupt(endpoint.address, buf, timeout),
        })
    }

    fn write(
        &self,
        endpoint: &EndpointInfo,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        self.with_handle(|handle| match endpoint.kind {
            EndpointKind::Bulk => handle.write_bulk(endpoint.address, data, timeout),
            _ => handle.write_interrupt(endpoint.address, data, timeout),
        })
    }

    fn control_in(
        &self,
        setup: ControlSetup,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        self.with_handle(|handle| {
            handle.read_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                buf,
                timeout,
            )
        })
    }

    fn control_out(
        &self,
        setup: ControlSetup,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        self.with_handle(|handle| {
            handle.write_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                data,
                timeout,
            )
        })
    }

    fn cancel_pending(&self) {
        // The synchronous API has no cancel; a blocked read returns within
        // its timeout.
    }

    fn close(&self) {
        if self.handle.write().take().is_some() {
            debug!(
                "Closed device on bus {:03} address {:03}",
                self.device.bus_number(),
                self.device.address()
            );
        }
    }
}

/// Bus/port path such as "1-4.2"
fn device_path(device: &Device<Context>) -> String {
    match device.port_numbers() {
        Ok(ports) if !ports.is_empty() => {
            let ports: Vec<String> = ports.iter().map(u8::to_string).collect();
            format!("{}-{}", device.bus_number(), ports.join("."))
        }
        _ => format!("{}-{}", device.bus_number(), device.address()),
    }
}

/// Manufacturer, product and serial strings, when the device can be opened
fn read_strings(
    device: &Device<Context>,
    descriptor: &DeviceDescriptor,
) -> (Option<String>, Option<String>, Option<String>) {
    let Ok(handle) = device.open() else {
        return (None, None, None);
    };

    let read = |index: Option<u8>| index.and_then(|i| handle.read_string_descriptor_ascii(i).ok());
    (
        read(descriptor.manufacturer_string_index()),
        read(descriptor.product_string_index()),
        read(descriptor.serial_number_string_index()),
    )
}

/// Map rusb::Error to protocol::UsbError
pub fn map_rusb_error(err: rusb::Error) -> UsbError {
    match err {
        rusb::Error::Timeout => UsbError::Timeout,
        rusb::Error::Pipe => UsbError::Pipe,
        rusb::Error::NoDevice => UsbError::NoDevice,
        rusb::Error::NotFound => UsbError::NotFound,
        rusb::Error::Busy => UsbError::Busy,
        rusb::Error::Overflow => UsbError::Overflow,
        rusb::Error::Io => UsbError::Io,
        rusb::Error::Interrupted => UsbError::Interrupted,
        rusb::Error::InvalidParam => UsbError::InvalidParam,
        rusb::Error::Access => UsbError::Access,
        _ => UsbError::Other {
            message: err.to_string(),
        },
    }
}
