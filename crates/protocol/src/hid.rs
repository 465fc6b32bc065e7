//! HID class conventions on USB
//!
//! Control transfer layout for GET_REPORT / SET_REPORT, report types, and
//! the interface classes treated as HID devices.

use std::time::Duration;

/// HID class request: GET_REPORT
pub const HID_GET_REPORT: u8 = 0x01;
/// HID class request: SET_REPORT
pub const HID_SET_REPORT: u8 = 0x09;

/// bmRequestType: host-to-device, class, interface recipient
pub const REQUEST_TYPE_CLASS_INTERFACE_OUT: u8 = 0x21;
/// bmRequestType: device-to-host, class, interface recipient
pub const REQUEST_TYPE_CLASS_INTERFACE_IN: u8 = 0xA1;

/// Fixed timeout for feature report control transfers
pub const FEATURE_REPORT_TIMEOUT: Duration = Duration::from_millis(1000);

/// USB interface class code for HID
pub const USB_CLASS_HID: u8 = 0x03;
/// Vendor-specific interface class
pub const USB_CLASS_VENDOR_SPEC: u8 = 0xFF;

/// Xbox 360 controller interface (vendor class, subclass 0x5D, protocol 0x01)
const XBOX360_IFACE_SUBCLASS: u8 = 0x5D;
const XBOX360_IFACE_PROTOCOL: u8 = 0x01;
/// Xbox One controller interface (vendor class, subclass 0x47, protocol 0xD0)
const XBOXONE_IFACE_SUBCLASS: u8 = 0x47;
const XBOXONE_IFACE_PROTOCOL: u8 = 0xD0;

/// HID report type, the high byte of wValue in GET/SET_REPORT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReportType {
    Input = 1,
    Output = 2,
    Feature = 3,
}

/// Setup packet fields of a control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlSetup {
    /// SET_REPORT for the given report type and ID on `interface`
    pub fn set_report(report_type: ReportType, report_id: u8, interface: u8) -> Self {
        Self {
            request_type: REQUEST_TYPE_CLASS_INTERFACE_OUT,
            request: HID_SET_REPORT,
            value: report_value(report_type, report_id),
            index: u16::from(interface),
        }
    }

    /// GET_REPORT for the given report type and ID on `interface`
    pub fn get_report(report_type: ReportType, report_id: u8, interface: u8) -> Self {
        Self {
            request_type: REQUEST_TYPE_CLASS_INTERFACE_IN,
            request: HID_GET_REPORT,
            value: report_value(report_type, report_id),
            index: u16::from(interface),
        }
    }
}

/// wValue for GET/SET_REPORT: `(report_type << 8) | report_id`
pub fn report_value(report_type: ReportType, report_id: u8) -> u16 {
    (u16::from(report_type as u8) << 8) | u16::from(report_id)
}

/// Split a caller-supplied report into its report ID and wire payload
///
/// Byte 0 is always the report ID. Report ID 0 means the device does not use
/// numbered reports, so the ID byte is not sent on the wire.
pub fn split_report_id(report: &[u8]) -> (u8, &[u8]) {
    match report.split_first() {
        Some((0, rest)) => (0, rest),
        Some((&id, _)) => (id, report),
        None => (0, report),
    }
}

/// Whether an interface should be exposed as a HID device
pub fn is_hid_interface(class: u8, subclass: u8, protocol: u8) -> bool {
    if class == USB_CLASS_HID {
        return true;
    }
    class == USB_CLASS_VENDOR_SPEC
        && matches!(
            (subclass, protocol),
            (XBOX360_IFACE_SUBCLASS, XBOX360_IFACE_PROTOCOL)
                | (XBOXONE_IFACE_SUBCLASS, XBOXONE_IFACE_PROTOCOL)
        )
}
