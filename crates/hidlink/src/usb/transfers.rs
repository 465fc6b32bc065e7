//! HID report transfers
//!
//! Output and feature reports over an opened connection. Callers pass the
//! report exactly as the consumer supplied it (report ID in byte 0); the
//! report-ID-0 convention is applied here so every path agrees on it.

use crate::usb::backend::{EndpointInfo, UsbConnection};
use protocol::UsbError;
use protocol::hid::{ControlSetup, FEATURE_REPORT_TIMEOUT, ReportType, split_report_id};
use std::time::Duration;
use tracing::{debug, warn};

/// Send an output report
///
/// Uses the interrupt/bulk OUT endpoint when the interface has one, and a
/// SET_REPORT(output) control transfer otherwise. Returns the number of
/// report bytes accepted, counting a stripped report ID.
pub fn write_output_report(
    connection: &dyn UsbConnection,
    interface: u8,
    output: Option<&EndpointInfo>,
    report: &[u8],
    timeout: Duration,
) -> Result<usize, UsbError> {
    let (report_id, payload) = split_report_id(report);
    let skipped = report.len() - payload.len();

    let result = match output {
        Some(endpoint) => {
            debug!(
                "Output report: endpoint={:#x}, report_id={}, len={}",
                endpoint.address,
                report_id,
                payload.len()
            );
            connection.write(endpoint, payload, timeout)
        }
        None => {
            let setup = ControlSetup::set_report(ReportType::Output, report_id, interface);
            debug!(
                "Output report via SET_REPORT: value={:#x}, index={:#x}, len={}",
                setup.value,
                setup.index,
                payload.len()
            );
            connection.control_out(setup, payload, timeout)
        }
    };

    match result {
        Ok(written) => Ok(written + skipped),
        Err(e) => {
            warn!("Output report transfer failed: {}", e);
            Err(e)
        }
    }
}

/// Send a feature report with SET_REPORT(feature)
pub fn write_feature_report(
    connection: &dyn UsbConnection,
    interface: u8,
    report: &[u8],
) -> Result<usize, UsbError> {
    let (report_id, payload) = split_report_id(report);
    let skipped = report.len() - payload.len();
    let setup = ControlSetup::set_report(ReportType::Feature, report_id, interface);

    debug!(
        "SET_REPORT(feature): value={:#x}, index={:#x}, len={}",
        setup.value,
        setup.index,
        payload.len()
    );

    match connection.control_out(setup, payload, FEATURE_REPORT_TIMEOUT) {
        Ok(written) => Ok(written + skipped),
        Err(e) => {
            warn!("Feature report write failed: {}", e);
            Err(e)
        }
    }
}

/// Fetch a feature report with GET_REPORT(feature)
///
/// `len` includes the report ID byte. The result always starts with the
/// report ID, also for devices without numbered reports (ID 0), which do not
/// send it themselves.
pub fn read_feature_report(
    connection: &dyn UsbConnection,
    interface: u8,
    report_id: u8,
    len: usize,
) -> Result<Vec<u8>, UsbError> {
    let setup = ControlSetup::get_report(ReportType::Feature, report_id, interface);
    let mut buffer = vec![0u8; len.max(1)];

    debug!(
        "GET_REPORT(feature): value={:#x}, index={:#x}, len={}",
        setup.value,
        setup.index,
        buffer.len()
    );

    let result = if report_id == 0 {
        connection
            .control_in(setup, &mut buffer[1..], FEATURE_REPORT_TIMEOUT)
            .map(|read| read + 1)
    } else {
        connection.control_in(setup, &mut buffer, FEATURE_REPORT_TIMEOUT)
    };

    match result {
        Ok(read) => {
            buffer.truncate(read);
            if let Some(first) = buffer.first_mut() {
                *first = report_id;
            }
            Ok(buffer)
        }
        Err(e) => {
            warn!("Feature report read failed: {}", e);
            Err(e)
        }
    }
}
