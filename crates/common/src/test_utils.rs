//! Test utilities for hidlink
//!
//! Provides a recording consumer, identity/metadata builders and async
//! timeout helpers shared by the crates' unit and integration tests.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{mock_ble_identity, mock_metadata};
//!
//! let identity = mock_ble_identity(1);
//! let metadata = mock_metadata("Controller", 0x28de, 0x1106);
//! assert_eq!(metadata.vendor_id, 0x28de);
//! assert!(identity.key().starts_with("ble:"));
//! ```

use crate::channel::{HidConsumer, HidEvent};
use parking_lot::Mutex;
use protocol::{DeviceId, DeviceIdentity, DeviceInfo, DeviceMetadata, HidError, RequestToken};
use std::future::Future;
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// USB identity with a serial number derived from `n`
pub fn mock_usb_identity(n: u32) -> DeviceIdentity {
    DeviceIdentity::usb(0x28de, 0x1142, Some(format!("SN{:06}", n)), "1-1", 0)
}

/// BLE identity with an address derived from `n`
pub fn mock_ble_identity(n: u32) -> DeviceIdentity {
    let b = n.to_be_bytes();
    DeviceIdentity::ble(format!("C0:FF:{:02X}:{:02X}:{:02X}:{:02X}", b[0], b[1], b[2], b[3]))
}

pub fn mock_metadata(name: &str, vendor_id: u16, product_id: u16) -> DeviceMetadata {
    DeviceMetadata {
        name: name.to_string(),
        vendor_id,
        product_id,
        manufacturer: Some("Test Manufacturer".to_string()),
        serial_number: None,
    }
}

/// Consumer that records every callback in order
#[derive(Default)]
pub struct RecordingConsumer {
    events: Mutex<Vec<HidEvent>>,
}

impl RecordingConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events so far
    pub fn events(&self) -> Vec<HidEvent> {
        self.events.lock().clone()
    }

    pub fn connected_count(&self, id: DeviceId) -> usize {
        self.count(|e| matches!(e, HidEvent::Connected { device } if device.id == id))
    }

    pub fn disconnected_count(&self, id: DeviceId) -> usize {
        self.count(|e| matches!(e, HidEvent::Disconnected { id: d } if *d == id))
    }

    /// Input reports received for `id`, in delivery order
    pub fn input_reports(&self, id: DeviceId) -> Vec<Vec<u8>> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                HidEvent::InputReport { id: d, data } if *d == id => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&HidEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(*e)).count()
    }

    /// Poll until `pred` matches some recorded event or `timeout` expires
    pub fn wait_for(&self, timeout: Duration, pred: impl Fn(&HidEvent) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.events.lock().iter().any(&pred) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn record(&self, event: HidEvent) {
        self.events.lock().push(event);
    }
}

impl HidConsumer for RecordingConsumer {
    fn on_device_connected(&self, device: &DeviceInfo) {
        self.record(HidEvent::Connected {
            device: device.clone(),
        });
    }

    fn on_device_disconnected(&self, id: DeviceId) {
        self.record(HidEvent::Disconnected { id });
    }

    fn on_input_report(&self, id: DeviceId, bytes: &[u8]) {
        self.record(HidEvent::InputReport {
            id,
            data: bytes.to_vec(),
        });
    }

    fn on_write_complete(&self, id: DeviceId, token: RequestToken, result: Result<usize, HidError>) {
        self.record(HidEvent::WriteComplete { id, token, result });
    }

    fn on_feature_report(
        &self,
        id: DeviceId,
        token: RequestToken,
        result: Result<Vec<u8>, HidError>,
    ) {
        self.record(HidEvent::FeatureReport { id, token, result });
    }
}

/// Run an async test with a timeout
///
/// # Example
/// ```
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// # #[tokio::main]
/// # async fn main() {
/// let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
/// assert_eq!(result, 42);
/// # }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
