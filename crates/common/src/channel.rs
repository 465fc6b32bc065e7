//! Upstream consumer interface and its async channel bridge
//!
//! The coordinator reports lifecycle changes and input through the
//! `HidConsumer` callbacks. Callbacks are invoked from USB read workers and
//! BLE transport tasks, never with the coordinator lock held, so they must
//! be cheap and must not block. `ChannelConsumer` turns them into
//! `HidEvent`s on a channel for consumers living on an async runtime.

use async_channel::{Receiver, Sender, unbounded};
use protocol::{DeviceId, DeviceInfo, HidError, RequestToken};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, trace};

/// Default number of input reports the bridge buffers
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Callbacks exposed to the upstream consumer
pub trait HidConsumer: Send + Sync {
    /// Device finished opening and is delivering reports
    fn on_device_connected(&self, device: &DeviceInfo);

    /// Terminal event for a device previously reported connected
    fn on_device_disconnected(&self, id: DeviceId);

    /// Input report, in hardware order for each device
    fn on_input_report(&self, id: DeviceId, bytes: &[u8]);

    /// Completion of a `submit_write` request
    fn on_write_complete(&self, id: DeviceId, token: RequestToken, result: Result<usize, HidError>);

    /// Completion of a `request_feature_report` request
    fn on_feature_report(
        &self,
        _id: DeviceId,
        _token: RequestToken,
        _result: Result<Vec<u8>, HidError>,
    ) {
    }
}

/// Consumer callbacks as values
#[derive(Debug, Clone, PartialEq)]
pub enum HidEvent {
    Connected {
        device: DeviceInfo,
    },
    Disconnected {
        id: DeviceId,
    },
    InputReport {
        id: DeviceId,
        data: Vec<u8>,
    },
    WriteComplete {
        id: DeviceId,
        token: RequestToken,
        result: Result<usize, HidError>,
    },
    FeatureReport {
        id: DeviceId,
        token: RequestToken,
        result: Result<Vec<u8>, HidError>,
    },
}

/// `HidConsumer` that forwards every callback into a channel
///
/// Callbacks never block. Only input reports are bounded: once `capacity`
/// of them are waiting, further reports are dropped and counted. Lifecycle
/// and completion events are always queued, in order with the reports, so a
/// connected device always gets its `Disconnected`.
pub struct ChannelConsumer {
    tx: Sender<HidEvent>,
    pending_reports: Arc<AtomicUsize>,
    report_capacity: usize,
    dropped_reports: AtomicU64,
}

impl ChannelConsumer {
    /// Input reports dropped because the receiver fell behind
    pub fn dropped_reports(&self) -> u64 {
        self.dropped_reports.load(Ordering::Relaxed)
    }

    fn forward_report(&self, id: DeviceId, data: Vec<u8>) {
        let reserved = self
            .pending_reports
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                (pending < self.report_capacity).then_some(pending + 1)
            })
            .is_ok();
        if !reserved {
            let dropped = self.dropped_reports.fetch_add(1, Ordering::Relaxed) + 1;
            trace!("Event channel full, dropped input report for {} ({} total)", id, dropped);
            return;
        }

        if self.tx.try_send(HidEvent::InputReport { id, data }).is_err() {
            self.pending_reports.fetch_sub(1, Ordering::AcqRel);
            trace!("Event channel closed, discarding input report");
        }
    }

    fn forward(&self, event: HidEvent) {
        if let Err(e) = self.tx.try_send(event) {
            debug!("Event channel closed, discarding {:?}", e.into_inner());
        }
    }
}

impl HidConsumer for ChannelConsumer {
    fn on_device_connected(&self, device: &DeviceInfo) {
        self.forward(HidEvent::Connected {
            device: device.clone(),
        });
    }

    fn on_device_disconnected(&self, id: DeviceId) {
        self.forward(HidEvent::Disconnected { id });
    }

    fn on_input_report(&self, id: DeviceId, bytes: &[u8]) {
        self.forward_report(id, bytes.to_vec());
    }

    fn on_write_complete(&self, id: DeviceId, token: RequestToken, result: Result<usize, HidError>) {
        self.forward(HidEvent::WriteComplete { id, token, result });
    }

    fn on_feature_report(
        &self,
        id: DeviceId,
        token: RequestToken,
        result: Result<Vec<u8>, HidError>,
    ) {
        self.forward(HidEvent::FeatureReport { id, token, result });
    }
}

/// Receiving half of the bridge
#[derive(Clone)]
pub struct EventReceiver {
    rx: Receiver<HidEvent>,
    pending_reports: Arc<AtomicUsize>,
}

impl EventReceiver {
    /// Receive the next event (async)
    pub async fn recv(&self) -> crate::Result<HidEvent> {
        self.rx
            .recv()
            .await
            .map(|event| self.received(event))
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive the next event (blocking)
    pub fn recv_blocking(&self) -> crate::Result<HidEvent> {
        self.rx
            .recv_blocking()
            .map(|event| self.received(event))
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&self) -> Option<HidEvent> {
        self.rx.try_recv().ok().map(|event| self.received(event))
    }

    fn received(&self, event: HidEvent) -> HidEvent {
        if matches!(event, HidEvent::InputReport { .. }) {
            self.pending_reports.fetch_sub(1, Ordering::AcqRel);
        }
        event
    }
}

/// Create the consumer/receiver pair
///
/// `capacity` bounds the input reports waiting in the channel.
pub fn create_event_channel(capacity: usize) -> (ChannelConsumer, EventReceiver) {
    let (tx, rx) = unbounded();
    let pending_reports = Arc::new(AtomicUsize::new(0));
    (
        ChannelConsumer {
            tx,
            pending_reports: Arc::clone(&pending_reports),
            report_capacity: capacity.max(1),
            dropped_reports: AtomicU64::new(0),
        },
        EventReceiver {
            rx,
            pending_reports,
        },
    )
}
