//! Device coordinator
//!
//! Registry of every device discovered on any transport. The coordinator
//! owns the device records, hands out stable IDs through the identity store,
//! drives the open/close lifecycle and routes reports between transports and
//! the upstream consumer.
//!
//! ```text
//!              on_device_discovered
//!                      │
//!                      ▼
//!   ┌──────────► Discovered ──open──► PendingPermission ──granted──┐ (USB)
//!   │                  │                                          ▼
//!   │                  └──────────────open (BLE)──────────────► Opening
//!   │                                                             │
//!   │                                              transport ready│
//! Closed ◄── Closing ◄──close / transport failure── Open ◄────────┘
//!   │
//!   └──open──► (same path as Discovered)
//! ```
//!
//! Locking: the device table sits behind one mutex that is never held across
//! a platform call or a consumer callback. Consumer callbacks for a device
//! are ordered by that device's gate, which is always taken before the table.

use crate::ble::{BleBackend, BleSettings, BleTransport};
use crate::sink::ReportSink;
use crate::usb::{UsbBackend, UsbTransport, UsbTransportSettings};
use common::input_queue::DEFAULT_QUEUE_CAPACITY;
use common::{BufferPool, HidConsumer, IdentityStore, InputQueue};
use parking_lot::{Mutex, ReentrantMutex};
use protocol::{
    Capabilities, DeviceId, DeviceIdentity, DeviceInfo, DeviceMetadata, DeviceState, HidError,
    QueueStats, Report, RequestToken, TransportKind,
};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, error, info, trace, warn};

/// Tuning shared by every device the coordinator opens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    /// Input reports buffered per device before the oldest is dropped
    pub queue_capacity: usize,
    pub usb: UsbTransportSettings,
    pub ble: BleSettings,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            usb: UsbTransportSettings::default(),
            ble: BleSettings::default(),
        }
    }
}

/// Transport of an open device
#[derive(Clone)]
enum TransportHandle {
    Usb(Arc<UsbTransport>),
    Ble(Arc<BleTransport>),
}

impl TransportHandle {
    fn shutdown(&self) {
        match self {
            TransportHandle::Usb(t) => t.shutdown(),
            TransportHandle::Ble(t) => t.shutdown(),
        }
    }

    fn freeze(&self) {
        match self {
            TransportHandle::Usb(t) => t.suspend(),
            TransportHandle::Ble(t) => t.freeze(),
        }
    }

    fn thaw(&self) -> Result<(), HidError> {
        match self {
            TransportHandle::Usb(t) => t.resume(),
            TransportHandle::Ble(t) => {
                t.thaw();
                Ok(())
            }
        }
    }
}

struct DeviceRecord {
    id: DeviceId,
    identity: DeviceIdentity,
    metadata: DeviceMetadata,
    state: DeviceState,
    /// Present only while `Open`
    transport: Option<TransportHandle>,
    /// Replaced on every open so stale readers see a closed queue
    queue: Arc<InputQueue>,
    /// `on_device_connected` was emitted and the terminal disconnect is owed
    announced: bool,
    /// Bumped by every open and close; sinks of older transports go stale
    generation: u64,
    /// Wakes a pending `open` when the device is closed under it
    opening: Option<Arc<Notify>>,
    /// Orders consumer callbacks for this device
    gate: Arc<ReentrantMutex<()>>,
}

impl DeviceRecord {
    fn new(id: DeviceId, identity: DeviceIdentity, metadata: DeviceMetadata, capacity: usize) -> Self {
        Self {
            id,
            identity,
            metadata,
            state: DeviceState::Discovered,
            transport: None,
            queue: Arc::new(InputQueue::new(capacity)),
            announced: false,
            generation: 0,
            opening: None,
            gate: Arc::new(ReentrantMutex::new(())),
        }
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.id,
            kind: self.identity.kind(),
            name: self.metadata.name.clone(),
            vendor_id: self.metadata.vendor_id,
            product_id: self.metadata.product_id,
            manufacturer: self.metadata.manufacturer.clone(),
            serial_number: self.metadata.serial_number.clone(),
            capabilities: Capabilities::ALL,
            state: self.state,
        }
    }

    /// Still the open (or opening) incarnation `generation` refers to
    fn is_current(&self, generation: Option<u64>) -> bool {
        generation.is_none_or(|g| g == self.generation)
    }
}

struct DeviceTable {
    records: BTreeMap<DeviceId, DeviceRecord>,
    identities: IdentityStore,
}

/// What a close took out of the record; torn down without the table lock
struct Teardown {
    id: DeviceId,
    transport: Option<TransportHandle>,
    queue: Arc<InputQueue>,
    announced: bool,
    gate: Arc<ReentrantMutex<()>>,
}

struct Inner {
    table: Mutex<DeviceTable>,
    consumer: Arc<dyn HidConsumer>,
    usb: Option<Arc<dyn UsbBackend>>,
    ble: Option<Arc<dyn BleBackend>>,
    pool: Arc<BufferPool>,
    settings: CoordinatorSettings,
    frozen: AtomicBool,
    /// Serializes freeze/thaw walks with the freeze decision of a committing open
    freeze_lock: Mutex<()>,
    next_token: AtomicU64,
}

impl Inner {
    fn dispatch_input(&self, id: DeviceId, generation: Option<u64>, bytes: Vec<u8>) {
        if self.frozen.load(Ordering::Acquire) {
            trace!("{}: input dropped while frozen", id);
            self.pool.release(bytes);
            return;
        }

        let Some(gate) = self.live(id, generation).map(|(gate, _)| gate) else {
            trace!("{}: input for a device that is not open dropped", id);
            self.pool.release(bytes);
            return;
        };

        let _gate = gate.lock();
        // Re-check under the gate; a close may have won the race.
        let Some((_, queue)) = self.live(id, generation) else {
            self.pool.release(bytes);
            return;
        };

        self.consumer.on_input_report(id, &bytes);
        if let Some(evicted) = queue.push(Report::input(id, bytes)) {
            self.pool.release(evicted.bytes);
        }
    }

    /// Gate and queue of a device that is `Open` in `generation`
    fn live(
        &self,
        id: DeviceId,
        generation: Option<u64>,
    ) -> Option<(Arc<ReentrantMutex<()>>, Arc<InputQueue>)> {
        let table = self.table.lock();
        let record = table.records.get(&id)?;
        (record.state == DeviceState::Open && record.is_current(generation))
            .then(|| (Arc::clone(&record.gate), Arc::clone(&record.queue)))
    }

    fn transport_failed(&self, id: DeviceId, generation: u64, error: HidError) {
        let teardown = {
            let mut table = self.table.lock();
            match table.records.get_mut(&id) {
                Some(record) if record.generation == generation && record.state.is_active() => {
                    error!("Transport for {} failed: {}", id, error);
                    Some(Self::begin_close(record))
                }
                _ => None,
            }
        };

        match teardown {
            Some(teardown) => self.finish_close(teardown),
            None => debug!("{}: stale transport failure ignored: {}", id, error),
        }
    }

    /// Move the record to `Closing` and take what needs tearing down
    fn begin_close(record: &mut DeviceRecord) -> Teardown {
        record.state = DeviceState::Closing;
        record.generation += 1;
        if let Some(opening) = record.opening.take() {
            opening.notify_one();
        }
        Teardown {
            id: record.id,
            transport: record.transport.take(),
            queue: Arc::clone(&record.queue),
            announced: std::mem::take(&mut record.announced),
            gate: Arc::clone(&record.gate),
        }
    }

    fn finish_close(&self, teardown: Teardown) {
        let Teardown {
            id,
            transport,
            queue,
            announced,
            gate,
        } = teardown;

        queue.close();
        if let Some(transport) = transport {
            transport.shutdown();
        }

        {
            let mut table = self.table.lock();
            if let Some(record) = table.records.get_mut(&id)
                && record.state == DeviceState::Closing
            {
                record.state = DeviceState::Closed;
            }
        }

        for report in queue.clear() {
            self.pool.release(report.bytes);
        }

        if announced {
            let _gate = gate.lock();
            self.consumer.on_device_disconnected(id);
        }
        info!("Device {} closed", id);
    }

    fn abandon_open(&self, id: DeviceId, generation: u64) {
        let mut table = self.table.lock();
        if let Some(record) = table.records.get_mut(&id)
            && record.generation == generation
            && record.state.is_active()
        {
            record.state = DeviceState::Closed;
            record.opening = None;
            record.queue.close();
        }
    }

    /// Step a pending open from `from` to `to`
    fn advance(
        &self,
        id: DeviceId,
        generation: u64,
        from: DeviceState,
        to: DeviceState,
    ) -> Result<(), HidError> {
        let mut table = self.table.lock();
        match table.records.get_mut(&id) {
            Some(record) if record.generation == generation && record.state == from => {
                debug!("{}: {} -> {}", id, from, to);
                record.state = to;
                Ok(())
            }
            _ => Err(HidError::NotOpen(id)),
        }
    }
}

/// Sink handed to a transport; bound to one open of one device
struct TransportSink {
    id: DeviceId,
    generation: u64,
    inner: Weak<Inner>,
}

impl ReportSink for TransportSink {
    fn dispatch_input(&self, bytes: Vec<u8>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.dispatch_input(self.id, Some(self.generation), bytes);
        }
    }

    fn transport_failed(&self, error: HidError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.transport_failed(self.id, self.generation, error);
        }
    }
}

/// Cleans up an `open` whose future was dropped before it finished
struct OpenGuard<'a> {
    inner: &'a Inner,
    id: DeviceId,
    generation: u64,
    armed: bool,
}

impl Drop for OpenGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("{}: open abandoned", self.id);
            self.inner.abandon_open(self.id, self.generation);
        }
    }
}

/// Builder for [`DeviceCoordinator`]
pub struct CoordinatorBuilder {
    consumer: Arc<dyn HidConsumer>,
    identities: IdentityStore,
    usb: Option<Arc<dyn UsbBackend>>,
    ble: Option<Arc<dyn BleBackend>>,
    pool: Option<Arc<BufferPool>>,
    settings: CoordinatorSettings,
}

impl CoordinatorBuilder {
    /// Identity store to allocate IDs from (default: in-memory)
    pub fn identity_store(mut self, store: IdentityStore) -> Self {
        self.identities = store;
        self
    }

    pub fn usb_backend(mut self, backend: Arc<dyn UsbBackend>) -> Self {
        self.usb = Some(backend);
        self
    }

    pub fn ble_backend(mut self, backend: Arc<dyn BleBackend>) -> Self {
        self.ble = Some(backend);
        self
    }

    pub fn pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn settings(mut self, settings: CoordinatorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> DeviceCoordinator {
        DeviceCoordinator {
            inner: Arc::new(Inner {
                table: Mutex::new(DeviceTable {
                    records: BTreeMap::new(),
                    identities: self.identities,
                }),
                consumer: self.consumer,
                usb: self.usb,
                ble: self.ble,
                pool: self.pool.unwrap_or_default(),
                settings: self.settings,
                frozen: AtomicBool::new(false),
                freeze_lock: Mutex::new(()),
                next_token: AtomicU64::new(1),
            }),
        }
    }
}

/// Registry and lifecycle driver for every HID device
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct DeviceCoordinator {
    inner: Arc<Inner>,
}

impl DeviceCoordinator {
    pub fn builder(consumer: Arc<dyn HidConsumer>) -> CoordinatorBuilder {
        CoordinatorBuilder {
            consumer,
            identities: IdentityStore::in_memory(),
            usb: None,
            ble: None,
            pool: None,
            settings: CoordinatorSettings::default(),
        }
    }

    /// Register a device seen by discovery and return its stable ID
    ///
    /// Rediscovery refreshes the metadata and never changes the state.
    /// Fails only for a new identity once the ID space is exhausted.
    pub fn on_device_discovered(
        &self,
        identity: DeviceIdentity,
        metadata: DeviceMetadata,
    ) -> Result<DeviceId, HidError> {
        let key = identity.key();
        let mut table = self.inner.table.lock();
        let (id, allocated) = table
            .identities
            .get_or_allocate(&key)
            .map_err(|_| HidError::IdsExhausted)?;

        match table.records.entry(id) {
            Entry::Occupied(entry) => {
                let record = entry.into_mut();
                debug!("Device {} rediscovered ({})", id, record.state);
                record.identity = identity;
                record.metadata = metadata;
            }
            Entry::Vacant(entry) => {
                info!(
                    "Discovered {} device {} as {}{}",
                    identity.kind(),
                    metadata.name,
                    id,
                    if allocated { "" } else { " (known identity)" }
                );
                entry.insert(DeviceRecord::new(
                    id,
                    identity,
                    metadata,
                    self.inner.settings.queue_capacity,
                ));
            }
        }
        Ok(id)
    }

    /// Hot-unplug: close the device if needed; the record and ID stay
    pub fn on_device_removed(&self, identity: &DeviceIdentity) {
        let id = self.inner.table.lock().identities.lookup(&identity.key());
        match id {
            Some(id) => {
                info!("Device {} removed", id);
                if let Err(e) = self.close(id) {
                    debug!("Close of removed device {} failed: {}", id, e);
                }
            }
            None => debug!("Removal of unknown device {} ignored", identity),
        }
    }

    /// Open the device, waiting at most `timeout` for the transport
    ///
    /// Returns the current state without doing anything when the device is
    /// already opening or open.
    pub async fn open(&self, id: DeviceId, timeout: Duration) -> Result<DeviceState, HidError> {
        let (generation, identity, opening) = {
            let mut table = self.inner.table.lock();
            let record = table
                .records
                .get_mut(&id)
                .ok_or(HidError::UnknownDevice(id))?;

            if record.state.is_active() {
                debug!("{} already {}", id, record.state);
                return Ok(record.state);
            }
            if !record.state.can_open() {
                return Err(HidError::InvalidState {
                    id,
                    state: record.state,
                });
            }

            record.generation += 1;
            record.state = match record.identity.kind() {
                TransportKind::Usb => DeviceState::PendingPermission,
                TransportKind::Ble => DeviceState::Opening,
            };
            record.queue = Arc::new(InputQueue::new(self.inner.settings.queue_capacity));
            let opening = Arc::new(Notify::new());
            record.opening = Some(Arc::clone(&opening));
            (record.generation, record.identity.clone(), opening)
        };

        info!("Opening device {} ({})", id, identity);
        let mut guard = OpenGuard {
            inner: &self.inner,
            id,
            generation,
            armed: true,
        };

        let result = tokio::select! {
            result = tokio::time::timeout(timeout, self.establish(id, generation, &identity)) => {
                result.unwrap_or_else(|_| {
                    warn!("Open of {} timed out after {:?}", id, timeout);
                    Err(HidError::Timeout)
                })
            }
            () = opening.notified() => {
                debug!("{} closed while opening", id);
                Err(HidError::NotOpen(id))
            }
        };

        guard.armed = false;
        match result {
            Ok(transport) => self.commit_open(id, generation, transport),
            Err(e) => {
                warn!("Failed to open {}: {}", id, e);
                self.inner.abandon_open(id, generation);
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        id: DeviceId,
        generation: u64,
        identity: &DeviceIdentity,
    ) -> Result<TransportHandle, HidError> {
        let sink: Arc<dyn ReportSink> = Arc::new(TransportSink {
            id,
            generation,
            inner: Arc::downgrade(&self.inner),
        });

        match identity.kind() {
            TransportKind::Usb => self
                .establish_usb(id, generation, identity, sink)
                .await
                .map(TransportHandle::Usb),
            TransportKind::Ble => {
                let backend = self.inner.ble.clone().ok_or_else(|| {
                    HidError::TransportFailure("no BLE backend configured".to_string())
                })?;
                BleTransport::open(id, identity, backend.as_ref(), self.inner.settings.ble, sink)
                    .await
                    .map(TransportHandle::Ble)
            }
        }
    }

    async fn establish_usb(
        &self,
        id: DeviceId,
        generation: u64,
        identity: &DeviceIdentity,
        sink: Arc<dyn ReportSink>,
    ) -> Result<Arc<UsbTransport>, HidError> {
        let backend = self
            .inner
            .usb
            .clone()
            .ok_or_else(|| HidError::TransportFailure("no USB backend configured".to_string()))?;

        if !backend.has_permission(identity) {
            debug!("Requesting USB permission for {}", id);
            let (reply, granted) = oneshot::channel();
            backend.request_permission(identity, reply);
            if !granted.await.unwrap_or(false) {
                warn!("USB permission for {} denied", id);
                return Err(HidError::PermissionDenied);
            }
        }

        self.inner.advance(
            id,
            generation,
            DeviceState::PendingPermission,
            DeviceState::Opening,
        )?;

        let interface = match identity {
            DeviceIdentity::Usb { interface, .. } => *interface,
            DeviceIdentity::Ble { .. } => 0,
        };
        let identity = identity.clone();
        let settings = self.inner.settings.usb;
        let pool = Arc::clone(&self.inner.pool);

        tokio::task::spawn_blocking(move || {
            let connection = backend.open_device(&identity)?;
            UsbTransport::open(id, connection, interface, settings, sink, pool)
        })
        .await
        .map_err(|e| HidError::TransportFailure(format!("USB open task failed: {}", e)))?
    }

    fn commit_open(
        &self,
        id: DeviceId,
        generation: u64,
        transport: TransportHandle,
    ) -> Result<DeviceState, HidError> {
        let Some(gate) = self.gate(id) else {
            transport.shutdown();
            return Err(HidError::UnknownDevice(id));
        };

        let gate_guard = gate.lock();
        let info = {
            let mut table = self.inner.table.lock();
            match table.records.get_mut(&id) {
                Some(record) if record.generation == generation && record.state.is_active() => {
                    record.state = DeviceState::Open;
                    record.transport = Some(transport.clone());
                    record.announced = true;
                    record.opening = None;
                    Some(record.info())
                }
                _ => None,
            }
        };

        let Some(info) = info else {
            drop(gate_guard);
            debug!("{} closed before open completed", id);
            transport.shutdown();
            return Err(HidError::NotOpen(id));
        };

        info!("Device {} ({}) open", id, info.name);
        self.inner.consumer.on_device_connected(&info);
        drop(gate_guard);

        // Taken after the gate: suspending a USB worker waits for its gate.
        // The record is already Open, so a freeze or thaw that takes the lock
        // after us walks this transport too.
        let _freeze = self.inner.freeze_lock.lock();
        if self.inner.frozen.load(Ordering::Acquire) {
            transport.freeze();
        }
        Ok(DeviceState::Open)
    }

    /// Tear the device down; valid from any state
    ///
    /// A pending `open` fails with `NotOpen`. A device that was announced
    /// connected gets its single `on_device_disconnected`.
    pub fn close(&self, id: DeviceId) -> Result<(), HidError> {
        let teardown = {
            let mut table = self.inner.table.lock();
            let record = table
                .records
                .get_mut(&id)
                .ok_or(HidError::UnknownDevice(id))?;
            match record.state {
                DeviceState::Closed | DeviceState::Closing => return Ok(()),
                _ => Inner::begin_close(record),
            }
        };

        info!("Closing device {}", id);
        self.inner.finish_close(teardown);
        Ok(())
    }

    /// Write an output or feature report; byte 0 is the report ID
    pub async fn write_report(
        &self,
        id: DeviceId,
        bytes: &[u8],
        is_feature: bool,
    ) -> Result<usize, HidError> {
        match self.open_transport(id)? {
            TransportHandle::Usb(transport) => {
                let bytes = bytes.to_vec();
                tokio::task::spawn_blocking(move || transport.write(&bytes, is_feature))
                    .await
                    .map_err(|e| HidError::TransportFailure(format!("write task failed: {}", e)))?
            }
            TransportHandle::Ble(transport) => transport.write(bytes.to_vec(), is_feature).await,
        }
    }

    /// GET_REPORT(feature); byte 0 of the result is `report_id`
    pub async fn get_feature_report(
        &self,
        id: DeviceId,
        report_id: u8,
        len: usize,
    ) -> Result<Vec<u8>, HidError> {
        match self.open_transport(id)? {
            TransportHandle::Usb(transport) => {
                tokio::task::spawn_blocking(move || transport.get_feature_report(report_id, len))
                    .await
                    .map_err(|e| {
                        HidError::TransportFailure(format!("feature read task failed: {}", e))
                    })?
            }
            TransportHandle::Ble(transport) => transport.get_feature_report(report_id, len).await,
        }
    }

    /// Start a write in the background; the result arrives through
    /// `on_write_complete` with the returned token
    pub fn submit_write(
        &self,
        id: DeviceId,
        bytes: Vec<u8>,
        is_feature: bool,
    ) -> Result<RequestToken, HidError> {
        self.open_transport(id)?;
        let runtime = runtime_handle()?;
        let token = self.next_token();

        let coordinator = self.clone();
        runtime.spawn(async move {
            let result = coordinator.write_report(id, &bytes, is_feature).await;
            debug!("{}: write {:?} finished: {:?}", id, token, result);
            coordinator.with_gate(id, |consumer| consumer.on_write_complete(id, token, result));
        });
        Ok(token)
    }

    /// Start a feature read in the background; the result arrives through
    /// `on_feature_report` with the returned token
    pub fn request_feature_report(
        &self,
        id: DeviceId,
        report_id: u8,
        len: usize,
    ) -> Result<RequestToken, HidError> {
        self.open_transport(id)?;
        let runtime = runtime_handle()?;
        let token = self.next_token();

        let coordinator = self.clone();
        runtime.spawn(async move {
            let result = coordinator.get_feature_report(id, report_id, len).await;
            coordinator.with_gate(id, |consumer| consumer.on_feature_report(id, token, result));
        });
        Ok(token)
    }

    /// Pop the oldest buffered input report, waiting up to `timeout`
    ///
    /// `Ok(None)` on timeout. Blocks the calling thread.
    pub fn read_report(&self, id: DeviceId, timeout: Duration) -> Result<Option<Report>, HidError> {
        let queue = {
            let table = self.inner.table.lock();
            let record = table.records.get(&id).ok_or(HidError::UnknownDevice(id))?;
            if record.state != DeviceState::Open {
                return Err(HidError::NotOpen(id));
            }
            Arc::clone(&record.queue)
        };

        match queue.pop(timeout) {
            Some(report) => Ok(Some(report)),
            None if queue.is_closed() => Err(HidError::NotOpen(id)),
            None => Ok(None),
        }
    }

    /// Feed an input report for the device's current transport
    pub fn dispatch_input(&self, id: DeviceId, bytes: Vec<u8>) {
        self.inner.dispatch_input(id, None, bytes);
    }

    /// Hand a drained report's buffer back to the pool
    pub fn recycle(&self, report: Report) {
        self.inner.pool.release(report.bytes);
    }

    /// Stop input delivery on every device; open state is retained
    pub fn freeze(&self) {
        let _freeze = self.inner.freeze_lock.lock();
        if self.inner.frozen.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Freezing all devices");
        for transport in self.open_transports() {
            transport.freeze();
        }
    }

    pub fn thaw(&self) {
        let _freeze = self.inner.freeze_lock.lock();
        if !self.inner.frozen.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Thawing all devices");
        for transport in self.open_transports() {
            if let Err(e) = transport.thaw() {
                warn!("Failed to resume transport: {}", e);
            }
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.frozen.load(Ordering::Acquire)
    }

    pub fn state(&self, id: DeviceId) -> Option<DeviceState> {
        self.inner.table.lock().records.get(&id).map(|r| r.state)
    }

    pub fn device_info(&self, id: DeviceId) -> Option<DeviceInfo> {
        self.inner.table.lock().records.get(&id).map(DeviceRecord::info)
    }

    /// Every known device, ordered by ID
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.inner
            .table
            .lock()
            .records
            .values()
            .map(DeviceRecord::info)
            .collect()
    }

    /// Counters of the device's current input queue
    pub fn queue_stats(&self, id: DeviceId) -> Option<QueueStats> {
        self.inner
            .table
            .lock()
            .records
            .get(&id)
            .map(|r| r.queue.stats())
    }

    /// Pool shared by every transport
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.inner.pool
    }

    /// Close every device and persist the identity store
    pub fn shutdown(&self) -> common::Result<()> {
        let ids: Vec<DeviceId> = self.inner.table.lock().records.keys().copied().collect();
        info!("Shutting down coordinator ({} devices)", ids.len());
        for id in ids {
            if let Err(e) = self.close(id) {
                warn!("Failed to close {}: {}", id, e);
            }
        }
        self.inner.table.lock().identities.persist()
    }

    fn gate(&self, id: DeviceId) -> Option<Arc<ReentrantMutex<()>>> {
        self.inner
            .table
            .lock()
            .records
            .get(&id)
            .map(|r| Arc::clone(&r.gate))
    }

    /// Run a consumer callback under the device's gate
    fn with_gate(&self, id: DeviceId, f: impl FnOnce(&dyn HidConsumer)) {
        match self.gate(id) {
            Some(gate) => {
                let _gate = gate.lock();
                f(self.inner.consumer.as_ref());
            }
            None => f(self.inner.consumer.as_ref()),
        }
    }

    fn open_transport(&self, id: DeviceId) -> Result<TransportHandle, HidError> {
        let table = self.inner.table.lock();
        let record = table.records.get(&id).ok_or(HidError::UnknownDevice(id))?;
        match (&record.state, &record.transport) {
            (DeviceState::Open, Some(transport)) => Ok(transport.clone()),
            _ => Err(HidError::NotOpen(id)),
        }
    }

    fn open_transports(&self) -> Vec<TransportHandle> {
        self.inner
            .table
            .lock()
            .records
            .values()
            .filter_map(|r| r.transport.clone())
            .collect()
    }

    fn next_token(&self) -> RequestToken {
        RequestToken(self.inner.next_token.fetch_add(1, Ordering::Relaxed))
    }
}

fn runtime_handle() -> Result<tokio::runtime::Handle, HidError> {
    tokio::runtime::Handle::try_current()
        .map_err(|_| HidError::TransportFailure("no async runtime available".to_string()))
}
