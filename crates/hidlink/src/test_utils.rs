//! In-memory platform backends for tests
//!
//! `MockUsbBackend` serves scripted interfaces and connections whose reads
//! come from a queue the test fills. `MockBleBackend` hands out
//! `MockGattClient`s that answer every request with the matching event, with
//! knobs for the misbehaviour the BLE transport has to survive.

use crate::ble::{BleBackend, GattClient, GattEvent, GattEventSender, GattService};
use crate::usb::{EndpointInfo, EndpointKind, UsbBackend, UsbConnection, UsbInterfaceInfo};
use parking_lot::{Condvar, Mutex};
use protocol::gatt::{INPUT_CHARACTERISTIC_UUID, REPORT_CHARACTERISTIC_UUID, VENDOR_SERVICE_UUID};
use protocol::hid::ControlSetup;
use protocol::{DeviceIdentity, DeviceMetadata, GattError, LinkPreference, LinkState, UsbError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Interrupt IN endpoint 0x81, 64 bytes
pub fn interrupt_in() -> EndpointInfo {
    EndpointInfo {
        address: 0x81,
        kind: EndpointKind::Interrupt,
        max_packet_size: 64,
    }
}

/// Interrupt OUT endpoint 0x02, 64 bytes
pub fn interrupt_out() -> EndpointInfo {
    EndpointInfo {
        address: 0x02,
        kind: EndpointKind::Interrupt,
        max_packet_size: 64,
    }
}

/// How the mock answers a permission request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockPermission {
    /// Already granted; no request is made
    Granted,
    /// Request answered with a grant
    Grant,
    /// Request answered with a denial
    Deny,
    /// Request never answered
    Hang,
}

/// Scripted USB connection
pub struct MockUsbConnection {
    endpoints: Vec<EndpointInfo>,
    reads: Mutex<VecDeque<Result<Vec<u8>, UsbError>>>,
    readable: Condvar,
    writes: Mutex<Vec<(u8, Vec<u8>)>>,
    control_writes: Mutex<Vec<(ControlSetup, Vec<u8>)>>,
    control_reads: Mutex<Vec<ControlSetup>>,
    feature_response: Mutex<Vec<u8>>,
    claimed: AtomicBool,
    released: AtomicBool,
    closed: AtomicBool,
    claim_error: Mutex<Option<UsbError>>,
}

impl MockUsbConnection {
    pub fn new(endpoints: Vec<EndpointInfo>) -> Arc<Self> {
        Arc::new(Self {
            endpoints,
            reads: Mutex::new(VecDeque::new()),
            readable: Condvar::new(),
            writes: Mutex::new(Vec::new()),
            control_writes: Mutex::new(Vec::new()),
            control_reads: Mutex::new(Vec::new()),
            feature_response: Mutex::new(Vec::new()),
            claimed: AtomicBool::new(false),
            released: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            claim_error: Mutex::new(None),
        })
    }

    /// Queue a report for the read worker
    pub fn push_read(&self, report: &[u8]) {
        self.reads.lock().push_back(Ok(report.to_vec()));
        self.readable.notify_all();
    }

    /// Queue a read error
    pub fn push_read_error(&self, error: UsbError) {
        self.reads.lock().push_back(Err(error));
        self.readable.notify_all();
    }

    /// Bytes GET_REPORT returns
    pub fn set_feature_response(&self, data: &[u8]) {
        *self.feature_response.lock() = data.to_vec();
    }

    pub fn fail_claim(&self, error: UsbError) {
        *self.claim_error.lock() = Some(error);
    }

    /// Endpoint writes as (endpoint address, payload)
    pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.writes.lock().clone()
    }

    pub fn control_writes(&self) -> Vec<(ControlSetup, Vec<u8>)> {
        self.control_writes.lock().clone()
    }

    pub fn control_reads(&self) -> Vec<ControlSetup> {
        self.control_reads.lock().clone()
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<(), UsbError> {
        if self.is_closed() {
            return Err(UsbError::NoDevice);
        }
        Ok(())
    }
}

impl UsbConnection for MockUsbConnection {
    fn endpoints(&self, _interface: u8) -> Result<Vec<EndpointInfo>, UsbError> {
        self.check_open()?;
        Ok(self.endpoints.clone())
    }

    fn claim_interface(&self, _interface: u8) -> Result<(), UsbError> {
        self.check_open()?;
        if let Some(error) = self.claim_error.lock().clone() {
            return Err(error);
        }
        self.claimed.store(true, Ordering::Release);
        Ok(())
    }

    fn release_interface(&self, _interface: u8) -> Result<(), UsbError> {
        self.claimed.store(false, Ordering::Release);
        self.released.store(true, Ordering::Release);
        Ok(())
    }

    fn read(
        &self,
        _endpoint: &EndpointInfo,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        self.check_open()?;
        let deadline = Instant::now() + timeout;
        let mut reads = self.reads.lock();
        loop {
            match reads.pop_front() {
                Some(Ok(report)) => {
                    let len = report.len().min(buf.len());
                    buf[..len].copy_from_slice(&report[..len]);
                    return Ok(len);
                }
                Some(Err(error)) => return Err(error),
                None => {
                    if self.is_closed() {
                        return Err(UsbError::NoDevice);
                    }
                    if self.readable.wait_until(&mut reads, deadline).timed_out() {
                        return Err(UsbError::Timeout);
                    }
                }
            }
        }
    }

    fn write(
        &self,
        endpoint: &EndpointInfo,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, UsbError> {
        self.check_open()?;
        self.writes.lock().push((endpoint.address, data.to_vec()));
        Ok(data.len())
    }

    fn control_in(
        &self,
        setup: ControlSetup,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, UsbError> {
        self.check_open()?;
        self.control_reads.lock().push(setup);
        let response = self.feature_response.lock();
        let len = response.len().min(buf.len());
        buf[..len].copy_from_slice(&response[..len]);
        Ok(len)
    }

    fn control_out(
        &self,
        setup: ControlSetup,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, UsbError> {
        self.check_open()?;
        self.control_writes.lock().push((setup, data.to_vec()));
        Ok(data.len())
    }

    fn cancel_pending(&self) {
        self.readable.notify_all();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.readable.notify_all();
    }
}

/// Scripted USB host stack
pub struct MockUsbBackend {
    interfaces: Mutex<Vec<UsbInterfaceInfo>>,
    endpoints: Mutex<Vec<EndpointInfo>>,
    permission: Mutex<MockPermission>,
    /// Unanswered permission requests (`MockPermission::Hang`)
    pending: Mutex<Vec<oneshot::Sender<bool>>>,
    open_error: Mutex<Option<UsbError>>,
    open_delay: Mutex<Duration>,
    connections: Mutex<Vec<Arc<MockUsbConnection>>>,
    permission_requests: AtomicUsize,
}

impl MockUsbBackend {
    /// Backend whose devices expose an interrupt IN and OUT endpoint
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            interfaces: Mutex::new(Vec::new()),
            endpoints: Mutex::new(vec![interrupt_in(), interrupt_out()]),
            permission: Mutex::new(MockPermission::Granted),
            pending: Mutex::new(Vec::new()),
            open_error: Mutex::new(None),
            open_delay: Mutex::new(Duration::ZERO),
            connections: Mutex::new(Vec::new()),
            permission_requests: AtomicUsize::new(0),
        })
    }

    pub fn add_interface(&self, identity: DeviceIdentity, metadata: DeviceMetadata) {
        self.interfaces
            .lock()
            .push(UsbInterfaceInfo { identity, metadata });
    }

    pub fn remove_interface(&self, identity: &DeviceIdentity) {
        self.interfaces.lock().retain(|i| &i.identity != identity);
    }

    /// Endpoints of connections opened from now on
    pub fn set_endpoints(&self, endpoints: Vec<EndpointInfo>) {
        *self.endpoints.lock() = endpoints;
    }

    pub fn set_permission(&self, permission: MockPermission) {
        *self.permission.lock() = permission;
    }

    pub fn fail_open(&self, error: UsbError) {
        *self.open_error.lock() = Some(error);
    }

    /// Make `open_device` block for `delay`
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = delay;
    }

    /// Every connection opened so far, oldest first
    pub fn connections(&self) -> Vec<Arc<MockUsbConnection>> {
        self.connections.lock().clone()
    }

    pub fn last_connection(&self) -> Option<Arc<MockUsbConnection>> {
        self.connections.lock().last().cloned()
    }

    pub fn open_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn permission_requests(&self) -> usize {
        self.permission_requests.load(Ordering::Acquire)
    }
}

impl UsbBackend for MockUsbBackend {
    fn enumerate(&self) -> Result<Vec<UsbInterfaceInfo>, UsbError> {
        Ok(self.interfaces.lock().clone())
    }

    fn has_permission(&self, _identity: &DeviceIdentity) -> bool {
        *self.permission.lock() == MockPermission::Granted
    }

    fn request_permission(&self, _identity: &DeviceIdentity, reply: oneshot::Sender<bool>) {
        self.permission_requests.fetch_add(1, Ordering::AcqRel);
        match *self.permission.lock() {
            MockPermission::Granted | MockPermission::Grant => {
                let _ = reply.send(true);
            }
            MockPermission::Deny => {
                let _ = reply.send(false);
            }
            MockPermission::Hang => self.pending.lock().push(reply),
        }
    }

    fn open_device(&self, _identity: &DeviceIdentity) -> Result<Arc<dyn UsbConnection>, UsbError> {
        let delay = *self.open_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if let Some(error) = self.open_error.lock().clone() {
            return Err(error);
        }

        let connection = MockUsbConnection::new(self.endpoints.lock().clone());
        self.connections.lock().push(Arc::clone(&connection));
        Ok(connection)
    }
}

/// The vendor service with both report characteristics
pub fn vendor_service() -> GattService {
    GattService {
        uuid: VENDOR_SERVICE_UUID,
        characteristics: vec![INPUT_CHARACTERISTIC_UUID, REPORT_CHARACTERISTIC_UUID],
    }
}

/// Behaviour of the GATT clients a `MockBleBackend` creates
#[derive(Debug, Clone)]
pub struct MockGattConfig {
    /// Services reported by a successful discovery
    pub services: Vec<GattService>,
    /// Number of initial discoveries that come back empty
    pub empty_discoveries: u32,
    /// Number of characteristic writes that fail before writes succeed
    pub failing_writes: u32,
    /// Never answer characteristic reads
    pub silent_reads: bool,
    /// Answer connect requests with a connected event
    pub connect_succeeds: bool,
    /// Value returned by characteristic reads
    pub read_value: Vec<u8>,
}

impl Default for MockGattConfig {
    fn default() -> Self {
        Self {
            services: vec![vendor_service()],
            empty_discoveries: 0,
            failing_writes: 0,
            silent_reads: false,
            connect_succeeds: true,
            read_value: Vec::new(),
        }
    }
}

/// GATT client answering every request immediately
pub struct MockGattClient {
    events: GattEventSender,
    config: Mutex<MockGattConfig>,
    link: Mutex<LinkState>,
    preferences: Mutex<Vec<LinkPreference>>,
    writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
    subscriptions: Mutex<Vec<Uuid>>,
    reads: AtomicUsize,
    discoveries: AtomicUsize,
    disconnects: AtomicUsize,
}

impl MockGattClient {
    fn post(&self, event: GattEvent) {
        let _ = self.events.try_send(event);
    }

    /// Deliver a notification on the input characteristic
    pub fn notify(&self, value: &[u8]) {
        self.post(GattEvent::CharacteristicChanged {
            uuid: INPUT_CHARACTERISTIC_UUID,
            value: value.to_vec(),
        });
    }

    /// Link drops without anyone asking for it
    pub fn drop_link(&self) {
        *self.link.lock() = LinkState::Disconnected;
        self.post(GattEvent::ConnectionStateChanged { connected: false });
    }

    /// Change what `link_state` reports without emitting an event
    pub fn set_link_state(&self, state: LinkState) {
        *self.link.lock() = state;
    }

    pub fn connect_preferences(&self) -> Vec<LinkPreference> {
        self.preferences.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.preferences.lock().len()
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::Acquire)
    }

    pub fn discovery_count(&self) -> usize {
        self.discoveries.load(Ordering::Acquire)
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Acquire)
    }

    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.writes.lock().clone()
    }

    pub fn subscriptions(&self) -> Vec<Uuid> {
        self.subscriptions.lock().clone()
    }
}

impl GattClient for MockGattClient {
    fn connect(&self, preference: LinkPreference) -> Result<(), GattError> {
        self.preferences.lock().push(preference);
        if self.config.lock().connect_succeeds {
            *self.link.lock() = LinkState::Connected;
            self.post(GattEvent::ConnectionStateChanged { connected: true });
        } else {
            *self.link.lock() = LinkState::Connecting;
        }
        Ok(())
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::AcqRel);
        let mut link = self.link.lock();
        if *link != LinkState::Disconnected {
            *link = LinkState::Disconnected;
            drop(link);
            self.post(GattEvent::ConnectionStateChanged { connected: false });
        }
    }

    fn discover_services(&self) -> Result<(), GattError> {
        let attempt = self.discoveries.fetch_add(1, Ordering::AcqRel) + 1;
        let config = self.config.lock();
        let services = if attempt <= config.empty_discoveries as usize {
            Vec::new()
        } else {
            config.services.clone()
        };
        drop(config);
        self.post(GattEvent::ServicesDiscovered { services });
        Ok(())
    }

    fn read_characteristic(&self, uuid: Uuid) -> Result<(), GattError> {
        self.reads.fetch_add(1, Ordering::AcqRel);
        let config = self.config.lock();
        if !config.silent_reads {
            let value = config.read_value.clone();
            drop(config);
            self.post(GattEvent::CharacteristicRead {
                uuid,
                result: Ok(value),
            });
        }
        Ok(())
    }

    fn write_characteristic(&self, uuid: Uuid, value: &[u8]) -> Result<(), GattError> {
        self.writes.lock().push((uuid, value.to_vec()));
        let result = {
            let mut config = self.config.lock();
            if config.failing_writes > 0 {
                config.failing_writes -= 1;
                Err(GattError::Status(0x85))
            } else {
                Ok(())
            }
        };
        self.post(GattEvent::CharacteristicWritten { uuid, result });
        Ok(())
    }

    fn enable_notification(&self, uuid: Uuid) -> Result<(), GattError> {
        self.subscriptions.lock().push(uuid);
        self.post(GattEvent::NotificationEnabled {
            uuid,
            result: Ok(()),
        });
        Ok(())
    }

    fn link_state(&self) -> LinkState {
        *self.link.lock()
    }
}

/// BLE stack creating `MockGattClient`s
pub struct MockBleBackend {
    config: Mutex<MockGattConfig>,
    clients: Mutex<Vec<Arc<MockGattClient>>>,
}

impl MockBleBackend {
    pub fn new() -> Arc<Self> {
        Self::with_config(MockGattConfig::default())
    }

    pub fn with_config(config: MockGattConfig) -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(config),
            clients: Mutex::new(Vec::new()),
        })
    }

    /// Configuration for clients created from now on
    pub fn set_config(&self, config: MockGattConfig) {
        *self.config.lock() = config;
    }

    pub fn clients(&self) -> Vec<Arc<MockGattClient>> {
        self.clients.lock().clone()
    }

    pub fn last_client(&self) -> Option<Arc<MockGattClient>> {
        self.clients.lock().last().cloned()
    }
}

impl BleBackend for MockBleBackend {
    fn create_client(
        &self,
        _identity: &DeviceIdentity,
        events: GattEventSender,
    ) -> Result<Arc<dyn GattClient>, GattError> {
        let client = Arc::new(MockGattClient {
            events,
            config: Mutex::new(self.config.lock().clone()),
            link: Mutex::new(LinkState::Disconnected),
            preferences: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            reads: AtomicUsize::new(0),
            discoveries: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        });
        self.clients.lock().push(Arc::clone(&client));
        Ok(client)
    }
}
