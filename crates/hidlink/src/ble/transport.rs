//! BLE transport
//!
//! One tokio task per device owns the GATT client and serializes everything
//! that can happen to the connection: platform events, coordinator commands,
//! watchdog ticks and operation timeouts.
//!
//! Connection setup:
//!
//! ```text
//! Disconnected ─connect(LE)─► Connecting ─connected─► ServiceDiscovery
//!      ▲                                                  │ vendor service missing:
//!      └──────────── disconnect + reconnect ◄─────────────┤ bounded recovery
//!                                                         ▼
//! Ready ◄─handshake written─ HandshakeWrite ◄─CCCD─ EnablingNotifications
//! ```
//!
//! `open` resolves the first time the task reaches `Ready`. Later watchdog
//! cycles re-run the whole setup without telling the coordinator.

use crate::ble::gatt::{BleBackend, GattClient, GattEvent, GattService};
use crate::ble::queue::{Finished, GattOperation, GattOperationQueue};
use crate::sink::ReportSink;
use protocol::gatt::{
    ENTER_REPORT_MODE, INPUT_CHARACTERISTIC_UUID, REPORT_CHARACTERISTIC_UUID, VENDOR_SERVICE_UUID,
};
use protocol::{
    DeviceId, DeviceIdentity, GattError, GattOperationKind, HidError, LinkPreference, LinkState,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

/// Connection tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BleSettings {
    /// Watchdog period; also how long setup may stall before a forced cycle
    pub watchdog_interval: Duration,
    /// Reconnects allowed when discovery misses the vendor service
    pub discovery_retries: u32,
    /// Re-executions of a failed GATT operation
    pub operation_retries: u32,
    /// Completion deadline for an in-flight GATT operation
    pub operation_timeout: Duration,
    /// Consecutive forced cycles without reaching Ready before giving up
    pub max_watchdog_cycles: u32,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            watchdog_interval: Duration::from_secs(10),
            discovery_retries: 1,
            operation_retries: 2,
            operation_timeout: Duration::from_millis(5000),
            max_watchdog_cycles: 3,
        }
    }
}

/// Setup progress of the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Disconnected,
    Connecting,
    ServiceDiscovery,
    EnablingNotifications,
    HandshakeWrite,
    Ready,
}

impl Phase {
    /// Phases in which the link itself is up
    fn link_up(self) -> bool {
        !matches!(self, Phase::Disconnected | Phase::Connecting)
    }
}

enum Command {
    Write {
        report: Vec<u8>,
        is_feature: bool,
        reply: oneshot::Sender<Result<usize, HidError>>,
    },
    GetFeature {
        report_id: u8,
        len: usize,
        reply: oneshot::Sender<Result<Vec<u8>, HidError>>,
    },
    Freeze,
    Thaw,
    Close,
}

/// What a queued operation was issued for
enum Completion {
    EnableNotifications,
    Handshake,
    Write {
        len: usize,
        reply: oneshot::Sender<Result<usize, HidError>>,
    },
    FeatureRead {
        report_id: u8,
        len: usize,
        reply: oneshot::Sender<Result<Vec<u8>, HidError>>,
    },
}

impl Completion {
    /// Answer a caller waiting on this operation with `error`
    fn reject(self, error: HidError) {
        match self {
            Completion::Write { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Completion::FeatureRead { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Completion::EnableNotifications | Completion::Handshake => {}
        }
    }
}

/// Handle to a running BLE transport task
///
/// Dropping the handle closes the connection.
pub struct BleTransport {
    id: DeviceId,
    commands: async_channel::Sender<Command>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl BleTransport {
    /// Connect and run setup; resolves once the device reached `Ready`
    ///
    /// Cancelling the returned future tears the half-built connection down.
    pub async fn open(
        id: DeviceId,
        identity: &DeviceIdentity,
        backend: &dyn BleBackend,
        settings: BleSettings,
        sink: Arc<dyn ReportSink>,
    ) -> Result<Arc<Self>, HidError> {
        let (event_tx, event_rx) = async_channel::unbounded();
        let (command_tx, command_rx) = async_channel::unbounded();
        let (ready_tx, ready_rx) = oneshot::channel();

        let client = backend.create_client(identity, event_tx).map_err(|e| {
            warn!("Failed to create GATT client for {}: {}", identity, e);
            HidError::from(e)
        })?;

        let driver = Driver::new(id, client, sink, settings, ready_tx);
        let task = tokio::spawn(driver.run(event_rx, command_rx));

        let transport = Arc::new(Self {
            id,
            commands: command_tx,
            task: parking_lot::Mutex::new(Some(task)),
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(transport),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(HidError::TransportFailure(format!(
                "{}: transport task ended during setup",
                id
            ))),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Write an output or feature report; byte 0 is the report ID
    pub async fn write(&self, report: Vec<u8>, is_feature: bool) -> Result<usize, HidError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Write {
            report,
            is_feature,
            reply,
        })?;
        rx.await.map_err(|_| HidError::NotOpen(self.id))?
    }

    /// Read a feature report; the result starts with `report_id`
    pub async fn get_feature_report(&self, report_id: u8, len: usize) -> Result<Vec<u8>, HidError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetFeature {
            report_id,
            len,
            reply,
        })?;
        rx.await.map_err(|_| HidError::NotOpen(self.id))?
    }

    /// Pause the watchdog and input delivery
    pub fn freeze(&self) {
        let _ = self.send(Command::Freeze);
    }

    pub fn thaw(&self) {
        let _ = self.send(Command::Thaw);
    }

    /// Ask the task to disconnect and stop; does not wait for the platform
    pub fn shutdown(&self) {
        if self.commands.try_send(Command::Close).is_ok() {
            debug!("Close requested for BLE transport {}", self.id);
        }
        self.commands.close();
    }

    /// Whether the task has exited
    pub fn is_finished(&self) -> bool {
        self.task.lock().as_ref().is_none_or(|t| t.is_finished())
    }

    fn send(&self, command: Command) -> Result<(), HidError> {
        self.commands
            .try_send(command)
            .map_err(|_| HidError::NotOpen(self.id))
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// State owned by the transport task
struct Driver {
    id: DeviceId,
    client: Arc<dyn GattClient>,
    sink: Arc<dyn ReportSink>,
    settings: BleSettings,
    phase: Phase,
    /// When `phase` last changed
    phase_since: Instant,
    queue: GattOperationQueue<Completion>,
    /// Resolves `open`; taken on the first Ready or on failure
    ready: Option<oneshot::Sender<Result<(), HidError>>>,
    /// We disconnected on purpose and reconnect on the next disconnect event
    recovery_pending: bool,
    discovery_attempts: u32,
    watchdog_cycles: u32,
    frozen: bool,
    done: bool,
}

impl Driver {
    fn new(
        id: DeviceId,
        client: Arc<dyn GattClient>,
        sink: Arc<dyn ReportSink>,
        settings: BleSettings,
        ready: oneshot::Sender<Result<(), HidError>>,
    ) -> Self {
        Self {
            id,
            client,
            sink,
            settings,
            phase: Phase::Disconnected,
            phase_since: Instant::now(),
            queue: GattOperationQueue::new(),
            ready: Some(ready),
            recovery_pending: false,
            discovery_attempts: 0,
            watchdog_cycles: 0,
            frozen: false,
            done: false,
        }
    }

    async fn run(
        mut self,
        events: async_channel::Receiver<GattEvent>,
        commands: async_channel::Receiver<Command>,
    ) {
        debug!("BLE transport task for {} started", self.id);
        self.connect();

        let interval = self.settings.watchdog_interval;
        let mut watchdog = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.done {
            let deadline = self
                .queue
                .deadline(self.settings.operation_timeout)
                .map(tokio::time::Instant::from_std);
            let operation_timeout = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = commands.recv() => match command {
                    Ok(Command::Close) | Err(_) => {
                        debug!("BLE transport {} closing", self.id);
                        break;
                    }
                    Ok(command) => self.handle_command(command),
                },
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event),
                    Err(_) => self.fail(HidError::TransportFailure(
                        "GATT event channel closed".to_string(),
                    )),
                },
                _ = watchdog.tick() => self.on_watchdog(),
                () = operation_timeout => {
                    let finished = self.queue.on_timeout(
                        Instant::now(),
                        self.settings.operation_timeout,
                        self.client.as_ref(),
                    );
                    self.complete(finished);
                }
            }
        }

        self.teardown();
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            trace!("{}: {:?} -> {:?}", self.id, self.phase, phase);
            self.phase = phase;
            self.phase_since = Instant::now();
        }
    }

    fn connect(&mut self) {
        self.set_phase(Phase::Connecting);
        if let Err(e) = self.client.connect(LinkPreference::LowEnergy) {
            warn!("{}: connect request rejected: {}", self.id, e);
            // The watchdog retries a stalled connect.
        }
    }

    fn handle_event(&mut self, event: GattEvent) {
        match event {
            GattEvent::ConnectionStateChanged { connected: true } => self.on_connected(),
            GattEvent::ConnectionStateChanged { connected: false } => self.on_disconnected(),
            GattEvent::ServicesDiscovered { services } => self.on_services(&services),
            GattEvent::CharacteristicRead { uuid, result } => {
                self.on_complete(GattOperationKind::Read, uuid, result)
            }
            GattEvent::CharacteristicWritten { uuid, result } => {
                self.on_complete(GattOperationKind::Write, uuid, result.map(|()| Vec::new()))
            }
            GattEvent::NotificationEnabled { uuid, result } => self.on_complete(
                GattOperationKind::EnableNotify,
                uuid,
                result.map(|()| Vec::new()),
            ),
            GattEvent::CharacteristicChanged { uuid, value } => {
                if uuid != INPUT_CHARACTERISTIC_UUID {
                    trace!("{}: notification on {} ignored", self.id, uuid);
                } else if self.phase != Phase::Ready || self.frozen {
                    trace!("{}: input dropped in {:?}", self.id, self.phase);
                } else {
                    self.sink.dispatch_input(value);
                }
            }
        }
    }

    fn on_connected(&mut self) {
        if self.phase != Phase::Connecting {
            debug!("{}: connected event in {:?} ignored", self.id, self.phase);
            return;
        }
        debug!("{}: link up, discovering services", self.id);
        self.set_phase(Phase::ServiceDiscovery);
        if let Err(e) = self.client.discover_services() {
            warn!("{}: service discovery rejected: {}", self.id, e);
            self.recover_missing_service();
        }
    }

    fn on_disconnected(&mut self) {
        self.abort_operations(HidError::TransportFailure(format!(
            "{}: link lost",
            self.id
        )));

        if self.recovery_pending {
            self.recovery_pending = false;
            debug!("{}: reconnecting", self.id);
            self.connect();
            return;
        }

        match self.phase {
            Phase::Ready => {
                warn!("{}: link lost", self.id);
                self.fail(HidError::TransportFailure("link lost".to_string()));
            }
            Phase::Disconnected => {}
            phase => {
                warn!("{}: link lost during {:?}", self.id, phase);
                self.count_cycle("link lost during setup");
                if !self.done {
                    self.connect();
                }
            }
        }
    }

    fn on_services(&mut self, services: &[GattService]) {
        if self.phase != Phase::ServiceDiscovery {
            debug!("{}: discovery result in {:?} ignored", self.id, self.phase);
            return;
        }

        let vendor = services.iter().find(|s| {
            s.uuid == VENDOR_SERVICE_UUID
                && s.has_characteristic(INPUT_CHARACTERISTIC_UUID)
                && s.has_characteristic(REPORT_CHARACTERISTIC_UUID)
        });
        if vendor.is_none() {
            self.recover_missing_service();
            return;
        }

        debug!("{}: vendor service found, enabling notifications", self.id);
        self.set_phase(Phase::EnablingNotifications);
        let op = GattOperation::enable_notify(
            INPUT_CHARACTERISTIC_UUID,
            self.settings.operation_retries,
            Completion::EnableNotifications,
        );
        self.enqueue(op);
    }

    /// Some stacks return an empty or stale service list on the first
    /// discovery after bonding; a fresh connection fixes it.
    fn recover_missing_service(&mut self) {
        if self.discovery_attempts >= self.settings.discovery_retries {
            error!(
                "{}: vendor service not found after {} reconnects",
                self.id, self.discovery_attempts
            );
            self.fail(HidError::NoService);
            return;
        }
        self.discovery_attempts += 1;
        info!(
            "{}: vendor service missing, reconnecting ({}/{})",
            self.id, self.discovery_attempts, self.settings.discovery_retries
        );
        self.cycle_link();
    }

    /// Disconnect and reconnect, or just reconnect if the link is down
    fn cycle_link(&mut self) {
        self.abort_operations(HidError::TransportFailure(format!(
            "{}: connection cycled",
            self.id
        )));
        if self.client.link_state() == LinkState::Disconnected {
            self.recovery_pending = false;
            self.connect();
        } else {
            self.recovery_pending = true;
            self.set_phase(Phase::Disconnected);
            self.client.disconnect();
        }
    }

    fn on_complete(
        &mut self,
        kind: GattOperationKind,
        uuid: uuid::Uuid,
        result: Result<Vec<u8>, GattError>,
    ) {
        let finished = self
            .queue
            .on_operation_complete(kind, uuid, result, self.client.as_ref());
        self.complete(finished);
    }

    fn enqueue(&mut self, op: GattOperation<Completion>) {
        let finished = self.queue.enqueue(op, self.client.as_ref());
        self.complete(finished);
    }

    /// Act on finished operations; may enqueue more, which may finish too
    fn complete(&mut self, finished: Vec<Finished<Completion>>) {
        let mut work: VecDeque<_> = finished.into();
        while let Some(done) = work.pop_front() {
            if self.done {
                done.completion.reject(HidError::NotOpen(self.id));
                continue;
            }
            match done.completion {
                Completion::EnableNotifications => match done.result {
                    Ok(_) => {
                        debug!("{}: notifications enabled, entering report mode", self.id);
                        self.set_phase(Phase::HandshakeWrite);
                        let op = GattOperation::write(
                            REPORT_CHARACTERISTIC_UUID,
                            ENTER_REPORT_MODE.to_vec(),
                            self.settings.operation_retries,
                            Completion::Handshake,
                        );
                        work.extend(self.queue.enqueue(op, self.client.as_ref()));
                    }
                    Err(e) => self.fail(e.into()),
                },
                Completion::Handshake => match done.result {
                    Ok(_) => self.become_ready(),
                    Err(e) => self.fail(e.into()),
                },
                Completion::Write { len, reply } => {
                    let _ = reply.send(done.result.map(|_| len).map_err(HidError::from));
                }
                Completion::FeatureRead {
                    report_id,
                    len,
                    reply,
                } => {
                    let result = done.result.map(|value| {
                        let mut report = Vec::with_capacity(value.len() + 1);
                        report.push(report_id);
                        report.extend_from_slice(&value);
                        if len > 0 {
                            report.truncate(len);
                        }
                        report
                    });
                    let _ = reply.send(result.map_err(HidError::from));
                }
            }
        }
    }

    fn become_ready(&mut self) {
        self.set_phase(Phase::Ready);
        self.watchdog_cycles = 0;
        self.discovery_attempts = 0;
        match self.ready.take() {
            Some(ready) => {
                info!("BLE transport for {} ready", self.id);
                let _ = ready.send(Ok(()));
            }
            None => info!("BLE transport for {} re-established", self.id),
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Write {
                report,
                is_feature,
                reply,
            } => {
                if self.phase != Phase::Ready {
                    let _ = reply.send(Err(HidError::NotOpen(self.id)));
                    return;
                }
                let len = report.len();
                // Each report has its own characteristic, so the report ID
                // of a feature report is implied and not sent.
                let payload = if is_feature {
                    report.get(1..).map(<[u8]>::to_vec).unwrap_or_default()
                } else {
                    report
                };
                let op = GattOperation::write(
                    REPORT_CHARACTERISTIC_UUID,
                    payload,
                    self.settings.operation_retries,
                    Completion::Write { len, reply },
                );
                self.enqueue(op);
            }
            Command::GetFeature {
                report_id,
                len,
                reply,
            } => {
                if self.phase != Phase::Ready {
                    let _ = reply.send(Err(HidError::NotOpen(self.id)));
                    return;
                }
                let op = GattOperation::read(
                    REPORT_CHARACTERISTIC_UUID,
                    self.settings.operation_retries,
                    Completion::FeatureRead {
                        report_id,
                        len,
                        reply,
                    },
                );
                self.enqueue(op);
            }
            Command::Freeze => {
                debug!("{}: frozen", self.id);
                self.frozen = true;
            }
            Command::Thaw => {
                debug!("{}: thawed", self.id);
                self.frozen = false;
                self.phase_since = Instant::now();
            }
            Command::Close => self.done = true,
        }
    }

    /// Compare the platform's view of the link with ours
    fn on_watchdog(&mut self) {
        if self.frozen || self.done {
            return;
        }

        let platform = self.client.link_state();
        let stalled = self.phase != Phase::Ready
            && self.phase_since.elapsed() >= self.settings.watchdog_interval;

        let reason = match (platform, self.phase) {
            (LinkState::Connecting, _) => None,
            (LinkState::Connected, Phase::Ready) => None,
            (LinkState::Connected, Phase::Disconnected | Phase::Connecting) if stalled => {
                Some("connected callback missed")
            }
            (LinkState::Connected, _) if stalled => Some("setup stalled"),
            (LinkState::Disconnected, phase) if phase.link_up() => Some("platform reports link down"),
            (LinkState::Disconnected, _) if stalled => Some("connect attempt stalled"),
            _ => None,
        };

        match reason {
            Some(reason) => {
                self.count_cycle(reason);
                if !self.done {
                    self.cycle_link();
                }
            }
            None => trace!(
                "{}: watchdog ok (platform {:?}, phase {:?})",
                self.id, platform, self.phase
            ),
        }
    }

    /// Count a forced cycle; fail once the budget is exhausted
    fn count_cycle(&mut self, reason: &str) {
        self.watchdog_cycles += 1;
        if self.watchdog_cycles > self.settings.max_watchdog_cycles {
            error!(
                "{}: {} after {} connection cycles, giving up",
                self.id, reason, self.settings.max_watchdog_cycles
            );
            self.fail(HidError::TransportFailure(format!(
                "connection not recovered after {} cycles ({})",
                self.settings.max_watchdog_cycles, reason
            )));
            return;
        }
        warn!(
            "{}: {}, cycling connection ({}/{})",
            self.id, reason, self.watchdog_cycles, self.settings.max_watchdog_cycles
        );
    }

    /// Complete every queued operation with `error`
    fn abort_operations(&mut self, error: HidError) {
        for op in self.queue.drain() {
            op.completion.reject(error.clone());
        }
    }

    /// Structural failure: resolve `open` with it, or report it upstream
    fn fail(&mut self, error: HidError) {
        if self.done {
            return;
        }
        self.done = true;
        self.abort_operations(error.clone());
        match self.ready.take() {
            Some(ready) => {
                let _ = ready.send(Err(error));
            }
            None => self.sink.transport_failed(error),
        }
    }

    fn teardown(&mut self) {
        self.abort_operations(HidError::NotOpen(self.id));
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err(HidError::NotOpen(self.id)));
        }
        self.client.disconnect();
        info!("BLE transport for {} closed", self.id);
    }
}
