//! USB transport
//!
//! One claimed HID interface plus a dedicated read worker thread. The worker
//! does blocking reads with a short timeout so it notices `running` being
//! cleared without needing the stack to cancel the transfer.
//!
//! ```text
//! hid-usb-N thread: loop {
//!     read(input endpoint, pooled buffer, read_timeout)
//!       Ok(n)       -> sink.dispatch_input
//!       Timeout     -> continue
//!       transient   -> back off, continue
//!       hard error  -> sink.transport_failed, exit
//! }
//! ```

use crate::sink::ReportSink;
use crate::usb::backend::{EndpointInfo, UsbConnection};
use crate::usb::transfers::{read_feature_report, write_feature_report, write_output_report};
use common::BufferPool;
use parking_lot::Mutex;
use protocol::{DeviceId, HidError, UsbError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Pause after a transient read error before the next attempt
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(10);

/// Timeouts for the transport's transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbTransportSettings {
    /// Read timeout per worker iteration; bounds how long close waits
    pub read_timeout: Duration,
    /// Timeout for output reports
    pub write_timeout: Duration,
}

impl Default for UsbTransportSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(100),
            write_timeout: Duration::from_millis(1000),
        }
    }
}

/// Open USB HID interface
pub struct UsbTransport {
    id: DeviceId,
    connection: Arc<dyn UsbConnection>,
    interface: u8,
    input: EndpointInfo,
    output: Option<EndpointInfo>,
    settings: UsbTransportSettings,
    sink: Arc<dyn ReportSink>,
    pool: Arc<BufferPool>,
    /// Cleared to stop the read worker
    running: Arc<AtomicBool>,
    /// Set once the worker hit a hard error
    failed: Arc<AtomicBool>,
    /// Set once `shutdown` ran
    closed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Serializes output and feature writes
    write_lock: Mutex<()>,
}

impl UsbTransport {
    /// Claim `interface`, discover its endpoints and start the read worker
    ///
    /// Fails with `NoEndpoints` when the interface has no IN endpoint; the
    /// interface is released again before returning.
    pub fn open(
        id: DeviceId,
        connection: Arc<dyn UsbConnection>,
        interface: u8,
        settings: UsbTransportSettings,
        sink: Arc<dyn ReportSink>,
        pool: Arc<BufferPool>,
    ) -> Result<Arc<Self>, HidError> {
        if let Err(e) = connection.claim_interface(interface) {
            warn!("Failed to claim interface {} for {}: {}", interface, id, e);
            connection.close();
            return Err(e.into());
        }
        debug!("Claimed interface {} for {}", interface, id);

        let endpoints = match connection.endpoints(interface) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!("Failed to read endpoints of interface {}: {}", interface, e);
                release_and_close(connection.as_ref(), interface);
                return Err(e.into());
            }
        };

        let input = endpoints
            .iter()
            .find(|e| e.is_in() && e.carries_reports())
            .copied();
        let output = endpoints
            .iter()
            .find(|e| !e.is_in() && e.carries_reports())
            .copied();

        let Some(input) = input else {
            warn!("Interface {} of {} has no input endpoint", interface, id);
            release_and_close(connection.as_ref(), interface);
            return Err(HidError::NoEndpoints);
        };

        debug!(
            "{}: input endpoint {:#x} ({} bytes), output endpoint {:?}",
            id,
            input.address,
            input.max_packet_size,
            output.map(|e| e.address)
        );

        let transport = Arc::new(Self {
            id,
            connection,
            interface,
            input,
            output,
            settings,
            sink,
            pool,
            running: Arc::new(AtomicBool::new(false)),
            failed: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            worker: Mutex::new(None),
            write_lock: Mutex::new(()),
        });

        if let Err(e) = transport.start_worker() {
            transport.shutdown();
            return Err(e);
        }

        info!("USB transport for {} open on interface {}", id, interface);
        Ok(transport)
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn has_output_endpoint(&self) -> bool {
        self.output.is_some()
    }

    /// Write an output or feature report; byte 0 is the report ID
    pub fn write(&self, report: &[u8], is_feature: bool) -> Result<usize, HidError> {
        self.ensure_usable()?;
        let _guard = self.write_lock.lock();

        let result = if is_feature {
            write_feature_report(self.connection.as_ref(), self.interface, report)
        } else {
            write_output_report(
                self.connection.as_ref(),
                self.interface,
                self.output.as_ref(),
                report,
                self.settings.write_timeout,
            )
        };

        result.map_err(|e| self.transfer_error(e))
    }

    /// GET_REPORT(feature); the result starts with the report ID
    pub fn get_feature_report(&self, report_id: u8, len: usize) -> Result<Vec<u8>, HidError> {
        self.ensure_usable()?;
        let _guard = self.write_lock.lock();

        read_feature_report(self.connection.as_ref(), self.interface, report_id, len)
            .map_err(|e| self.transfer_error(e))
    }

    /// Stop the read worker, keeping the interface claimed
    pub fn suspend(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            debug!("Suspending USB read worker for {}", self.id);
            self.connection.cancel_pending();
            self.join_worker();
        }
    }

    /// Restart the read worker after `suspend`
    pub fn resume(&self) -> Result<(), HidError> {
        self.ensure_usable()?;
        if self.worker.lock().is_some() {
            return Ok(());
        }
        debug!("Resuming USB read worker for {}", self.id);
        self.start_worker()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the worker, release the interface and close the handle
    ///
    /// Idempotent. Called from the worker thread itself (a consumer callback
    /// closing the device), the join and release move to a reaper thread.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.running.store(false, Ordering::Release);
        self.connection.cancel_pending();

        let worker = self.worker.lock().take();
        let on_worker_thread = worker
            .as_ref()
            .is_some_and(|handle| handle.thread().id() == thread::current().id());

        if on_worker_thread {
            let connection = Arc::clone(&self.connection);
            let interface = self.interface;
            let id = self.id;
            let reaper = thread::Builder::new()
                .name(format!("hid-usb-reap-{}", id.0))
                .spawn(move || {
                    if let Some(handle) = worker
                        && handle.join().is_err()
                    {
                        error!("USB read worker for {} panicked", id);
                    }
                    release_and_close(connection.as_ref(), interface);
                    debug!("Reaped USB transport for {}", id);
                });
            if let Err(e) = reaper {
                // Worker is about to exit on its own; release from here.
                warn!("Failed to spawn reaper for {}: {}", self.id, e);
                release_and_close(self.connection.as_ref(), self.interface);
            }
        } else {
            if let Some(handle) = worker
                && handle.join().is_err()
            {
                error!("USB read worker for {} panicked", self.id);
            }
            release_and_close(self.connection.as_ref(), self.interface);
        }

        info!("USB transport for {} closed", self.id);
    }

    fn ensure_usable(&self) -> Result<(), HidError> {
        if self.closed.load(Ordering::Acquire) || self.failed.load(Ordering::Acquire) {
            return Err(HidError::NotOpen(self.id));
        }
        Ok(())
    }

    fn transfer_error(&self, err: UsbError) -> HidError {
        match err {
            UsbError::Timeout => HidError::Timeout,
            UsbError::Access => HidError::PermissionDenied,
            other => HidError::TransportFailure(format!("{}: {}", self.id, other)),
        }
    }

    fn start_worker(&self) -> Result<(), HidError> {
        let mut slot = self.worker.lock();
        if slot.is_some() {
            return Ok(());
        }

        self.running.store(true, Ordering::Release);
        let reader = ReadLoop {
            id: self.id,
            connection: Arc::clone(&self.connection),
            input: self.input,
            read_timeout: self.settings.read_timeout,
            sink: Arc::clone(&self.sink),
            pool: Arc::clone(&self.pool),
            running: Arc::clone(&self.running),
            failed: Arc::clone(&self.failed),
        };

        let handle = thread::Builder::new()
            .name(format!("hid-usb-{}", self.id.0))
            .spawn(move || reader.run())
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                HidError::TransportFailure(format!("failed to spawn read worker: {}", e))
            })?;

        *slot = Some(handle);
        Ok(())
    }

    fn join_worker(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            // Suspended from a callback on the worker itself; it exits on
            // its own once the callback returns.
            return;
        }
        if handle.join().is_err() {
            error!("USB read worker for {} panicked", self.id);
        }
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn release_and_close(connection: &dyn UsbConnection, interface: u8) {
    if let Err(e) = connection.release_interface(interface) {
        debug!("Failed to release interface {}: {}", interface, e);
    }
    connection.close();
}

/// State moved into the read worker thread
struct ReadLoop {
    id: DeviceId,
    connection: Arc<dyn UsbConnection>,
    input: EndpointInfo,
    read_timeout: Duration,
    sink: Arc<dyn ReportSink>,
    pool: Arc<BufferPool>,
    running: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
}

impl ReadLoop {
    fn run(self) {
        debug!("USB read worker for {} started", self.id);
        let report_size = usize::from(self.input.max_packet_size).max(1);

        while self.running.load(Ordering::Acquire) {
            let mut buffer = self.pool.acquire(report_size);

            match self
                .connection
                .read(&self.input, &mut buffer, self.read_timeout)
            {
                Ok(0) => self.pool.release(buffer),
                Ok(len) => {
                    buffer.truncate(len);
                    trace!("{}: read {} bytes", self.id, len);
                    self.sink.dispatch_input(buffer);
                }
                Err(e) => {
                    self.pool.release(buffer);
                    if !self.running.load(Ordering::Acquire) {
                        break;
                    }
                    match e {
                        UsbError::Timeout => {}
                        e if e.is_transient() => {
                            debug!("{}: transient read error: {}", self.id, e);
                            thread::sleep(TRANSIENT_BACKOFF);
                        }
                        e => {
                            error!("{}: read failed: {}", self.id, e);
                            self.failed.store(true, Ordering::Release);
                            self.running.store(false, Ordering::Release);
                            self.sink
                                .transport_failed(HidError::TransportFailure(e.to_string()));
                            break;
                        }
                    }
                }
            }
        }

        debug!("USB read worker for {} stopped", self.id);
    }
}
