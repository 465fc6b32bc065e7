//! Serialized GATT operation queue
//!
//! Most BLE stacks silently drop a request issued while another one is
//! outstanding, so every read, write and CCCD write of a transport goes
//! through this queue and at most one is in flight.
//!
//! ```text
//! enqueue ──► [op3 op4] ──► in flight: op2 ──► completion
//!                 ▲                              │ failed, budget left
//!                 └──────── retries_left -= 1 ◄──┘
//! ```
//!
//! The queue only decides ordering and retries. What a finished operation
//! means is up to the owner, which gets each one back as a `Finished` with
//! its completion value `C`.

use crate::ble::gatt::GattClient;
use protocol::{GattError, GattOperationKind};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// One queued GATT request
#[derive(Debug)]
pub struct GattOperation<C> {
    pub kind: GattOperationKind,
    pub target: Uuid,
    /// Value for writes
    pub payload: Option<Vec<u8>>,
    /// Re-executions left after a failure
    pub retries_left: u32,
    pub completion: C,
}

impl<C> GattOperation<C> {
    pub fn read(target: Uuid, retries: u32, completion: C) -> Self {
        Self {
            kind: GattOperationKind::Read,
            target,
            payload: None,
            retries_left: retries,
            completion,
        }
    }

    pub fn write(target: Uuid, value: Vec<u8>, retries: u32, completion: C) -> Self {
        Self {
            kind: GattOperationKind::Write,
            target,
            payload: Some(value),
            retries_left: retries,
            completion,
        }
    }

    pub fn enable_notify(target: Uuid, retries: u32, completion: C) -> Self {
        Self {
            kind: GattOperationKind::EnableNotify,
            target,
            payload: None,
            retries_left: retries,
            completion,
        }
    }

    fn execute(&self, client: &dyn GattClient) -> Result<(), GattError> {
        match self.kind {
            GattOperationKind::Read => client.read_characteristic(self.target),
            GattOperationKind::Write => {
                client.write_characteristic(self.target, self.payload.as_deref().unwrap_or(&[]))
            }
            GattOperationKind::EnableNotify => client.enable_notification(self.target),
        }
    }
}

/// Operation that left the queue for good
#[derive(Debug)]
pub struct Finished<C> {
    pub kind: GattOperationKind,
    pub target: Uuid,
    /// Read value on success (empty for writes and CCCD writes)
    pub result: Result<Vec<u8>, GattError>,
    pub completion: C,
}

struct InFlight<C> {
    op: GattOperation<C>,
    started: Instant,
}

pub struct GattOperationQueue<C> {
    pending: VecDeque<GattOperation<C>>,
    in_flight: Option<InFlight<C>>,
}

impl<C> GattOperationQueue<C> {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: None,
        }
    }

    /// Append `op` and start it right away when nothing is in flight
    pub fn enqueue(&mut self, op: GattOperation<C>, client: &dyn GattClient) -> Vec<Finished<C>> {
        trace!("Enqueue GATT {:?} on {}", op.kind, op.target);
        self.pending.push_back(op);
        let mut finished = Vec::new();
        self.pump(client, &mut finished);
        finished
    }

    /// Completion callback for the in-flight operation
    ///
    /// A completion that does not match the in-flight operation is ignored.
    pub fn on_operation_complete(
        &mut self,
        kind: GattOperationKind,
        target: Uuid,
        result: Result<Vec<u8>, GattError>,
        client: &dyn GattClient,
    ) -> Vec<Finished<C>> {
        let matches = self
            .in_flight
            .as_ref()
            .is_some_and(|f| f.op.kind == kind && f.op.target == target);
        if !matches {
            warn!(
                "Ignoring GATT {:?} completion for {} (in flight: {:?})",
                kind,
                target,
                self.in_flight.as_ref().map(|f| (f.op.kind, f.op.target))
            );
            return Vec::new();
        }

        let mut finished = Vec::new();
        if let Some(flight) = self.in_flight.take() {
            self.settle(flight.op, result, &mut finished);
        }
        self.pump(client, &mut finished);
        finished
    }

    /// Fail the in-flight operation if it started more than `timeout` ago
    pub fn on_timeout(
        &mut self,
        now: Instant,
        timeout: Duration,
        client: &dyn GattClient,
    ) -> Vec<Finished<C>> {
        let expired = self
            .in_flight
            .as_ref()
            .is_some_and(|f| now.saturating_duration_since(f.started) >= timeout);
        if !expired {
            return Vec::new();
        }

        let mut finished = Vec::new();
        if let Some(flight) = self.in_flight.take() {
            warn!(
                "GATT {:?} on {} got no completion within {:?}",
                flight.op.kind, flight.op.target, timeout
            );
            self.settle(flight.op, Err(GattError::Timeout), &mut finished);
        }
        self.pump(client, &mut finished);
        finished
    }

    /// When the in-flight operation times out, if one is in flight
    pub fn deadline(&self, timeout: Duration) -> Option<Instant> {
        self.in_flight.as_ref().map(|f| f.started + timeout)
    }

    /// Remove everything, in-flight operation first
    pub fn drain(&mut self) -> Vec<GattOperation<C>> {
        let mut drained: Vec<_> = self.in_flight.take().map(|f| f.op).into_iter().collect();
        drained.extend(self.pending.drain(..));
        drained
    }

    /// Queued plus in-flight operations
    pub fn len(&self) -> usize {
        self.pending.len() + usize::from(self.in_flight.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none()
    }

    fn settle(
        &mut self,
        mut op: GattOperation<C>,
        result: Result<Vec<u8>, GattError>,
        finished: &mut Vec<Finished<C>>,
    ) {
        match result {
            Err(e) if op.retries_left > 0 => {
                op.retries_left -= 1;
                debug!(
                    "GATT {:?} on {} failed ({}), retrying ({} left)",
                    op.kind, op.target, e, op.retries_left
                );
                self.pending.push_back(op);
            }
            result => {
                if let Err(e) = &result {
                    warn!("GATT {:?} on {} failed: {}", op.kind, op.target, e);
                }
                finished.push(Finished {
                    kind: op.kind,
                    target: op.target,
                    result,
                    completion: op.completion,
                });
            }
        }
    }

    /// Start queued operations until one is in flight or the queue is empty
    ///
    /// An operation the stack refuses synchronously counts as a failed
    /// completion, so this always makes progress.
    fn pump(&mut self, client: &dyn GattClient, finished: &mut Vec<Finished<C>>) {
        while self.in_flight.is_none() {
            let Some(op) = self.pending.pop_front() else {
                break;
            };
            match op.execute(client) {
                Ok(()) => {
                    debug!("GATT {:?} on {} in flight", op.kind, op.target);
                    self.in_flight = Some(InFlight {
                        op,
                        started: Instant::now(),
                    });
                }
                Err(e) => self.settle(op, Err(e), finished),
            }
        }
    }
}

impl<C> Default for GattOperationQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}
