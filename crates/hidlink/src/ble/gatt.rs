//! BLE host stack abstraction
//!
//! GATT is callback driven: every request returns immediately and its
//! outcome arrives later as a `GattEvent` on the channel handed to
//! `BleBackend::create_client`. A request that the stack refuses outright
//! fails synchronously and produces no event.

use protocol::{DeviceIdentity, DeviceMetadata, GattError, LinkPreference, LinkState};
use std::sync::Arc;
use uuid::Uuid;

/// Sender half the platform stack posts events on
pub type GattEventSender = async_channel::Sender<GattEvent>;

/// Service found during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

impl GattService {
    pub fn has_characteristic(&self, uuid: Uuid) -> bool {
        self.characteristics.contains(&uuid)
    }
}

/// Completion or unsolicited notification from the stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    ConnectionStateChanged {
        connected: bool,
    },
    /// Result of `discover_services`; empty when discovery found nothing
    ServicesDiscovered {
        services: Vec<GattService>,
    },
    CharacteristicRead {
        uuid: Uuid,
        result: Result<Vec<u8>, GattError>,
    },
    CharacteristicWritten {
        uuid: Uuid,
        result: Result<(), GattError>,
    },
    NotificationEnabled {
        uuid: Uuid,
        result: Result<(), GattError>,
    },
    /// Notification on a subscribed characteristic
    CharacteristicChanged {
        uuid: Uuid,
        value: Vec<u8>,
    },
}

/// GATT client for one peripheral
///
/// Requests must not block; the transport task issues them inline.
pub trait GattClient: Send + Sync {
    fn connect(&self, preference: LinkPreference) -> Result<(), GattError>;

    fn disconnect(&self);

    fn discover_services(&self) -> Result<(), GattError>;

    fn read_characteristic(&self, uuid: Uuid) -> Result<(), GattError>;

    fn write_characteristic(&self, uuid: Uuid, value: &[u8]) -> Result<(), GattError>;

    /// Subscribe to notifications (writes the CCCD)
    fn enable_notification(&self, uuid: Uuid) -> Result<(), GattError>;

    /// Link state according to the platform, independent of delivered events
    fn link_state(&self) -> LinkState;
}

/// Advertisement of a peripheral found by a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlePeripheralInfo {
    pub identity: DeviceIdentity,
    pub metadata: DeviceMetadata,
}

/// Platform BLE stack
pub trait BleBackend: Send + Sync {
    /// Create a client for the peripheral; does not connect yet
    fn create_client(
        &self,
        identity: &DeviceIdentity,
        events: GattEventSender,
    ) -> Result<Arc<dyn GattClient>, GattError>;
}
