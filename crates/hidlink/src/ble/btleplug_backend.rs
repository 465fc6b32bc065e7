//! btleplug binding
//!
//! btleplug exposes an async request/response API; each `GattClient` call
//! spawns the request on the runtime and posts the outcome as a `GattEvent`.
//! btleplug only speaks LE, so the link preference needs no translation.

use crate::ble::gatt::{
    BleBackend, BlePeripheralInfo, GattClient, GattEvent, GattEventSender, GattService,
};
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use parking_lot::Mutex;
use protocol::{DeviceIdentity, DeviceMetadata, GattError, LinkPreference, LinkState};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, warn};
use uuid::Uuid;

fn map_btleplug_error(err: btleplug::Error) -> GattError {
    match err {
        btleplug::Error::TimedOut(_) => GattError::Timeout,
        btleplug::Error::NotConnected => GattError::Disconnected,
        other => GattError::Rejected(other.to_string()),
    }
}

/// BLE stack on the first adapter btleplug finds
pub struct BtleplugBackend {
    adapter: Adapter,
    runtime: Handle,
}

impl BtleplugBackend {
    pub async fn new() -> Result<Self, GattError> {
        let manager = Manager::new().await.map_err(map_btleplug_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(map_btleplug_error)?
            .into_iter()
            .next()
            .ok_or_else(|| GattError::Rejected("no Bluetooth adapter found".to_string()))?;

        Ok(Self {
            adapter,
            runtime: Handle::current(),
        })
    }

    /// Scan for `duration` and list every peripheral that reported properties
    pub async fn scan(&self, duration: Duration) -> Result<Vec<BlePeripheralInfo>, GattError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(map_btleplug_error)?;
        tokio::time::sleep(duration).await;
        if let Err(e) = self.adapter.stop_scan().await {
            debug!("Failed to stop BLE scan: {}", e);
        }

        let peripherals = self.adapter.peripherals().await.map_err(map_btleplug_error)?;
        let mut found = Vec::new();
        for peripheral in peripherals {
            if let Ok(Some(props)) = peripheral.properties().await {
                let address = props.address.to_string();
                found.push(BlePeripheralInfo {
                    identity: DeviceIdentity::ble(&address),
                    metadata: DeviceMetadata {
                        name: props.local_name.unwrap_or_else(|| address.clone()),
                        ..DeviceMetadata::default()
                    },
                });
            }
        }

        debug!("BLE scan found {} peripherals", found.len());
        Ok(found)
    }
}

impl BleBackend for BtleplugBackend {
    fn create_client(
        &self,
        identity: &DeviceIdentity,
        events: GattEventSender,
    ) -> Result<Arc<dyn GattClient>, GattError> {
        let DeviceIdentity::Ble { address } = identity else {
            return Err(GattError::Rejected(format!("{} is not a BLE device", identity)));
        };

        Ok(Arc::new(BtleplugClient {
            shared: Arc::new(Shared {
                adapter: self.adapter.clone(),
                address: address.clone(),
                peripheral: Mutex::new(None),
                link: Mutex::new(LinkState::Disconnected),
                events,
            }),
            runtime: self.runtime.clone(),
        }))
    }
}

struct Shared {
    adapter: Adapter,
    address: String,
    /// Resolved on the first connect
    peripheral: Mutex<Option<Peripheral>>,
    link: Mutex<LinkState>,
    events: GattEventSender,
}

impl Shared {
    fn post(&self, event: GattEvent) {
        if self.events.try_send(event).is_err() {
            debug!("GATT event for {} dropped, transport gone", self.address);
        }
    }

    fn set_link(&self, state: LinkState) {
        *self.link.lock() = state;
    }

    fn peripheral(&self) -> Result<Peripheral, GattError> {
        self.peripheral.lock().clone().ok_or(GattError::Disconnected)
    }

    fn characteristic(&self, uuid: Uuid) -> Result<(Peripheral, Characteristic), GattError> {
        let peripheral = self.peripheral()?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(GattError::UnknownCharacteristic(uuid))?;
        Ok((peripheral, characteristic))
    }

    async fn find_peripheral(&self) -> Result<Peripheral, GattError> {
        let peripherals = self.adapter.peripherals().await.map_err(map_btleplug_error)?;
        peripherals
            .into_iter()
            .find(|p| p.address().to_string().eq_ignore_ascii_case(&self.address))
            .ok_or_else(|| GattError::Rejected(format!("{} not seen by the adapter", self.address)))
    }

    /// Forward notifications and adapter-level disconnects as events
    async fn watch(self: Arc<Self>, peripheral: Peripheral) {
        let notifications = peripheral.notifications().await;
        let central = self.adapter.events().await;
        let (Ok(mut notifications), Ok(mut central)) = (notifications, central) else {
            warn!("Failed to subscribe to events for {}", self.address);
            return;
        };

        loop {
            tokio::select! {
                notification = notifications.next() => match notification {
                    Some(n) => self.post(GattEvent::CharacteristicChanged {
                        uuid: n.uuid,
                        value: n.value,
                    }),
                    None => break,
                },
                event = central.next() => match event {
                    Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral.id() => {
                        self.set_link(LinkState::Disconnected);
                        self.post(GattEvent::ConnectionStateChanged { connected: false });
                        break;
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }
    }
}

/// GATT client for one peripheral address
pub struct BtleplugClient {
    shared: Arc<Shared>,
    runtime: Handle,
}

impl BtleplugClient {
    fn spawn<F>(&self, f: impl FnOnce(Arc<Shared>) -> F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(f(Arc::clone(&self.shared)));
    }
}

impl GattClient for BtleplugClient {
    fn connect(&self, _preference: LinkPreference) -> Result<(), GattError> {
        self.shared.set_link(LinkState::Connecting);
        self.spawn(|shared| async move {
            let result = async {
                let peripheral = shared.find_peripheral().await?;
                peripheral.connect().await.map_err(map_btleplug_error)?;
                Ok::<_, GattError>(peripheral)
            }
            .await;

            match result {
                Ok(peripheral) => {
                    *shared.peripheral.lock() = Some(peripheral.clone());
                    shared.set_link(LinkState::Connected);
                    shared.post(GattEvent::ConnectionStateChanged { connected: true });
                    tokio::spawn(Arc::clone(&shared).watch(peripheral));
                }
                Err(e) => {
                    warn!("Connect to {} failed: {}", shared.address, e);
                    shared.set_link(LinkState::Disconnected);
                    shared.post(GattEvent::ConnectionStateChanged { connected: false });
                }
            }
        });
        Ok(())
    }

    fn disconnect(&self) {
        self.spawn(|shared| async move {
            if let Ok(peripheral) = shared.peripheral()
                && let Err(e) = peripheral.disconnect().await
            {
                debug!("Disconnect from {} failed: {}", shared.address, e);
            }
            let was_up = *shared.link.lock() != LinkState::Disconnected;
            shared.set_link(LinkState::Disconnected);
            if was_up {
                shared.post(GattEvent::ConnectionStateChanged { connected: false });
            }
        });
    }

    fn discover_services(&self) -> Result<(), GattError> {
        let peripheral = self.shared.peripheral()?;
        self.spawn(|shared| async move {
            let services = match peripheral.discover_services().await {
                Ok(()) => peripheral
                    .services()
                    .into_iter()
                    .map(|s| GattService {
                        uuid: s.uuid,
                        characteristics: s.characteristics.iter().map(|c| c.uuid).collect(),
                    })
                    .collect(),
                Err(e) => {
                    warn!("Service discovery on {} failed: {}", shared.address, e);
                    Vec::new()
                }
            };
            shared.post(GattEvent::ServicesDiscovered { services });
        });
        Ok(())
    }

    fn read_characteristic(&self, uuid: Uuid) -> Result<(), GattError> {
        let (peripheral, characteristic) = self.shared.characteristic(uuid)?;
        self.spawn(|shared| async move {
            let result = peripheral
                .read(&characteristic)
                .await
                .map_err(map_btleplug_error);
            shared.post(GattEvent::CharacteristicRead { uuid, result });
        });
        Ok(())
    }

    fn write_characteristic(&self, uuid: Uuid, value: &[u8]) -> Result<(), GattError> {
        let (peripheral, characteristic) = self.shared.characteristic(uuid)?;
        let value = value.to_vec();
        self.spawn(|shared| async move {
            let result = peripheral
                .write(&characteristic, &value, WriteType::WithResponse)
                .await
                .map_err(map_btleplug_error);
            shared.post(GattEvent::CharacteristicWritten { uuid, result });
        });
        Ok(())
    }

    fn enable_notification(&self, uuid: Uuid) -> Result<(), GattError> {
        let (peripheral, characteristic) = self.shared.characteristic(uuid)?;
        self.spawn(|shared| async move {
            let result = peripheral
                .subscribe(&characteristic)
                .await
                .map_err(map_btleplug_error);
            shared.post(GattEvent::NotificationEnabled { uuid, result });
        });
        Ok(())
    }

    fn link_state(&self) -> LinkState {
        *self.shared.link.lock()
    }
}
