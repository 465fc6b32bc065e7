//! hidlink
//!
//! Discovers USB (and, with the `btleplug` feature, BLE) HID devices and
//! logs their lifecycle. With `--monitor` every discovered device is opened
//! and its input reports are logged until Ctrl+C.

use anyhow::{Context, Result};
use clap::Parser;
use common::channel::DEFAULT_EVENT_CAPACITY;
use common::{BufferPool, EventReceiver, HidEvent, IdentityStore, create_event_channel, setup_logging};
use hidlink::config::HidlinkConfig;
use hidlink::usb::{RusbBackend, UsbBackend, UsbDiscovery, spawn_hotplug_monitor};
use hidlink::DeviceCoordinator;
use protocol::DeviceState;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "hidlink")]
#[command(author, version, about = "HID transport and lifecycle coordinator")]
#[command(long_about = "
Discovers HID devices over USB and Bluetooth LE, assigns each a stable ID
and opens them on request.

EXAMPLES:
    # List devices and exit
    hidlink --list-devices

    # Open every device and log input reports
    hidlink --monitor

    # Run with debug logging
    hidlink --monitor --log-level debug

CONFIGURATION:
    hidlink looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/hidlink/hidlink.toml
    3. /etc/hidlink/hidlink.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List HID devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Open every discovered device and log its input reports
    #[arg(long)]
    monitor: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = HidlinkConfig::default();
        let path = HidlinkConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        HidlinkConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        HidlinkConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.general.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("hidlink v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let store_path = config.identity_store_path();
    let identities = IdentityStore::load(&store_path)
        .with_context(|| format!("Failed to load identity store: {}", store_path.display()))?;

    let (consumer, events) = create_event_channel(DEFAULT_EVENT_CAPACITY);
    let pool = Arc::new(BufferPool::new(
        config.queue.pool_max_buffers,
        config.queue.pool_max_buffer_size,
    ));

    let mut builder = DeviceCoordinator::builder(Arc::new(consumer))
        .identity_store(identities)
        .pool(pool)
        .settings(config.coordinator_settings());

    let usb: Option<Arc<dyn UsbBackend>> = if config.usb.enabled {
        let backend = RusbBackend::new().context("Failed to initialize libusb")?;
        Some(Arc::new(backend))
    } else {
        info!("USB disabled by configuration");
        None
    };
    if let Some(backend) = &usb {
        builder = builder.usb_backend(Arc::clone(backend));
    }

    #[cfg(feature = "btleplug")]
    let ble = if config.ble.enabled {
        let backend = hidlink::ble::BtleplugBackend::new()
            .await
            .context("Failed to initialize Bluetooth")?;
        let backend = Arc::new(backend);
        builder = builder.ble_backend(backend.clone());
        Some(backend)
    } else {
        None
    };
    #[cfg(not(feature = "btleplug"))]
    if config.ble.enabled {
        warn!("BLE enabled in configuration but hidlink was built without the btleplug feature");
    }

    let coordinator = builder.build();

    let mut discovery = usb.map(|backend| UsbDiscovery::new(backend, &config.usb.filters));
    if let Some(discovery) = discovery.as_mut() {
        let arrived = discovery
            .scan(&coordinator)
            .context("Failed to enumerate USB devices")?;
        info!("Found {} USB HID interface(s)", arrived);
    }

    #[cfg(feature = "btleplug")]
    if let Some(ble) = &ble {
        match ble.scan(Duration::from_secs(config.ble.scan_secs)).await {
            Ok(peripherals) => {
                for peripheral in peripherals {
                    if let Err(e) =
                        coordinator.on_device_discovered(peripheral.identity, peripheral.metadata)
                    {
                        warn!("BLE peripheral not registered: {}", e);
                    }
                }
            }
            Err(e) => warn!("BLE scan failed: {}", e),
        }
    }

    if args.list_devices {
        list_devices(&coordinator);
        return shutdown_coordinator(&coordinator).await;
    }

    let hotplug = match (discovery, config.hotplug_poll()) {
        (Some(discovery), Some(interval)) => {
            Some(spawn_hotplug_monitor(discovery, coordinator.clone(), interval))
        }
        _ => None,
    };

    let event_loop = tokio::spawn(log_events(events, coordinator.clone()));

    let opener = args.monitor.then(|| {
        tokio::spawn(open_discovered(
            coordinator.clone(),
            config.open_timeout(),
            config.hotplug_poll().unwrap_or(Duration::from_secs(1)),
        ))
    });

    info!("Press Ctrl+C to shutdown");
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
        Err(e) => error!("Error waiting for Ctrl+C: {}", e),
    }

    if let Some(opener) = opener {
        opener.abort();
    }
    if let Some(hotplug) = hotplug {
        hotplug.abort();
    }

    let result = shutdown_coordinator(&coordinator).await;
    event_loop.abort();

    info!("Shutdown complete");
    result
}

/// Close every device and persist identities off the async workers
async fn shutdown_coordinator(coordinator: &DeviceCoordinator) -> Result<()> {
    let coordinator = coordinator.clone();
    tokio::task::spawn_blocking(move || coordinator.shutdown())
        .await
        .context("Shutdown task failed")?
        .context("Failed to persist identity store")
}

fn list_devices(coordinator: &DeviceCoordinator) {
    let devices = coordinator.devices();
    if devices.is_empty() {
        println!("No HID devices found.");
        return;
    }

    println!("Found {} HID device(s):\n", devices.len());
    for device in devices {
        println!(
            "  [{}] {} {:04x}:{:04x} - {} {}",
            device.id.0,
            device.kind,
            device.vendor_id,
            device.product_id,
            device
                .manufacturer
                .as_deref()
                .unwrap_or("Unknown Manufacturer"),
            device.name
        );
        if let Some(serial) = &device.serial_number {
            println!("      Serial: {}", serial);
        }
        println!();
    }
}

/// Open every device still in `Discovered`, re-checking every `interval`
async fn open_discovered(coordinator: DeviceCoordinator, timeout: Duration, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        for device in coordinator.devices() {
            if device.state != DeviceState::Discovered {
                continue;
            }
            match coordinator.open(device.id, timeout).await {
                Ok(state) => debug!("{} is {}", device.id, state),
                Err(e) => warn!("Failed to open {} ({}): {}", device.id, device.name, e),
            }
        }
    }
}

async fn log_events(events: EventReceiver, coordinator: DeviceCoordinator) {
    while let Ok(event) = events.recv().await {
        match event {
            HidEvent::Connected { device } => info!(
                "Connected {} {} {:04x}:{:04x} ({})",
                device.id, device.kind, device.vendor_id, device.product_id, device.name
            ),
            HidEvent::Disconnected { id } => info!("Disconnected {}", id),
            HidEvent::InputReport { id, data } => {
                info!("{} input: {:02x?}", id, data);
                // The consumer already saw the bytes; drain the queue copy.
                while let Ok(Some(report)) = coordinator.read_report(id, Duration::ZERO) {
                    coordinator.recycle(report);
                }
            }
            HidEvent::WriteComplete { id, token, result } => {
                debug!("{} write {:?}: {:?}", id, token, result)
            }
            HidEvent::FeatureReport { id, token, result } => {
                debug!("{} feature report {:?}: {:?}", id, token, result)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{RecordingConsumer, mock_metadata, mock_usb_identity};
    use hidlink::test_utils::MockUsbBackend;

    #[tokio::test(flavor = "current_thread")]
    async fn test_shutdown_joins_workers_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identities.json");

        let consumer = Arc::new(RecordingConsumer::new());
        let backend = MockUsbBackend::new();
        let coordinator = DeviceCoordinator::builder(consumer.clone())
            .usb_backend(backend.clone())
            .identity_store(IdentityStore::load(&path).unwrap())
            .build();

        let id = coordinator
            .on_device_discovered(mock_usb_identity(1), mock_metadata("pad", 0x045e, 0x028e))
            .unwrap();
        coordinator.open(id, Duration::from_secs(2)).await.unwrap();

        shutdown_coordinator(&coordinator).await.unwrap();

        assert_eq!(coordinator.state(id), Some(DeviceState::Closed));
        assert_eq!(consumer.disconnected_count(id), 1);
        assert!(backend.last_connection().unwrap().is_closed());
        assert!(path.exists());
    }
}
