//! USB discovery and hot-plug polling
//!
//! Each scan enumerates the backend, applies the VID:PID filters and diffs
//! the result against the previous scan. New interfaces are reported with
//! `on_device_discovered`, vanished ones with `on_device_removed`.

use crate::coordinator::DeviceCoordinator;
use crate::usb::backend::{UsbBackend, UsbInterfaceInfo};
use protocol::{DeviceIdentity, UsbError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Parsed "0xVID:0xPID" filter, `*` matching anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl DeviceFilter {
    /// Parse a filter; `None` when malformed (config validation rejects those)
    pub fn parse(filter: &str) -> Option<Self> {
        let (vid, pid) = filter.split_once(':')?;
        Some(Self {
            vendor_id: parse_part(vid)?,
            product_id: parse_part(pid)?,
        })
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.is_none_or(|v| v == vendor_id)
            && self.product_id.is_none_or(|p| p == product_id)
    }
}

/// `Some(None)` for a wildcard, `Some(Some(id))` for a hex ID
fn parse_part(part: &str) -> Option<Option<u16>> {
    if part == "*" {
        return Some(None);
    }
    let hex = part
        .strip_prefix("0x")
        .or_else(|| part.strip_prefix("0X"))?;
    u16::from_str_radix(hex, 16).ok().map(Some)
}

/// Whether a VID/PID pair passes the filters; no filters allow everything
pub fn check_filter(vendor_id: u16, product_id: u16, filters: &[DeviceFilter]) -> bool {
    filters.is_empty() || filters.iter().any(|f| f.matches(vendor_id, product_id))
}

/// Diffing scanner over a USB backend
pub struct UsbDiscovery {
    backend: Arc<dyn UsbBackend>,
    filters: Vec<DeviceFilter>,
    /// Interfaces seen in the last scan, by identity key
    present: HashMap<String, DeviceIdentity>,
}

impl UsbDiscovery {
    pub fn new(backend: Arc<dyn UsbBackend>, filters: &[String]) -> Self {
        let filters = filters
            .iter()
            .filter_map(|f| {
                let parsed = DeviceFilter::parse(f);
                if parsed.is_none() {
                    warn!("Ignoring malformed USB filter '{}'", f);
                }
                parsed
            })
            .collect();

        Self {
            backend,
            filters,
            present: HashMap::new(),
        }
    }

    /// Interfaces currently attached that pass the filters
    pub fn enumerate(&self) -> Result<Vec<UsbInterfaceInfo>, UsbError> {
        let mut interfaces = self.backend.enumerate()?;
        interfaces.retain(|i| {
            let allowed = check_filter(i.metadata.vendor_id, i.metadata.product_id, &self.filters);
            if !allowed {
                debug!("Interface {} ignored by filter", i.identity);
            }
            allowed
        });
        Ok(interfaces)
    }

    /// Enumerate once and report arrivals and removals to `coordinator`
    ///
    /// Returns the number of arrivals.
    pub fn scan(&mut self, coordinator: &DeviceCoordinator) -> Result<usize, UsbError> {
        let interfaces = self.enumerate()?;
        let mut current = HashMap::with_capacity(interfaces.len());
        let mut arrived = 0;

        for interface in interfaces {
            let key = interface.identity.key();
            if !self.present.contains_key(&key) {
                match coordinator.on_device_discovered(interface.identity.clone(), interface.metadata)
                {
                    Ok(id) => info!("USB interface {} arrived as {}", key, id),
                    Err(e) => {
                        // Not marked present, so the next scan retries it
                        warn!("USB interface {} not registered: {}", key, e);
                        continue;
                    }
                }
                arrived += 1;
            }
            current.insert(key, interface.identity);
        }

        for (key, identity) in &self.present {
            if !current.contains_key(key) {
                info!("USB interface {} left", key);
                coordinator.on_device_removed(identity);
            }
        }

        self.present = current;
        Ok(arrived)
    }
}

/// Poll `discovery` every `interval` on the tokio runtime
///
/// Enumeration is blocking and runs on the blocking pool.
pub fn spawn_hotplug_monitor(
    discovery: UsbDiscovery,
    coordinator: DeviceCoordinator,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut discovery = discovery;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let scan_coordinator = coordinator.clone();
            let result = tokio::task::spawn_blocking(move || {
                let result = discovery.scan(&scan_coordinator);
                (discovery, result)
            })
            .await;

            match result {
                Ok((returned, Ok(_))) => discovery = returned,
                Ok((returned, Err(e))) => {
                    warn!("USB hot-plug scan failed: {}", e);
                    discovery = returned;
                }
                Err(e) => {
                    warn!("USB hot-plug scan task failed: {}", e);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_logic() {
        let filters = vec![
            DeviceFilter::parse("0x1234:0x5678").unwrap(),
            DeviceFilter::parse("0xABCD:*").unwrap(),
        ];

        assert!(check_filter(0x1234, 0x5678, &filters));
        assert!(check_filter(0xABCD, 0x1111, &filters));
        assert!(check_filter(0xABCD, 0x9999, &filters));

        assert!(!check_filter(0x1234, 0x9999, &filters));
        assert!(!check_filter(0x9999, 0x5678, &filters));

        assert!(check_filter(0x1234, 0x5678, &[]));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(DeviceFilter::parse("1234:5678").is_none());
        assert!(DeviceFilter::parse("0x1234").is_none());
        assert!(DeviceFilter::parse("0xGHIJ:*").is_none());
        assert_eq!(
            DeviceFilter::parse("*:*"),
            Some(DeviceFilter {
                vendor_id: None,
                product_id: None
            })
        );
    }
}
