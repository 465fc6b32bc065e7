//! Persistent identity → device ID mapping
//!
//! The coordinator hands out device IDs from this store so the same
//! physical device keeps its ID across reconnects and across restarts.
//! The store is loaded once at startup and persisted on shutdown; it is
//! never consulted implicitly through global state.
//!
//! File format (JSON):
//!
//! ```json
//! { "next_id": 4, "identities": { "ble:AA:BB:CC:DD:EE:FF": 3 } }
//! ```

use protocol::DeviceId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// First ID handed out by an empty store
const FIRST_DEVICE_ID: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    next_id: u32,
    identities: BTreeMap<String, u32>,
}

/// Identity store
#[derive(Debug)]
pub struct IdentityStore {
    /// Backing file; `None` for a store that lives only in memory
    path: Option<PathBuf>,
    identities: HashMap<String, DeviceId>,
    next_id: u32,
    dirty: bool,
}

impl IdentityStore {
    /// Store without a backing file
    pub fn in_memory() -> Self {
        Self {
            path: None,
            identities: HashMap::new(),
            next_id: FIRST_DEVICE_ID,
            dirty: false,
        }
    }

    /// Load the store from `path`
    ///
    /// A missing file yields an empty store that will be created on the
    /// first `persist`.
    pub fn load(path: impl Into<PathBuf>) -> crate::Result<Self> {
        let path = path.into();
        if !path.exists() {
            debug!("Identity store {} not found, starting empty", path.display());
            return Ok(Self {
                path: Some(path),
                ..Self::in_memory()
            });
        }

        let content = fs::read_to_string(&path)?;
        let file: StoreFile = serde_json::from_str(&content)?;

        // Never hand out an ID at or below one already recorded, even if
        // next_id in the file was edited by hand.
        let highest = file.identities.values().copied().max().unwrap_or(0);
        let next_id = file.next_id.max(highest.saturating_add(1)).max(FIRST_DEVICE_ID);

        let identities = file
            .identities
            .into_iter()
            .map(|(key, id)| (key, DeviceId(id)))
            .collect::<HashMap<_, _>>();

        info!(
            "Loaded {} device identities from {}",
            identities.len(),
            path.display()
        );

        Ok(Self {
            path: Some(path),
            identities,
            next_id,
            dirty: false,
        })
    }

    /// Default on-disk location
    pub fn default_path() -> PathBuf {
        if let Some(data_dir) = dirs::data_local_dir() {
            data_dir.join("hidlink").join("identities.json")
        } else {
            PathBuf::from(".local/share/hidlink/identities.json")
        }
    }

    pub fn lookup(&self, key: &str) -> Option<DeviceId> {
        self.identities.get(key).copied()
    }

    /// ID for `key`, allocating the next one if the key is new
    ///
    /// Returns `(id, allocated)`. Fails with `IdsExhausted` once no unused ID
    /// is left; known keys keep resolving.
    pub fn get_or_allocate(&mut self, key: &str) -> crate::Result<(DeviceId, bool)> {
        if let Some(id) = self.lookup(key) {
            return Ok((id, false));
        }

        let Some(next_id) = self.next_id.checked_add(1) else {
            error!("Device ID space exhausted, cannot register {}", key);
            return Err(crate::Error::IdsExhausted);
        };
        let id = DeviceId(self.next_id);
        self.next_id = next_id;
        self.identities.insert(key.to_string(), id);
        self.dirty = true;
        debug!("Allocated device ID {} for {}", id, key);
        Ok((id, true))
    }

    /// Write the store to its backing file
    ///
    /// Written to a sibling temp file first and renamed into place so a
    /// crash never leaves a truncated store behind.
    pub fn persist(&mut self) -> crate::Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        if !self.dirty && path.exists() {
            return Ok(());
        }

        let file = StoreFile {
            next_id: self.next_id,
            identities: self
                .identities
                .iter()
                .map(|(key, id)| (key.clone(), id.0))
                .collect(),
        };
        let content = serde_json::to_string_pretty(&file)?;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, path)?;

        self.dirty = false;
        info!(
            "Persisted {} device identities to {}",
            self.identities.len(),
            path.display()
        );
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

impl Default for IdentityStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_monotonic() {
        let mut store = IdentityStore::in_memory();
        assert_eq!(store.get_or_allocate("ble:A").unwrap(), (DeviceId(1), true));
        assert_eq!(store.get_or_allocate("ble:B").unwrap(), (DeviceId(2), true));
        assert_eq!(store.get_or_allocate("ble:A").unwrap(), (DeviceId(1), false));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_in_memory_persist_is_noop() {
        let mut store = IdentityStore::in_memory();
        store.get_or_allocate("usb:1").unwrap();
        assert!(store.persist().is_ok());
        assert!(store.path().is_none());
    }
}
