use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, instrument};

use crate::error::StoreError;
use crate::model::{PairedDevice, normalise_address};

/// Persistence for the cameras this host is paired with.
pub trait PairedDeviceStore: Send + Sync + Debug {
    /// Every record, sorted by address.
    fn list(&self) -> Vec<PairedDevice>;

    fn get(&self, address: &str) -> Option<PairedDevice>;

    /// Inserts or replaces a record.
    ///
    /// # Errors
    ///
    /// Returns an error when the change cannot be persisted.
    fn upsert(&self, device: PairedDevice) -> Result<(), StoreError>;

    /// # Errors
    ///
    /// Returns an error when the change cannot be persisted.
    fn remove(&self, address: &str) -> Result<Option<PairedDevice>, StoreError>;

    /// Enabled records, re-published after every change.
    fn enabled_devices(&self) -> watch::Receiver<Vec<PairedDevice>>;

    /// Applies `change` to an existing record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownDevice`] when no record exists.
    fn modify(
        &self,
        address: &str,
        change: &mut dyn FnMut(&mut PairedDevice),
    ) -> Result<PairedDevice, StoreError> {
        let mut device = self
            .get(address)
            .ok_or_else(|| StoreError::UnknownDevice {
                address: normalise_address(address),
            })?;
        change(&mut device);
        self.upsert(device.clone())?;
        Ok(device)
    }

    /// # Errors
    ///
    /// Returns [`StoreError::UnknownDevice`] or a persistence error.
    fn set_enabled(&self, address: &str, enabled: bool) -> Result<PairedDevice, StoreError> {
        self.modify(address, &mut |device| device.enabled = enabled)
    }

    /// # Errors
    ///
    /// Returns [`StoreError::UnknownDevice`] or a persistence error.
    fn record_sync(&self, address: &str, at: OffsetDateTime) -> Result<(), StoreError> {
        self.modify(address, &mut |device| device.last_synced_at = Some(at))
            .map(drop)
    }

    /// # Errors
    ///
    /// Returns [`StoreError::UnknownDevice`] or a persistence error.
    fn record_firmware_version(&self, address: &str, version: &str) -> Result<(), StoreError> {
        self.modify(address, &mut |device| {
            device.firmware_version = Some(version.to_string());
        })
        .map(drop)
    }

    /// # Errors
    ///
    /// Returns [`StoreError::UnknownDevice`] or a persistence error.
    fn record_firmware_check(&self, address: &str, at: OffsetDateTime) -> Result<(), StoreError> {
        self.modify(address, &mut |device| device.last_firmware_check_at = Some(at))
            .map(drop)
    }

    /// Caches the newest available firmware. A different version than the
    /// one cached before clears `firmware_update_notified`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownDevice`] or a persistence error.
    fn set_latest_firmware(&self, address: &str, version: &str) -> Result<(), StoreError> {
        self.modify(address, &mut |device| {
            if device.latest_firmware_version.as_deref() != Some(version) {
                device.latest_firmware_version = Some(version.to_string());
                device.firmware_update_notified = false;
            }
        })
        .map(drop)
    }

    /// # Errors
    ///
    /// Returns [`StoreError::UnknownDevice`] or a persistence error.
    fn mark_firmware_notified(&self, address: &str, notified: bool) -> Result<(), StoreError> {
        self.modify(address, &mut |device| {
            device.firmware_update_notified = notified;
        })
        .map(drop)
    }
}

#[derive(Debug)]
struct DeviceTable {
    devices: Mutex<BTreeMap<String, PairedDevice>>,
    enabled: watch::Sender<Vec<PairedDevice>>,
}

impl DeviceTable {
    fn new(devices: BTreeMap<String, PairedDevice>) -> Self {
        let enabled = watch::Sender::new(enabled_of(&devices));
        Self {
            devices: Mutex::new(devices),
            enabled,
        }
    }

    fn devices(&self) -> MutexGuard<'_, BTreeMap<String, PairedDevice>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, devices: &BTreeMap<String, PairedDevice>) {
        let enabled = enabled_of(devices);
        self.enabled.send_if_modified(|current| {
            if *current == enabled {
                false
            } else {
                *current = enabled;
                true
            }
        });
    }
}

fn enabled_of(devices: &BTreeMap<String, PairedDevice>) -> Vec<PairedDevice> {
    devices
        .values()
        .filter(|device| device.enabled)
        .cloned()
        .collect()
}

/// Volatile store for tests and one-shot commands.
#[derive(Debug)]
pub struct InMemoryPairedDeviceStore {
    table: DeviceTable,
}

impl Default for InMemoryPairedDeviceStore {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl InMemoryPairedDeviceStore {
    #[must_use]
    pub fn new(devices: Vec<PairedDevice>) -> Self {
        Self {
            table: DeviceTable::new(
                devices
                    .into_iter()
                    .map(|device| (normalise_address(&device.address), device))
                    .collect(),
            ),
        }
    }
}

impl PairedDeviceStore for InMemoryPairedDeviceStore {
    fn list(&self) -> Vec<PairedDevice> {
        self.table.devices().values().cloned().collect()
    }

    fn get(&self, address: &str) -> Option<PairedDevice> {
        self.table
            .devices()
            .get(&normalise_address(address))
            .cloned()
    }

    fn upsert(&self, mut device: PairedDevice) -> Result<(), StoreError> {
        device.address = normalise_address(&device.address);
        let mut devices = self.table.devices();
        devices.insert(device.address.clone(), device);
        self.table.publish(&devices);
        Ok(())
    }

    fn remove(&self, address: &str) -> Result<Option<PairedDevice>, StoreError> {
        let mut devices = self.table.devices();
        let removed = devices.remove(&normalise_address(address));
        self.table.publish(&devices);
        Ok(removed)
    }

    fn enabled_devices(&self) -> watch::Receiver<Vec<PairedDevice>> {
        self.table.enabled.subscribe()
    }
}

/// Store persisted as a JSON array, rewritten after every change.
#[derive(Debug)]
pub struct JsonPairedDeviceStore {
    path: PathBuf,
    table: DeviceTable,
}

impl JsonPairedDeviceStore {
    /// Opens the store at `path`. A missing file is an empty store.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or parsed.
    #[instrument(level = "debug", skip(path), fields(path = %path.display()))]
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let devices: Vec<PairedDevice> = match fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|source| StoreError::Malformed {
                path: path.display().to_string(),
                source,
            })?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        debug!(count = devices.len(), "paired devices loaded");

        Ok(Self {
            path: path.to_path_buf(),
            table: DeviceTable::new(
                devices
                    .into_iter()
                    .map(|device| (normalise_address(&device.address), device))
                    .collect(),
            ),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, devices: &BTreeMap<String, PairedDevice>) -> Result<(), StoreError> {
        let io_error = |source| StoreError::Io {
            path: self.path.display().to_string(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let records: Vec<&PairedDevice> = devices.values().collect();
        let json = serde_json::to_string_pretty(&records).map_err(|source| {
            StoreError::Malformed {
                path: self.path.display().to_string(),
                source,
            }
        })?;
        fs::write(&self.path, json).map_err(io_error)
    }
}

impl PairedDeviceStore for JsonPairedDeviceStore {
    fn list(&self) -> Vec<PairedDevice> {
        self.table.devices().values().cloned().collect()
    }

    fn get(&self, address: &str) -> Option<PairedDevice> {
        self.table
            .devices()
            .get(&normalise_address(address))
            .cloned()
    }

    fn upsert(&self, mut device: PairedDevice) -> Result<(), StoreError> {
        device.address = normalise_address(&device.address);
        let mut devices = self.table.devices();
        devices.insert(device.address.clone(), device);
        self.persist(&devices)?;
        self.table.publish(&devices);
        Ok(())
    }

    fn remove(&self, address: &str) -> Result<Option<PairedDevice>, StoreError> {
        let mut devices = self.table.devices();
        let removed = devices.remove(&normalise_address(address));
        if removed.is_some() {
            self.persist(&devices)?;
            self.table.publish(&devices);
        }
        Ok(removed)
    }

    fn enabled_devices(&self) -> watch::Receiver<Vec<PairedDevice>> {
        self.table.enabled.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;
    use time::macros::datetime;

    use super::*;
    use crate::vendor::VendorId;

    fn ricoh(address: &str) -> PairedDevice {
        PairedDevice::new(address, "GR IIIx", VendorId::Ricoh)
    }

    #[test]
    fn enabled_stream_tracks_toggles() {
        let store = InMemoryPairedDeviceStore::new(vec![ricoh("aa:00:00:00:00:01")]);
        let mut enabled = store.enabled_devices();
        enabled.mark_unchanged();

        store
            .set_enabled("AA:00:00:00:00:01", false)
            .expect("known device should toggle");

        assert_eq!(true, enabled.has_changed().expect("store should be alive"));
        assert_eq!(Vec::<PairedDevice>::new(), *enabled.borrow_and_update());
    }

    #[test]
    fn new_latest_firmware_rearms_the_notification() -> Result<(), StoreError> {
        let address = "AA:00:00:00:00:01";
        let store = InMemoryPairedDeviceStore::new(vec![ricoh(address)]);
        store.set_latest_firmware(address, "1.90")?;
        store.mark_firmware_notified(address, true)?;

        store.set_latest_firmware(address, "1.90")?;
        let unchanged = store.get(address).expect("device should stay paired");
        store.set_latest_firmware(address, "2.00")?;
        let bumped = store.get(address).expect("device should stay paired");

        assert_eq!(true, unchanged.firmware_update_notified);
        assert_eq!(false, bumped.firmware_update_notified);
        assert_eq!(Some("2.00".to_string()), bumped.latest_firmware_version);
        Ok(())
    }

    #[test]
    fn modifying_an_unknown_device_fails() {
        let store = InMemoryPairedDeviceStore::default();

        let result = store.record_sync("AA:00:00:00:00:09", datetime!(2025-03-15 12:00 UTC));

        assert_matches!(result, Err(StoreError::UnknownDevice { address }) if address == "AA:00:00:00:00:09");
    }

    #[test]
    fn json_store_round_trips_through_disk() {
        let directory = tempdir().expect("temporary directory should be creatable");
        let path = directory.path().join("nested").join("paired-devices.json");
        let store = JsonPairedDeviceStore::open(&path).expect("missing file should open empty");
        store
            .upsert(ricoh("aa:00:00:00:00:01"))
            .expect("insert should persist");
        store
            .record_firmware_version("AA:00:00:00:00:01", "1.10")
            .expect("firmware should persist");

        let reopened = JsonPairedDeviceStore::open(&path).expect("written file should parse");

        assert_eq!(
            Some("1.10".to_string()),
            reopened
                .get("AA:00:00:00:00:01")
                .and_then(|device| device.firmware_version)
        );
    }

    #[test]
    fn json_store_reports_malformed_file() {
        let directory = tempdir().expect("temporary directory should be creatable");
        let path = directory.path().join("paired-devices.json");
        fs::write(&path, "{not json").expect("fixture should be writable");

        assert_matches!(
            JsonPairedDeviceStore::open(&path),
            Err(StoreError::Malformed { .. })
        );
    }
}
