use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::store::PairedDeviceStore;
use crate::error::ConfigError;
use crate::model::PairedDevice;

const MODEL_PREFIX: &str = "RICOH ";

/// Latest published firmware per camera model.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct FirmwareCatalog {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_updated: Option<OffsetDateTime>,
    #[serde(default)]
    pub cameras: BTreeMap<String, String>,
}

/// A paired camera with newer firmware available that has not been announced.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct FirmwareNotice {
    pub address: String,
    pub name: String,
    pub installed: String,
    pub available: String,
}

impl FirmwareCatalog {
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or is not a catalog.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Latest version for `model`, matched on the normalised model name.
    #[must_use]
    pub fn latest_for(&self, model: &str) -> Option<&str> {
        let wanted = normalise_model_name(model);
        self.cameras
            .iter()
            .find(|(name, _)| normalise_model_name(name) == wanted)
            .map(|(_, version)| version.as_str())
    }

    /// Devices whose installed firmware is older than the catalog's and
    /// that have not been told about it yet.
    #[must_use]
    pub fn pending_notifications(&self, devices: &[PairedDevice]) -> Vec<FirmwareNotice> {
        devices
            .iter()
            .filter(|device| !device.firmware_update_notified)
            .filter_map(|device| {
                let installed = device.firmware_version.as_deref()?;
                let available = self.latest_for(&device.name)?;
                (compare_versions(available, installed) == Ordering::Greater).then(|| {
                    FirmwareNotice {
                        address: device.address.clone(),
                        name: device.name.clone(),
                        installed: installed.to_string(),
                        available: available.to_string(),
                    }
                })
            })
            .collect()
    }
}

/// Collapses whitespace, upper-cases, and drops a leading `RICOH ` prefix.
#[must_use]
pub fn normalise_model_name(name: &str) -> String {
    let collapsed = name
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase();
    collapsed
        .strip_prefix(MODEL_PREFIX)
        .map_or_else(|| collapsed.clone(), str::to_string)
}

/// Compares dotted versions numerically, ignoring any non-numeric decoration
/// such as a `Ver.` prefix. Missing components count as zero.
#[must_use]
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    let left = version_components(left);
    let right = version_components(right);
    let len = left.len().max(right.len());
    (0..len)
        .map(|index| {
            let a = left.get(index).copied().unwrap_or_default();
            let b = right.get(index).copied().unwrap_or_default();
            a.cmp(&b)
        })
        .find(|ordering| ordering.is_ne())
        .unwrap_or(Ordering::Equal)
}

fn version_components(version: &str) -> Vec<u64> {
    version
        .split(|character: char| !character.is_ascii_digit())
        .filter(|part| !part.is_empty())
        .filter_map(|part| part.parse().ok())
        .collect()
}

/// External hook that looks for new firmware for one device.
pub trait FirmwareUpdateScheduler: Send + Sync + Debug {
    fn schedule_update_check(&self, device: &PairedDevice);
}

/// Scheduler that never checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFirmwareScheduler;

impl FirmwareUpdateScheduler for NoopFirmwareScheduler {
    fn schedule_update_check(&self, device: &PairedDevice) {
        debug!(address = device.address, "firmware update checks are disabled");
    }
}

/// Resolves update checks against a local catalog and stores the result.
#[derive(Debug)]
pub struct CatalogUpdateChecker {
    catalog: FirmwareCatalog,
    store: Arc<dyn PairedDeviceStore>,
}

impl CatalogUpdateChecker {
    #[must_use]
    pub fn new(catalog: FirmwareCatalog, store: Arc<dyn PairedDeviceStore>) -> Self {
        Self { catalog, store }
    }
}

impl FirmwareUpdateScheduler for CatalogUpdateChecker {
    fn schedule_update_check(&self, device: &PairedDevice) {
        let Some(latest) = self.catalog.latest_for(&device.name) else {
            debug!(address = device.address, model = device.name, "model not in firmware catalog");
            return;
        };
        match self.store.set_latest_firmware(&device.address, latest) {
            Ok(()) => info!(address = device.address, latest, "latest firmware recorded"),
            Err(error) => warn!(address = device.address, %error, "failed to record latest firmware"),
        }
    }
}
