use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bon::Builder;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use tracing::debug;

use crate::error::ConfigError;

const SETTINGS_FILE_NAME: &str = "settings.json";
const PAIRED_DEVICES_FILE_NAME: &str = "paired-devices.json";

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_SCAN_ATTEMPTS: u32 = 3;
const DEFAULT_SCAN_RETRY_DELAY: Duration = Duration::from_secs(3);
const DEFAULT_BONDED_ADVERTISEMENT_WAIT: Duration = Duration::from_secs(20);
const DEFAULT_UNBONDED_ADVERTISEMENT_WAIT: Duration = Duration::from_secs(10);
const DEFAULT_LOCATION_WRITE_ATTEMPTS: u32 = 3;
const DEFAULT_LOCATION_RETRY_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_PROACTIVE_CONNECT_STALENESS: Duration = Duration::from_secs(60 * 60);
const DEFAULT_FIRMWARE_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_LOCATION_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Runtime tuning for discovery, sessions, and the sync coordinator.
#[serde_as]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Bound on every individual GATT read or write.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[builder(default = DEFAULT_WRITE_TIMEOUT)]
    pub write_timeout: Duration,
    /// Bound on the whole connect and initial-setup sequence.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[builder(default = DEFAULT_CONNECT_TIMEOUT)]
    pub connect_timeout: Duration,
    #[builder(default = DEFAULT_SCAN_ATTEMPTS)]
    pub scan_attempts: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[builder(default = DEFAULT_SCAN_RETRY_DELAY)]
    pub scan_retry_delay: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[builder(default = DEFAULT_BONDED_ADVERTISEMENT_WAIT)]
    pub bonded_advertisement_wait: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[builder(default = DEFAULT_UNBONDED_ADVERTISEMENT_WAIT)]
    pub unbonded_advertisement_wait: Duration,
    #[builder(default = DEFAULT_LOCATION_WRITE_ATTEMPTS)]
    pub location_write_attempts: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[builder(default = DEFAULT_LOCATION_RETRY_DELAY)]
    pub location_retry_delay: Duration,
    /// Devices synced more recently than this wait for a presence sighting
    /// instead of being connected proactively on startup.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[builder(default = DEFAULT_PROACTIVE_CONNECT_STALENESS)]
    pub proactive_connect_staleness: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[builder(default = DEFAULT_FIRMWARE_CHECK_INTERVAL)]
    pub firmware_check_interval: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[builder(default = DEFAULT_LOCATION_POLL_INTERVAL)]
    pub location_poll_interval: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SyncSettings {
    /// Loads settings from `path`, or from the platform config directory.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => config_dir()?.join(SETTINGS_FILE_NAME),
        };
        Self::load_from_path(&path)
    }

    fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "settings file absent; using defaults");
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Advertisement wait for one scan attempt.
    #[must_use]
    pub fn advertisement_wait(&self, bonded: bool) -> Duration {
        if bonded {
            self.bonded_advertisement_wait
        } else {
            self.unbonded_advertisement_wait
        }
    }
}

/// Default location of the paired-device file.
///
/// # Errors
///
/// Returns an error when the platform exposes no configuration directory.
pub fn default_paired_devices_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join(PAIRED_DEVICES_FILE_NAME))
}

fn config_dir() -> Result<PathBuf, ConfigError> {
    ProjectDirs::from("io", "camsync", "camsync")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or(ConfigError::NoConfigDirectory)
}
