use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};
use time::{OffsetDateTime, UtcOffset};

use crate::vendor::VendorId;

/// A camera sighted in an advertisement.
///
/// Recreated on every sighting; the address is the stable identity.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct Camera {
    identifier: String,
    name: Option<String>,
    address: String,
    vendor: VendorId,
    metadata: BTreeMap<String, String>,
    protocol_version: Option<u32>,
}

impl Camera {
    /// Creates a camera record. The address is normalised to uppercase.
    #[must_use]
    pub fn new(address: &str, name: Option<String>, vendor: VendorId) -> Self {
        let address = normalise_address(address);
        Self {
            identifier: address.clone(),
            name,
            address,
            vendor,
            metadata: BTreeMap::new(),
            protocol_version: None,
        }
    }

    /// Attaches a vendor protocol-version hint parsed from the advertisement.
    #[must_use]
    pub fn with_protocol_version(mut self, protocol_version: Option<u32>) -> Self {
        self.protocol_version = protocol_version;
        self
    }

    /// Attaches one vendor-specific metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Backend-specific identifier, equal to the address unless overridden.
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Uppercase MAC address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn vendor(&self) -> VendorId {
        self.vendor
    }

    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    #[must_use]
    pub fn protocol_version(&self) -> Option<u32> {
        self.protocol_version
    }

    /// Name used in logs and tables when the camera did not advertise one.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

/// A persisted pairing record.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PairedDevice {
    pub address: String,
    pub name: String,
    pub vendor: VendorId,
    pub enabled: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_synced_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub latest_firmware_version: Option<String>,
    #[serde(default)]
    pub firmware_update_notified: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_firmware_check_at: Option<OffsetDateTime>,
}

impl PairedDevice {
    /// Creates an enabled record that has never synced.
    #[must_use]
    pub fn new(address: &str, name: impl Into<String>, vendor: VendorId) -> Self {
        Self {
            address: normalise_address(address),
            name: name.into(),
            vendor,
            enabled: true,
            last_synced_at: None,
            firmware_version: None,
            latest_firmware_version: None,
            firmware_update_notified: false,
            last_firmware_check_at: None,
        }
    }

    #[must_use]
    pub fn has_never_synced(&self) -> bool {
        self.last_synced_at.is_none()
    }
}

/// A GPS fix shared with every syncing camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GpsLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub timestamp: OffsetDateTime,
}

impl GpsLocation {
    #[must_use]
    pub fn new(latitude: f64, longitude: f64, altitude: f64, timestamp: OffsetDateTime) -> Self {
        Self {
            latitude,
            longitude,
            altitude,
            timestamp,
        }
    }
}

/// A local date-time together with the standard (non-DST) offset of its zone.
///
/// `OffsetDateTime` only knows the offset in effect; cameras also want to know
/// whether that offset includes daylight saving.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ZonedDateTime {
    date_time: OffsetDateTime,
    standard_offset: UtcOffset,
}

impl ZonedDateTime {
    /// Creates a zoned value whose zone does not observe daylight saving.
    #[must_use]
    pub fn fixed(date_time: OffsetDateTime) -> Self {
        Self {
            date_time,
            standard_offset: date_time.offset(),
        }
    }

    /// Creates a zoned value with an explicit standard offset.
    #[must_use]
    pub fn new(date_time: OffsetDateTime, standard_offset: UtcOffset) -> Self {
        Self {
            date_time,
            standard_offset,
        }
    }

    /// Wall-clock date-time in the zone's current offset.
    #[must_use]
    pub fn date_time(&self) -> OffsetDateTime {
        self.date_time
    }

    /// Offset in effect at this instant.
    #[must_use]
    pub fn offset(&self) -> UtcOffset {
        self.date_time.offset()
    }

    #[must_use]
    pub fn standard_offset(&self) -> UtcOffset {
        self.standard_offset
    }

    /// True when the offset in effect differs from the standard offset.
    #[must_use]
    pub fn is_dst(&self) -> bool {
        self.date_time.offset() != self.standard_offset
    }

    /// Daylight-saving shift in minutes (zero outside DST).
    #[must_use]
    pub fn dst_minutes(&self) -> i32 {
        (self.date_time.offset().whole_seconds() - self.standard_offset.whole_seconds()) / 60
    }
}

/// Boolean capability flags resolved per vendor.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct ConnectionCapabilities {
    pub supports_firmware_version: bool,
    pub supports_device_name: bool,
    pub supports_date_time_sync: bool,
    pub supports_geo_tagging: bool,
    pub supports_location_sync: bool,
    pub supports_hardware_revision: bool,
    pub requires_vendor_pairing: bool,
}

impl ConnectionCapabilities {
    /// Returns whether one gated capability is available.
    #[must_use]
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::FirmwareVersion => self.supports_firmware_version,
            Capability::DeviceName => self.supports_device_name,
            Capability::DateTimeSync => self.supports_date_time_sync,
            Capability::GeoTagging => self.supports_geo_tagging,
            Capability::LocationSync => self.supports_location_sync,
            Capability::HardwareRevision => self.supports_hardware_revision,
            Capability::VendorPairing => self.requires_vendor_pairing,
            Capability::BatteryLevel | Capability::ShootingMode | Capability::DriveMode => false,
        }
    }
}

/// Named session capabilities, used in `UnsupportedCapability` errors.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, EnumIter, Serialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    FirmwareVersion,
    DeviceName,
    DateTimeSync,
    GeoTagging,
    LocationSync,
    HardwareRevision,
    VendorPairing,
    BatteryLevel,
    ShootingMode,
    DriveMode,
}

/// Outcome of the most recent successful location push.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncInfo {
    pub synced_at: OffsetDateTime,
    pub location: GpsLocation,
}

/// Per-device connection state observed by the UI and notification layer.
#[derive(Debug, Clone, PartialEq, Serialize, derive_more::Display)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeviceConnectionState {
    #[display("disconnected")]
    Disconnected,
    #[display("searching")]
    Searching,
    #[display("connecting")]
    Connecting,
    #[display("connected")]
    Connected,
    #[display("syncing")]
    Syncing { last_sync: Option<SyncInfo> },
    #[display("unreachable")]
    Unreachable,
    #[display("error: {message}")]
    Error {
        message: String,
        is_recoverable: bool,
    },
}

impl DeviceConnectionState {
    /// True for states that require a live session.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Syncing { .. })
    }

    /// True while a connect attempt is in flight.
    #[must_use]
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Searching | Self::Connecting)
    }
}

/// Normalises a MAC address to the uppercase form used as a map key.
#[must_use]
pub fn normalise_address(address: &str) -> String {
    address.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use strum::IntoEnumIterator;
    use time::macros::{datetime, offset};

    use super::*;

    #[test]
    fn zoned_date_time_reports_dst_shift() {
        let summer = ZonedDateTime::new(datetime!(2025-07-01 12:00 +2), offset!(+1));
        assert_eq!(true, summer.is_dst());
        assert_eq!(60, summer.dst_minutes());

        let winter = ZonedDateTime::new(datetime!(2025-01-01 12:00 +1), offset!(+1));
        assert_eq!(false, winter.is_dst());
        assert_eq!(0, winter.dst_minutes());
    }

    #[test]
    fn capability_names_are_kebab_case() {
        let names: Vec<String> = Capability::iter().map(|value| value.to_string()).collect();
        assert_eq!("firmware-version", names[0]);
        assert_eq!("date-time-sync", names[2]);
    }

    #[rstest]
    #[case(" aa:bb:cc:dd:ee:ff ", "AA:BB:CC:DD:EE:FF")]
    #[case("AA:BB:CC:DD:EE:FF", "AA:BB:CC:DD:EE:FF")]
    fn addresses_normalise_to_uppercase(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(expected, normalise_address(raw));
    }

    #[test]
    fn error_state_renders_message() {
        let state = DeviceConnectionState::Error {
            message: "boom".to_string(),
            is_recoverable: true,
        };
        assert_snapshot!(state.to_string(), @"error: boom");
    }

    #[test]
    fn vendor_pairing_flag_maps_to_capability() {
        let capabilities = ConnectionCapabilities {
            requires_vendor_pairing: true,
            ..ConnectionCapabilities::default()
        };
        assert_eq!(true, capabilities.supports(Capability::VendorPairing));
        assert_eq!(false, capabilities.supports(Capability::GeoTagging));
    }
}
