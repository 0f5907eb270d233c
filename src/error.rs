use std::time::Duration;

use derive_more::From;
use thiserror::Error;
use uuid::Uuid;

use crate::model::Capability;
use crate::vendor::VendorId;

/// Errors returned by the pure protocol codecs.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum CodecError {
    #[error("{packet} packet must be {expected} bytes, got {actual}")]
    InvalidData {
        packet: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{packet} packet field `{field}` holds out-of-range value {value}")]
    InvalidField {
        packet: &'static str,
        field: &'static str,
        value: i64,
    },
}

/// Errors returned by camera sessions, transports, and discovery.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("{vendor} cameras do not support {capability}")]
    UnsupportedCapability {
        vendor: VendorId,
        capability: Capability,
    },
    #[error("GATT service {service} was not found; discovered services: [{discovered}]")]
    ServiceNotFound { service: Uuid, discovered: String },
    #[error(
        "characteristic {characteristic} was not found in service {service}; discovered: [{discovered}]"
    )]
    CharacteristicNotFound {
        service: Uuid,
        characteristic: Uuid,
        discovered: String,
    },
    #[error("{operation} timed out after {}", humantime::format_duration(*after))]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("{operation} failed after {attempts} attempts")]
    Io {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: Box<CameraError>,
    },
    #[error("no registered vendor recognises the camera at {address}")]
    UnknownVendor { address: String },
    #[error(
        "bonded camera {address} did not advertise within {attempts} scan attempts; is it powered on?"
    )]
    BondedDeviceSilent { address: String, attempts: u32 },
    #[error("camera {address} was never seen advertising")]
    DeviceNotFound { address: String },
    #[error("the camera connection was lost")]
    Disconnected,
    #[error("{operation} was cancelled")]
    Cancelled { operation: &'static str },
    #[error("no BLE adapters were found")]
    NoAdapters,
    #[error("BLE operation failed")]
    Ble(#[from] btleplug::Error),
    #[error("transport failure: {message}")]
    Transport { message: String },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl CameraError {
    /// Returns whether the failure was a timeout, directly or after retries.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. }
            | Self::BondedDeviceSilent { .. }
            | Self::DeviceNotFound { .. } => true,
            Self::Io { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Returns whether the operation was abandoned because its owner stopped.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns whether retrying cannot succeed without new advertisement data.
    #[must_use]
    pub fn is_unknown_vendor(&self) -> bool {
        matches!(self, Self::UnknownVendor { .. })
    }
}

/// Errors returned by the paired-device store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed while reading or writing `{path}`")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("paired-device file `{path}` is not valid JSON")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no paired device with address {address}")]
    UnknownDevice { address: String },
}

/// Errors returned while loading runtime settings or firmware catalogs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read `{path}`")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{path}` is not valid JSON")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not determine a configuration directory for this platform")]
    NoConfigDirectory,
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub(crate) enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

/// Top-level error wrapping module-specific error types.
#[derive(Debug, Error, From)]
pub enum SyncError {
    #[error(transparent)]
    #[from(CameraError, Box<CameraError>)]
    Camera(Box<CameraError>),
    #[error(transparent)]
    #[from(CodecError, Box<CodecError>)]
    Codec(Box<CodecError>),
    #[error(transparent)]
    #[from(StoreError, Box<StoreError>)]
    Store(Box<StoreError>),
    #[error(transparent)]
    #[from(ConfigError, Box<ConfigError>)]
    Config(Box<ConfigError>),
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn io_error_classifies_wrapped_timeout() {
        let error = CameraError::Io {
            operation: "location write",
            attempts: 3,
            source: Box::new(CameraError::Timeout {
                operation: "write",
                after: Duration::from_secs(30),
            }),
        };
        assert_eq!(true, error.is_timeout());
        assert_eq!(false, error.is_unknown_vendor());
    }

    #[test]
    fn unsupported_capability_names_vendor_and_capability() {
        let error = CameraError::UnsupportedCapability {
            vendor: VendorId::Sony,
            capability: Capability::GeoTagging,
        };
        assert_eq!("sony cameras do not support geo-tagging", error.to_string());
    }
}
