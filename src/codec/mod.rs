mod ricoh;
mod sony;

use std::fmt::Debug;

use crate::error::CodecError;
use crate::model::{GpsLocation, ZonedDateTime};

pub use self::ricoh::{DriveMode, RicohCodec, ShootingMode};
pub use self::sony::{SonyCodec, SonyDateTime};

/// Degrees are sent as fixed-point integers with seven decimal places.
pub(crate) const COORDINATE_SCALE: f64 = 10_000_000.0;

/// Pure per-vendor packet encoders and decoders.
///
/// Implementations perform no I/O. Decoders reject packets whose length does
/// not match the vendor's fixed size.
pub trait ProtocolCodec: Send + Sync + Debug {
    /// Encodes a local date-time for the vendor's clock characteristic.
    fn encode_date_time(&self, date_time: &ZonedDateTime) -> Vec<u8>;

    /// Decodes a clock packet into a human-readable string.
    ///
    /// # Errors
    ///
    /// Returns an error when the packet has the wrong length.
    fn decode_date_time(&self, bytes: &[u8]) -> Result<String, CodecError>;

    /// Encodes a GPS fix. `zone` is the fix timestamp in the host zone.
    fn encode_location(&self, location: &GpsLocation, zone: &ZonedDateTime) -> Vec<u8>;

    /// Decodes a location packet.
    ///
    /// # Errors
    ///
    /// Returns an error when the packet has the wrong length or holds an
    /// impossible date.
    fn decode_location(&self, bytes: &[u8]) -> Result<GpsLocation, CodecError>;

    /// Encodes the geo-tagging toggle. Vendors without the feature return an
    /// empty packet.
    fn encode_geo_tagging_enabled(&self, enabled: bool) -> Vec<u8>;

    /// Decodes the geo-tagging toggle. Vendors without the feature always
    /// report `false`.
    ///
    /// # Errors
    ///
    /// Returns an error when the packet has the wrong length.
    fn decode_geo_tagging_enabled(&self, bytes: &[u8]) -> Result<bool, CodecError>;
}

pub(crate) fn encode_coordinate(degrees: f64) -> i32 {
    // `as` truncates toward zero and saturates, which is the wire contract.
    (degrees * COORDINATE_SCALE) as i32
}

pub(crate) fn decode_coordinate(raw: i32) -> f64 {
    f64::from(raw) / COORDINATE_SCALE
}

pub(crate) fn expect_len(
    packet: &'static str,
    bytes: &[u8],
    expected: usize,
) -> Result<(), CodecError> {
    if bytes.len() == expected {
        Ok(())
    } else {
        Err(CodecError::InvalidData {
            packet,
            expected,
            actual: bytes.len(),
        })
    }
}
