use serde::Serialize;
use time::{Date, Month, PrimitiveDateTime, Time, UtcOffset};

use super::{ProtocolCodec, decode_coordinate, encode_coordinate, expect_len};
use crate::error::CodecError;
use crate::model::{GpsLocation, ZonedDateTime};

const DATE_TIME_PACKET: &str = "ricoh date/time";
const LOCATION_PACKET: &str = "ricoh location";
const GEO_TAG_PACKET: &str = "ricoh geo-tag";
const BATTERY_PACKET: &str = "ricoh battery";
const MODE_PACKET: &str = "ricoh mode";

pub(crate) const DATE_TIME_LEN: usize = 7;
pub(crate) const LOCATION_LEN: usize = 24;
const DATUM_WGS84: u8 = 0x00;

/// Capture mode reported by the camera.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, derive_more::Display)]
#[serde(rename_all = "snake_case")]
pub enum ShootingMode {
    #[display("still")]
    Still,
    #[display("movie")]
    Movie,
    #[display("unknown({_0:#04x})")]
    Unknown(u8),
}

impl From<u8> for ShootingMode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Still,
            0x01 => Self::Movie,
            other => Self::Unknown(other),
        }
    }
}

/// Drive mode reported by the camera.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, derive_more::Display)]
#[serde(rename_all = "snake_case")]
pub enum DriveMode {
    #[display("single")]
    Single,
    #[display("continuous")]
    Continuous,
    #[display("self-timer 10s")]
    SelfTimer10s,
    #[display("self-timer 2s")]
    SelfTimer2s,
    #[display("interval")]
    Interval,
    #[display("unknown({_0:#04x})")]
    Unknown(u8),
}

impl From<u8> for DriveMode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Single,
            0x01 => Self::Continuous,
            0x02 => Self::SelfTimer10s,
            0x03 => Self::SelfTimer2s,
            0x04 => Self::Interval,
            other => Self::Unknown(other),
        }
    }
}

/// Little-endian codec for Ricoh GR-family characteristics.
#[derive(Debug, Clone, Copy, Default)]
pub struct RicohCodec;

impl RicohCodec {
    /// Parses a clock packet into the camera's local wall-clock time.
    ///
    /// # Errors
    ///
    /// Returns an error when the packet is not 7 bytes or holds an invalid date.
    pub fn parse_date_time(bytes: &[u8]) -> Result<PrimitiveDateTime, CodecError> {
        expect_len(DATE_TIME_PACKET, bytes, DATE_TIME_LEN)?;
        read_date_time(DATE_TIME_PACKET, bytes)
    }

    /// Decodes a battery level, clamping out-of-range raw bytes to 100.
    ///
    /// # Errors
    ///
    /// Returns an error when the packet is empty.
    pub fn decode_battery_level(bytes: &[u8]) -> Result<u8, CodecError> {
        let Some(raw) = bytes.first() else {
            return Err(CodecError::InvalidData {
                packet: BATTERY_PACKET,
                expected: 1,
                actual: 0,
            });
        };
        Ok((*raw).min(100))
    }

    /// Decodes the capture mode byte.
    ///
    /// # Errors
    ///
    /// Returns an error when the packet is not exactly one byte.
    pub fn decode_shooting_mode(bytes: &[u8]) -> Result<ShootingMode, CodecError> {
        expect_len(MODE_PACKET, bytes, 1)?;
        Ok(ShootingMode::from(bytes[0]))
    }

    /// Decodes the drive mode byte.
    ///
    /// # Errors
    ///
    /// Returns an error when the packet is not exactly one byte.
    pub fn decode_drive_mode(bytes: &[u8]) -> Result<DriveMode, CodecError> {
        expect_len(MODE_PACKET, bytes, 1)?;
        Ok(DriveMode::from(bytes[0]))
    }
}

impl ProtocolCodec for RicohCodec {
    fn encode_date_time(&self, date_time: &ZonedDateTime) -> Vec<u8> {
        let local = date_time.date_time();
        let mut packet = Vec::with_capacity(DATE_TIME_LEN);
        write_date_time(
            &mut packet,
            PrimitiveDateTime::new(local.date(), local.time()),
        );
        packet
    }

    fn decode_date_time(&self, bytes: &[u8]) -> Result<String, CodecError> {
        let parsed = Self::parse_date_time(bytes)?;
        Ok(format!(
            "{} {:02}:{:02}:{:02}",
            parsed.date(),
            parsed.hour(),
            parsed.minute(),
            parsed.second()
        ))
    }

    fn encode_location(&self, location: &GpsLocation, _zone: &ZonedDateTime) -> Vec<u8> {
        let utc = location.timestamp.to_offset(UtcOffset::UTC);
        let mut packet = Vec::with_capacity(LOCATION_LEN);
        packet.extend_from_slice(&encode_coordinate(location.latitude).to_le_bytes());
        packet.extend_from_slice(&encode_coordinate(location.longitude).to_le_bytes());
        packet.extend_from_slice(&location.altitude.to_le_bytes());
        write_date_time(&mut packet, PrimitiveDateTime::new(utc.date(), utc.time()));
        packet.push(DATUM_WGS84);
        packet
    }

    fn decode_location(&self, bytes: &[u8]) -> Result<GpsLocation, CodecError> {
        expect_len(LOCATION_PACKET, bytes, LOCATION_LEN)?;
        let latitude = decode_coordinate(i32::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]));
        let longitude = decode_coordinate(i32::from_le_bytes([
            bytes[4], bytes[5], bytes[6], bytes[7],
        ]));
        let mut altitude = [0u8; 8];
        altitude.copy_from_slice(&bytes[8..16]);
        let timestamp = read_date_time(LOCATION_PACKET, &bytes[16..23])?.assume_utc();

        Ok(GpsLocation::new(
            latitude,
            longitude,
            f64::from_le_bytes(altitude),
            timestamp,
        ))
    }

    fn encode_geo_tagging_enabled(&self, enabled: bool) -> Vec<u8> {
        vec![u8::from(enabled)]
    }

    fn decode_geo_tagging_enabled(&self, bytes: &[u8]) -> Result<bool, CodecError> {
        expect_len(GEO_TAG_PACKET, bytes, 1)?;
        Ok(bytes[0] != 0x00)
    }
}

fn write_date_time(packet: &mut Vec<u8>, date_time: PrimitiveDateTime) {
    let year = u16::try_from(date_time.year()).unwrap_or_default();
    packet.extend_from_slice(&year.to_le_bytes());
    packet.push(u8::from(date_time.month()));
    packet.push(date_time.day());
    packet.push(date_time.hour());
    packet.push(date_time.minute());
    packet.push(date_time.second());
}

fn read_date_time(packet: &'static str, bytes: &[u8]) -> Result<PrimitiveDateTime, CodecError> {
    let year = i32::from(u16::from_le_bytes([bytes[0], bytes[1]]));
    let invalid = |field: &'static str, value: u8| CodecError::InvalidField {
        packet,
        field,
        value: i64::from(value),
    };
    let month = Month::try_from(bytes[2]).map_err(|_| invalid("month", bytes[2]))?;
    let date = Date::from_calendar_date(year, month, bytes[3]).map_err(|_| invalid("day", bytes[3]))?;
    let time =
        Time::from_hms(bytes[4], bytes[5], bytes[6]).map_err(|_| invalid("time", bytes[4]))?;
    Ok(PrimitiveDateTime::new(date, time))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use time::macros::{datetime, offset};

    use super::*;

    #[test]
    fn date_time_packet_uses_little_endian_year() {
        let value = ZonedDateTime::fixed(datetime!(2025-03-15 14:30:45 +9));
        let packet = RicohCodec.encode_date_time(&value);
        assert_eq!(vec![0xE9, 0x07, 0x03, 0x0F, 0x0E, 0x1E, 0x2D], packet);
    }

    #[rstest]
    #[case(datetime!(2000-01-01 00:00:00 UTC))]
    #[case(datetime!(2025-12-31 23:59:59 -8))]
    #[case(datetime!(2038-02-28 12:34:56 +5:30))]
    fn date_time_round_trip_keeps_wall_clock(#[case] date_time: time::OffsetDateTime) {
        let packet = RicohCodec.encode_date_time(&ZonedDateTime::fixed(date_time));
        let decoded = RicohCodec::parse_date_time(&packet).expect("encoded packet should decode");
        assert_eq!(
            PrimitiveDateTime::new(date_time.date(), date_time.time()),
            decoded
        );
    }

    #[test]
    fn date_time_decode_rejects_wrong_length() {
        let result = RicohCodec.decode_date_time(&[0xE9, 0x07, 0x03]);
        assert_matches!(
            result,
            Err(CodecError::InvalidData {
                expected: 7,
                actual: 3,
                ..
            })
        );
    }

    #[test]
    fn location_round_trip_recovers_all_fields() {
        let location = GpsLocation::new(
            -33.8567844,
            151.2152967,
            58.25,
            datetime!(2025-06-01 18:00:05 +10),
        );
        let zone = ZonedDateTime::new(datetime!(2025-06-01 18:00:05 +10), offset!(+10));
        let packet = RicohCodec.encode_location(&location, &zone);
        assert_eq!(24, packet.len());

        let decoded = RicohCodec
            .decode_location(&packet)
            .expect("encoded packet should decode");
        assert!((decoded.latitude - location.latitude).abs() < 1.5e-7);
        assert!((decoded.longitude - location.longitude).abs() < 1.5e-7);
        assert_eq!(58.25, decoded.altitude);
        assert_eq!(datetime!(2025-06-01 08:00:05 UTC), decoded.timestamp);
    }

    #[rstest]
    #[case(&[0x00], Ok(0))]
    #[case(&[0x64], Ok(100))]
    #[case(&[0xC8], Ok(100))]
    #[case(&[0xFF], Ok(100))]
    fn battery_level_is_clamped_not_sign_extended(
        #[case] payload: &[u8],
        #[case] expected: Result<u8, CodecError>,
    ) {
        assert_eq!(expected, RicohCodec::decode_battery_level(payload));
    }

    #[rstest]
    #[case(true, vec![0x01])]
    #[case(false, vec![0x00])]
    fn geo_tagging_round_trips(#[case] enabled: bool, #[case] expected: Vec<u8>) {
        let packet = RicohCodec.encode_geo_tagging_enabled(enabled);
        assert_eq!(expected, packet);
        assert_eq!(Ok(enabled), RicohCodec.decode_geo_tagging_enabled(&packet));
    }

    #[test]
    fn unknown_modes_keep_raw_byte() {
        assert_eq!(
            Ok(DriveMode::Unknown(0x09)),
            RicohCodec::decode_drive_mode(&[0x09])
        );
        assert_eq!(
            Ok(ShootingMode::Movie),
            RicohCodec::decode_shooting_mode(&[0x01])
        );
        assert_eq!("unknown(0x09)", DriveMode::Unknown(0x09).to_string());
    }
}
