use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};
use tracing::instrument;

use super::{ProtocolCodec, decode_coordinate, encode_coordinate, expect_len};
use crate::error::CodecError;
use crate::model::{GpsLocation, ZonedDateTime};

const DATE_TIME_PACKET: &str = "sony CC13 date/time";
const LOCATION_PACKET: &str = "sony DD11 location";

pub(crate) const DATE_TIME_LEN: usize = 13;
pub(crate) const LOCATION_LEN_WITH_TIMEZONE: usize = 95;
pub(crate) const LOCATION_LEN_WITHOUT_TIMEZONE: usize = 91;

const DATE_TIME_HEADER: [u8; 3] = [0x0C, 0x00, 0x00];
const LOCATION_MAGIC: [u8; 3] = [0x08, 0x02, 0xFC];
const LOCATION_FIXED: [u8; 3] = [0x10, 0x10, 0x10];
const TIMEZONE_PRESENT: u8 = 0x03;
const TIMEZONE_ABSENT: u8 = 0x00;

const LATITUDE_OFFSET: usize = 11;
const LONGITUDE_OFFSET: usize = 15;
const DATE_OFFSET: usize = 19;
const TZ_OFFSET: usize = 91;
const DST_OFFSET: usize = 93;

/// Decoded CC13 clock packet.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SonyDateTime {
    pub local: PrimitiveDateTime,
    pub dst: bool,
    pub offset_hours: i8,
    pub offset_minutes: u8,
}

/// Big-endian codec for Sony's CC13 clock and DD11 location packets.
#[derive(Debug, Clone, Copy, Default)]
pub struct SonyCodec;

impl SonyCodec {
    /// Builds a DD11 packet, with or without the trailing timezone fields.
    ///
    /// Coordinates and the date are written in UTC; the trailer carries the
    /// host zone's standard offset and its daylight-saving shift.
    #[instrument(skip_all, level = "trace", fields(include_timezone))]
    pub fn encode_location_packet(
        location: &GpsLocation,
        zone: &ZonedDateTime,
        include_timezone: bool,
    ) -> Vec<u8> {
        let total_len = if include_timezone {
            LOCATION_LEN_WITH_TIMEZONE
        } else {
            LOCATION_LEN_WITHOUT_TIMEZONE
        };
        let payload_len = u16::try_from(total_len - 2).unwrap_or(u16::MAX);

        let mut packet = vec![0u8; total_len];
        packet[0..2].copy_from_slice(&payload_len.to_be_bytes());
        packet[2..5].copy_from_slice(&LOCATION_MAGIC);
        packet[5] = if include_timezone {
            TIMEZONE_PRESENT
        } else {
            TIMEZONE_ABSENT
        };
        packet[8..11].copy_from_slice(&LOCATION_FIXED);
        packet[LATITUDE_OFFSET..LATITUDE_OFFSET + 4]
            .copy_from_slice(&encode_coordinate(location.latitude).to_be_bytes());
        packet[LONGITUDE_OFFSET..LONGITUDE_OFFSET + 4]
            .copy_from_slice(&encode_coordinate(location.longitude).to_be_bytes());

        let utc = location.timestamp.to_offset(UtcOffset::UTC);
        write_date_time(&mut packet[DATE_OFFSET..DATE_OFFSET + 7], utc);

        if include_timezone {
            let standard_minutes = zone.standard_offset().whole_minutes();
            let dst_minutes = i16::try_from(zone.dst_minutes()).unwrap_or_default();
            packet[TZ_OFFSET..TZ_OFFSET + 2].copy_from_slice(&standard_minutes.to_be_bytes());
            packet[DST_OFFSET..DST_OFFSET + 2].copy_from_slice(&dst_minutes.to_be_bytes());
        }

        packet
    }

    /// Parses a CC13 packet into its fields.
    ///
    /// # Errors
    ///
    /// Returns an error when the packet is not 13 bytes or holds an invalid date.
    pub fn parse_date_time(bytes: &[u8]) -> Result<SonyDateTime, CodecError> {
        expect_len(DATE_TIME_PACKET, bytes, DATE_TIME_LEN)?;
        let local = read_date_time(DATE_TIME_PACKET, &bytes[3..10])?;
        Ok(SonyDateTime {
            local,
            dst: bytes[10] == 0x01,
            offset_hours: i8::from_be_bytes([bytes[11]]),
            offset_minutes: bytes[12],
        })
    }
}

impl ProtocolCodec for SonyCodec {
    fn encode_date_time(&self, date_time: &ZonedDateTime) -> Vec<u8> {
        let local = date_time.date_time();
        let standard_minutes = date_time.standard_offset().whole_minutes();
        let offset_hours = i8::try_from(standard_minutes / 60).unwrap_or_default();
        let offset_minutes =
            u8::try_from((standard_minutes % 60).unsigned_abs()).unwrap_or_default();

        let mut packet = Vec::with_capacity(DATE_TIME_LEN);
        packet.extend_from_slice(&DATE_TIME_HEADER);
        let mut clock = [0u8; 7];
        write_date_time(&mut clock, local);
        packet.extend_from_slice(&clock);
        packet.push(u8::from(date_time.is_dst()));
        packet.extend_from_slice(&offset_hours.to_be_bytes());
        packet.push(offset_minutes);
        packet
    }

    fn decode_date_time(&self, bytes: &[u8]) -> Result<String, CodecError> {
        let parsed = Self::parse_date_time(bytes)?;
        let dst = if parsed.dst { " DST" } else { "" };
        Ok(format!(
            "{} {:02}:{:02}:{:02} UTC{:+03}:{:02}{dst}",
            parsed.local.date(),
            parsed.local.hour(),
            parsed.local.minute(),
            parsed.local.second(),
            parsed.offset_hours,
            parsed.offset_minutes,
        ))
    }

    fn encode_location(&self, location: &GpsLocation, zone: &ZonedDateTime) -> Vec<u8> {
        Self::encode_location_packet(location, zone, true)
    }

    fn decode_location(&self, bytes: &[u8]) -> Result<GpsLocation, CodecError> {
        if bytes.len() != LOCATION_LEN_WITH_TIMEZONE && bytes.len() != LOCATION_LEN_WITHOUT_TIMEZONE
        {
            return Err(CodecError::InvalidData {
                packet: LOCATION_PACKET,
                expected: LOCATION_LEN_WITH_TIMEZONE,
                actual: bytes.len(),
            });
        }
        let declared = usize::from(u16::from_be_bytes([bytes[0], bytes[1]]));
        if declared + 2 != bytes.len() {
            return Err(CodecError::InvalidField {
                packet: LOCATION_PACKET,
                field: "payload_len",
                value: i64::try_from(declared).unwrap_or(i64::MAX),
            });
        }

        let latitude = decode_coordinate(read_i32(bytes, LATITUDE_OFFSET));
        let longitude = decode_coordinate(read_i32(bytes, LONGITUDE_OFFSET));
        let timestamp =
            read_date_time(LOCATION_PACKET, &bytes[DATE_OFFSET..DATE_OFFSET + 7])?.assume_utc();

        Ok(GpsLocation::new(latitude, longitude, 0.0, timestamp))
    }

    fn encode_geo_tagging_enabled(&self, _enabled: bool) -> Vec<u8> {
        Vec::new()
    }

    fn decode_geo_tagging_enabled(&self, _bytes: &[u8]) -> Result<bool, CodecError> {
        Ok(false)
    }
}

fn write_date_time(target: &mut [u8], date_time: OffsetDateTime) {
    let year = u16::try_from(date_time.year()).unwrap_or_default();
    target[0..2].copy_from_slice(&year.to_be_bytes());
    target[2] = u8::from(date_time.month());
    target[3] = date_time.day();
    target[4] = date_time.hour();
    target[5] = date_time.minute();
    target[6] = date_time.second();
}

fn read_date_time(packet: &'static str, bytes: &[u8]) -> Result<PrimitiveDateTime, CodecError> {
    let year = i32::from(u16::from_be_bytes([bytes[0], bytes[1]]));
    let month = Month::try_from(bytes[2]).map_err(|_| CodecError::InvalidField {
        packet,
        field: "month",
        value: i64::from(bytes[2]),
    })?;
    let date = Date::from_calendar_date(year, month, bytes[3]).map_err(|_| {
        CodecError::InvalidField {
            packet,
            field: "day",
            value: i64::from(bytes[3]),
        }
    })?;
    let time = Time::from_hms(bytes[4], bytes[5], bytes[6]).map_err(|_| {
        CodecError::InvalidField {
            packet,
            field: "time",
            value: i64::from(bytes[4]),
        }
    })?;
    Ok(PrimitiveDateTime::new(date, time))
}

fn read_i32(bytes: &[u8], offset: usize) -> i32 {
    i32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}
