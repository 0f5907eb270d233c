use std::fmt::Debug;

use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};
use tracing::debug;

use crate::model::ZonedDateTime;

/// Resolves the wall-clock offset and standard offset of a time zone.
pub trait ZoneRules: Send + Sync + Debug {
    /// Converts an instant into the zone, tagging it with the standard offset.
    fn zoned(&self, instant: OffsetDateTime) -> ZonedDateTime;
}

/// A zone with explicit current and standard offsets.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FixedZone {
    offset: UtcOffset,
    standard_offset: UtcOffset,
}

impl FixedZone {
    #[must_use]
    pub fn new(offset: UtcOffset, standard_offset: UtcOffset) -> Self {
        Self {
            offset,
            standard_offset,
        }
    }

    #[must_use]
    pub fn utc() -> Self {
        Self::new(UtcOffset::UTC, UtcOffset::UTC)
    }
}

impl ZoneRules for FixedZone {
    fn zoned(&self, instant: OffsetDateTime) -> ZonedDateTime {
        ZonedDateTime::new(instant.to_offset(self.offset), self.standard_offset)
    }
}

/// The host's local zone.
///
/// Local offsets cannot always be queried once the process is multi-threaded,
/// so a snapshot is taken by [`SystemZone::detect`] and used as the fallback
/// whenever a live lookup is refused.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SystemZone {
    snapshot: FixedZone,
}

impl SystemZone {
    /// Captures the local zone. Call this before starting a multi-threaded runtime.
    #[must_use]
    pub fn detect() -> Self {
        let now = OffsetDateTime::now_utc();
        let offset = UtcOffset::local_offset_at(now).unwrap_or(UtcOffset::UTC);
        let standard_offset = standard_offset_for_year(now.year()).unwrap_or(offset);
        Self {
            snapshot: FixedZone::new(offset, standard_offset),
        }
    }
}

impl ZoneRules for SystemZone {
    fn zoned(&self, instant: OffsetDateTime) -> ZonedDateTime {
        let live = UtcOffset::local_offset_at(instant).ok().and_then(|offset| {
            standard_offset_for_year(instant.year())
                .map(|standard| ZonedDateTime::new(instant.to_offset(offset), standard))
        });
        live.unwrap_or_else(|| {
            debug!("local offset lookup refused; using startup snapshot");
            self.snapshot.zoned(instant)
        })
    }
}

/// Daylight saving only ever adds to the standard offset, so the smaller of
/// the mid-winter and mid-summer offsets is the standard one in both hemispheres.
fn standard_offset_for_year(year: i32) -> Option<UtcOffset> {
    let january = offset_on(year, Month::January)?;
    let july = offset_on(year, Month::July)?;
    Some(if january.whole_seconds() <= july.whole_seconds() {
        january
    } else {
        july
    })
}

fn offset_on(year: i32, month: Month) -> Option<UtcOffset> {
    let date = Date::from_calendar_date(year, month, 1).ok()?;
    let instant = PrimitiveDateTime::new(date, Time::MIDNIGHT).assume_utc();
    UtcOffset::local_offset_at(instant).ok()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use time::macros::{datetime, offset};

    use super::*;

    #[test]
    fn fixed_zone_converts_instant_and_keeps_standard_offset() {
        let zone = FixedZone::new(offset!(+2), offset!(+1));
        let zoned = zone.zoned(datetime!(2025-06-01 10:00 UTC));

        assert_eq!(datetime!(2025-06-01 12:00 +2), zoned.date_time());
        assert_eq!(offset!(+1), zoned.standard_offset());
        assert_eq!(true, zoned.is_dst());
    }

    #[test]
    fn utc_zone_never_reports_dst() {
        let zoned = FixedZone::utc().zoned(datetime!(2025-06-01 10:00 UTC));
        assert_eq!(false, zoned.is_dst());
    }
}
