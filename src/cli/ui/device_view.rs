use std::fmt::{self, Display, Formatter};

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::model::{DeviceConnectionState, PairedDevice};
use crate::sync::{FirmwareNotice, SyncSummary};

use super::painter::Painter;
use super::table::{Table, or_dash};

fn timestamp(value: Option<OffsetDateTime>) -> String {
    value
        .and_then(|value| value.format(&Rfc3339).ok())
        .unwrap_or_else(|| "never".to_string())
}

/// Renders paired devices as a table.
pub(crate) struct PairedDevicesView<'a> {
    devices: &'a [PairedDevice],
    painter: &'a Painter,
}

impl<'a> PairedDevicesView<'a> {
    pub(crate) fn new(devices: &'a [PairedDevice], painter: &'a Painter) -> Self {
        Self { devices, painter }
    }
}

impl Display for PairedDevicesView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.devices.is_empty() {
            return write!(f, "{}", self.painter.muted("No paired cameras."));
        }

        let mut table = Table::new(["address", "name", "vendor", "enabled", "last sync", "firmware"]);
        for device in self.devices {
            let firmware = match (&device.firmware_version, &device.latest_firmware_version) {
                (Some(installed), Some(latest)) if installed != latest => {
                    format!("{installed} ({} {latest})", self.painter.warning("→"))
                }
                (installed, _) => or_dash(installed.as_deref()),
            };
            table.push_row([
                self.painter.value(&device.address),
                device.name.clone(),
                device.vendor.to_string(),
                self.painter.flag(device.enabled),
                timestamp(device.last_synced_at),
                firmware,
            ]);
        }
        write!(f, "{table}")
    }
}

/// Renders firmware update notices.
pub(crate) struct FirmwareNoticesView<'a> {
    notices: &'a [FirmwareNotice],
    painter: &'a Painter,
}

impl<'a> FirmwareNoticesView<'a> {
    pub(crate) fn new(notices: &'a [FirmwareNotice], painter: &'a Painter) -> Self {
        Self { notices, painter }
    }
}

impl Display for FirmwareNoticesView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.notices.is_empty() {
            return write!(f, "{}", self.painter.muted("All paired cameras are up to date."));
        }

        let mut table = Table::new(["address", "name", "installed", "available"]);
        for notice in self.notices {
            table.push_row([
                self.painter.value(&notice.address),
                notice.name.clone(),
                notice.installed.clone(),
                self.painter.success(&notice.available),
            ]);
        }
        write!(f, "{table}")
    }
}

/// One line per device state transition during `run`.
pub(crate) struct StateChangeView<'a> {
    address: &'a str,
    state: &'a DeviceConnectionState,
    painter: &'a Painter,
}

impl<'a> StateChangeView<'a> {
    pub(crate) fn new(
        address: &'a str,
        state: &'a DeviceConnectionState,
        painter: &'a Painter,
    ) -> Self {
        Self {
            address,
            state,
            painter,
        }
    }
}

impl Display for StateChangeView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            self.painter.value(self.address),
            self.painter.state(self.state)
        )?;
        if let DeviceConnectionState::Syncing {
            last_sync: Some(sync),
        } = self.state
        {
            write!(
                f,
                " {}",
                self.painter.muted(format!(
                    "({:.5}, {:.5})",
                    sync.location.latitude, sync.location.longitude
                ))
            )?;
        }
        Ok(())
    }
}

pub(crate) struct SummaryView<'a> {
    summary: &'a SyncSummary,
    painter: &'a Painter,
}

impl<'a> SummaryView<'a> {
    pub(crate) fn new(summary: &'a SyncSummary, painter: &'a Painter) -> Self {
        Self { summary, painter }
    }
}

impl Display for SummaryView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let summary = self.summary;
        let table = Table::key_value(
            self.painter,
            vec![
                ("tracked", summary.tracked.to_string()),
                ("connected", summary.connected.to_string()),
                ("syncing", summary.syncing.to_string()),
                ("unreachable", summary.unreachable.to_string()),
                ("errors", summary.errors.to_string()),
            ],
        );
        write!(f, "{table}")
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;
    use pretty_assertions::assert_eq;
    use time::macros::datetime;

    use super::*;
    use crate::model::{GpsLocation, SyncInfo};
    use crate::vendor::VendorId;

    #[test]
    fn paired_devices_flag_pending_firmware() {
        let painter = Painter::new(false);
        let mut device = PairedDevice::new("AA:00:00:00:00:01", "GR III", VendorId::Ricoh);
        device.last_synced_at = Some(datetime!(2025-03-15 12:00 UTC));
        device.firmware_version = Some("1.81".to_string());
        device.latest_firmware_version = Some("1.90".to_string());

        assert_snapshot!(PairedDevicesView::new(&[device], &painter).to_string(), @r"
        ╭───────────────────┬────────┬────────┬─────────┬──────────────────────┬───────────────╮
        │ address           │ name   │ vendor │ enabled │ last sync            │ firmware      │
        ├───────────────────┼────────┼────────┼─────────┼──────────────────────┼───────────────┤
        │ AA:00:00:00:00:01 │ GR III │ ricoh  │ yes     │ 2025-03-15T12:00:00Z │ 1.81 (→ 1.90) │
        ╰───────────────────┴────────┴────────┴─────────┴──────────────────────┴───────────────╯
        ");
    }

    #[test]
    fn syncing_line_includes_the_last_fix() {
        let painter = Painter::new(false);
        let state = DeviceConnectionState::Syncing {
            last_sync: Some(SyncInfo {
                synced_at: datetime!(2025-03-15 12:00 UTC),
                location: GpsLocation::new(48.858_37, 2.294_481, 35.0, datetime!(2025-03-15 12:00 UTC)),
            }),
        };

        assert_eq!(
            "AA:00:00:00:00:01 syncing (48.85837, 2.29448)",
            StateChangeView::new("AA:00:00:00:00:01", &state, &painter).to_string()
        );
    }

    #[test]
    fn no_notices_reads_as_up_to_date() {
        let painter = Painter::new(false);
        assert_eq!(
            "All paired cameras are up to date.",
            FirmwareNoticesView::new(&[], &painter).to_string()
        );
    }
}
