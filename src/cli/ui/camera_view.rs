use std::fmt::{self, Display, Formatter};

use strum::IntoEnumIterator;

use crate::cli::camera::InspectReport;
use crate::model::{Camera, Capability};

use super::painter::Painter;
use super::table::{Table, or_dash};

/// Renders scan results, one camera per row.
pub(crate) struct CameraListView<'a> {
    cameras: &'a [Camera],
    painter: &'a Painter,
}

impl<'a> CameraListView<'a> {
    pub(crate) fn new(cameras: &'a [Camera], painter: &'a Painter) -> Self {
        Self { cameras, painter }
    }
}

impl Display for CameraListView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.cameras.is_empty() {
            return write!(f, "{}", self.painter.muted("No cameras found."));
        }

        let mut table = Table::new(["address", "name", "vendor", "protocol"]);
        for camera in self.cameras {
            table.push_row([
                self.painter.value(camera.address()),
                or_dash(camera.name()),
                camera.vendor().to_string(),
                or_dash(camera.protocol_version()),
            ]);
        }
        write!(f, "{table}")
    }
}

/// Renders an inspect report: identity, live readings, capabilities, GATT tree.
pub(crate) struct InspectView<'a> {
    report: &'a InspectReport,
    painter: &'a Painter,
}

impl<'a> InspectView<'a> {
    pub(crate) fn new(report: &'a InspectReport, painter: &'a Painter) -> Self {
        Self { report, painter }
    }

    fn overview(&self) -> Table {
        let report = self.report;
        let painter = self.painter;
        Table::key_value(
            painter,
            vec![
                ("address", painter.value(report.camera.address())),
                ("name", or_dash(report.camera.name())),
                ("vendor", report.camera.vendor().to_string()),
                ("protocol", or_dash(report.camera.protocol_version())),
                ("firmware", or_dash(report.firmware_version.as_deref())),
                ("hardware", or_dash(report.hardware_revision.as_deref())),
                (
                    "geo-tagging",
                    report
                        .geo_tagging
                        .map_or_else(|| "-".to_string(), |enabled| painter.flag(enabled)),
                ),
                (
                    "battery",
                    or_dash(report.battery_level.map(|level| format!("{level}%"))),
                ),
            ],
        )
    }

    fn capabilities(&self) -> Table {
        let mut table = Table::new(["capability", "supported"]);
        for capability in Capability::iter() {
            table.push_row([
                capability.to_string(),
                self.painter
                    .flag(self.report.capabilities.supports(capability)),
            ]);
        }
        table
    }

    fn services(&self) -> Table {
        let mut table = Table::new(["service", "characteristic", "properties"]);
        for service in &self.report.services {
            for characteristic in service.characteristics() {
                table.push_row([
                    service.uuid().to_string(),
                    characteristic.uuid().to_string(),
                    characteristic.properties().join(","),
                ]);
            }
        }
        table
    }
}

impl Display for InspectView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.painter.heading("Camera"))?;
        writeln!(f, "{}", self.overview())?;
        writeln!(f)?;
        writeln!(f, "{}", self.painter.heading("Capabilities"))?;
        writeln!(f, "{}", self.capabilities())?;
        writeln!(f)?;
        writeln!(f, "{}", self.painter.heading("GATT services"))?;
        let services = self.services();
        if services.is_empty() {
            write!(f, "{}", self.painter.muted("No services discovered."))
        } else {
            write!(f, "{services}")
        }
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::vendor::VendorId;

    #[test]
    fn empty_scan_says_so() {
        let painter = Painter::new(false);
        assert_eq!(
            "No cameras found.",
            CameraListView::new(&[], &painter).to_string()
        );
    }

    #[test]
    fn scan_rows_show_missing_fields_as_dashes() {
        let painter = Painter::new(false);
        let cameras = [
            Camera::new("aa:00:00:00:00:01", Some("GR IIIx".to_string()), VendorId::Ricoh),
            Camera::new("D0:00:00:00:00:02", None, VendorId::Sony).with_protocol_version(Some(65)),
        ];

        assert_snapshot!(CameraListView::new(&cameras, &painter).to_string(), @r"
        ╭───────────────────┬─────────┬────────┬──────────╮
        │ address           │ name    │ vendor │ protocol │
        ├───────────────────┼─────────┼────────┼──────────┤
        │ AA:00:00:00:00:01 │ GR IIIx │ ricoh  │ -        │
        │ D0:00:00:00:00:02 │ -       │ sony   │ 65       │
        ╰───────────────────┴─────────┴────────┴──────────╯
        ");
    }
}
