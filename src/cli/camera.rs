use std::collections::BTreeMap;
use std::io;

use anyhow::Result;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::{Instant, timeout_at};
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument};

use crate::app::AppContext;
use crate::cli::ui::{CameraListView, InspectView, Painter, Spinner};
use crate::cli::{AddressArgs, OutputFormat, ScanArgs};
use crate::hw::ServiceInfo;
use crate::model::{Camera, Capability, ConnectionCapabilities};
use crate::session::CameraConnection;
use crate::terminal::TerminalClient;

/// Everything `inspect` learns from one connected camera.
#[derive(Debug, Clone, Serialize)]
pub struct InspectReport {
    pub camera: Camera,
    pub firmware_version: Option<String>,
    pub hardware_revision: Option<String>,
    pub geo_tagging: Option<bool>,
    pub battery_level: Option<u8>,
    pub capabilities: ConnectionCapabilities,
    pub services: Vec<ServiceInfo>,
}

impl InspectReport {
    /// Reads every supported value; reads that fail are reported as absent.
    pub(crate) async fn collect(connection: &CameraConnection) -> Self {
        let capabilities = connection.capabilities();
        let firmware_version = if capabilities.supports(Capability::FirmwareVersion) {
            connection
                .read_firmware_version()
                .await
                .inspect_err(|error| debug!(%error, "firmware version unavailable"))
                .ok()
        } else {
            None
        };
        let hardware_revision = if capabilities.supports(Capability::HardwareRevision) {
            connection
                .read_hardware_revision()
                .await
                .inspect_err(|error| debug!(%error, "hardware revision unavailable"))
                .ok()
        } else {
            None
        };
        let geo_tagging = if capabilities.supports(Capability::GeoTagging) {
            connection
                .is_geo_tagging_enabled()
                .await
                .inspect_err(|error| debug!(%error, "geo-tagging flag unavailable"))
                .ok()
        } else {
            None
        };
        let battery_level = connection
            .read_battery_level()
            .await
            .inspect_err(|error| debug!(%error, "battery level unavailable"))
            .ok();

        Self {
            camera: connection.camera().clone(),
            firmware_version,
            hardware_revision,
            geo_tagging,
            battery_level,
            capabilities,
            services: connection.services().to_vec(),
        }
    }
}

#[derive(Debug, Serialize)]
struct TimeSyncReport<'a> {
    address: &'a str,
    #[serde(with = "time::serde::rfc3339")]
    date_time: OffsetDateTime,
    dst: bool,
}

fn spinner_for(format: OutputFormat, terminal: &dyn TerminalClient) -> Spinner {
    Spinner::new(format == OutputFormat::Pretty && terminal.stderr_is_terminal())
}

/// Runs an active scan for `args.duration` and lists each camera once.
#[instrument(skip(context, out, terminal), level = "debug", fields(duration = ?args.duration))]
pub(crate) async fn scan<W: io::Write>(
    context: &AppContext,
    args: &ScanArgs,
    out: &mut W,
    format: OutputFormat,
    terminal: &dyn TerminalClient,
) -> Result<()> {
    let painter = Painter::new(terminal.stdout_is_terminal());
    let spinner = spinner_for(format, terminal);
    let repository = context.repository();

    let cameras = spinner
        .run(&painter, "Scanning for cameras", || async {
            let mut stream = repository.discover_cameras().await?;
            let deadline = Instant::now() + args.duration;
            let mut seen = BTreeMap::new();
            while let Ok(Some(camera)) = timeout_at(deadline, stream.next()).await {
                seen.entry(camera.address().to_string()).or_insert(camera);
            }
            Ok::<_, anyhow::Error>(seen.into_values().collect::<Vec<_>>())
        })
        .await?;
    info!(found = cameras.len(), "scan finished");

    match format {
        OutputFormat::Pretty => writeln!(out, "{}", CameraListView::new(&cameras, &painter))?,
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, &cameras)?;
            writeln!(out)?;
        }
    }
    Ok(())
}

/// Connects, reads identity and live values, and prints the GATT layout.
#[instrument(skip(context, out, terminal), level = "debug", fields(address = %args.address))]
pub(crate) async fn inspect<W: io::Write>(
    context: &AppContext,
    args: &AddressArgs,
    out: &mut W,
    format: OutputFormat,
    terminal: &dyn TerminalClient,
) -> Result<()> {
    let painter = Painter::new(terminal.stdout_is_terminal());
    let spinner = spinner_for(format, terminal);

    let connection = spinner
        .run(&painter, &format!("Connecting to {}", args.address), || {
            context.connect(&args.address)
        })
        .await?;
    let report = InspectReport::collect(&connection).await;
    connection.disconnect().await?;

    match format {
        OutputFormat::Pretty => writeln!(out, "{}", InspectView::new(&report, &painter))?,
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, &report)?;
            writeln!(out)?;
        }
    }
    Ok(())
}

/// Writes the host's zoned wall-clock time to the camera.
#[instrument(skip(context, out, terminal), level = "debug", fields(address = %args.address))]
pub(crate) async fn sync_time<W: io::Write>(
    context: &AppContext,
    args: &AddressArgs,
    out: &mut W,
    format: OutputFormat,
    terminal: &dyn TerminalClient,
) -> Result<()> {
    let painter = Painter::new(terminal.stdout_is_terminal());
    let spinner = spinner_for(format, terminal);

    let mut connection = spinner
        .run(&painter, &format!("Connecting to {}", args.address), || {
            context.connect(&args.address)
        })
        .await?;
    let zoned = context.zone().zoned(OffsetDateTime::now_utc());
    connection.sync_date_time(&zoned).await?;
    let address = connection.camera().address().to_string();
    connection.disconnect().await?;

    match format {
        OutputFormat::Pretty => writeln!(
            out,
            "{} Synced {} to {}{}",
            painter.success("✓"),
            painter.value(&address),
            zoned.date_time(),
            if zoned.is_dst() { " (DST)" } else { "" }
        )?,
        OutputFormat::Json => {
            let report = TimeSyncReport {
                address: &address,
                date_time: zoned.date_time(),
                dst: zoned.is_dst(),
            };
            serde_json::to_writer_pretty(&mut *out, &report)?;
            writeln!(out)?;
        }
    }
    Ok(())
}
