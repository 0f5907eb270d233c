use std::io;

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::app::AppContext;
use crate::cli::ui::{FirmwareNoticesView, PairedDevicesView, Painter, Spinner};
use crate::cli::{AddressArgs, FirmwareArgs, OutputFormat, PairArgs};
use crate::error::StoreError;
use crate::model::{Capability, PairedDevice, normalise_address};
use crate::sync::FirmwareCatalog;
use crate::terminal::TerminalClient;

#[derive(Debug, Serialize)]
struct Unpaired<'a> {
    address: &'a str,
    removed: bool,
}

fn write_json<W: io::Write, T: Serialize + ?Sized>(out: &mut W, value: &T) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

/// Connects, runs vendor pairing, and records the camera.
///
/// Re-pairing keeps the stored sync history and enabled flag.
#[instrument(skip(context, out, terminal), level = "debug", fields(address = %args.address))]
pub(crate) async fn pair<W: io::Write>(
    context: &AppContext,
    args: &PairArgs,
    out: &mut W,
    format: OutputFormat,
    terminal: &dyn TerminalClient,
) -> Result<()> {
    let painter = Painter::new(terminal.stdout_is_terminal());
    let spinner = Spinner::new(format == OutputFormat::Pretty && terminal.stderr_is_terminal());

    let connection = spinner
        .run(&painter, &format!("Connecting to {}", args.address), || {
            context.connect(&args.address)
        })
        .await?;
    if !connection.initialize_pairing().await {
        connection.disconnect().await?;
        bail!("vendor pairing with {} failed", args.address);
    }

    let firmware_version = if connection
        .capabilities()
        .supports(Capability::FirmwareVersion)
    {
        connection
            .read_firmware_version()
            .await
            .inspect_err(|error| warn!(%error, "could not read firmware version"))
            .ok()
    } else {
        None
    };
    let camera = connection.camera().clone();
    connection.disconnect().await?;

    let store = context.store();
    let name = args
        .name
        .clone()
        .unwrap_or_else(|| camera.display_name().to_string());
    let mut device = store
        .get(camera.address())
        .unwrap_or_else(|| PairedDevice::new(camera.address(), name.clone(), camera.vendor()));
    device.name = name;
    device.vendor = camera.vendor();
    if firmware_version.is_some() {
        device.firmware_version = firmware_version;
    }
    store.upsert(device.clone())?;
    info!(vendor = %device.vendor, "camera paired");

    match format {
        OutputFormat::Pretty => writeln!(
            out,
            "{} Paired {} ({})",
            painter.success("✓"),
            painter.value(&device.address),
            device.name
        )?,
        OutputFormat::Json => write_json(out, &device)?,
    }
    Ok(())
}

#[instrument(skip(context, out, terminal), level = "debug", fields(address = %args.address))]
pub(crate) fn unpair<W: io::Write>(
    context: &AppContext,
    args: &AddressArgs,
    out: &mut W,
    format: OutputFormat,
    terminal: &dyn TerminalClient,
) -> Result<()> {
    let painter = Painter::new(terminal.stdout_is_terminal());
    let address = normalise_address(&args.address);
    if context.store().remove(&address)?.is_none() {
        return Err(StoreError::UnknownDevice { address }.into());
    }

    match format {
        OutputFormat::Pretty => {
            writeln!(out, "{} Unpaired {}", painter.success("✓"), painter.value(&address))?;
        }
        OutputFormat::Json => write_json(
            out,
            &Unpaired {
                address: &address,
                removed: true,
            },
        )?,
    }
    Ok(())
}

#[instrument(skip(context, out, terminal), level = "debug", fields(address = %args.address))]
pub(crate) fn set_enabled<W: io::Write>(
    context: &AppContext,
    args: &AddressArgs,
    enabled: bool,
    out: &mut W,
    format: OutputFormat,
    terminal: &dyn TerminalClient,
) -> Result<()> {
    let painter = Painter::new(terminal.stdout_is_terminal());
    let device = context.store().set_enabled(&args.address, enabled)?;

    match format {
        OutputFormat::Pretty => writeln!(
            out,
            "{} {} {}",
            painter.success("✓"),
            if enabled { "Enabled" } else { "Disabled" },
            painter.value(&device.address)
        )?,
        OutputFormat::Json => write_json(out, &device)?,
    }
    Ok(())
}

pub(crate) fn list<W: io::Write>(
    context: &AppContext,
    out: &mut W,
    format: OutputFormat,
    terminal: &dyn TerminalClient,
) -> Result<()> {
    let devices = context.store().list();
    match format {
        OutputFormat::Pretty => {
            let painter = Painter::new(terminal.stdout_is_terminal());
            writeln!(out, "{}", PairedDevicesView::new(&devices, &painter))?;
        }
        OutputFormat::Json => write_json(out, &devices)?,
    }
    Ok(())
}

/// Compares paired cameras against a firmware catalog.
///
/// With `--mark-notified` every reported notice is recorded so it is not
/// shown again until a newer version appears.
#[instrument(skip(context, out, terminal), level = "debug", fields(catalog = %args.catalog.display()))]
pub(crate) fn firmware<W: io::Write>(
    context: &AppContext,
    args: &FirmwareArgs,
    out: &mut W,
    format: OutputFormat,
    terminal: &dyn TerminalClient,
) -> Result<()> {
    let catalog = FirmwareCatalog::load(&args.catalog)?;
    let store = context.store();
    let notices = catalog.pending_notifications(&store.list());

    if args.mark_notified {
        for notice in &notices {
            store.set_latest_firmware(&notice.address, &notice.available)?;
            store.mark_firmware_notified(&notice.address, true)?;
        }
        info!(count = notices.len(), "firmware notices marked as delivered");
    }

    match format {
        OutputFormat::Pretty => {
            let painter = Painter::new(terminal.stdout_is_terminal());
            writeln!(out, "{}", FirmwareNoticesView::new(&notices, &painter))?;
        }
        OutputFormat::Json => write_json(out, &notices)?,
    }
    Ok(())
}
