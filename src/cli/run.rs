use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::app::AppContext;
use crate::cli::ui::{Painter, StateChangeView, SummaryView};
use crate::cli::{OutputFormat, RunArgs};
use crate::model::DeviceConnectionState;
use crate::service::{ServiceRunningState, SyncService};
use crate::sync::{
    CatalogUpdateChecker, FirmwareCatalog, FirmwareUpdateScheduler, FixedLocationSource,
    LocationCollector, NoopFirmwareScheduler, SyncCoordinator,
};
use crate::terminal::TerminalClient;

#[derive(Debug, Serialize)]
struct StateEvent<'a> {
    address: &'a str,
    #[serde(flatten)]
    state: &'a DeviceConnectionState,
}

/// Runs the sync service until `shutdown` resolves, reporting every device
/// state change as it happens.
#[instrument(skip_all, level = "info", fields(latitude = args.latitude, longitude = args.longitude))]
pub(crate) async fn run<W, S>(
    context: &AppContext,
    args: &RunArgs,
    out: &mut W,
    format: OutputFormat,
    terminal: &dyn TerminalClient,
    shutdown: S,
) -> Result<()>
where
    W: io::Write,
    S: Future<Output = ()>,
{
    let settings = *context.settings();
    let every = args.interval.unwrap_or(settings.location_poll_interval);
    let source = Arc::new(FixedLocationSource::new(
        args.latitude,
        args.longitude,
        args.altitude,
        every,
    ));
    let scheduler: Arc<dyn FirmwareUpdateScheduler> = match &args.firmware_catalog {
        Some(path) => Arc::new(CatalogUpdateChecker::new(
            FirmwareCatalog::load(path)?,
            context.store(),
        )),
        None => Arc::new(NoopFirmwareScheduler),
    };

    let coordinator = SyncCoordinator::builder()
        .repository(context.repository())
        .store(context.store())
        .collector(Arc::new(LocationCollector::new(source)))
        .zone(context.zone())
        .scheduler(scheduler)
        .settings(settings)
        .device_name(args.device_name.clone())
        .build();
    let service = SyncService::new(coordinator, ServiceRunningState::new());
    let states = service.coordinator().device_states();
    service.start();

    let painter = Painter::new(terminal.stdout_is_terminal());
    let followed = tokio::select! {
        result = follow_states(states, out, format, &painter) => result,
        () = shutdown => {
            info!("shutdown requested");
            Ok(())
        }
    };
    service.stop().await;
    followed?;

    let summary = service.summary();
    match format {
        OutputFormat::Pretty => {
            writeln!(out)?;
            writeln!(out, "{}", SummaryView::new(&summary, &painter))?;
        }
        OutputFormat::Json => {
            serde_json::to_writer(&mut *out, &summary)?;
            writeln!(out)?;
        }
    }
    Ok(())
}

/// Prints each state that differs from the last one seen for its device.
async fn follow_states<W: io::Write>(
    mut states: watch::Receiver<BTreeMap<String, DeviceConnectionState>>,
    out: &mut W,
    format: OutputFormat,
    painter: &Painter,
) -> Result<()> {
    let mut seen: BTreeMap<String, DeviceConnectionState> = BTreeMap::new();
    loop {
        let current = states.borrow_and_update().clone();
        for (address, state) in &current {
            if seen.get(address) == Some(state) {
                continue;
            }
            match format {
                OutputFormat::Pretty => {
                    writeln!(out, "{}", StateChangeView::new(address, state, painter))?;
                }
                OutputFormat::Json => {
                    serde_json::to_writer(&mut *out, &StateEvent { address, state })?;
                    writeln!(out)?;
                }
            }
        }
        out.flush()?;
        seen = current;

        if states.changed().await.is_err() {
            warn!("coordinator state channel closed");
            return Ok(());
        }
    }
}
