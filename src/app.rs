use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use bon::Builder;
use tokio::time::timeout;
use tracing::{instrument, warn};

use crate::cli::{Args, Command, LogLevel, OutputFormat};
use crate::config::{SyncSettings, default_paired_devices_path};
use crate::error::CameraError;
use crate::hw::{
    Advertisement, BtleplugCameraRepository, CameraRepository, ConnectionFactory, FakeCamera,
    FakeCameraRepository, FakeGatt,
};
use crate::session::CameraConnection;
use crate::sync::{JsonPairedDeviceStore, PairedDeviceStore};
use crate::telemetry;
use crate::terminal::{SystemTerminalClient, TerminalClient};
use crate::vendor::VendorRegistry;
use crate::zone::ZoneRules;

const SERVICE_NAME: &str = "camsync";
const DEMO_RICOH_ADDRESS: &str = "AA:00:00:00:00:01";
const DEMO_SONY_ADDRESS: &str = "D0:00:00:00:00:02";
const SONY_COMPANY_ID: u16 = 0x012D;

/// Collaborators shared by every command.
#[derive(Debug, Clone, Builder)]
pub struct AppContext {
    repository: Arc<dyn CameraRepository>,
    store: Arc<dyn PairedDeviceStore>,
    zone: Arc<dyn ZoneRules>,
    #[builder(default)]
    settings: SyncSettings,
}

impl AppContext {
    /// Builds the context described by the global CLI flags.
    ///
    /// # Errors
    ///
    /// Returns an error when settings or the paired-device file cannot be
    /// loaded, or when the BLE stack is unavailable.
    pub async fn from_args(args: &Args, zone: Arc<dyn ZoneRules>) -> Result<Self> {
        let settings = SyncSettings::load(args.config().map(PathBuf::as_path))?;
        let devices_path = match args.devices_file() {
            Some(path) => path.clone(),
            None => default_paired_devices_path()?,
        };
        let store = Arc::new(JsonPairedDeviceStore::open(&devices_path)?);
        let factory = ConnectionFactory::new(
            VendorRegistry::with_default_vendors(),
            Arc::clone(&zone),
            settings,
        );
        let repository: Arc<dyn CameraRepository> = if args.is_fake() {
            Arc::new(demo_repository(factory))
        } else {
            Arc::new(BtleplugCameraRepository::new(factory).await?)
        };

        Ok(Self {
            repository,
            store,
            zone,
            settings,
        })
    }

    #[must_use]
    pub fn repository(&self) -> Arc<dyn CameraRepository> {
        Arc::clone(&self.repository)
    }

    #[must_use]
    pub fn store(&self) -> Arc<dyn PairedDeviceStore> {
        Arc::clone(&self.store)
    }

    #[must_use]
    pub fn zone(&self) -> Arc<dyn ZoneRules> {
        Arc::clone(&self.zone)
    }

    #[must_use]
    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Connects to one camera under the configured connect timeout.
    pub(crate) async fn connect(&self, address: &str) -> Result<CameraConnection, CameraError> {
        let after = self.settings.connect_timeout;
        timeout(after, self.repository.connect(address, None))
            .await
            .unwrap_or(Err(CameraError::Timeout {
                operation: "connect",
                after,
            }))
    }
}

/// Simulated cameras used by `--fake`: a Ricoh GR IIIx and a Sony body that
/// needs the location unlock handshake.
#[must_use]
pub fn demo_repository(factory: ConnectionFactory) -> FakeCameraRepository {
    let repository = FakeCameraRepository::new(factory);
    repository.add_camera(
        FakeCamera::builder()
            .advertisement(Advertisement::new(
                DEMO_RICOH_ADDRESS,
                Some("GR IIIx".to_string()),
            ))
            .gatt(FakeGatt::ricoh(DEMO_RICOH_ADDRESS))
            .build(),
    );
    repository.add_camera(
        FakeCamera::builder()
            .advertisement(
                Advertisement::new(DEMO_SONY_ADDRESS, Some("ILCE-7M4".to_string()))
                    .with_manufacturer_data(SONY_COMPANY_ID, vec![0x03, 0x00, 0x41, 0x00]),
            )
            .gatt(FakeGatt::sony(DEMO_SONY_ADDRESS, true))
            .build(),
    );
    repository
}

/// Runs one command against `context`, writing results to `out`.
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, the command fails, or
/// output writing fails.
pub async fn run<W>(command: Command, out: &mut W, context: AppContext) -> Result<()>
where
    W: io::Write,
{
    run_with_clients_and_log_level(command, out, &SystemTerminalClient, context, None, None).await
}

/// Runs one command with injected terminal detection and telemetry settings.
///
/// `output_format` defaults to pretty output when stdout is a terminal and
/// JSON otherwise.
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, the command fails, or
/// output writing fails.
#[instrument(
    skip(out, terminal_client, context),
    level = "info",
    fields(command = command.name(), ?log_level)
)]
pub async fn run_with_clients_and_log_level<W>(
    command: Command,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    context: AppContext,
    log_level: Option<LogLevel>,
    output_format: Option<OutputFormat>,
) -> Result<()>
where
    W: io::Write,
{
    telemetry::initialise_tracing(
        SERVICE_NAME,
        terminal_client.stderr_is_terminal(),
        log_level.map(LogLevel::as_level_filter),
    )?;
    let format = output_format.unwrap_or(if terminal_client.stdout_is_terminal() {
        OutputFormat::Pretty
    } else {
        OutputFormat::Json
    });

    match command {
        Command::Scan(args) => {
            crate::cli::camera::scan(&context, &args, out, format, terminal_client).await
        }
        Command::Inspect(args) => {
            crate::cli::camera::inspect(&context, &args, out, format, terminal_client).await
        }
        Command::SyncTime(args) => {
            crate::cli::camera::sync_time(&context, &args, out, format, terminal_client).await
        }
        Command::Pair(args) => {
            crate::cli::devices::pair(&context, &args, out, format, terminal_client).await
        }
        Command::Unpair(args) => {
            crate::cli::devices::unpair(&context, &args, out, format, terminal_client)
        }
        Command::Enable(args) => {
            crate::cli::devices::set_enabled(&context, &args, true, out, format, terminal_client)
        }
        Command::Disable(args) => {
            crate::cli::devices::set_enabled(&context, &args, false, out, format, terminal_client)
        }
        Command::Devices => crate::cli::devices::list(&context, out, format, terminal_client),
        Command::Firmware(args) => {
            crate::cli::devices::firmware(&context, &args, out, format, terminal_client)
        }
        Command::Run(args) => {
            crate::cli::run::run(
                &context,
                &args,
                out,
                format,
                terminal_client,
                interrupted(),
            )
            .await
        }
    }
}

async fn interrupted() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "could not listen for Ctrl+C; stopping");
    }
}
