use std::path::PathBuf;
use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use tracing_subscriber::filter::LevelFilter;

/// Command-line options for the camera sync tool.
#[derive(Debug, Parser)]
#[command(
    name = "camsync",
    about = "Pair with Bluetooth cameras and keep their clocks and GPS in sync."
)]
pub struct Args {
    /// Log verbosity for this tool; overrides `RUST_LOG`.
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
    /// Output format. Defaults to `pretty` on a terminal and `json` otherwise.
    #[arg(long, global = true, value_enum)]
    output: Option<OutputFormat>,
    /// Settings file to use instead of the platform default.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Paired-device file to use instead of the platform default.
    #[arg(long, global = true)]
    devices_file: Option<PathBuf>,
    /// Uses simulated Ricoh and Sony cameras instead of the BLE adapter.
    #[arg(long, global = true)]
    fake: bool,
    #[command(subcommand)]
    command: Command,
}

impl Args {
    /// Creates argument values directly without CLI parsing.
    ///
    /// ```
    /// use camsync::{Args, Command};
    ///
    /// let args = Args::new(Command::Devices);
    /// assert!(args.config().is_none());
    /// ```
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            log_level: None,
            output: None,
            config: None,
            devices_file: None,
            fake: false,
            command,
        }
    }

    #[must_use]
    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }

    #[must_use]
    pub fn output_format(&self) -> Option<OutputFormat> {
        self.output
    }

    #[must_use]
    pub fn config(&self) -> Option<&PathBuf> {
        self.config.as_ref()
    }

    #[must_use]
    pub fn devices_file(&self) -> Option<&PathBuf> {
        self.devices_file.as_ref()
    }

    #[must_use]
    pub fn is_fake(&self) -> bool {
        self.fake
    }

    #[must_use]
    pub fn command(&self) -> &Command {
        &self.command
    }

    #[must_use]
    pub fn into_command(self) -> Command {
        self.command
    }
}

/// Supported CLI commands.
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// List cameras that are advertising nearby.
    Scan(ScanArgs),
    /// Connect to a camera and print what it reports.
    Inspect(AddressArgs),
    /// Set a camera's clock to the local time.
    SyncTime(AddressArgs),
    /// Pair with a camera and remember it for background sync.
    Pair(PairArgs),
    /// Forget a paired camera.
    Unpair(AddressArgs),
    /// Include a paired camera in background sync.
    Enable(AddressArgs),
    /// Exclude a paired camera from background sync.
    Disable(AddressArgs),
    /// List paired cameras.
    Devices,
    /// Report paired cameras with newer firmware in a catalog.
    Firmware(FirmwareArgs),
    /// Keep every enabled camera in sync until interrupted.
    Run(RunArgs),
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Scan(_) => "scan",
            Self::Inspect(_) => "inspect",
            Self::SyncTime(_) => "sync-time",
            Self::Pair(_) => "pair",
            Self::Unpair(_) => "unpair",
            Self::Enable(_) => "enable",
            Self::Disable(_) => "disable",
            Self::Devices => "devices",
            Self::Firmware(_) => "firmware",
            Self::Run(_) => "run",
        }
    }
}

#[derive(Debug, Clone, ClapArgs)]
pub struct ScanArgs {
    /// How long to listen for advertisements (e.g. `5s`, `1m`).
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub duration: Duration,
}

#[derive(Debug, Clone, ClapArgs)]
pub struct AddressArgs {
    /// Camera MAC address, e.g. `AA:BB:CC:DD:EE:FF`.
    pub address: String,
}

#[derive(Debug, Clone, ClapArgs)]
pub struct PairArgs {
    pub address: String,
    /// Name to store instead of the advertised one.
    #[arg(long)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, ClapArgs)]
pub struct FirmwareArgs {
    /// Firmware catalog JSON.
    pub catalog: PathBuf,
    /// Record the reported updates so they are not reported again.
    #[arg(long)]
    pub mark_notified: bool,
}

#[derive(Debug, Clone, ClapArgs)]
pub struct RunArgs {
    #[arg(long, allow_negative_numbers = true)]
    pub latitude: f64,
    #[arg(long, allow_negative_numbers = true)]
    pub longitude: f64,
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    pub altitude: f64,
    /// Interval between location pushes; defaults to the configured poll interval.
    #[arg(long, value_parser = parse_duration)]
    pub interval: Option<Duration>,
    /// Firmware catalog used for update checks after each connect.
    #[arg(long)]
    pub firmware_catalog: Option<PathBuf>,
    /// Name the cameras record for this host.
    #[arg(long, default_value = "camsync")]
    pub device_name: String,
}

/// Log verbosity accepted by `--log-level`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    #[must_use]
    pub fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

/// How command results are written to stdout.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Json,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|error| error.to_string())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use clap::error::ErrorKind;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn run_requires_coordinates() {
        let error = Args::try_parse_from(["camsync", "run", "--latitude", "48.1"])
            .expect_err("missing --longitude should fail argument parsing");

        assert_eq!(ErrorKind::MissingRequiredArgument, error.kind());
    }

    #[test]
    fn run_accepts_negative_coordinates() {
        let args = Args::try_parse_from([
            "camsync",
            "run",
            "--latitude",
            "-33.8688",
            "--longitude",
            "151.2093",
            "--interval",
            "15s",
        ])
        .expect("valid run arguments should parse");

        assert_matches!(
            args.into_command(),
            Command::Run(RunArgs { latitude, interval: Some(interval), .. })
                if latitude == -33.8688 && interval == Duration::from_secs(15)
        );
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let args = Args::try_parse_from([
            "camsync",
            "devices",
            "--output",
            "json",
            "--log-level",
            "debug",
            "--fake",
        ])
        .expect("global flags should parse after the subcommand");

        assert_eq!(Some(OutputFormat::Json), args.output_format());
        assert_eq!(Some(LogLevel::Debug), args.log_level());
        assert_eq!(true, args.is_fake());
        assert_eq!("devices", args.command().name());
    }

    #[test]
    fn scan_duration_uses_humantime() {
        let args = Args::try_parse_from(["camsync", "scan", "--duration", "1m 30s"])
            .expect("humantime duration should parse");

        assert_matches!(
            args.into_command(),
            Command::Scan(ScanArgs { duration }) if duration == Duration::from_secs(90)
        );
    }
}
