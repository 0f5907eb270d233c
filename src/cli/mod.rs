pub(crate) mod camera;
pub(crate) mod command;
pub(crate) mod devices;
pub(crate) mod run;
pub(crate) mod ui;

pub use self::command::{
    AddressArgs, Args, Command, FirmwareArgs, LogLevel, OutputFormat, PairArgs, RunArgs, ScanArgs,
};
