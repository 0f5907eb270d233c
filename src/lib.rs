mod app;
mod cli;
mod codec;
mod config;
mod error;
mod hw;
mod model;
mod service;
mod session;
mod sync;
mod telemetry;
mod terminal;
mod utils;
mod vendor;
mod zone;

pub use app::{AppContext, demo_repository, run, run_with_clients_and_log_level};
pub use cli::{
    AddressArgs, Args, Command, FirmwareArgs, LogLevel, OutputFormat, PairArgs, RunArgs, ScanArgs,
};
pub use codec::{DriveMode, ProtocolCodec, RicohCodec, ShootingMode, SonyCodec, SonyDateTime};
pub use config::{SyncSettings, default_paired_devices_path};
pub use error::{CameraError, CodecError, ConfigError, StoreError, SyncError};
pub use hw::{
    Advertisement, AdvertisementSource, BtleplugCameraRepository, CameraRepository, CameraStream,
    CharacteristicInfo, ConnectionFactory, FakeCamera, FakeCameraRepository, FakeGatt,
    FoundCallback, GattClient, GattOperation, ServiceInfo, WriteMode, discover_with_retry,
    gatt_tree,
};
pub use model::{
    Camera, Capability, ConnectionCapabilities, DeviceConnectionState, GpsLocation, PairedDevice,
    SyncInfo, ZonedDateTime, normalise_address,
};
pub use service::{ServiceRunningState, SyncService};
pub use session::{CameraConnection, ConnectionDelegate, SonyDelegate, StandardDelegate};
pub use sync::{
    CatalogUpdateChecker, ChannelLocationSource, DeviceConnectionManager, FirmwareCatalog,
    FirmwareNotice, FirmwareUpdateScheduler, FixedLocationSource, InMemoryPairedDeviceStore,
    JsonPairedDeviceStore, LocationCollector, LocationSource, NoopFirmwareScheduler,
    PairedDeviceStore, SyncCoordinator, SyncSummary, compare_versions, normalise_model_name,
};
pub use terminal::{SystemTerminalClient, TerminalClient};
pub use vendor::{
    CameraVendor, CharacteristicRef, GattSpec, RicohVendor, ScanCriteria, SonyVendor, VendorId,
    VendorRegistry, sony_uuids,
};
pub use zone::{FixedZone, SystemZone, ZoneRules};
