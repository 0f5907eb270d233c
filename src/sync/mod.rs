mod connection_manager;
mod coordinator;
mod firmware;
mod location;
mod store;

pub use self::connection_manager::{DeviceConnectionManager, Supervisor, SupervisorId};
pub use self::coordinator::{DeviceHandle, SyncCoordinator, SyncSummary};
pub use self::firmware::{
    CatalogUpdateChecker, FirmwareCatalog, FirmwareNotice, FirmwareUpdateScheduler,
    NoopFirmwareScheduler, compare_versions, normalise_model_name,
};
pub use self::location::{
    ChannelLocationSource, FixedLocationSource, LocationCollector, LocationSource, LocationStream,
};
pub use self::store::{InMemoryPairedDeviceStore, JsonPairedDeviceStore, PairedDeviceStore};
