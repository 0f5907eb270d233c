mod btleplug_backend;
mod discovery;
mod fake_backend;
mod gatt;
mod model;
mod repository;

pub use self::btleplug_backend::{BtleplugCameraRepository, BtleplugGatt};
pub use self::discovery::{AdvertisementSource, discover_with_retry};
pub use self::fake_backend::{
    FakeCamera, FakeCameraRepository, FakeGatt, GattOperation, gatt_tree,
};
pub use self::gatt::{GattClient, NotificationStream};
pub(crate) use self::model::{describe_characteristics, describe_services};
pub use self::model::{
    Advertisement, CharacteristicInfo, ServiceInfo, WriteMode, find_service, has_characteristic,
};
pub use self::repository::{CameraRepository, CameraStream, ConnectionFactory, FoundCallback};
