use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bon::{Builder, bon};
use tokio::sync::{broadcast, watch};
use tokio::time::sleep;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info};
use uuid::Uuid;

use super::discovery::AdvertisementSource;
use super::gatt::{GattClient, NotificationStream};
use super::model::{Advertisement, CharacteristicInfo, ServiceInfo, WriteMode};
use super::repository::{CameraRepository, CameraStream, ConnectionFactory, FoundCallback};
use crate::error::CameraError;
use crate::session::CameraConnection;
use crate::vendor::{CameraVendor, GattSpec, RicohVendor, SonyVendor, sony_uuids};

const FAKE_PROPERTIES: [&str; 3] = ["read", "write", "notify"];

/// One GATT call observed by a [`FakeGatt`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum GattOperation {
    Read {
        characteristic: Uuid,
    },
    Write {
        characteristic: Uuid,
        payload: Vec<u8>,
        mode: WriteMode,
    },
    Subscribe {
        characteristic: Uuid,
    },
    Disconnect,
}

#[derive(Debug)]
struct FakeGattState {
    address: String,
    services: Vec<ServiceInfo>,
    values: Mutex<HashMap<Uuid, Vec<u8>>>,
    write_failures: Mutex<HashMap<Uuid, u32>>,
    read_failures: Mutex<HashSet<Uuid>>,
    hanging: Mutex<HashSet<Uuid>>,
    operations: Mutex<Vec<GattOperation>>,
    notifications: broadcast::Sender<(Uuid, Vec<u8>)>,
    connected: watch::Sender<bool>,
}

/// In-memory GATT peripheral.
///
/// Clones share state, so a test can keep one handle while the session owns
/// another. Writes are recorded and echoed back as the characteristic's
/// next read value.
#[derive(Debug, Clone)]
pub struct FakeGatt {
    state: Arc<FakeGattState>,
}

#[bon]
impl FakeGatt {
    #[builder]
    pub fn new(
        #[builder(into)] address: String,
        services: Vec<ServiceInfo>,
        #[builder(default)] values: HashMap<Uuid, Vec<u8>>,
    ) -> Self {
        let (notifications, _) = broadcast::channel(16);
        Self {
            state: Arc::new(FakeGattState {
                address: crate::model::normalise_address(&address),
                services,
                values: Mutex::new(values),
                write_failures: Mutex::new(HashMap::new()),
                read_failures: Mutex::new(HashSet::new()),
                hanging: Mutex::new(HashSet::new()),
                operations: Mutex::new(Vec::new()),
                notifications,
                connected: watch::Sender::new(true),
            }),
        }
    }
}

impl FakeGatt {
    /// A Ricoh GR with its full service tree, geo-tagging off.
    #[must_use]
    pub fn ricoh(address: &str) -> Self {
        let vendor = RicohVendor::default();
        let spec = vendor.gatt_spec();
        let mut values = HashMap::new();
        if let Some(firmware) = spec.firmware_version {
            values.insert(firmware.characteristic, b"1.10\0".to_vec());
        }
        if let Some(hardware) = spec.hardware_revision {
            values.insert(hardware.characteristic, b"GR IIIx\0".to_vec());
        }
        if let Some(geo_tagging) = spec.geo_tagging {
            values.insert(geo_tagging.characteristic, vec![0x00]);
        }
        if let Some(battery) = spec.battery_level {
            values.insert(battery.characteristic, vec![0x55]);
        }

        Self::builder()
            .address(address)
            .services(gatt_tree(&spec_entries(spec)))
            .values(values)
            .build()
    }

    /// A Sony camera. `unlock` adds the DD30/DD31 lock and enable pair.
    #[must_use]
    pub fn sony(address: &str, unlock: bool) -> Self {
        let vendor = SonyVendor::default();
        let mut entries = spec_entries(vendor.gatt_spec());
        let location = sony_uuids::LOCATION_SERVICE;
        entries.extend([
            (location, sony_uuids::STATUS_NOTIFY),
            (location, sony_uuids::CONFIG),
            (location, sony_uuids::TIME_CORRECTION),
            (location, sony_uuids::AREA_ADJUSTMENT),
        ]);
        if unlock {
            entries.extend([
                (location, sony_uuids::LOCK),
                (location, sony_uuids::ENABLE),
            ]);
        }

        let values = HashMap::from([
            (sony_uuids::CONFIG, vec![0x06, 0x10, 0x00, 0x9C, 0x02, 0x00]),
            (sony_uuids::TIME_CORRECTION, vec![0x00]),
            (sony_uuids::AREA_ADJUSTMENT, vec![0x00]),
        ]);

        Self::builder()
            .address(address)
            .services(gatt_tree(&entries))
            .values(values)
            .build()
    }

    fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Scripts the value returned by the next reads of `characteristic`.
    pub fn set_value(&self, characteristic: Uuid, value: Vec<u8>) {
        Self::lock(&self.state.values).insert(characteristic, value);
    }

    /// Fails the next `times` writes to `characteristic`.
    pub fn fail_writes(&self, characteristic: Uuid, times: u32) {
        Self::lock(&self.state.write_failures).insert(characteristic, times);
    }

    /// Fails every read of `characteristic`.
    pub fn fail_reads(&self, characteristic: Uuid) {
        Self::lock(&self.state.read_failures).insert(characteristic);
    }

    /// Makes reads and writes of `characteristic` never complete.
    pub fn hang(&self, characteristic: Uuid) {
        Self::lock(&self.state.hanging).insert(characteristic);
    }

    /// Pushes a notification to subscribers of `characteristic`.
    pub fn notify(&self, characteristic: Uuid, payload: Vec<u8>) {
        let _ = self.state.notifications.send((characteristic, payload));
    }

    /// Simulates the camera dropping the link.
    pub fn drop_link(&self) {
        self.state.connected.send_replace(false);
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.connected.send_replace(connected);
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.state.connected.borrow()
    }

    #[must_use]
    pub fn operations(&self) -> Vec<GattOperation> {
        Self::lock(&self.state.operations).clone()
    }

    /// Payloads written to `characteristic`, in order.
    #[must_use]
    pub fn writes_to(&self, characteristic: Uuid) -> Vec<Vec<u8>> {
        Self::lock(&self.state.operations)
            .iter()
            .filter_map(|operation| match operation {
                GattOperation::Write {
                    characteristic: written,
                    payload,
                    ..
                } if *written == characteristic => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn write_count(&self) -> usize {
        Self::lock(&self.state.operations)
            .iter()
            .filter(|operation| matches!(operation, GattOperation::Write { .. }))
            .count()
    }

    #[must_use]
    pub fn disconnect_count(&self) -> usize {
        Self::lock(&self.state.operations)
            .iter()
            .filter(|operation| matches!(operation, GattOperation::Disconnect))
            .count()
    }

    fn record(&self, operation: GattOperation) {
        Self::lock(&self.state.operations).push(operation);
    }

    fn ensure_present(&self, service: Uuid, characteristic: Uuid) -> Result<(), CameraError> {
        if super::model::has_characteristic(&self.state.services, service, characteristic) {
            Ok(())
        } else {
            Err(CameraError::CharacteristicNotFound {
                service,
                characteristic,
                discovered: super::model::describe_services(&self.state.services),
            })
        }
    }

    fn ensure_connected(&self) -> Result<(), CameraError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(CameraError::Disconnected)
        }
    }

    fn hangs(&self, characteristic: Uuid) -> bool {
        Self::lock(&self.state.hanging).contains(&characteristic)
    }
}

#[async_trait]
impl GattClient for FakeGatt {
    fn address(&self) -> &str {
        &self.state.address
    }

    fn services(&self) -> &[ServiceInfo] {
        &self.state.services
    }

    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>, CameraError> {
        self.ensure_connected()?;
        self.ensure_present(service, characteristic)?;
        self.record(GattOperation::Read { characteristic });
        if self.hangs(characteristic) {
            std::future::pending::<()>().await;
        }
        if Self::lock(&self.state.read_failures).contains(&characteristic) {
            return Err(CameraError::Transport {
                message: format!("scripted read failure on {characteristic}"),
            });
        }

        Self::lock(&self.state.values)
            .get(&characteristic)
            .cloned()
            .ok_or_else(|| CameraError::Transport {
                message: format!("no value scripted for {characteristic}"),
            })
    }

    async fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), CameraError> {
        self.ensure_connected()?;
        self.ensure_present(service, characteristic)?;
        self.record(GattOperation::Write {
            characteristic,
            payload: payload.to_vec(),
            mode,
        });
        if self.hangs(characteristic) {
            std::future::pending::<()>().await;
        }

        {
            let mut failures = Self::lock(&self.state.write_failures);
            if let Some(remaining) = failures.get_mut(&characteristic)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(CameraError::Transport {
                    message: format!("scripted write failure on {characteristic}"),
                });
            }
        }

        Self::lock(&self.state.values).insert(characteristic, payload.to_vec());
        Ok(())
    }

    async fn subscribe(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream, CameraError> {
        self.ensure_connected()?;
        self.ensure_present(service, characteristic)?;
        self.record(GattOperation::Subscribe { characteristic });

        let stream = BroadcastStream::new(self.state.notifications.subscribe()).filter_map(
            move |notification| match notification {
                Ok((uuid, payload)) if uuid == characteristic => Some(payload),
                _ => None,
            },
        );
        Ok(Box::pin(stream))
    }

    fn connection_state(&self) -> watch::Receiver<bool> {
        self.state.connected.subscribe()
    }

    async fn disconnect(&self) -> Result<(), CameraError> {
        self.record(GattOperation::Disconnect);
        self.state.connected.send_replace(false);
        Ok(())
    }
}

/// Groups `(service, characteristic)` pairs into a service tree.
#[must_use]
pub fn gatt_tree(entries: &[(Uuid, Uuid)]) -> Vec<ServiceInfo> {
    let mut order = Vec::new();
    let mut grouped: HashMap<Uuid, Vec<CharacteristicInfo>> = HashMap::new();
    for (service, characteristic) in entries {
        let characteristics = grouped.entry(*service).or_insert_with(|| {
            order.push(*service);
            Vec::new()
        });
        if characteristics
            .iter()
            .all(|existing| existing.uuid() != *characteristic)
        {
            characteristics.push(CharacteristicInfo::new(
                *characteristic,
                FAKE_PROPERTIES.iter().map(|label| (*label).to_string()).collect(),
            ));
        }
    }

    order
        .into_iter()
        .map(|service| ServiceInfo::new(service, true, grouped.remove(&service).unwrap_or_default()))
        .collect()
}

fn spec_entries(spec: &GattSpec) -> Vec<(Uuid, Uuid)> {
    [
        spec.firmware_version,
        spec.hardware_revision,
        spec.device_name,
        spec.date_time,
        spec.geo_tagging,
        spec.location,
        spec.pairing,
        spec.battery_level,
        spec.shooting_mode,
        spec.drive_mode,
    ]
    .into_iter()
    .flatten()
    .map(|target| (target.service, target.characteristic))
    .collect()
}

/// A camera known to a [`FakeCameraRepository`].
#[derive(Debug, Clone, Builder)]
pub struct FakeCamera {
    advertisement: Advertisement,
    gatt: FakeGatt,
    #[builder(default = true)]
    bonded: bool,
    #[builder(default = true)]
    advertising: bool,
    /// Delay between the advertisement and a completed GATT connect.
    #[builder(default)]
    connect_delay: Duration,
}

/// In-memory camera repository for tests and offline runs.
#[derive(Debug)]
pub struct FakeCameraRepository {
    factory: ConnectionFactory,
    cameras: Mutex<HashMap<String, FakeCamera>>,
    connect_attempts: Mutex<HashMap<String, usize>>,
    passive_scan: watch::Sender<bool>,
    passive_scan_starts: AtomicUsize,
    presence: broadcast::Sender<String>,
}

impl FakeCameraRepository {
    #[must_use]
    pub fn new(factory: ConnectionFactory) -> Self {
        let (presence, _) = broadcast::channel(32);
        Self {
            factory,
            cameras: Mutex::new(HashMap::new()),
            connect_attempts: Mutex::new(HashMap::new()),
            passive_scan: watch::Sender::new(false),
            passive_scan_starts: AtomicUsize::new(0),
            presence,
        }
    }

    pub fn add_camera(&self, camera: FakeCamera) {
        let address = camera.advertisement.address().to_string();
        FakeGatt::lock(&self.cameras).insert(address, camera);
    }

    /// Turns a camera's advertising on or off.
    pub fn set_advertising(&self, address: &str, advertising: bool) {
        if let Some(camera) =
            FakeGatt::lock(&self.cameras).get_mut(&crate::model::normalise_address(address))
        {
            camera.advertising = advertising;
        }
    }

    /// Reports a passive-scan sighting of `address`.
    pub fn announce(&self, address: &str) {
        let _ = self
            .presence
            .send(crate::model::normalise_address(address));
    }

    /// Number of `connect` calls made for `address`.
    #[must_use]
    pub fn connect_attempts(&self, address: &str) -> usize {
        FakeGatt::lock(&self.connect_attempts)
            .get(&crate::model::normalise_address(address))
            .copied()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_passive_scanning(&self) -> bool {
        *self.passive_scan.borrow()
    }

    #[must_use]
    pub fn passive_scan_starts(&self) -> usize {
        self.passive_scan_starts.load(Ordering::SeqCst)
    }

    fn camera(&self, address: &str) -> Option<FakeCamera> {
        FakeGatt::lock(&self.cameras).get(address).cloned()
    }
}

#[async_trait]
impl AdvertisementSource for FakeCameraRepository {
    async fn wait_for_advertisement(
        &self,
        address: &str,
        wait: Duration,
    ) -> Result<Option<Advertisement>, CameraError> {
        match self.camera(address) {
            Some(camera) if camera.advertising => Ok(Some(camera.advertisement)),
            _ => {
                sleep(wait).await;
                Ok(None)
            }
        }
    }

    async fn is_bonded(&self, address: &str) -> bool {
        self.camera(address).is_some_and(|camera| camera.bonded)
    }
}

#[async_trait]
impl CameraRepository for FakeCameraRepository {
    async fn discover_cameras(&self) -> Result<CameraStream, CameraError> {
        let cameras: Vec<_> = FakeGatt::lock(&self.cameras)
            .values()
            .filter(|camera| camera.advertising)
            .filter_map(|camera| {
                self.factory
                    .registry()
                    .identify_camera(&camera.advertisement)
            })
            .collect();
        Ok(Box::pin(tokio_stream::iter(cameras)))
    }

    async fn connect(
        &self,
        address: &str,
        on_found: Option<FoundCallback>,
    ) -> Result<CameraConnection, CameraError> {
        let address = crate::model::normalise_address(address);
        *FakeGatt::lock(&self.connect_attempts)
            .entry(address.clone())
            .or_default() += 1;
        let camera = self.camera(&address);
        let missing = address.clone();

        self.factory
            .establish(self, &address, on_found, |_advertisement| async move {
                let Some(camera) = camera else {
                    return Err(CameraError::DeviceNotFound { address: missing });
                };
                sleep(camera.connect_delay).await;
                camera.gatt.set_connected(true);
                debug!(address = camera.gatt.address(), "fake GATT connected");
                Ok(Box::new(camera.gatt) as Box<dyn GattClient>)
            })
            .await
    }

    async fn start_passive_scan(&self) -> Result<(), CameraError> {
        info!("fake passive scan started");
        self.passive_scan_starts.fetch_add(1, Ordering::SeqCst);
        self.passive_scan.send_replace(true);
        Ok(())
    }

    async fn stop_passive_scan(&self) -> Result<(), CameraError> {
        self.passive_scan.send_replace(false);
        Ok(())
    }

    fn presence(&self) -> broadcast::Receiver<String> {
        self.presence.subscribe()
    }
}
