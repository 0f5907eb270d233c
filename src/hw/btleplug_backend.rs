use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use super::discovery::AdvertisementSource;
use super::gatt::{GattClient, NotificationStream};
use super::model::{Advertisement, CharacteristicInfo, ServiceInfo, WriteMode};
use super::repository::{CameraRepository, CameraStream, ConnectionFactory, FoundCallback};
use crate::error::CameraError;
use crate::model::normalise_address;
use crate::session::CameraConnection;

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
struct AdapterHandle {
    adapter: Adapter,
    name: String,
}

#[derive(Debug, Clone)]
struct SeenPeripheral {
    adapter: Adapter,
    peripheral: Peripheral,
}

#[derive(Debug)]
struct RepositoryState {
    manager: Manager,
    factory: ConnectionFactory,
    seen: Mutex<HashMap<String, SeenPeripheral>>,
    passive_scan: Mutex<Option<CancellationToken>>,
    presence: broadcast::Sender<String>,
}

/// Camera repository backed by the host's BLE adapters.
#[derive(Debug, Clone)]
pub struct BtleplugCameraRepository {
    state: Arc<RepositoryState>,
}

impl BtleplugCameraRepository {
    /// Opens the platform BLE manager.
    ///
    /// # Errors
    ///
    /// Returns an error when the platform BLE stack is unavailable.
    pub async fn new(factory: ConnectionFactory) -> Result<Self, CameraError> {
        let manager = Manager::new().await?;
        let (presence, _) = broadcast::channel(64);
        Ok(Self {
            state: Arc::new(RepositoryState {
                manager,
                factory,
                seen: Mutex::new(HashMap::new()),
                passive_scan: Mutex::new(None),
                presence,
            }),
        })
    }

    fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[instrument(skip(self), level = "trace")]
    async fn adapters(&self) -> Result<Vec<AdapterHandle>, CameraError> {
        let adapters = self.state.manager.adapters().await?;
        if adapters.is_empty() {
            return Err(CameraError::NoAdapters);
        }

        let mut handles = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            let name = adapter.adapter_info().await?;
            handles.push(AdapterHandle { adapter, name });
        }
        Ok(handles)
    }

    fn scan_filter(&self) -> ScanFilter {
        ScanFilter {
            services: self.state.factory.registry().scan_criteria().service_uuids,
        }
    }

    async fn stop_scans(adapters: &[AdapterHandle]) {
        for handle in adapters {
            if let Err(error) = handle.adapter.stop_scan().await {
                debug!(?error, adapter = handle.name, "failed to stop adapter scan cleanly");
            }
        }
    }

    /// Looks for `address` among the peripherals every adapter currently knows.
    async fn find_peripheral(
        &self,
        adapters: &[AdapterHandle],
        address: &str,
    ) -> Result<Option<Advertisement>, CameraError> {
        for handle in adapters {
            for peripheral in handle.adapter.peripherals().await? {
                let Some(properties) = peripheral.properties().await? else {
                    continue;
                };
                let advertisement = advertisement_from_properties(&peripheral, &properties);
                if advertisement.address() != address {
                    continue;
                }

                Self::lock(&self.state.seen).insert(
                    address.to_string(),
                    SeenPeripheral {
                        adapter: handle.adapter.clone(),
                        peripheral,
                    },
                );
                return Ok(Some(advertisement));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl AdvertisementSource for BtleplugCameraRepository {
    #[instrument(skip(self), level = "debug")]
    async fn wait_for_advertisement(
        &self,
        address: &str,
        wait: Duration,
    ) -> Result<Option<Advertisement>, CameraError> {
        let adapters = self.adapters().await?;
        for handle in &adapters {
            handle.adapter.start_scan(ScanFilter::default()).await?;
        }

        let deadline = Instant::now() + wait;
        let found = loop {
            if let Some(advertisement) = self.find_peripheral(&adapters, address).await? {
                break Some(advertisement);
            }
            if Instant::now() >= deadline {
                break None;
            }
            sleep(SCAN_POLL_INTERVAL).await;
        };

        Self::stop_scans(&adapters).await;
        Ok(found)
    }

    /// The OS keeps bonded peripherals in the adapter cache, so a cached
    /// entry is treated as a bond.
    async fn is_bonded(&self, address: &str) -> bool {
        let Ok(adapters) = self.adapters().await else {
            return false;
        };
        for handle in &adapters {
            let Ok(peripherals) = handle.adapter.peripherals().await else {
                continue;
            };
            for peripheral in peripherals {
                if normalise_address(&peripheral.address().to_string()) == address {
                    return true;
                }
            }
        }
        false
    }
}

#[async_trait]
impl CameraRepository for BtleplugCameraRepository {
    #[instrument(skip(self), level = "debug")]
    async fn discover_cameras(&self) -> Result<CameraStream, CameraError> {
        let adapters = self.adapters().await?;
        info!(adapter_count = adapters.len(), "starting camera scan");
        for handle in &adapters {
            handle.adapter.start_scan(ScanFilter::default()).await?;
        }

        let (sender, receiver) = mpsc::channel(16);
        let repository = self.clone();
        tokio::spawn(async move {
            let mut reported = HashSet::new();
            'scan: loop {
                for handle in &adapters {
                    let Ok(peripherals) = handle.adapter.peripherals().await else {
                        continue;
                    };
                    for peripheral in peripherals {
                        let Ok(Some(properties)) = peripheral.properties().await else {
                            continue;
                        };
                        let advertisement = advertisement_from_properties(&peripheral, &properties);
                        let Some(camera) = repository
                            .state
                            .factory
                            .registry()
                            .identify_camera(&advertisement)
                        else {
                            continue;
                        };
                        if !reported.insert(camera.address().to_string()) {
                            continue;
                        }
                        if sender.send(camera).await.is_err() {
                            break 'scan;
                        }
                    }
                }

                tokio::select! {
                    () = sender.closed() => break 'scan,
                    () = sleep(SCAN_POLL_INTERVAL) => {}
                }
            }
            Self::stop_scans(&adapters).await;
            debug!("camera scan stopped");
        });

        Ok(Box::pin(ReceiverStream::new(receiver)))
    }

    async fn connect(
        &self,
        address: &str,
        on_found: Option<FoundCallback>,
    ) -> Result<CameraConnection, CameraError> {
        let address = normalise_address(address);
        self.state
            .factory
            .establish(self, &address, on_found, |_advertisement| async {
                let seen = Self::lock(&self.state.seen).get(&address).cloned();
                let Some(seen) = seen else {
                    return Err(CameraError::DeviceNotFound {
                        address: address.clone(),
                    });
                };
                let gatt = BtleplugGatt::connect(&address, seen.adapter, seen.peripheral).await?;
                Ok(Box::new(gatt) as Box<dyn GattClient>)
            })
            .await
    }

    #[instrument(skip(self), level = "info")]
    async fn start_passive_scan(&self) -> Result<(), CameraError> {
        let token = {
            let mut running = Self::lock(&self.state.passive_scan);
            if running.is_some() {
                debug!("passive scan already running");
                return Ok(());
            }
            let token = CancellationToken::new();
            *running = Some(token.clone());
            token
        };

        let adapters = self.adapters().await?;
        let filter = self.scan_filter();
        for handle in adapters {
            handle.adapter.start_scan(filter.clone()).await?;
            let events = handle.adapter.events().await?;
            let repository = self.clone();
            let token = token.clone();
            tokio::spawn(async move {
                repository.forward_presence(handle, events, token).await;
            });
        }
        Ok(())
    }

    async fn stop_passive_scan(&self) -> Result<(), CameraError> {
        if let Some(token) = Self::lock(&self.state.passive_scan).take() {
            token.cancel();
            info!("passive scan stopped");
        }
        Ok(())
    }

    fn presence(&self) -> broadcast::Receiver<String> {
        self.state.presence.subscribe()
    }
}

impl BtleplugCameraRepository {
    async fn forward_presence(
        &self,
        handle: AdapterHandle,
        mut events: std::pin::Pin<Box<dyn tokio_stream::Stream<Item = CentralEvent> + Send>>,
        token: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                () = token.cancelled() => break,
                event = events.next() => event,
            };
            let Some(event) = event else {
                break;
            };
            let (CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id)) = event
            else {
                continue;
            };
            let Ok(peripheral) = handle.adapter.peripheral(&id).await else {
                continue;
            };
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };
            let advertisement = advertisement_from_properties(&peripheral, &properties);
            if self
                .state
                .factory
                .registry()
                .identify_vendor(&advertisement)
                .is_some()
            {
                trace!(address = advertisement.address(), "camera sighted by passive scan");
                let _ = self.state.presence.send(advertisement.address().to_string());
            }
        }

        if let Err(error) = handle.adapter.stop_scan().await {
            debug!(?error, adapter = handle.name, "failed to stop passive scan cleanly");
        }
    }
}

/// GATT client bound to a connected btleplug peripheral.
#[derive(Debug)]
pub struct BtleplugGatt {
    address: String,
    peripheral: Peripheral,
    services: Vec<ServiceInfo>,
    characteristics: HashMap<(Uuid, Uuid), Characteristic>,
    connected: Arc<watch::Sender<bool>>,
    link_monitor: JoinHandle<()>,
}

impl BtleplugGatt {
    #[instrument(skip(adapter, peripheral), level = "debug")]
    async fn connect(
        address: &str,
        adapter: Adapter,
        peripheral: Peripheral,
    ) -> Result<Self, CameraError> {
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        peripheral.discover_services().await?;
        let (services, characteristics) = collect_services_and_characteristics(&peripheral);

        let connected = Arc::new(watch::Sender::new(true));
        let mut events = adapter.events().await?;
        let peripheral_id = peripheral.id();
        let link = Arc::clone(&connected);
        let link_monitor = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if matches!(&event, CentralEvent::DeviceDisconnected(id) if *id == peripheral_id) {
                    link.send_replace(false);
                    break;
                }
            }
        });

        Ok(Self {
            address: address.to_string(),
            peripheral,
            services,
            characteristics,
            connected,
            link_monitor,
        })
    }

    fn characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<&Characteristic, CameraError> {
        self.characteristics
            .get(&(service, characteristic))
            .ok_or_else(|| CameraError::CharacteristicNotFound {
                service,
                characteristic,
                discovered: super::model::describe_services(&self.services),
            })
    }
}

impl Drop for BtleplugGatt {
    fn drop(&mut self) {
        self.link_monitor.abort();
    }
}

#[async_trait]
impl GattClient for BtleplugGatt {
    fn address(&self) -> &str {
        &self.address
    }

    fn services(&self) -> &[ServiceInfo] {
        &self.services
    }

    #[instrument(skip(self), level = "trace")]
    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>, CameraError> {
        let characteristic = self.characteristic(service, characteristic)?;
        Ok(self.peripheral.read(characteristic).await?)
    }

    #[instrument(skip(self, payload), level = "trace", fields(%mode, payload_len = payload.len()))]
    async fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), CameraError> {
        let characteristic = self.characteristic(service, characteristic)?;
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        self.peripheral
            .write(characteristic, payload, write_type)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "trace")]
    async fn subscribe(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream, CameraError> {
        let target = self.characteristic(service, characteristic)?;
        let notifications = self.peripheral.notifications().await?;
        self.peripheral.subscribe(target).await?;
        let uuid = target.uuid;
        Ok(Box::pin(notifications.filter_map(move |notification| {
            (notification.uuid == uuid).then_some(notification.value)
        })))
    }

    fn connection_state(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    #[instrument(skip(self), level = "debug", fields(address = self.address))]
    async fn disconnect(&self) -> Result<(), CameraError> {
        let result = if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await.map_err(CameraError::from)
        } else {
            Ok(())
        };
        self.connected.send_replace(false);
        if let Err(error) = &result {
            warn!(%error, "peripheral disconnect failed");
        }
        result
    }
}

fn advertisement_from_properties(
    peripheral: &Peripheral,
    properties: &PeripheralProperties,
) -> Advertisement {
    let address = properties.address.to_string();
    let address = if properties.address.into_inner() == [0; 6] {
        peripheral.id().to_string()
    } else {
        address
    };

    let manufacturer_data: BTreeMap<u16, Vec<u8>> = properties
        .manufacturer_data
        .iter()
        .map(|(company_id, payload)| (*company_id, payload.clone()))
        .collect();
    manufacturer_data.into_iter().fold(
        Advertisement::new(&address, properties.local_name.clone())
            .with_rssi(properties.rssi)
            .with_service_uuids(properties.services.clone()),
        |advertisement, (company_id, payload)| {
            advertisement.with_manufacturer_data(company_id, payload)
        },
    )
}

fn collect_services_and_characteristics(
    peripheral: &Peripheral,
) -> (Vec<ServiceInfo>, HashMap<(Uuid, Uuid), Characteristic>) {
    let mut services = Vec::new();
    let mut characteristics_by_uuid = HashMap::new();

    for service in peripheral.services() {
        let mut characteristics = Vec::new();
        for characteristic in &service.characteristics {
            characteristics_by_uuid
                .entry((service.uuid, characteristic.uuid))
                .or_insert_with(|| characteristic.clone());

            characteristics.push(CharacteristicInfo::new(
                characteristic.uuid,
                property_labels(characteristic.properties),
            ));
        }
        characteristics.sort_by_key(CharacteristicInfo::uuid);

        services.push(ServiceInfo::new(service.uuid, service.primary, characteristics));
    }
    services.sort_by_key(ServiceInfo::uuid);

    (services, characteristics_by_uuid)
}

fn property_labels(flags: CharPropFlags) -> Vec<String> {
    let labels: Vec<String> = flags
        .iter_names()
        .map(|(name, _)| name.to_lowercase())
        .collect();
    if labels.is_empty() {
        vec!["none".to_string()]
    } else {
        labels
    }
}
