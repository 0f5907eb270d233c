use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bon::bon;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection_manager::{DeviceConnectionManager, Supervisor, SupervisorId};
use super::firmware::{FirmwareUpdateScheduler, NoopFirmwareScheduler};
use super::location::LocationCollector;
use super::store::PairedDeviceStore;
use crate::config::SyncSettings;
use crate::error::CameraError;
use crate::hw::{CameraRepository, FoundCallback};
use crate::model::{
    Camera, Capability, DeviceConnectionState, GpsLocation, PairedDevice, SyncInfo,
    normalise_address,
};
use crate::session::CameraConnection;
use crate::zone::ZoneRules;

const LOCATION_QUEUE_DEPTH: usize = 4;
const DEFAULT_DEVICE_NAME: &str = "camsync";

/// Handle the coordinator keeps for each supervised session.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    camera: Camera,
    locations: mpsc::Sender<GpsLocation>,
}

impl DeviceHandle {
    #[must_use]
    pub fn camera(&self) -> &Camera {
        &self.camera
    }
}

/// Aggregate view over every tracked device.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct SyncSummary {
    pub tracked: usize,
    pub connected: usize,
    pub syncing: usize,
    pub errors: usize,
    pub unreachable: usize,
}

/// A connect attempt that has not yet been handed to a supervisor.
#[derive(Debug)]
struct ConnectAttempt {
    id: SupervisorId,
    cancel: CancellationToken,
    /// Fires once the attempt has released everything it opened.
    finished: CancellationToken,
}

impl ConnectAttempt {
    fn is(&self, id: SupervisorId) -> bool {
        self.id == id
    }
}

enum SupervisorExit {
    Stopped,
    LinkLost,
}

#[derive(Debug)]
struct CoordinatorState {
    repository: Arc<dyn CameraRepository>,
    store: Arc<dyn PairedDeviceStore>,
    collector: Arc<LocationCollector>,
    scheduler: Arc<dyn FirmwareUpdateScheduler>,
    zone: Arc<dyn ZoneRules>,
    settings: SyncSettings,
    device_name: String,
    connections: DeviceConnectionManager<DeviceHandle>,
    connecting: Mutex<HashMap<String, ConnectAttempt>>,
    states: watch::Sender<BTreeMap<String, DeviceConnectionState>>,
    shutdown: CancellationToken,
    fan_out: Mutex<Option<JoinHandle<()>>>,
    monitor: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

/// Drives connections to every enabled camera and fans GPS fixes out to them.
///
/// Each connected camera is owned by one supervising task. Failures surface
/// as per-device [`DeviceConnectionState`] values, never as errors from the
/// coordinator itself.
#[derive(Debug, Clone)]
pub struct SyncCoordinator {
    state: Arc<CoordinatorState>,
}

#[bon]
impl SyncCoordinator {
    #[builder]
    pub fn new(
        repository: Arc<dyn CameraRepository>,
        store: Arc<dyn PairedDeviceStore>,
        collector: Arc<LocationCollector>,
        zone: Arc<dyn ZoneRules>,
        #[builder(default = Arc::new(NoopFirmwareScheduler) as Arc<dyn FirmwareUpdateScheduler>)]
        scheduler: Arc<dyn FirmwareUpdateScheduler>,
        #[builder(default)] settings: SyncSettings,
        #[builder(into, default = DEFAULT_DEVICE_NAME.to_string())]
        device_name: String,
    ) -> Self {
        Self {
            state: Arc::new(CoordinatorState {
                repository,
                store,
                collector,
                scheduler,
                zone,
                settings,
                device_name,
                connections: DeviceConnectionManager::new(),
                connecting: Mutex::new(HashMap::new()),
                states: watch::Sender::new(BTreeMap::new()),
                shutdown: CancellationToken::new(),
                fan_out: Mutex::new(None),
                monitor: Mutex::new(None),
            }),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SyncCoordinator {
    /// Per-device states, keyed by uppercase address.
    #[must_use]
    pub fn device_states(&self) -> watch::Receiver<BTreeMap<String, DeviceConnectionState>> {
        self.state.states.subscribe()
    }

    #[must_use]
    pub fn state_of(&self, address: &str) -> DeviceConnectionState {
        self.state
            .states
            .borrow()
            .get(&normalise_address(address))
            .cloned()
            .unwrap_or(DeviceConnectionState::Disconnected)
    }

    #[must_use]
    pub fn connected_cameras(&self) -> Vec<Camera> {
        self.state
            .connections
            .sessions()
            .into_iter()
            .map(|(_, handle)| handle.camera)
            .collect()
    }

    #[must_use]
    pub fn summary(&self) -> SyncSummary {
        let states = self.state.states.borrow();
        states
            .values()
            .fold(SyncSummary::default(), |mut summary, state| {
                summary.tracked += 1;
                match state {
                    DeviceConnectionState::Connected => summary.connected += 1,
                    DeviceConnectionState::Syncing { .. } => {
                        summary.connected += 1;
                        summary.syncing += 1;
                    }
                    DeviceConnectionState::Error { .. } => summary.errors += 1,
                    DeviceConnectionState::Unreachable => summary.unreachable += 1,
                    _ => {}
                }
                summary
            })
    }

    /// True when no camera is connected and no connect attempt is running.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state.connections.is_empty() && lock(&self.state.connecting).is_empty()
    }

    fn is_tracked(&self, address: &str) -> bool {
        self.state.connections.contains(address) || lock(&self.state.connecting).contains_key(address)
    }

    fn set_state(&self, address: &str, next: DeviceConnectionState) {
        info!(address, state = %next, "device state changed");
        self.state.states.send_modify(|states| {
            states.insert(address.to_string(), next);
        });
    }

    /// Connects to `device`, runs initial setup, and starts supervising it.
    ///
    /// Concurrent calls for one address collapse into a single attempt;
    /// the losers return `false` immediately.
    #[instrument(skip_all, level = "info", fields(address = %normalise_address(&device.address)))]
    pub async fn start_device_sync(&self, device: PairedDevice) -> bool {
        let address = normalise_address(&device.address);
        let cancel = self.state.shutdown.child_token();
        let finished = CancellationToken::new();
        let _finished = finished.clone().drop_guard();
        let id = self.state.connections.next_supervisor_id();
        {
            let mut connecting = lock(&self.state.connecting);
            if connecting.contains_key(&address) || self.state.connections.contains(&address) {
                debug!("device already connecting or connected");
                return false;
            }
            connecting.insert(
                address.clone(),
                ConnectAttempt {
                    id,
                    cancel: cancel.clone(),
                    finished,
                },
            );
            self.set_state(&address, DeviceConnectionState::Searching);
        }

        let error = match self.connect_and_set_up(&device, &cancel).await {
            Ok(connection) => match self.supervise(connection, cancel, id) {
                Ok(()) => return true,
                Err(connection) => {
                    if let Err(error) = connection.disconnect().await {
                        debug!(%error, "disconnect after cancelled start failed");
                    }
                    CameraError::Cancelled {
                        operation: "connect",
                    }
                }
            },
            Err(error) => error,
        };

        let next = if error.is_cancelled() {
            DeviceConnectionState::Disconnected
        } else if error.is_timeout() {
            warn!(%error, "camera unreachable");
            DeviceConnectionState::Unreachable
        } else {
            warn!(%error, "camera connection failed");
            DeviceConnectionState::Error {
                message: error.to_string(),
                is_recoverable: !error.is_unknown_vendor(),
            }
        };

        let mut connecting = lock(&self.state.connecting);
        if connecting.get(&address).is_some_and(|attempt| attempt.is(id)) {
            connecting.remove(&address);
            self.state.collector.unregister_device(&address);
            self.set_state(&address, next);
        } else {
            debug!("attempt was stopped; the stopper owns cleanup");
        }
        true
    }

    async fn connect_and_set_up(
        &self,
        device: &PairedDevice,
        cancel: &CancellationToken,
    ) -> Result<CameraConnection, CameraError> {
        let address = normalise_address(&device.address);
        let connect_timeout = self.state.settings.connect_timeout;
        let deadline = Instant::now() + connect_timeout;
        let timed_out = || CameraError::Timeout {
            operation: "connect",
            after: connect_timeout,
        };

        let found = self.clone();
        let found_address = address.clone();
        let on_found: FoundCallback = Box::new(move |_camera: &Camera| {
            found.set_state(&found_address, DeviceConnectionState::Connecting);
        });

        let connected = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(CameraError::Cancelled { operation: "connect" }),
            connected = timeout_at(deadline, self.state.repository.connect(&address, Some(on_found))) => connected,
        };
        let mut connection = connected
            .map_err(|_elapsed| timed_out())??
            .with_cancellation(cancel.clone());

        self.set_state(&address, DeviceConnectionState::Connected);
        self.state.collector.register_device(&address);

        let setup = timeout_at(deadline, self.initial_setup(&mut connection, device)).await;
        let failure = if setup.is_err() {
            Some(timed_out())
        } else if cancel.is_cancelled() {
            Some(CameraError::Cancelled {
                operation: "initial setup",
            })
        } else {
            None
        };

        match failure {
            None => Ok(connection),
            Some(error) => {
                if let Err(disconnect_error) = connection.disconnect().await {
                    debug!(%disconnect_error, "disconnect after failed setup also failed");
                }
                Err(error)
            }
        }
    }

    /// Runs each supported setup step. A failing step is logged and skipped.
    #[instrument(skip_all, level = "debug", fields(address = connection.camera().address()))]
    async fn initial_setup(&self, connection: &mut CameraConnection, device: &PairedDevice) {
        let capabilities = connection.capabilities();
        let mut failed = Vec::new();

        if capabilities.supports(Capability::DeviceName)
            && let Err(error) = connection
                .set_paired_device_name(&self.state.device_name)
                .await
        {
            warn!(%error, "setting paired device name failed");
            failed.push(Capability::DeviceName);
        }

        if capabilities.supports(Capability::DateTimeSync) {
            let now = self.state.zone.zoned(OffsetDateTime::now_utc());
            if let Err(error) = connection.sync_date_time(&now).await {
                warn!(%error, "date/time sync failed");
                failed.push(Capability::DateTimeSync);
            }
        }

        if capabilities.supports(Capability::GeoTagging)
            && let Err(error) = connection.set_geo_tagging_enabled(true).await
        {
            warn!(%error, "enabling geo-tagging failed");
            failed.push(Capability::GeoTagging);
        }

        if capabilities.supports(Capability::FirmwareVersion) {
            match connection.read_firmware_version().await {
                Ok(version) => self.record_firmware(device, &version),
                Err(error) => {
                    warn!(%error, "firmware read failed");
                    failed.push(Capability::FirmwareVersion);
                }
            }
        }

        if failed.is_empty() {
            debug!("initial setup complete");
        } else {
            info!(?failed, "initial setup partially complete");
        }
    }

    /// Stores the firmware read during setup and schedules an update check
    /// when the last one is older than the configured interval.
    ///
    /// The notified flag is left alone here; it follows the cached latest
    /// version, which only the scheduler's check can change.
    fn record_firmware(&self, device: &PairedDevice, version: &str) {
        let store = &self.state.store;
        let address = normalise_address(&device.address);
        let Some(known) = store.get(&address) else {
            debug!(%address, "firmware read for a device that is not paired");
            return;
        };

        if let Err(error) = store.record_firmware_version(&address, version) {
            warn!(%error, "failed to record firmware version");
        }

        let now = OffsetDateTime::now_utc();
        let interval = self.state.settings.firmware_check_interval;
        let due = known
            .last_firmware_check_at
            .is_none_or(|checked| now - checked >= interval);
        if !due {
            debug!(%address, "firmware update check not due");
            return;
        }

        let mut current = known;
        current.firmware_version = Some(version.to_string());
        self.state.scheduler.schedule_update_check(&current);
        if let Err(error) = store.record_firmware_check(&address, now) {
            warn!(%error, "failed to record firmware check");
        }
    }

    /// Moves a set-up connection from `connecting` to its own supervising
    /// task in one step. Hands the connection back when the attempt was
    /// stopped meanwhile.
    fn supervise(
        &self,
        connection: CameraConnection,
        cancel: CancellationToken,
        id: SupervisorId,
    ) -> Result<(), CameraConnection> {
        let camera = connection.camera().clone();
        let address = normalise_address(camera.address());

        let mut connecting = lock(&self.state.connecting);
        let owned = connecting.get(&address).is_some_and(|attempt| attempt.is(id));
        if !owned || cancel.is_cancelled() {
            return Err(connection);
        }

        let (locations, queue) = mpsc::channel(LOCATION_QUEUE_DEPTH);
        let (ready, registered) = oneshot::channel();
        let coordinator = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            if registered.await.is_err() {
                return;
            }
            coordinator.run_device(connection, queue, token, id).await;
        });

        let handle = DeviceHandle { camera, locations };
        if let Some((_, displaced)) =
            self.state
                .connections
                .add_connection(&address, handle.clone(), Supervisor::new(id, cancel, task))
        {
            warn!(%address, "replacing an existing supervisor");
            tokio::spawn(displaced.shutdown());
        }
        connecting.remove(&address);
        self.set_state(&address, DeviceConnectionState::Syncing { last_sync: None });
        drop(connecting);
        let _ = ready.send(());

        self.ensure_fan_out();
        if let Some(latest) = self.state.collector.latest()
            && handle.locations.try_send(latest).is_err()
        {
            debug!(%address, "could not queue latest fix for new session");
        }
        Ok(())
    }

    #[instrument(skip_all, level = "debug", fields(address = connection.camera().address(), supervisor = %id))]
    async fn run_device(
        &self,
        mut connection: CameraConnection,
        mut queue: mpsc::Receiver<GpsLocation>,
        cancel: CancellationToken,
        id: SupervisorId,
    ) {
        let address = connection.camera().address().to_string();
        let mut link = connection.connection_state();

        let exit = if *link.borrow_and_update() {
            self.serve(&mut connection, &mut queue, &mut link, &cancel)
                .await
        } else {
            SupervisorExit::LinkLost
        };

        match exit {
            SupervisorExit::Stopped => {
                if let Err(error) = connection.disconnect().await {
                    debug!(%error, "disconnect during stop failed");
                }
            }
            SupervisorExit::LinkLost => {
                warn!("camera link dropped");
                let _connecting = lock(&self.state.connecting);
                if self
                    .state
                    .connections
                    .remove_connection_if_matches(&address, id)
                    .is_some()
                {
                    self.state.collector.unregister_device(&address);
                    self.set_state(&address, DeviceConnectionState::Disconnected);
                }
            }
        }
    }

    async fn serve(
        &self,
        connection: &mut CameraConnection,
        queue: &mut mpsc::Receiver<GpsLocation>,
        link: &mut watch::Receiver<bool>,
        cancel: &CancellationToken,
    ) -> SupervisorExit {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return SupervisorExit::Stopped,
                changed = link.changed() => {
                    if changed.is_err() || !*link.borrow_and_update() {
                        return SupervisorExit::LinkLost;
                    }
                }
                location = queue.recv() => match location {
                    Some(location) => self.push_location(connection, &location).await,
                    None => return SupervisorExit::Stopped,
                },
            }
        }
    }

    async fn push_location(&self, connection: &mut CameraConnection, location: &GpsLocation) {
        let address = connection.camera().address().to_string();
        match connection.sync_location(location).await {
            Ok(()) => {
                let synced_at = OffsetDateTime::now_utc();
                self.set_state(
                    &address,
                    DeviceConnectionState::Syncing {
                        last_sync: Some(SyncInfo {
                            synced_at,
                            location: *location,
                        }),
                    },
                );
                if let Err(error) = self.state.store.record_sync(&address, synced_at) {
                    debug!(%address, %error, "failed to record sync time");
                }
            }
            Err(error) if error.is_cancelled() => debug!(%address, "location sync cancelled"),
            Err(error) => warn!(%address, %error, "location sync failed; will retry on next fix"),
        }
    }

    /// Queues `location` for every supervised session. A full or closed
    /// queue only affects its own device.
    pub fn sync_location_to_all(&self, location: &GpsLocation) -> usize {
        let mut delivered = 0;
        for (address, handle) in self.state.connections.sessions() {
            match handle.locations.try_send(*location) {
                Ok(()) => delivered += 1,
                Err(error) => debug!(%address, %error, "location fix not queued"),
            }
        }
        delivered
    }

    fn ensure_fan_out(&self) {
        let mut fan_out = lock(&self.state.fan_out);
        if fan_out.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let coordinator = self.clone();
        let mut updates = self.state.collector.location_updates();
        updates.mark_unchanged();
        let shutdown = self.state.shutdown.clone();
        *fan_out = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let latest = *updates.borrow_and_update();
                        if let Some(location) = latest {
                            let delivered = coordinator.sync_location_to_all(&location);
                            debug!(delivered, "location fix fanned out");
                        }
                    }
                }
            }
        }));
    }

    /// Stops one device and waits until its session is torn down.
    ///
    /// An in-flight connect is cancelled and joined too, so nothing opened
    /// for `address` is still live once this returns.
    #[instrument(skip(self), level = "info")]
    pub async fn stop_device_sync(&self, address: &str) {
        let address = normalise_address(address);
        let attempt = lock(&self.state.connecting).remove(&address);
        if let Some(attempt) = attempt {
            attempt.cancel.cancel();
            attempt.finished.cancelled().await;
            debug!(supervisor = %attempt.id, "connect attempt joined");
        }
        if let Some((_, supervisor)) = self.state.connections.remove_connection(&address) {
            supervisor.shutdown().await;
        }

        let connecting = lock(&self.state.connecting);
        if connecting.contains_key(&address) || self.state.connections.contains(&address) {
            debug!("device restarted while stopping");
            return;
        }
        self.state.collector.unregister_device(&address);
        let tracked = self.state.states.borrow().contains_key(&address);
        if tracked {
            self.set_state(&address, DeviceConnectionState::Disconnected);
        }
    }

    /// Stops every tracked device.
    pub async fn stop_all_devices(&self) {
        let mut addresses: HashSet<String> = self.state.connections.addresses().into_iter().collect();
        addresses.extend(lock(&self.state.connecting).keys().cloned());
        for address in addresses {
            self.stop_device_sync(&address).await;
        }
    }

    /// Connects every enabled device that is not already tracked, skipping
    /// the staleness gate. Returns how many attempts were started.
    pub fn refresh_connections(&self) -> usize {
        let enabled = self.state.store.enabled_devices().borrow().clone();
        let mut started = 0;
        for device in enabled {
            if !self.is_tracked(&normalise_address(&device.address)) {
                self.spawn_start(device);
                started += 1;
            }
        }
        info!(started, "connections refreshed");
        started
    }

    fn spawn_start(&self, device: PairedDevice) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.start_device_sync(device).await;
        });
    }

    fn proactive_connect_due(&self, device: &PairedDevice) -> bool {
        let staleness = self.state.settings.proactive_connect_staleness;
        device
            .last_synced_at
            .is_none_or(|synced| OffsetDateTime::now_utc() - synced >= staleness)
    }

    /// Starts following the enabled-device list and presence sightings.
    ///
    /// On startup every enabled device that has never synced, or synced
    /// longer ago than the staleness threshold, is connected once without
    /// waiting for a sighting.
    pub fn start_background_monitoring(&self) {
        let mut monitor = lock(&self.state.monitor);
        if monitor.is_some() {
            debug!("background monitoring already running");
            return;
        }

        let cancel = self.state.shutdown.child_token();
        let coordinator = self.clone();
        let enabled = self.state.store.enabled_devices();
        let presence = self.state.repository.presence();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            coordinator.monitor(enabled, presence, token).await;
        });
        *monitor = Some((cancel, task));
        info!("background monitoring started");
    }

    /// Stops the monitor started by [`Self::start_background_monitoring`].
    pub async fn stop_background_monitoring(&self) {
        let monitor = lock(&self.state.monitor).take();
        if let Some((cancel, task)) = monitor {
            cancel.cancel();
            let _ = task.await;
            info!("background monitoring stopped");
        }
    }

    async fn monitor(
        &self,
        mut enabled: watch::Receiver<Vec<PairedDevice>>,
        mut presence: broadcast::Receiver<String>,
        cancel: CancellationToken,
    ) {
        let initial = enabled.borrow_and_update().clone();
        let mut known: HashSet<String> = HashSet::new();
        self.reconcile(&initial, &mut known, true).await;
        let mut presence_open = true;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                changed = enabled.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let devices = enabled.borrow_and_update().clone();
                    self.reconcile(&devices, &mut known, false).await;
                }
                sighting = presence.recv(), if presence_open => match sighting {
                    Ok(address) => {
                        let devices = enabled.borrow().clone();
                        self.on_presence(&address, &devices);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "presence sightings dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => presence_open = false,
                },
            }
        }
    }

    /// Disconnects devices that are no longer enabled and connects newly
    /// enabled ones. `initial` applies the proactive-connect policy instead.
    async fn reconcile(&self, devices: &[PairedDevice], known: &mut HashSet<String>, initial: bool) {
        let enabled: HashMap<String, &PairedDevice> = devices
            .iter()
            .map(|device| (normalise_address(&device.address), device))
            .collect();

        let mut tracked: HashSet<String> = self.state.connections.addresses().into_iter().collect();
        tracked.extend(lock(&self.state.connecting).keys().cloned());
        let disabled: Vec<String> = tracked
            .into_iter()
            .filter(|address| !enabled.contains_key(address))
            .collect();
        for address in disabled {
            info!(%address, "device disabled; disconnecting");
            self.stop_device_sync(&address).await;
        }

        for (address, device) in &enabled {
            let newly_enabled = !known.contains(address);
            let eligible = if initial {
                self.proactive_connect_due(device)
            } else {
                newly_enabled
            };
            if eligible && !self.is_tracked(address) {
                debug!(%address, initial, "connecting enabled device");
                self.spawn_start((*device).clone());
            }
        }

        *known = enabled.into_keys().collect();
    }

    fn on_presence(&self, address: &str, enabled: &[PairedDevice]) {
        let address = normalise_address(address);
        let Some(device) = enabled
            .iter()
            .find(|device| normalise_address(&device.address) == address)
        else {
            return;
        };
        if self.is_tracked(&address) {
            return;
        }
        info!(%address, "enabled camera sighted; connecting");
        self.spawn_start(device.clone());
    }

    /// Registers the OS-level wake-on-advertisement scan.
    ///
    /// # Errors
    ///
    /// Returns the repository's error.
    pub async fn start_passive_scan(&self) -> Result<(), CameraError> {
        self.state.repository.start_passive_scan().await
    }

    /// # Errors
    ///
    /// Returns the repository's error.
    pub async fn stop_passive_scan(&self) -> Result<(), CameraError> {
        self.state.repository.stop_passive_scan().await
    }

    /// Stops monitoring and every device, then ends background tasks.
    pub async fn shutdown(&self) {
        self.stop_background_monitoring().await;
        self.stop_all_devices().await;
        self.state.shutdown.cancel();
        let fan_out = lock(&self.state.fan_out).take();
        if let Some(task) = fan_out {
            let _ = task.await;
        }
    }
}
