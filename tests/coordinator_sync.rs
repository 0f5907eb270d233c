use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use time::OffsetDateTime;
use time::macros::datetime;
use tokio::time::sleep;

use camsync::{
    Advertisement, CameraVendor, ChannelLocationSource, ConnectionFactory, DeviceConnectionState,
    FakeCamera, FakeCameraRepository, FakeGatt, FirmwareUpdateScheduler, FixedZone, GpsLocation,
    InMemoryPairedDeviceStore, LocationCollector, PairedDevice, PairedDeviceStore, RicohVendor,
    SyncCoordinator, SyncInfo, SyncSettings, VendorId, VendorRegistry, sony_uuids,
};

const RICOH: &str = "AA:00:00:00:00:01";
const SONY: &str = "D0:00:00:00:00:02";
const HEADPHONES: &str = "E0:00:00:00:00:03";
const SONY_COMPANY_ID: u16 = 0x012D;

#[derive(Debug, Default)]
struct RecordingScheduler {
    checked: Mutex<Vec<String>>,
}

impl RecordingScheduler {
    fn checked(&self) -> Vec<String> {
        self.checked.lock().expect("scheduler lock").clone()
    }
}

impl FirmwareUpdateScheduler for RecordingScheduler {
    fn schedule_update_check(&self, device: &PairedDevice) {
        self.checked
            .lock()
            .expect("scheduler lock")
            .push(device.address.clone());
    }
}

struct Harness {
    repository: Arc<FakeCameraRepository>,
    store: Arc<InMemoryPairedDeviceStore>,
    source: ChannelLocationSource,
    collector: Arc<LocationCollector>,
    scheduler: Arc<RecordingScheduler>,
    coordinator: SyncCoordinator,
}

impl Harness {
    fn new(cameras: Vec<FakeCamera>, devices: Vec<PairedDevice>) -> Self {
        let zone = Arc::new(FixedZone::utc());
        let repository = Arc::new(FakeCameraRepository::new(ConnectionFactory::new(
            VendorRegistry::with_default_vendors(),
            zone.clone(),
            SyncSettings::default(),
        )));
        for camera in cameras {
            repository.add_camera(camera);
        }
        let store = Arc::new(InMemoryPairedDeviceStore::new(devices));
        let source = ChannelLocationSource::new();
        let collector = Arc::new(LocationCollector::new(Arc::new(source.clone())));
        let scheduler = Arc::new(RecordingScheduler::default());
        let coordinator = SyncCoordinator::builder()
            .repository(repository.clone())
            .store(store.clone())
            .collector(collector.clone())
            .zone(zone)
            .scheduler(scheduler.clone())
            .build();

        Self {
            repository,
            store,
            source,
            collector,
            scheduler,
            coordinator,
        }
    }
}

fn ricoh_camera(gatt: &FakeGatt) -> FakeCamera {
    FakeCamera::builder()
        .advertisement(Advertisement::new(RICOH, Some("GR IIIx".to_string())))
        .gatt(gatt.clone())
        .build()
}

fn sony_camera(gatt: &FakeGatt) -> FakeCamera {
    FakeCamera::builder()
        .advertisement(
            Advertisement::new(SONY, Some("ILCE-7M4".to_string()))
                .with_manufacturer_data(SONY_COMPANY_ID, vec![0x03, 0x00, 0x41, 0x00]),
        )
        .gatt(gatt.clone())
        .build()
}

fn ricoh_device() -> PairedDevice {
    PairedDevice::new(RICOH, "GR IIIx", VendorId::Ricoh)
}

fn sony_device() -> PairedDevice {
    PairedDevice::new(SONY, "ILCE-7M4", VendorId::Sony)
}

fn fix() -> GpsLocation {
    GpsLocation::new(51.500_7, -0.124_6, 12.0, datetime!(2025-03-15 12:00 UTC))
}

fn last_synced(state: &DeviceConnectionState) -> Option<GpsLocation> {
    match state {
        DeviceConnectionState::Syncing {
            last_sync: Some(SyncInfo { location, .. }),
        } => Some(*location),
        _ => None,
    }
}

async fn settle() {
    sleep(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn connected_ricoh_gets_initial_setup_and_syncs() {
    let gatt = FakeGatt::ricoh(RICOH);
    let harness = Harness::new(vec![ricoh_camera(&gatt)], vec![ricoh_device()]);
    let layout = RicohVendor::default().gatt_spec().clone();

    assert_eq!(true, harness.coordinator.start_device_sync(ricoh_device()).await);

    assert_eq!(
        DeviceConnectionState::Syncing { last_sync: None },
        harness.coordinator.state_of(RICOH)
    );
    let geo_tagging = layout.geo_tagging.expect("ricoh geo-tagging").characteristic;
    let device_name = layout.device_name.expect("ricoh device name").characteristic;
    assert_eq!(vec![vec![0x01]], gatt.writes_to(geo_tagging));
    assert_eq!(1, gatt.writes_to(device_name).len());
    assert_eq!(
        Some("1.10".to_string()),
        harness.store.get(RICOH).and_then(|device| device.firmware_version)
    );
    assert_eq!(1, harness.collector.registered_count());
}

#[tokio::test(start_paused = true)]
async fn concurrent_starts_collapse_into_one_connect() {
    let gatt = FakeGatt::ricoh(RICOH);
    let camera = FakeCamera::builder()
        .advertisement(Advertisement::new(RICOH, Some("GR IIIx".to_string())))
        .gatt(gatt)
        .connect_delay(Duration::from_secs(5))
        .build();
    let harness = Harness::new(vec![camera], vec![ricoh_device()]);

    let starts: Vec<_> = (0..5)
        .map(|_| {
            let coordinator = harness.coordinator.clone();
            tokio::spawn(async move { coordinator.start_device_sync(ricoh_device()).await })
        })
        .collect();
    let mut winners = 0;
    for start in starts {
        if start.await.expect("start task should not panic") {
            winners += 1;
        }
    }

    assert_eq!(1, winners);
    assert_eq!(1, harness.repository.connect_attempts(RICOH));
    assert_eq!(1, harness.coordinator.connected_cameras().len());
}

#[tokio::test(start_paused = true)]
async fn never_synced_device_is_connected_proactively_once() {
    let gatt = FakeGatt::ricoh(RICOH);
    let harness = Harness::new(vec![ricoh_camera(&gatt)], vec![ricoh_device()]);

    harness.coordinator.start_background_monitoring();
    settle().await;

    assert_eq!(1, harness.repository.connect_attempts(RICOH));
    assert_eq!(true, harness.coordinator.state_of(RICOH).is_connected());
    harness.coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn recently_synced_device_waits_for_a_sighting() {
    let gatt = FakeGatt::ricoh(RICOH);
    let mut device = ricoh_device();
    device.last_synced_at = Some(OffsetDateTime::now_utc() - time::Duration::minutes(5));
    let harness = Harness::new(vec![ricoh_camera(&gatt)], vec![device]);

    harness.coordinator.start_background_monitoring();
    settle().await;
    assert_eq!(0, harness.repository.connect_attempts(RICOH));

    harness.repository.announce(RICOH);
    settle().await;

    assert_eq!(1, harness.repository.connect_attempts(RICOH));
    assert_eq!(true, harness.coordinator.state_of(RICOH).is_connected());
    harness.coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn one_fix_reaches_every_syncing_camera() {
    let ricoh = FakeGatt::ricoh(RICOH);
    let sony = FakeGatt::sony(SONY, true);
    let harness = Harness::new(
        vec![ricoh_camera(&ricoh), sony_camera(&sony)],
        vec![ricoh_device(), sony_device()],
    );
    harness.coordinator.start_device_sync(ricoh_device()).await;
    harness.coordinator.start_device_sync(sony_device()).await;
    settle().await;

    assert_eq!(1, harness.source.publish(fix()));
    settle().await;

    assert_eq!(Some(fix()), last_synced(&harness.coordinator.state_of(RICOH)));
    assert_eq!(Some(fix()), last_synced(&harness.coordinator.state_of(SONY)));
    assert_eq!(1, sony.writes_to(sony_uuids::LOCATION).len());
    assert_eq!(
        true,
        harness
            .store
            .get(SONY)
            .is_some_and(|device| device.last_synced_at.is_some())
    );
    harness.coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn slow_connect_becomes_unreachable() {
    let camera = FakeCamera::builder()
        .advertisement(Advertisement::new(RICOH, Some("GR IIIx".to_string())))
        .gatt(FakeGatt::ricoh(RICOH))
        .connect_delay(Duration::from_secs(120))
        .build();
    let harness = Harness::new(vec![camera], vec![ricoh_device()]);

    harness.coordinator.start_device_sync(ricoh_device()).await;

    assert_eq!(
        DeviceConnectionState::Unreachable,
        harness.coordinator.state_of(RICOH)
    );
    assert_eq!(0, harness.collector.registered_count());
}

#[tokio::test(start_paused = true)]
async fn silent_bonded_camera_becomes_unreachable() {
    let camera = FakeCamera::builder()
        .advertisement(Advertisement::new(RICOH, Some("GR IIIx".to_string())))
        .gatt(FakeGatt::ricoh(RICOH))
        .advertising(false)
        .build();
    let harness = Harness::new(vec![camera], vec![ricoh_device()]);

    harness.coordinator.start_device_sync(ricoh_device()).await;

    assert_eq!(
        DeviceConnectionState::Unreachable,
        harness.coordinator.state_of(RICOH)
    );
}

#[tokio::test(start_paused = true)]
async fn unrecognised_advertisement_is_a_permanent_error() {
    let camera = FakeCamera::builder()
        .advertisement(Advertisement::new(HEADPHONES, Some("WH-1000XM5".to_string())))
        .gatt(FakeGatt::ricoh(HEADPHONES))
        .build();
    let device = PairedDevice::new(HEADPHONES, "WH-1000XM5", VendorId::Sony);
    let harness = Harness::new(vec![camera], vec![device.clone()]);

    harness.coordinator.start_device_sync(device).await;

    assert_matches!(
        harness.coordinator.state_of(HEADPHONES),
        DeviceConnectionState::Error {
            is_recoverable: false,
            ..
        }
    );
}

#[tokio::test(start_paused = true)]
async fn dropped_link_releases_the_device() {
    let gatt = FakeGatt::ricoh(RICOH);
    let harness = Harness::new(vec![ricoh_camera(&gatt)], vec![ricoh_device()]);
    harness.coordinator.start_device_sync(ricoh_device()).await;

    gatt.drop_link();
    settle().await;

    assert_eq!(
        DeviceConnectionState::Disconnected,
        harness.coordinator.state_of(RICOH)
    );
    assert_eq!(0, harness.collector.registered_count());
    assert_eq!(true, harness.coordinator.is_idle());
}

#[tokio::test(start_paused = true)]
async fn stopping_mid_connect_leaves_the_device_disconnected() {
    let camera = FakeCamera::builder()
        .advertisement(Advertisement::new(RICOH, Some("GR IIIx".to_string())))
        .gatt(FakeGatt::ricoh(RICOH))
        .connect_delay(Duration::from_secs(10))
        .build();
    let harness = Harness::new(vec![camera], vec![ricoh_device()]);
    let coordinator = harness.coordinator.clone();
    let start = tokio::spawn(async move { coordinator.start_device_sync(ricoh_device()).await });
    sleep(Duration::from_secs(1)).await;

    harness.coordinator.stop_device_sync(RICOH).await;

    assert_eq!(
        DeviceConnectionState::Disconnected,
        harness.coordinator.state_of(RICOH)
    );
    assert_eq!(true, harness.coordinator.is_idle());
    assert_eq!(true, start.is_finished());
    assert_eq!(true, start.await.expect("start task should not panic"));
}

fn ricoh_stalled_in_setup() -> (FakeGatt, FakeCamera) {
    let gatt = FakeGatt::ricoh(RICOH);
    let device_name = RicohVendor::default()
        .gatt_spec()
        .device_name
        .expect("ricoh exposes the paired device name")
        .characteristic;
    gatt.hang(device_name);
    let camera = ricoh_camera(&gatt);
    (gatt, camera)
}

#[tokio::test(start_paused = true)]
async fn stopping_during_setup_tears_the_session_down_before_returning() {
    let (gatt, camera) = ricoh_stalled_in_setup();
    let harness = Harness::new(vec![camera], vec![ricoh_device()]);
    let coordinator = harness.coordinator.clone();
    tokio::spawn(async move { coordinator.start_device_sync(ricoh_device()).await });
    settle().await;
    assert_eq!(
        DeviceConnectionState::Connected,
        harness.coordinator.state_of(RICOH)
    );
    assert_eq!(1, harness.collector.registered_count());

    harness.coordinator.stop_device_sync(RICOH).await;

    assert_eq!(1, gatt.disconnect_count());
    assert_eq!(
        DeviceConnectionState::Disconnected,
        harness.coordinator.state_of(RICOH)
    );
    assert_eq!(0, harness.collector.registered_count());
    assert_eq!(false, *harness.collector.is_collecting().borrow());
}

#[tokio::test(start_paused = true)]
async fn restart_after_stop_keeps_the_new_session_tracked() {
    let (_, stalled) = ricoh_stalled_in_setup();
    let harness = Harness::new(vec![stalled], vec![ricoh_device()]);
    let coordinator = harness.coordinator.clone();
    tokio::spawn(async move { coordinator.start_device_sync(ricoh_device()).await });
    settle().await;
    harness.coordinator.stop_device_sync(RICOH).await;

    let gatt = FakeGatt::ricoh(RICOH);
    harness.repository.add_camera(ricoh_camera(&gatt));
    assert_eq!(true, harness.coordinator.start_device_sync(ricoh_device()).await);
    settle().await;

    assert_eq!(
        DeviceConnectionState::Syncing { last_sync: None },
        harness.coordinator.state_of(RICOH)
    );
    assert_eq!(1, harness.collector.registered_count());
    assert_eq!(true, *harness.collector.is_collecting().borrow());
    assert_eq!(1, harness.coordinator.connected_cameras().len());
    assert_eq!(0, gatt.disconnect_count());

    assert_eq!(1, harness.source.publish(fix()));
    settle().await;
    assert_eq!(Some(fix()), last_synced(&harness.coordinator.state_of(RICOH)));
    harness.coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn disabling_one_device_leaves_the_other_syncing() -> anyhow::Result<()> {
    let ricoh = FakeGatt::ricoh(RICOH);
    let sony = FakeGatt::sony(SONY, true);
    let harness = Harness::new(
        vec![ricoh_camera(&ricoh), sony_camera(&sony)],
        vec![ricoh_device(), sony_device()],
    );
    harness.coordinator.start_background_monitoring();
    settle().await;
    assert_eq!(2, harness.coordinator.summary().syncing);

    harness.store.set_enabled(RICOH, false)?;
    settle().await;

    assert_eq!(1, ricoh.disconnect_count());
    assert_eq!(
        DeviceConnectionState::Disconnected,
        harness.coordinator.state_of(RICOH)
    );
    assert_eq!(0, sony.disconnect_count());
    assert_eq!(true, harness.coordinator.state_of(SONY).is_connected());
    harness.coordinator.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn firmware_check_runs_at_most_once_a_day() {
    let gatt = FakeGatt::ricoh(RICOH);
    let mut recent = ricoh_device();
    recent.last_firmware_check_at = Some(OffsetDateTime::now_utc() - time::Duration::hours(1));
    let harness = Harness::new(vec![ricoh_camera(&gatt)], vec![recent]);

    harness.coordinator.start_device_sync(ricoh_device()).await;
    harness.coordinator.stop_device_sync(RICOH).await;
    assert_eq!(Vec::<String>::new(), harness.scheduler.checked());

    let mut stale = ricoh_device();
    stale.last_firmware_check_at = Some(OffsetDateTime::now_utc() - time::Duration::hours(25));
    harness
        .store
        .upsert(stale)
        .expect("in-memory upsert cannot fail");
    harness.coordinator.start_device_sync(ricoh_device()).await;

    assert_eq!(vec![RICOH.to_string()], harness.scheduler.checked());
    let checked_at = harness
        .store
        .get(RICOH)
        .and_then(|device| device.last_firmware_check_at)
        .expect("check time should be recorded");
    assert_eq!(
        true,
        OffsetDateTime::now_utc() - checked_at < time::Duration::minutes(1)
    );
}

#[tokio::test(start_paused = true)]
async fn installed_firmware_change_keeps_the_update_notification() {
    let gatt = FakeGatt::ricoh(RICOH);
    let mut notified = ricoh_device();
    notified.firmware_version = Some("1.00".to_string());
    notified.latest_firmware_version = Some("1.50".to_string());
    notified.firmware_update_notified = true;
    notified.last_firmware_check_at = Some(OffsetDateTime::now_utc() - time::Duration::hours(1));
    let harness = Harness::new(vec![ricoh_camera(&gatt)], vec![notified]);

    harness.coordinator.start_device_sync(ricoh_device()).await;

    let device = harness.store.get(RICOH).expect("device should stay paired");
    assert_eq!(Some("1.10".to_string()), device.firmware_version);
    assert_eq!(true, device.firmware_update_notified);
}

#[tokio::test(start_paused = true)]
async fn stopping_a_syncing_device_disconnects_its_session() {
    let gatt = FakeGatt::sony(SONY, true);
    let harness = Harness::new(vec![sony_camera(&gatt)], vec![sony_device()]);
    harness.coordinator.start_device_sync(sony_device()).await;
    harness.source.publish(fix());
    settle().await;

    harness.coordinator.stop_device_sync(SONY).await;

    assert_eq!(1, gatt.disconnect_count());
    assert_eq!(vec![vec![0x01], vec![0x00]], gatt.writes_to(sony_uuids::LOCK));
    assert_eq!(
        DeviceConnectionState::Disconnected,
        harness.coordinator.state_of(SONY)
    );
    assert_eq!(false, *harness.collector.is_collecting().borrow());
}

#[tokio::test(start_paused = true)]
async fn refresh_connects_recently_synced_devices_without_a_sighting() {
    let gatt = FakeGatt::ricoh(RICOH);
    let mut device = ricoh_device();
    device.last_synced_at = Some(OffsetDateTime::now_utc() - time::Duration::minutes(5));
    let harness = Harness::new(vec![ricoh_camera(&gatt)], vec![device]);

    assert_eq!(1, harness.coordinator.refresh_connections());
    settle().await;

    assert_eq!(1, harness.repository.connect_attempts(RICOH));
    assert_eq!(0, harness.coordinator.refresh_connections());
    harness.coordinator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_starts_on_worker_threads_connect_once() {
    for _ in 0..20 {
        let harness = Harness::new(
            vec![ricoh_camera(&FakeGatt::ricoh(RICOH))],
            vec![ricoh_device()],
        );
        let starts: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = harness.coordinator.clone();
                tokio::spawn(async move { coordinator.start_device_sync(ricoh_device()).await })
            })
            .collect();

        let mut winners = 0;
        for start in starts {
            if start.await.expect("start task should not panic") {
                winners += 1;
            }
        }

        assert_eq!(1, winners);
        assert_eq!(1, harness.repository.connect_attempts(RICOH));
        harness.coordinator.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_start_and_stop_agree_on_liveness() {
    for _ in 0..20 {
        let harness = Harness::new(
            vec![ricoh_camera(&FakeGatt::ricoh(RICOH))],
            vec![ricoh_device()],
        );
        let starter = harness.coordinator.clone();
        let start = tokio::spawn(async move { starter.start_device_sync(ricoh_device()).await });
        let stopper = harness.coordinator.clone();
        let stop = tokio::spawn(async move { stopper.stop_device_sync(RICOH).await });
        start.await.expect("start task should not panic");
        stop.await.expect("stop task should not panic");

        let live = !harness.coordinator.connected_cameras().is_empty();
        assert_eq!(live, harness.coordinator.state_of(RICOH).is_connected());
        assert_eq!(usize::from(live), harness.collector.registered_count());
        harness.coordinator.shutdown().await;
    }
}
