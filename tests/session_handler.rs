use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use rstest::rstest;
use time::macros::datetime;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use camsync::{
    Advertisement, CameraConnection, CameraError, CameraRepository, CameraVendor, Capability,
    ConnectionFactory, FakeCamera, FakeCameraRepository, FakeGatt, FixedZone, GpsLocation,
    RicohVendor, SyncSettings, VendorId, VendorRegistry, sony_uuids,
};

const RICOH: &str = "AA:00:00:00:00:01";
const SONY: &str = "D0:00:00:00:00:02";
const SONY_COMPANY_ID: u16 = 0x012D;

fn repository() -> FakeCameraRepository {
    FakeCameraRepository::new(ConnectionFactory::new(
        VendorRegistry::with_default_vendors(),
        Arc::new(FixedZone::utc()),
        SyncSettings::default(),
    ))
}

fn fix() -> GpsLocation {
    GpsLocation::new(35.681_2, 139.767_1, 40.0, datetime!(2025-03-15 03:00 UTC))
}

async fn connect_sony(protocol_version: u16, unlock: bool) -> (CameraConnection, FakeGatt) {
    let repository = repository();
    let gatt = FakeGatt::sony(SONY, unlock);
    let [low, high] = protocol_version.to_le_bytes();
    repository.add_camera(
        FakeCamera::builder()
            .advertisement(
                Advertisement::new(SONY, Some("ILCE-7M4".to_string()))
                    .with_manufacturer_data(SONY_COMPANY_ID, vec![0x03, 0x00, low, high]),
            )
            .gatt(gatt.clone())
            .build(),
    );
    let connection = repository
        .connect(SONY, None)
        .await
        .expect("fake sony camera should connect");
    (connection, gatt)
}

async fn connect_ricoh() -> (CameraConnection, FakeGatt) {
    let repository = repository();
    let gatt = FakeGatt::ricoh(RICOH);
    repository.add_camera(
        FakeCamera::builder()
            .advertisement(Advertisement::new(RICOH, Some("GR IIIx".to_string())))
            .gatt(gatt.clone())
            .build(),
    );
    let connection = repository
        .connect(RICOH, None)
        .await
        .expect("fake ricoh camera should connect");
    (connection, gatt)
}

fn location_session_writes(gatt: &FakeGatt) -> Vec<&'static str> {
    gatt.operations()
        .into_iter()
        .filter_map(|operation| match operation {
            camsync::GattOperation::Write { characteristic, .. } => {
                if characteristic == sony_uuids::LOCK {
                    Some("lock")
                } else if characteristic == sony_uuids::ENABLE {
                    Some("enable")
                } else if characteristic == sony_uuids::LOCATION {
                    Some("location")
                } else {
                    None
                }
            }
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn sony_rejects_geo_tagging_without_touching_gatt() {
    let (connection, gatt) = connect_sony(65, true).await;

    let result = connection.set_geo_tagging_enabled(true).await;

    assert_matches!(
        result,
        Err(CameraError::UnsupportedCapability {
            vendor: VendorId::Sony,
            capability: Capability::GeoTagging,
        })
    );
    assert_eq!(0, gatt.write_count());
}

#[derive(Debug, Clone, Copy)]
enum SonyGatedCall {
    ReadFirmwareVersion,
    ReadHardwareRevision,
    SetPairedDeviceName,
    ReadGeoTagging,
}

async fn call_gated(
    connection: &CameraConnection,
    call: SonyGatedCall,
) -> Result<(), CameraError> {
    match call {
        SonyGatedCall::ReadFirmwareVersion => connection.read_firmware_version().await.map(drop),
        SonyGatedCall::ReadHardwareRevision => connection.read_hardware_revision().await.map(drop),
        SonyGatedCall::SetPairedDeviceName => connection.set_paired_device_name("camsync").await,
        SonyGatedCall::ReadGeoTagging => connection.is_geo_tagging_enabled().await.map(drop),
    }
}

#[rstest]
#[case::firmware_version(SonyGatedCall::ReadFirmwareVersion, Capability::FirmwareVersion)]
#[case::hardware_revision(SonyGatedCall::ReadHardwareRevision, Capability::HardwareRevision)]
#[case::device_name(SonyGatedCall::SetPairedDeviceName, Capability::DeviceName)]
#[case::geo_tagging_read(SonyGatedCall::ReadGeoTagging, Capability::GeoTagging)]
#[tokio::test(start_paused = true)]
async fn sony_gated_operations_fail_without_gatt_traffic(
    #[case] call: SonyGatedCall,
    #[case] expected: Capability,
) {
    let (connection, gatt) = connect_sony(65, true).await;
    let before = gatt.operations().len();

    let error = call_gated(&connection, call)
        .await
        .expect_err("sony does not expose this capability");

    assert_matches!(
        &error,
        CameraError::UnsupportedCapability {
            vendor: VendorId::Sony,
            capability,
        } if *capability == expected
    );
    let message = error.to_string();
    assert_eq!(true, message.contains("sony"), "{message}");
    assert_eq!(true, message.contains(&expected.to_string()), "{message}");
    assert_eq!(before, gatt.operations().len());
}

#[tokio::test(start_paused = true)]
async fn geo_tagging_write_is_skipped_when_already_enabled() -> anyhow::Result<()> {
    let (connection, gatt) = connect_ricoh().await;
    let geo_tagging = RicohVendor::default()
        .gatt_spec()
        .geo_tagging
        .expect("ricoh exposes geo-tagging")
        .characteristic;

    connection.set_geo_tagging_enabled(true).await?;
    connection.set_geo_tagging_enabled(true).await?;

    assert_eq!(vec![vec![0x01]], gatt.writes_to(geo_tagging));
    assert_eq!(true, connection.is_geo_tagging_enabled().await?);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn sony_unlocks_before_every_location_write() -> anyhow::Result<()> {
    let (mut connection, gatt) = connect_sony(65, true).await;

    connection.sync_location(&fix()).await?;
    connection.sync_location(&fix()).await?;

    assert_eq!(
        vec!["lock", "enable", "location", "lock", "enable", "location"],
        location_session_writes(&gatt)
    );
    assert_eq!(vec![vec![0x01], vec![0x01]], gatt.writes_to(sony_uuids::LOCK));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn legacy_sony_protocol_writes_location_directly() -> anyhow::Result<()> {
    let (mut connection, gatt) = connect_sony(64, true).await;

    connection.sync_location(&fix()).await?;

    assert_eq!(vec!["location"], location_session_writes(&gatt));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn sony_without_unlock_characteristics_skips_the_handshake() -> anyhow::Result<()> {
    let (mut connection, gatt) = connect_sony(65, false).await;

    connection.sync_location(&fix()).await?;

    assert_eq!(vec!["location"], location_session_writes(&gatt));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn location_write_gives_up_after_three_attempts() {
    let (mut connection, gatt) = connect_sony(65, true).await;
    gatt.fail_writes(sony_uuids::LOCATION, 10);
    let started = Instant::now();

    let result = connection.sync_location(&fix()).await;

    assert_matches!(
        result,
        Err(CameraError::Io {
            operation: "location write",
            attempts: 3,
            ..
        })
    );
    assert_eq!(3, gatt.writes_to(sony_uuids::LOCATION).len());
    let elapsed = started.elapsed();
    assert_eq!(
        true,
        elapsed >= Duration::from_millis(1_000) && elapsed < Duration::from_millis(1_100),
        "two retry delays expected, waited {elapsed:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn location_write_recovers_on_the_last_attempt() -> anyhow::Result<()> {
    let (mut connection, gatt) = connect_sony(65, true).await;
    gatt.fail_writes(sony_uuids::LOCATION, 2);

    connection.sync_location(&fix()).await?;

    assert_eq!(3, gatt.writes_to(sony_uuids::LOCATION).len());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cancelling_the_owner_interrupts_the_retry_delay() -> anyhow::Result<()> {
    let (connection, gatt) = connect_sony(65, true).await;
    gatt.fail_writes(sony_uuids::LOCATION, 10);
    let cancel = CancellationToken::new();
    let mut connection = connection.with_cancellation(cancel.clone());

    let sync = tokio::spawn(async move { connection.sync_location(&fix()).await });
    sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    let result = sync.await?;

    assert_matches!(result, Err(CameraError::Cancelled { .. }));
    assert_eq!(1, gatt.writes_to(sony_uuids::LOCATION).len());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn disconnect_releases_an_active_location_session() -> anyhow::Result<()> {
    let (mut connection, gatt) = connect_sony(65, true).await;
    connection.sync_location(&fix()).await?;

    connection.disconnect().await?;

    assert_eq!(vec![vec![0x01], vec![0x00]], gatt.writes_to(sony_uuids::ENABLE));
    assert_eq!(vec![vec![0x01], vec![0x00]], gatt.writes_to(sony_uuids::LOCK));
    assert_eq!(1, gatt.disconnect_count());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn hanging_write_times_out() {
    let repository = FakeCameraRepository::new(ConnectionFactory::new(
        VendorRegistry::with_default_vendors(),
        Arc::new(FixedZone::utc()),
        SyncSettings::builder()
            .write_timeout(Duration::from_secs(2))
            .build(),
    ));
    let gatt = FakeGatt::ricoh(RICOH);
    repository.add_camera(
        FakeCamera::builder()
            .advertisement(Advertisement::new(RICOH, Some("GR III".to_string())))
            .gatt(gatt.clone())
            .build(),
    );
    let connection = repository
        .connect(RICOH, None)
        .await
        .expect("fake ricoh camera should connect");
    let device_name = RicohVendor::default()
        .gatt_spec()
        .device_name
        .expect("ricoh exposes the paired device name")
        .characteristic;
    gatt.hang(device_name);

    let result = connection.set_paired_device_name("camsync").await;

    assert_matches!(
        result,
        Err(CameraError::Timeout { after, .. }) if after == Duration::from_secs(2)
    );
}
