use std::fs;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use insta::assert_snapshot;
use pretty_assertions::assert_eq;
use serde_json::Value;
use tempfile::tempdir;

use camsync::{
    AddressArgs, AppContext, Command, ConnectionFactory, FirmwareArgs, FixedZone,
    InMemoryPairedDeviceStore, OutputFormat, PairArgs, PairedDevice, PairedDeviceStore, ScanArgs,
    StoreError, SyncSettings, VendorId, VendorRegistry, demo_repository,
};

const RICOH: &str = "AA:00:00:00:00:01";
const SONY: &str = "D0:00:00:00:00:02";

#[derive(Debug, Default)]
struct FakeTerminalClient;

impl camsync::TerminalClient for FakeTerminalClient {
    fn stdout_is_terminal(&self) -> bool {
        false
    }

    fn stderr_is_terminal(&self) -> bool {
        false
    }
}

fn fake_context(store: Arc<InMemoryPairedDeviceStore>) -> AppContext {
    let zone = Arc::new(FixedZone::utc());
    let factory = ConnectionFactory::new(
        VendorRegistry::with_default_vendors(),
        zone.clone(),
        SyncSettings::default(),
    );
    AppContext::builder()
        .repository(Arc::new(demo_repository(factory)))
        .store(store)
        .zone(zone)
        .build()
}

async fn run_command(
    context: AppContext,
    command: Command,
    format: OutputFormat,
) -> anyhow::Result<String> {
    let mut output = Vec::new();
    camsync::run_with_clients_and_log_level(
        command,
        &mut output,
        &FakeTerminalClient,
        context,
        None,
        Some(format),
    )
    .await?;
    Ok(String::from_utf8(output)?)
}

fn address(address: &str) -> AddressArgs {
    AddressArgs {
        address: address.to_string(),
    }
}

#[tokio::test]
async fn devices_command_reports_an_empty_store() -> anyhow::Result<()> {
    let context = fake_context(Arc::new(InMemoryPairedDeviceStore::default()));

    let stdout = run_command(context, Command::Devices, OutputFormat::Pretty).await?;

    assert_eq!("No paired cameras.", stdout.trim_end());
    Ok(())
}

#[tokio::test]
async fn scan_command_lists_each_demo_camera_once() -> anyhow::Result<()> {
    let context = fake_context(Arc::new(InMemoryPairedDeviceStore::default()));

    let stdout = run_command(
        context,
        Command::Scan(ScanArgs {
            duration: Duration::from_secs(1),
        }),
        OutputFormat::Pretty,
    )
    .await?;

    assert_snapshot!(stdout.trim_end(), @r"
    ╭───────────────────┬──────────┬────────┬──────────╮
    │ address           │ name     │ vendor │ protocol │
    ├───────────────────┼──────────┼────────┼──────────┤
    │ AA:00:00:00:00:01 │ GR IIIx  │ ricoh  │ -        │
    │ D0:00:00:00:00:02 │ ILCE-7M4 │ sony   │ 65       │
    ╰───────────────────┴──────────┴────────┴──────────╯
    ");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn pair_records_firmware_and_keeps_history_on_repair() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryPairedDeviceStore::default());
    let context = fake_context(store.clone());

    let stdout = run_command(
        context.clone(),
        Command::Pair(PairArgs {
            address: RICOH.to_lowercase(),
            name: None,
        }),
        OutputFormat::Json,
    )
    .await?;
    let paired: Value = serde_json::from_str(&stdout)?;
    assert_eq!(Value::from(RICOH), paired["address"]);
    assert_eq!(Value::from("1.10"), paired["firmware_version"]);

    store.set_enabled(RICOH, false)?;
    run_command(
        context,
        Command::Pair(PairArgs {
            address: RICOH.to_string(),
            name: Some("Street GR".to_string()),
        }),
        OutputFormat::Json,
    )
    .await?;

    let device = store.get(RICOH).expect("device should stay paired");
    assert_eq!("Street GR", device.name);
    assert_eq!(false, device.enabled);
    assert_eq!(VendorId::Ricoh, device.vendor);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn pair_runs_sony_vendor_pairing() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryPairedDeviceStore::default());
    let context = fake_context(store.clone());

    let stdout = run_command(
        context,
        Command::Pair(PairArgs {
            address: SONY.to_string(),
            name: None,
        }),
        OutputFormat::Pretty,
    )
    .await?;

    assert_eq!("✓ Paired D0:00:00:00:00:02 (ILCE-7M4)", stdout.trim_end());
    let device = store.get(SONY).expect("sony camera should be paired");
    assert_eq!(VendorId::Sony, device.vendor);
    assert_eq!(None, device.firmware_version);
    Ok(())
}

#[tokio::test]
async fn enable_and_disable_toggle_the_stored_flag() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryPairedDeviceStore::new(vec![PairedDevice::new(
        RICOH,
        "GR IIIx",
        VendorId::Ricoh,
    )]));
    let context = fake_context(store.clone());

    let stdout = run_command(
        context.clone(),
        Command::Disable(address(RICOH)),
        OutputFormat::Pretty,
    )
    .await?;
    assert_eq!("✓ Disabled AA:00:00:00:00:01", stdout.trim_end());
    assert_eq!(Vec::<PairedDevice>::new(), store.enabled_devices().borrow().clone());

    run_command(context, Command::Enable(address(RICOH)), OutputFormat::Json).await?;
    assert_eq!(1, store.enabled_devices().borrow().len());
    Ok(())
}

#[tokio::test]
async fn unpair_of_unknown_camera_fails() {
    let context = fake_context(Arc::new(InMemoryPairedDeviceStore::default()));

    let error = run_command(context, Command::Unpair(address(SONY)), OutputFormat::Pretty)
        .await
        .expect_err("unpairing an unknown camera should fail");

    assert_matches!(
        error.downcast_ref::<StoreError>(),
        Some(StoreError::UnknownDevice { address }) if address == SONY
    );
}

#[tokio::test]
async fn unpair_removes_the_record() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryPairedDeviceStore::new(vec![PairedDevice::new(
        SONY,
        "ILCE-7M4",
        VendorId::Sony,
    )]));
    let context = fake_context(store.clone());

    let stdout = run_command(context, Command::Unpair(address(SONY)), OutputFormat::Json).await?;

    let removed: Value = serde_json::from_str(&stdout)?;
    assert_eq!(Value::from(true), removed["removed"]);
    assert_eq!(None, store.get(SONY));
    Ok(())
}

#[tokio::test]
async fn firmware_command_reports_once_when_marked() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let catalog = dir.path().join("catalog.json");
    fs::write(
        &catalog,
        r#"{"last_updated":"2025-03-01T00:00:00Z","cameras":{"RICOH GR IIIx":"1.90"}}"#,
    )?;
    let mut device = PairedDevice::new(RICOH, "GR IIIx", VendorId::Ricoh);
    device.firmware_version = Some("1.81".to_string());
    let store = Arc::new(InMemoryPairedDeviceStore::new(vec![device]));
    let context = fake_context(store.clone());
    let args = FirmwareArgs {
        catalog,
        mark_notified: true,
    };

    let first = run_command(context.clone(), Command::Firmware(args.clone()), OutputFormat::Pretty)
        .await?;
    let second = run_command(context, Command::Firmware(args), OutputFormat::Pretty).await?;

    assert_snapshot!(first.trim_end(), @r"
    ╭───────────────────┬─────────┬───────────┬───────────╮
    │ address           │ name    │ installed │ available │
    ├───────────────────┼─────────┼───────────┼───────────┤
    │ AA:00:00:00:00:01 │ GR IIIx │ 1.81      │ 1.90      │
    ╰───────────────────┴─────────┴───────────┴───────────╯
    ");
    assert_eq!("All paired cameras are up to date.", second.trim_end());
    let stored = store.get(RICOH).expect("device should remain paired");
    assert_eq!(Some("1.90".to_string()), stored.latest_firmware_version);
    assert_eq!(true, stored.firmware_update_notified);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn inspect_reports_ricoh_readings_as_json() -> anyhow::Result<()> {
    let context = fake_context(Arc::new(InMemoryPairedDeviceStore::default()));

    let stdout = run_command(context, Command::Inspect(address(RICOH)), OutputFormat::Json).await?;

    let report: Value = serde_json::from_str(&stdout)?;
    assert_eq!(Value::from("1.10"), report["firmware_version"]);
    assert_eq!(Value::from("GR IIIx"), report["hardware_revision"]);
    assert_eq!(Value::from(false), report["geo_tagging"]);
    assert_eq!(Value::from(85), report["battery_level"]);
    assert_eq!(Value::from(true), report["capabilities"]["supports_geo_tagging"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn inspect_of_a_silent_camera_fails() {
    let context = fake_context(Arc::new(InMemoryPairedDeviceStore::default()));

    let error = run_command(
        context,
        Command::Inspect(address("EE:00:00:00:00:09")),
        OutputFormat::Pretty,
    )
    .await
    .expect_err("an absent camera cannot be inspected");

    assert_eq!(
        "camera EE:00:00:00:00:09 was never seen advertising",
        error.to_string()
    );
}

#[tokio::test(start_paused = true)]
async fn sync_time_reports_the_written_clock() -> anyhow::Result<()> {
    let context = fake_context(Arc::new(InMemoryPairedDeviceStore::default()));

    let stdout = run_command(context, Command::SyncTime(address(SONY)), OutputFormat::Json).await?;

    let report: Value = serde_json::from_str(&stdout)?;
    assert_eq!(Value::from(SONY), report["address"]);
    assert_eq!(Value::from(false), report["dst"]);
    Ok(())
}
