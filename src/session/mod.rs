mod delegate;
mod sony;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::codec::{DriveMode, RicohCodec, ShootingMode};
use crate::config::SyncSettings;
use crate::error::CameraError;
use crate::hw::{GattClient, ServiceInfo};
use crate::model::{
    Camera, Capability, ConnectionCapabilities, GpsLocation, ZonedDateTime,
};
use crate::utils::decode_nul_terminated;
use crate::vendor::{CameraVendor, CharacteristicRef, GattSpec};
use crate::zone::ZoneRules;

pub use self::delegate::{ConnectionDelegate, SessionContext, StandardDelegate};
pub use self::sony::{SonyDelegate, SonyLocationCapabilities};

/// A live GATT session with one camera.
///
/// Every operation checks the vendor's capabilities before touching the
/// GATT layer. The session is owned by a single task; it is `Send` but
/// methods that mutate vendor protocol state take `&mut self`.
#[derive(Debug)]
pub struct CameraConnection {
    camera: Camera,
    vendor: Arc<dyn CameraVendor>,
    capabilities: ConnectionCapabilities,
    gatt: Box<dyn GattClient>,
    delegate: Box<dyn ConnectionDelegate>,
    zone: Arc<dyn ZoneRules>,
    settings: SyncSettings,
    cancel: CancellationToken,
}

impl CameraConnection {
    /// Wraps a connected GATT client.
    #[must_use]
    pub fn new(
        camera: Camera,
        vendor: Arc<dyn CameraVendor>,
        gatt: Box<dyn GattClient>,
        zone: Arc<dyn ZoneRules>,
        settings: SyncSettings,
    ) -> Self {
        let capabilities = vendor.capabilities();
        let delegate = vendor.create_connection_delegate(&camera);
        Self {
            camera,
            vendor,
            capabilities,
            gatt,
            delegate,
            zone,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Ties in-flight operations to an owner's cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    #[must_use]
    pub fn vendor(&self) -> &Arc<dyn CameraVendor> {
        &self.vendor
    }

    #[must_use]
    pub fn capabilities(&self) -> ConnectionCapabilities {
        self.capabilities
    }

    /// Service tree discovered when the link came up.
    #[must_use]
    pub fn services(&self) -> &[ServiceInfo] {
        self.gatt.services()
    }

    /// Liveness of the underlying GATT link.
    #[must_use]
    pub fn connection_state(&self) -> watch::Receiver<bool> {
        self.gatt.connection_state()
    }

    fn context(&self) -> SessionContext<'_> {
        session_context(
            &self.camera,
            self.vendor.as_ref(),
            self.gatt.as_ref(),
            self.zone.as_ref(),
            &self.settings,
            &self.cancel,
        )
    }

    fn split(&mut self) -> (&mut dyn ConnectionDelegate, SessionContext<'_>) {
        let Self {
            camera,
            vendor,
            gatt,
            delegate,
            zone,
            settings,
            cancel,
            ..
        } = self;
        let ctx = session_context(camera, &**vendor, &**gatt, &**zone, settings, cancel);
        (delegate.as_mut(), ctx)
    }

    fn ensure(&self, capability: Capability) -> Result<(), CameraError> {
        if self.capabilities.supports(capability) {
            Ok(())
        } else {
            Err(CameraError::UnsupportedCapability {
                vendor: self.camera.vendor(),
                capability,
            })
        }
    }

    fn target(
        &self,
        capability: Capability,
        select: impl FnOnce(&GattSpec) -> Option<CharacteristicRef>,
    ) -> Result<CharacteristicRef, CameraError> {
        self.context()
            .target(select(self.vendor.gatt_spec()), capability)
    }

    /// Starts vendor pairing. Vendors without pairing succeed trivially.
    ///
    /// Returns `false` rather than an error when pairing is not configured or
    /// the write fails; the caller decides whether to continue.
    #[instrument(skip(self), level = "info", fields(address = self.camera.address()))]
    pub async fn initialize_pairing(&self) -> bool {
        if !self.capabilities.requires_vendor_pairing {
            return true;
        }
        let (Some(target), Some(payload)) = (
            self.vendor.gatt_spec().pairing,
            self.vendor.pairing_init_payload(),
        ) else {
            warn!("vendor requires pairing but no pairing endpoint is configured");
            return false;
        };

        match self.context().write(target, payload, "pairing init").await {
            Ok(()) => {
                info!("pairing initialised");
                true
            }
            Err(error) => {
                warn!(%error, "pairing init failed");
                false
            }
        }
    }

    /// Reads the firmware version string.
    ///
    /// # Errors
    ///
    /// Returns an error when unsupported, not found, or the read fails.
    #[instrument(skip(self), level = "debug", fields(address = self.camera.address()))]
    pub async fn read_firmware_version(&self) -> Result<String, CameraError> {
        self.ensure(Capability::FirmwareVersion)?;
        let target = self.target(Capability::FirmwareVersion, |spec| spec.firmware_version)?;
        let payload = self.context().read(target, "firmware read").await?;
        Ok(decode_nul_terminated(&payload))
    }

    /// Reads the hardware revision string.
    ///
    /// # Errors
    ///
    /// Returns an error when unsupported, not found, or the read fails.
    #[instrument(skip(self), level = "debug", fields(address = self.camera.address()))]
    pub async fn read_hardware_revision(&self) -> Result<String, CameraError> {
        self.ensure(Capability::HardwareRevision)?;
        let target = self.target(Capability::HardwareRevision, |spec| spec.hardware_revision)?;
        let payload = self.context().read(target, "hardware revision read").await?;
        Ok(decode_nul_terminated(&payload))
    }

    /// Tells the camera which device it is paired with.
    ///
    /// # Errors
    ///
    /// Returns an error when unsupported, not found, or the write fails.
    #[instrument(skip(self), level = "debug", fields(address = self.camera.address()))]
    pub async fn set_paired_device_name(&self, name: &str) -> Result<(), CameraError> {
        self.ensure(Capability::DeviceName)?;
        let target = self.target(Capability::DeviceName, |spec| spec.device_name)?;
        self.context()
            .write(target, name.as_bytes(), "device name write")
            .await
    }

    /// Sets the camera clock.
    ///
    /// # Errors
    ///
    /// Returns an error when unsupported, timed out, or the write fails.
    #[instrument(skip(self, date_time), level = "info", fields(address = self.camera.address()))]
    pub async fn sync_date_time(&mut self, date_time: &ZonedDateTime) -> Result<(), CameraError> {
        self.ensure(Capability::DateTimeSync)?;
        let (delegate, ctx) = self.split();
        delegate.sync_date_time(&ctx, date_time).await
    }

    /// Reads the raw clock packet. Decoding is logged, not returned.
    ///
    /// # Errors
    ///
    /// Returns an error when unsupported or the read fails.
    #[instrument(skip(self), level = "debug", fields(address = self.camera.address()))]
    pub async fn read_date_time(&self) -> Result<Vec<u8>, CameraError> {
        self.ensure(Capability::DateTimeSync)?;
        let target = self.target(Capability::DateTimeSync, |spec| spec.date_time)?;
        let payload = self.context().read(target, "date/time read").await?;
        match self.vendor.codec().decode_date_time(&payload) {
            Ok(decoded) => debug!(%decoded, "camera clock"),
            Err(error) => trace!(%error, "camera clock did not decode"),
        }
        Ok(payload)
    }

    /// Enables or disables geo-tagging, skipping the write when the camera
    /// already matches.
    ///
    /// # Errors
    ///
    /// Returns an error when unsupported or the read or write fails.
    #[instrument(skip(self), level = "debug", fields(address = self.camera.address()))]
    pub async fn set_geo_tagging_enabled(&self, enabled: bool) -> Result<(), CameraError> {
        self.ensure(Capability::GeoTagging)?;
        let target = self.target(Capability::GeoTagging, |spec| spec.geo_tagging)?;
        let ctx = self.context();
        let codec = self.vendor.codec();

        let current = codec.decode_geo_tagging_enabled(&ctx.read(target, "geo-tag read").await?)?;
        if current == enabled {
            debug!(enabled, "geo-tagging already in requested state");
            return Ok(());
        }
        ctx.write(
            target,
            &codec.encode_geo_tagging_enabled(enabled),
            "geo-tag write",
        )
        .await
    }

    /// # Errors
    ///
    /// Returns an error when unsupported or the read fails.
    pub async fn is_geo_tagging_enabled(&self) -> Result<bool, CameraError> {
        self.ensure(Capability::GeoTagging)?;
        let target = self.target(Capability::GeoTagging, |spec| spec.geo_tagging)?;
        let payload = self.context().read(target, "geo-tag read").await?;
        Ok(self.vendor.codec().decode_geo_tagging_enabled(&payload)?)
    }

    /// Pushes a GPS fix to the camera.
    ///
    /// # Errors
    ///
    /// Returns an error when unsupported, cancelled, or every write attempt fails.
    #[instrument(skip(self, location), level = "debug", fields(address = self.camera.address()))]
    pub async fn sync_location(&mut self, location: &GpsLocation) -> Result<(), CameraError> {
        self.ensure(Capability::LocationSync)?;
        let (delegate, ctx) = self.split();
        delegate.sync_location(&ctx, location).await
    }

    /// Battery percentage, clamped to 100.
    ///
    /// # Errors
    ///
    /// Returns an error when unsupported or the read fails.
    pub async fn read_battery_level(&self) -> Result<u8, CameraError> {
        let target = self.target(Capability::BatteryLevel, |spec| spec.battery_level)?;
        let payload = self.context().read(target, "battery read").await?;
        Ok(RicohCodec::decode_battery_level(&payload)?)
    }

    /// # Errors
    ///
    /// Returns an error when unsupported or the read fails.
    pub async fn read_shooting_mode(&self) -> Result<ShootingMode, CameraError> {
        let target = self.target(Capability::ShootingMode, |spec| spec.shooting_mode)?;
        let payload = self.context().read(target, "shooting mode read").await?;
        Ok(RicohCodec::decode_shooting_mode(&payload)?)
    }

    /// # Errors
    ///
    /// Returns an error when unsupported or the read fails.
    pub async fn read_drive_mode(&self) -> Result<DriveMode, CameraError> {
        let target = self.target(Capability::DriveMode, |spec| spec.drive_mode)?;
        let payload = self.context().read(target, "drive mode read").await?;
        Ok(RicohCodec::decode_drive_mode(&payload)?)
    }

    /// Runs vendor teardown, then closes the link.
    ///
    /// Teardown failures are logged and never prevent the close.
    ///
    /// # Errors
    ///
    /// Returns an error only when closing the link itself fails.
    #[instrument(skip(self), level = "info", fields(address = self.camera.address()))]
    pub async fn disconnect(mut self) -> Result<(), CameraError> {
        let write_timeout = self.settings.write_timeout;
        {
            let (delegate, ctx) = self.split();
            delegate.before_disconnect(&ctx).await;
        }
        timeout(write_timeout, self.gatt.disconnect())
            .await
            .unwrap_or(Err(CameraError::Timeout {
                operation: "disconnect",
                after: write_timeout,
            }))
    }
}

fn session_context<'a>(
    camera: &'a Camera,
    vendor: &'a dyn CameraVendor,
    gatt: &'a dyn GattClient,
    zone: &'a dyn ZoneRules,
    settings: &'a SyncSettings,
    cancel: &'a CancellationToken,
) -> SessionContext<'a> {
    SessionContext {
        camera,
        gatt,
        spec: vendor.gatt_spec(),
        codec: vendor.codec(),
        zone,
        settings,
        cancel,
    }
}
