use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument, warn};

use super::delegate::{ConnectionDelegate, SessionContext};
use crate::codec::SonyCodec;
use crate::error::CameraError;
use crate::model::{Capability, GpsLocation};
use crate::utils::format_hex;
use crate::vendor::CharacteristicRef;
use crate::vendor::sony_uuids as uuids;

/// Cameras at or above this protocol version gate location writes behind
/// the DD30/DD31 lock and enable pair.
pub(crate) const UNLOCK_PROTOCOL_VERSION: u32 = 65;

const LOCK: CharacteristicRef = CharacteristicRef::new(uuids::LOCATION_SERVICE, uuids::LOCK);
const ENABLE: CharacteristicRef = CharacteristicRef::new(uuids::LOCATION_SERVICE, uuids::ENABLE);
const STATUS_NOTIFY: CharacteristicRef =
    CharacteristicRef::new(uuids::LOCATION_SERVICE, uuids::STATUS_NOTIFY);
const TIME_CORRECTION: CharacteristicRef =
    CharacteristicRef::new(uuids::LOCATION_SERVICE, uuids::TIME_CORRECTION);
const AREA_ADJUSTMENT: CharacteristicRef =
    CharacteristicRef::new(uuids::LOCATION_SERVICE, uuids::AREA_ADJUSTMENT);
const CONFIG: CharacteristicRef = CharacteristicRef::new(uuids::LOCATION_SERVICE, uuids::CONFIG);

const CONFIG_FLAGS_OFFSET: usize = 4;
const CONFIG_TIMEZONE_BIT: u8 = 0x02;

/// Values read once per session from the location service.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct SonyLocationCapabilities {
    pub time_correction: Option<Vec<u8>>,
    pub area_adjustment: Option<Vec<u8>>,
    /// Whether DD11 packets carry the timezone trailer.
    pub include_timezone: bool,
}

/// Sony session state for the location service.
#[derive(Debug)]
pub struct SonyDelegate {
    protocol_version: Option<u32>,
    location_session_active: bool,
    capabilities: Option<SonyLocationCapabilities>,
    status_listener: Option<JoinHandle<()>>,
}

impl SonyDelegate {
    #[must_use]
    pub fn new(protocol_version: Option<u32>) -> Self {
        Self {
            protocol_version,
            location_session_active: false,
            capabilities: None,
            status_listener: None,
        }
    }

    /// Capabilities cached by the first location sync, if it ran.
    #[must_use]
    pub fn location_capabilities(&self) -> Option<&SonyLocationCapabilities> {
        self.capabilities.as_ref()
    }

    fn uses_unlock_protocol(&self, ctx: &SessionContext<'_>) -> bool {
        self.protocol_version
            .is_some_and(|version| version >= UNLOCK_PROTOCOL_VERSION)
            && ctx.has_characteristic(LOCK)
            && ctx.has_characteristic(ENABLE)
    }

    /// Activates the camera's location session before a DD11 write.
    ///
    /// The camera expires the session on its own schedule, so lock and enable
    /// are written before every location write, not only the first.
    #[instrument(skip_all, level = "debug", fields(address = ctx.camera.address()))]
    async fn ensure_location_session(
        &mut self,
        ctx: &SessionContext<'_>,
    ) -> Result<(), CameraError> {
        if self.uses_unlock_protocol(ctx) {
            if !self.location_session_active {
                self.start_status_listener(ctx).await;
            }
            ctx.write(LOCK, &[0x01], "location lock").await?;
            ctx.write(ENABLE, &[0x01], "location enable").await?;
            if !self.location_session_active {
                info!("sony location session unlocked");
            }
            self.location_session_active = true;
        } else {
            debug!(
                protocol_version = ?self.protocol_version,
                "legacy location protocol; skipping lock and enable"
            );
        }

        if self.capabilities.is_none() {
            self.capabilities = Some(read_location_capabilities(ctx).await);
        }
        Ok(())
    }

    async fn start_status_listener(&mut self, ctx: &SessionContext<'_>) {
        if !ctx.has_characteristic(STATUS_NOTIFY) {
            debug!("camera exposes no location status characteristic");
            return;
        }

        let subscription = timeout(
            ctx.settings.write_timeout,
            ctx.gatt
                .subscribe(STATUS_NOTIFY.service, STATUS_NOTIFY.characteristic),
        )
        .await;
        match subscription {
            Ok(Ok(mut notifications)) => {
                let address = ctx.camera.address().to_string();
                self.status_listener = Some(tokio::spawn(async move {
                    while let Some(payload) = notifications.next().await {
                        debug!(%address, payload = %format_hex(&payload), "location status notification");
                    }
                }));
            }
            Ok(Err(error)) => warn!(%error, "location status subscription failed"),
            Err(_elapsed) => warn!("location status subscription timed out"),
        }
    }

    fn stop_status_listener(&mut self) {
        if let Some(listener) = self.status_listener.take() {
            listener.abort();
        }
    }

    #[instrument(skip_all, level = "debug", fields(address = ctx.camera.address()))]
    async fn write_location_with_retry(
        &self,
        ctx: &SessionContext<'_>,
        target: CharacteristicRef,
        packet: &[u8],
    ) -> Result<(), CameraError> {
        let attempts = ctx.settings.location_write_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match ctx.write(target, packet, "location write").await {
                Ok(()) => return Ok(()),
                Err(error) if error.is_cancelled() => return Err(error),
                Err(error) => {
                    warn!(attempt, %error, "location write failed");
                    last_error = Some(error);
                }
            }

            if attempt < attempts {
                tokio::select! {
                    biased;
                    () = ctx.cancel.cancelled() => {
                        return Err(CameraError::Cancelled { operation: "location write" });
                    }
                    () = sleep(ctx.settings.location_retry_delay) => {}
                }
            }
        }

        Err(CameraError::Io {
            operation: "location write",
            attempts,
            source: Box::new(last_error.unwrap_or(CameraError::Disconnected)),
        })
    }
}

impl Drop for SonyDelegate {
    fn drop(&mut self) {
        self.stop_status_listener();
    }
}

#[async_trait]
impl ConnectionDelegate for SonyDelegate {
    async fn sync_location(
        &mut self,
        ctx: &SessionContext<'_>,
        location: &GpsLocation,
    ) -> Result<(), CameraError> {
        let target = ctx.target(ctx.spec.location, Capability::LocationSync)?;
        self.ensure_location_session(ctx).await?;

        let include_timezone = self
            .capabilities
            .as_ref()
            .is_some_and(|capabilities| capabilities.include_timezone);
        let zoned = ctx.zone.zoned(location.timestamp);
        let packet = SonyCodec::encode_location_packet(location, &zoned, include_timezone);
        self.write_location_with_retry(ctx, target, &packet).await
    }

    async fn before_disconnect(&mut self, ctx: &SessionContext<'_>) {
        self.stop_status_listener();
        if !self.location_session_active {
            return;
        }

        if let Err(error) = ctx
            .teardown_write(ENABLE, &[0x00], "location disable")
            .await
        {
            warn!(%error, "failed to disable location session");
        }
        if let Err(error) = ctx.teardown_write(LOCK, &[0x00], "location unlock").await {
            warn!(%error, "failed to release location lock");
        }
        self.location_session_active = false;
    }
}

/// Reads time correction, area adjustment, then config, each best-effort.
async fn read_location_capabilities(ctx: &SessionContext<'_>) -> SonyLocationCapabilities {
    let time_correction = read_optional(ctx, TIME_CORRECTION, "time correction read").await;
    let area_adjustment = read_optional(ctx, AREA_ADJUSTMENT, "area adjustment read").await;
    let include_timezone = read_optional(ctx, CONFIG, "location config read")
        .await
        .and_then(|config| config.get(CONFIG_FLAGS_OFFSET).copied())
        .is_some_and(|flags| flags & CONFIG_TIMEZONE_BIT != 0);

    debug!(include_timezone, "sony location capabilities cached");
    SonyLocationCapabilities {
        time_correction,
        area_adjustment,
        include_timezone,
    }
}

async fn read_optional(
    ctx: &SessionContext<'_>,
    target: CharacteristicRef,
    operation: &'static str,
) -> Option<Vec<u8>> {
    match ctx.read(target, operation).await {
        Ok(payload) => Some(payload),
        Err(error) => {
            debug!(%error, operation, "capability read failed; keeping default");
            None
        }
    }
}
