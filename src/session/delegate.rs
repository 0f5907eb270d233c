use std::fmt::Debug;
use std::future::Future;

use async_trait::async_trait;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, trace};

use crate::codec::ProtocolCodec;
use crate::config::SyncSettings;
use crate::error::CameraError;
use crate::hw::{GattClient, WriteMode, describe_characteristics, describe_services, find_service};
use crate::model::{Camera, Capability, GpsLocation, ZonedDateTime};
use crate::utils::format_hex;
use crate::vendor::{CharacteristicRef, GattSpec};
use crate::zone::ZoneRules;

/// Borrowed view of a session handed to its delegate.
#[derive(Debug)]
pub struct SessionContext<'a> {
    pub camera: &'a Camera,
    pub gatt: &'a dyn GattClient,
    pub spec: &'a GattSpec,
    pub codec: &'static dyn ProtocolCodec,
    pub zone: &'a dyn ZoneRules,
    pub settings: &'a SyncSettings,
    pub cancel: &'a CancellationToken,
}

impl SessionContext<'_> {
    /// Resolves a configured characteristic or reports the capability as unsupported.
    ///
    /// # Errors
    ///
    /// Returns [`CameraError::UnsupportedCapability`] when the vendor has no
    /// characteristic for `capability`.
    pub fn target(
        &self,
        configured: Option<CharacteristicRef>,
        capability: Capability,
    ) -> Result<CharacteristicRef, CameraError> {
        configured.ok_or(CameraError::UnsupportedCapability {
            vendor: self.camera.vendor(),
            capability,
        })
    }

    /// Returns whether the discovered GATT tree holds `target`.
    #[must_use]
    pub fn has_characteristic(&self, target: CharacteristicRef) -> bool {
        crate::hw::has_characteristic(
            self.gatt.services(),
            target.service,
            target.characteristic,
        )
    }

    /// Checks `target` against the discovered GATT tree.
    ///
    /// # Errors
    ///
    /// Returns a not-found error listing what was actually discovered.
    pub fn require(&self, target: CharacteristicRef) -> Result<(), CameraError> {
        let services = self.gatt.services();
        let Some(service) = find_service(services, target.service) else {
            return Err(CameraError::ServiceNotFound {
                service: target.service,
                discovered: describe_services(services),
            });
        };
        if service.characteristic(target.characteristic).is_none() {
            return Err(CameraError::CharacteristicNotFound {
                service: target.service,
                characteristic: target.characteristic,
                discovered: describe_characteristics(service),
            });
        }
        Ok(())
    }

    /// Reads `target` under the session timeout.
    ///
    /// # Errors
    ///
    /// Returns lookup, timeout, cancellation, or transport errors.
    #[instrument(skip(self), level = "trace", fields(characteristic = %target.characteristic))]
    pub async fn read(
        &self,
        target: CharacteristicRef,
        operation: &'static str,
    ) -> Result<Vec<u8>, CameraError> {
        self.require(target)?;
        let payload = self
            .bounded(
                operation,
                self.gatt.read(target.service, target.characteristic),
            )
            .await?;
        trace!(payload = %format_hex(&payload), "read characteristic");
        Ok(payload)
    }

    /// Writes `target` with an acknowledged write under the session timeout.
    ///
    /// # Errors
    ///
    /// Returns lookup, timeout, cancellation, or transport errors.
    #[instrument(skip(self, payload), level = "trace", fields(characteristic = %target.characteristic))]
    pub async fn write(
        &self,
        target: CharacteristicRef,
        payload: &[u8],
        operation: &'static str,
    ) -> Result<(), CameraError> {
        self.require(target)?;
        trace!(payload = %format_hex(payload), "writing characteristic");
        self.bounded(
            operation,
            self.gatt.write(
                target.service,
                target.characteristic,
                payload,
                WriteMode::WithResponse,
            ),
        )
        .await
    }

    /// Writes during teardown, when the owning task may already be cancelled.
    ///
    /// # Errors
    ///
    /// Returns lookup, timeout, or transport errors.
    pub async fn teardown_write(
        &self,
        target: CharacteristicRef,
        payload: &[u8],
        operation: &'static str,
    ) -> Result<(), CameraError> {
        self.require(target)?;
        let write = self.gatt.write(
            target.service,
            target.characteristic,
            payload,
            WriteMode::WithResponse,
        );
        timeout(self.settings.write_timeout, write)
            .await
            .unwrap_or(Err(CameraError::Timeout {
                operation,
                after: self.settings.write_timeout,
            }))
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        future: impl Future<Output = Result<T, CameraError>> + Send,
    ) -> Result<T, CameraError> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(CameraError::Cancelled { operation }),
            result = timeout(self.settings.write_timeout, future) => {
                result.unwrap_or(Err(CameraError::Timeout {
                    operation,
                    after: self.settings.write_timeout,
                }))
            }
        }
    }
}

/// Vendor hook points inside a session.
///
/// The defaults encode with the vendor codec and write the configured
/// characteristic once.
#[async_trait]
pub trait ConnectionDelegate: Send + Sync + Debug {
    async fn sync_date_time(
        &mut self,
        ctx: &SessionContext<'_>,
        date_time: &ZonedDateTime,
    ) -> Result<(), CameraError> {
        let target = ctx.target(ctx.spec.date_time, Capability::DateTimeSync)?;
        let payload = ctx.codec.encode_date_time(date_time);
        ctx.write(target, &payload, "date/time write").await
    }

    async fn sync_location(
        &mut self,
        ctx: &SessionContext<'_>,
        location: &GpsLocation,
    ) -> Result<(), CameraError> {
        let target = ctx.target(ctx.spec.location, Capability::LocationSync)?;
        let zoned = ctx.zone.zoned(location.timestamp);
        let payload = ctx.codec.encode_location(location, &zoned);
        ctx.write(target, &payload, "location write").await
    }

    /// Runs before the GATT link is closed. Must not fail.
    async fn before_disconnect(&mut self, _ctx: &SessionContext<'_>) {}
}

/// Delegate for vendors without session-level quirks.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardDelegate;

#[async_trait]
impl ConnectionDelegate for StandardDelegate {}
