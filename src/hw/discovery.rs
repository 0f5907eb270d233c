use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, info, instrument};

use super::model::Advertisement;
use crate::config::SyncSettings;
use crate::error::CameraError;

/// Source of targeted advertisement sightings.
#[async_trait]
pub trait AdvertisementSource: Send + Sync {
    /// Waits up to `wait` for `address` to advertise.
    async fn wait_for_advertisement(
        &self,
        address: &str,
        wait: Duration,
    ) -> Result<Option<Advertisement>, CameraError>;

    /// Returns whether the OS holds a bond for `address`.
    async fn is_bonded(&self, address: &str) -> bool;
}

/// Waits for a target camera to advertise.
///
/// Bonded cameras can take a while to start advertising after power-on, so
/// they get `scan_attempts` waits separated by `scan_retry_delay`. Unbonded
/// targets get a single, shorter wait.
///
/// # Errors
///
/// Returns [`CameraError::BondedDeviceSilent`] or
/// [`CameraError::DeviceNotFound`] when no advertisement arrives, or the
/// source's own error.
#[instrument(skip(source, settings), level = "debug", fields(bonded = tracing::field::Empty))]
pub async fn discover_with_retry(
    source: &dyn AdvertisementSource,
    address: &str,
    settings: &SyncSettings,
) -> Result<Advertisement, CameraError> {
    let bonded = source.is_bonded(address).await;
    tracing::Span::current().record("bonded", bonded);
    let attempts = if bonded {
        settings.scan_attempts.max(1)
    } else {
        1
    };
    let wait = settings.advertisement_wait(bonded);

    for attempt in 1..=attempts {
        debug!(attempt, wait = %humantime::format_duration(wait), "waiting for advertisement");
        if let Some(advertisement) = source.wait_for_advertisement(address, wait).await? {
            info!(attempt, "camera advertisement observed");
            return Ok(advertisement);
        }
        if attempt < attempts {
            sleep(settings.scan_retry_delay).await;
        }
    }

    if bonded {
        Err(CameraError::BondedDeviceSilent {
            address: address.to_string(),
            attempts,
        })
    } else {
        Err(CameraError::DeviceNotFound {
            address: address.to_string(),
        })
    }
}
