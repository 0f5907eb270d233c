use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_stream::Stream;
use tracing::{info, instrument};

use super::discovery::{AdvertisementSource, discover_with_retry};
use super::gatt::GattClient;
use super::model::Advertisement;
use crate::config::SyncSettings;
use crate::error::CameraError;
use crate::model::Camera;
use crate::session::CameraConnection;
use crate::vendor::{CameraVendor, VendorRegistry};
use crate::zone::ZoneRules;

/// Fired once the target is seen advertising, before the GATT connect.
pub type FoundCallback = Box<dyn FnOnce(&Camera) + Send>;

/// Cameras sighted by an active scan.
pub type CameraStream = Pin<Box<dyn Stream<Item = Camera> + Send>>;

/// Entry point for finding and connecting to cameras.
#[async_trait]
pub trait CameraRepository: Send + Sync + Debug {
    /// Starts an active scan and streams every recognised camera.
    async fn discover_cameras(&self) -> Result<CameraStream, CameraError>;

    /// Finds `address`, resolves its vendor, and opens a session.
    async fn connect(
        &self,
        address: &str,
        on_found: Option<FoundCallback>,
    ) -> Result<CameraConnection, CameraError>;

    /// Registers a low-power scan that reports sightings on [`Self::presence`].
    async fn start_passive_scan(&self) -> Result<(), CameraError>;

    async fn stop_passive_scan(&self) -> Result<(), CameraError>;

    /// Addresses of recognised cameras seen while the passive scan runs.
    fn presence(&self) -> broadcast::Receiver<String>;
}

/// Builds sessions from advertisements and connected GATT clients.
#[derive(Debug, Clone)]
pub struct ConnectionFactory {
    registry: VendorRegistry,
    zone: Arc<dyn ZoneRules>,
    settings: SyncSettings,
}

impl ConnectionFactory {
    #[must_use]
    pub fn new(registry: VendorRegistry, zone: Arc<dyn ZoneRules>, settings: SyncSettings) -> Self {
        Self {
            registry,
            zone,
            settings,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &VendorRegistry {
        &self.registry
    }

    #[must_use]
    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Resolves the vendor of an advertisement.
    ///
    /// # Errors
    ///
    /// Returns [`CameraError::UnknownVendor`] when no vendor claims it.
    pub fn identify(
        &self,
        advertisement: &Advertisement,
    ) -> Result<(Camera, Arc<dyn CameraVendor>), CameraError> {
        let unknown = || CameraError::UnknownVendor {
            address: advertisement.address().to_string(),
        };
        let camera = self
            .registry
            .identify_camera(advertisement)
            .ok_or_else(unknown)?;
        let vendor = self.registry.get(camera.vendor()).ok_or_else(unknown)?;
        Ok((camera, vendor))
    }

    #[must_use]
    pub fn open(
        &self,
        camera: Camera,
        vendor: Arc<dyn CameraVendor>,
        gatt: Box<dyn GattClient>,
    ) -> CameraConnection {
        CameraConnection::new(camera, vendor, gatt, Arc::clone(&self.zone), self.settings)
    }

    /// Runs discovery, vendor resolution, the found callback, and the GATT
    /// connect in that order.
    #[instrument(skip(self, source, on_found, connect), level = "info")]
    pub(crate) async fn establish<F, Fut>(
        &self,
        source: &dyn AdvertisementSource,
        address: &str,
        on_found: Option<FoundCallback>,
        connect: F,
    ) -> Result<CameraConnection, CameraError>
    where
        F: FnOnce(Advertisement) -> Fut + Send,
        Fut: Future<Output = Result<Box<dyn GattClient>, CameraError>> + Send,
    {
        let advertisement = discover_with_retry(source, address, &self.settings).await?;
        let (camera, vendor) = self.identify(&advertisement)?;
        if let Some(on_found) = on_found {
            on_found(&camera);
        }

        let gatt = connect(advertisement).await?;
        info!(vendor = %camera.vendor(), name = camera.display_name(), "camera connected");
        Ok(self.open(camera, vendor, gatt))
    }
}
