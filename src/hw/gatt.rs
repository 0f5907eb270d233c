use std::fmt::Debug;
use std::pin::Pin;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_stream::Stream;
use uuid::Uuid;

use super::model::{ServiceInfo, WriteMode};
use crate::error::CameraError;

/// Notification payloads from one subscribed characteristic.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// A connected GATT peripheral with its discovered service tree.
///
/// Implementations do not apply timeouts; callers bound every call.
#[async_trait]
pub trait GattClient: Send + Sync + Debug {
    /// Uppercase MAC address of the peripheral.
    fn address(&self) -> &str;

    /// Services discovered after connecting.
    fn services(&self) -> &[ServiceInfo];

    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>, CameraError>;

    async fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), CameraError>;

    /// Subscribes to notifications from one characteristic.
    async fn subscribe(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream, CameraError>;

    /// Liveness signal; `false` once the link drops.
    fn connection_state(&self) -> watch::Receiver<bool>;

    async fn disconnect(&self) -> Result<(), CameraError>;
}
