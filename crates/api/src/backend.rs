use async_trait::async_trait;

use ecoflow_core::{DeviceInfo, QuotaMap};

use crate::error::ApiError;

/// Common operations every data-acquisition backend exposes to the Worker.
///
/// The REST backend answers by polling the developer API; the MQTT backends
/// answer from the quota cache fed by the broker session. The Worker is
/// backend-agnostic.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Establish the session. For REST this validates credentials with one
    /// device-list fetch; for the broker backends it authenticates, connects,
    /// subscribes, and starts the idle supervisor.
    async fn connect(&self) -> Result<(), ApiError>;

    /// Release the session and stop all periodic work. Idempotent.
    async fn disconnect(&self);

    /// List known devices. Broker backends return only the configured one.
    async fn get_devices(&self) -> Result<Vec<DeviceInfo>, ApiError>;

    /// Look up one device by serial.
    async fn get_device(&self, sn: &str) -> Result<Option<DeviceInfo>, ApiError>;

    /// The freshest quota map for the device. Broker backends return a cache
    /// snapshot; mutating the returned map never affects later calls.
    async fn get_device_quota(&self, sn: &str) -> Result<QuotaMap, ApiError>;
}
