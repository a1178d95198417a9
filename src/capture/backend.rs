use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};

use crate::error::SessionResult;

use super::session::{CaptureRequest, EndReason, TrackKind};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub label: String,
}

impl DeviceInfo {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

pub type GrantId = u64;

/// A live hold on capture hardware. Must be handed back through
/// [`MediaBackend::release`].
#[derive(Debug)]
pub struct HardwareGrant {
    pub id: GrantId,
    pub device_id: Option<String>,
    pub has_audio: bool,
    /// Fires when the grant ends without the app asking: the device was
    /// unplugged or the user revoked a share from the OS chrome. A dropped
    /// sender is treated the same way.
    pub ended: oneshot::Receiver<EndReason>,
}

/// Platform boundary for local audio/video hardware.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    async fn enumerate_devices(&self) -> Vec<DeviceInfo>;

    /// May take as long as the user needs to answer a permission prompt.
    async fn acquire(&self, request: &CaptureRequest) -> SessionResult<HardwareGrant>;

    /// Releasing an unknown or already-released grant is a no-op.
    async fn release(&self, grant: GrantId);

    async fn set_track_enabled(
        &self,
        grant: GrantId,
        track: TrackKind,
        enabled: bool,
    ) -> SessionResult<()>;

    /// Notifies whenever the set of input devices changes.
    fn device_changes(&self) -> broadcast::Receiver<()>;
}
