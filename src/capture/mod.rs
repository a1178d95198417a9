pub mod backend;
pub mod manager;
pub mod retry;
pub mod session;
pub mod simulated;

pub use backend::{DeviceInfo, GrantId, HardwareGrant, MediaBackend};
pub use manager::{CaptureEvent, CaptureManager};
pub use retry::{RetryPolicy, RetryTracker};
pub use session::{
    CaptureKind, CaptureLifecycle, CaptureRequest, CaptureSession, EndReason, TrackKind,
};
pub use simulated::{PermissionPolicy, SimulatedMediaBackend};
