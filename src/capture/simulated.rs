use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot};

use crate::error::{SessionError, SessionResult};
use crate::log_info;

use super::backend::{DeviceInfo, GrantId, HardwareGrant, MediaBackend};
use super::session::{CaptureKind, CaptureRequest, EndReason, TrackKind};

const ENABLE_LOGS: bool = true;
const LOG_TARGET: &str = "pulsefit::capture::simulated";

/// How the simulated permission prompt answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionPolicy {
    #[default]
    Grant,
    DenyAll,
    DenyCamera,
    DenyScreen,
}

struct LiveGrant {
    kind: CaptureKind,
    device_id: Option<String>,
    video: bool,
    audio: bool,
    ended_tx: Option<oneshot::Sender<EndReason>>,
}

struct BackendState {
    devices: Vec<DeviceInfo>,
    policy: PermissionPolicy,
    grants: HashMap<GrantId, LiveGrant>,
    next_grant: GrantId,
    acquisitions: u64,
    peak_grants: usize,
}

/// In-process stand-in for camera, microphone and screen-capture hardware.
///
/// Tests and the demo binary use it to script permission answers, unplug
/// devices and revoke shares.
pub struct SimulatedMediaBackend {
    state: Mutex<BackendState>,
    latency: Duration,
    changes: broadcast::Sender<()>,
}

impl SimulatedMediaBackend {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(BackendState {
                devices,
                policy: PermissionPolicy::Grant,
                grants: HashMap::new(),
                next_grant: 1,
                acquisitions: 0,
                peak_grants: 0,
            }),
            latency: Duration::from_millis(300),
            changes,
        }
    }

    pub fn with_default_devices() -> Self {
        Self::new(vec![
            DeviceInfo::new("cam-front", "FaceTime HD Camera"),
            DeviceInfo::new("cam-usb", "USB Webcam"),
        ])
    }

    /// Time every `acquire` spends "waiting on the permission prompt".
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_policy(&self, policy: PermissionPolicy) {
        self.state().policy = policy;
    }

    pub fn plug(&self, device: DeviceInfo) {
        self.state().devices.push(device);
        let _ = self.changes.send(());
    }

    /// Remove a device and end every grant that was using it.
    pub fn unplug(&self, device_id: &str) {
        {
            let mut state = self.state();
            state.devices.retain(|d| d.id != device_id);
            end_grants(&mut state, EndReason::DeviceLost, |grant| {
                grant.device_id.as_deref() == Some(device_id)
            });
        }
        log_info!("device {device_id} unplugged");
        let _ = self.changes.send(());
    }

    /// Simulate the user pressing "Stop sharing" in the OS chrome.
    pub fn revoke_screen_share(&self) {
        let mut state = self.state();
        end_grants(&mut state, EndReason::ShareRevoked, |grant| {
            grant.kind == CaptureKind::Screen
        });
    }

    pub fn live_grants(&self) -> usize {
        self.state().grants.len()
    }

    /// Highest number of grants ever held at once.
    pub fn peak_grants(&self) -> usize {
        self.state().peak_grants
    }

    pub fn acquisitions(&self) -> u64 {
        self.state().acquisitions
    }

    /// `(video, audio)` enabled flags of a live grant.
    pub fn track_state(&self, grant: GrantId) -> Option<(bool, bool)> {
        self.state().grants.get(&grant).map(|g| (g.video, g.audio))
    }

    fn state(&self) -> MutexGuard<'_, BackendState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn end_grants(state: &mut BackendState, reason: EndReason, matches: impl Fn(&LiveGrant) -> bool) {
    let ended: Vec<GrantId> = state
        .grants
        .iter()
        .filter(|(_, grant)| matches(grant))
        .map(|(id, _)| *id)
        .collect();
    for id in ended {
        if let Some(mut grant) = state.grants.remove(&id) {
            if let Some(tx) = grant.ended_tx.take() {
                let _ = tx.send(reason);
            }
        }
    }
}

#[async_trait]
impl MediaBackend for SimulatedMediaBackend {
    async fn enumerate_devices(&self) -> Vec<DeviceInfo> {
        self.state().devices.clone()
    }

    async fn acquire(&self, request: &CaptureRequest) -> SessionResult<HardwareGrant> {
        tokio::time::sleep(self.latency).await;

        let mut state = self.state();
        let denied = match (state.policy, request.kind) {
            (PermissionPolicy::DenyAll, _) => true,
            (PermissionPolicy::DenyCamera, CaptureKind::Camera) => true,
            (PermissionPolicy::DenyScreen, CaptureKind::Screen) => true,
            _ => false,
        };
        if denied {
            return Err(SessionError::PermissionDenied);
        }

        let device_id = match request.kind {
            CaptureKind::Screen => None,
            CaptureKind::Camera => {
                let found = match &request.device_id {
                    Some(wanted) => state.devices.iter().find(|d| &d.id == wanted),
                    None => state.devices.first(),
                };
                match found {
                    Some(device) => Some(device.id.clone()),
                    None => {
                        return Err(SessionError::DeviceUnavailable {
                            device_id: request.device_id.clone().unwrap_or_else(|| "default".into()),
                        })
                    }
                }
            }
        };

        let id = state.next_grant;
        state.next_grant += 1;
        state.acquisitions += 1;

        let (ended_tx, ended) = oneshot::channel();
        state.grants.insert(
            id,
            LiveGrant {
                kind: request.kind,
                device_id: device_id.clone(),
                video: true,
                audio: request.audio_requested,
                ended_tx: Some(ended_tx),
            },
        );
        state.peak_grants = state.peak_grants.max(state.grants.len());

        Ok(HardwareGrant {
            id,
            device_id,
            has_audio: request.audio_requested,
            ended,
        })
    }

    async fn release(&self, grant: GrantId) {
        self.state().grants.remove(&grant);
    }

    async fn set_track_enabled(
        &self,
        grant: GrantId,
        track: TrackKind,
        enabled: bool,
    ) -> SessionResult<()> {
        let mut state = self.state();
        let live = state
            .grants
            .get_mut(&grant)
            .ok_or(SessionError::NoActiveCapture)?;
        match track {
            TrackKind::Video => live.video = enabled,
            TrackKind::Audio => live.audio = enabled,
        }
        Ok(())
    }

    fn device_changes(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }
}
