use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum CaptureKind {
    Camera,
    Screen,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum TrackKind {
    Video,
    Audio,
}

/// `Idle -> Requesting -> Active -> Ended`. Muting is carried by the track
/// flags and does not move the lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum CaptureLifecycle {
    #[default]
    Idle,
    Requesting,
    Active,
    Ended,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum EndReason {
    Stopped,
    /// The input device disappeared mid-session.
    DeviceLost,
    /// The user revoked a screen share from outside the app.
    ShareRevoked,
    /// Released so a new capture could take the hardware.
    Replaced,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRequest {
    pub kind: CaptureKind,
    pub device_id: Option<String>,
    pub audio_requested: bool,
}

impl CaptureRequest {
    pub fn camera(device_id: Option<String>) -> Self {
        Self {
            kind: CaptureKind::Camera,
            device_id,
            audio_requested: true,
        }
    }

    pub fn screen() -> Self {
        Self {
            kind: CaptureKind::Screen,
            device_id: None,
            audio_requested: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSession {
    pub id: Uuid,
    pub kind: CaptureKind,
    pub video_enabled: bool,
    pub audio_enabled: bool,
    pub device_id: Option<String>,
    pub lifecycle: CaptureLifecycle,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
}

impl CaptureSession {
    pub(crate) fn requesting(request: &CaptureRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: request.kind,
            video_enabled: true,
            audio_enabled: request.audio_requested,
            device_id: request.device_id.clone(),
            lifecycle: CaptureLifecycle::Requesting,
            started_at: Utc::now(),
            end_reason: None,
        }
    }

    pub(crate) fn activate(&mut self, device_id: Option<String>, has_audio: bool) {
        self.lifecycle = CaptureLifecycle::Active;
        self.device_id = device_id;
        self.audio_enabled = self.audio_enabled && has_audio;
        self.started_at = Utc::now();
    }

    pub fn is_live(&self) -> bool {
        matches!(
            self.lifecycle,
            CaptureLifecycle::Requesting | CaptureLifecycle::Active
        )
    }

    pub fn is_muted(&self, track: TrackKind) -> bool {
        match track {
            TrackKind::Video => !self.video_enabled,
            TrackKind::Audio => !self.audio_enabled,
        }
    }

    pub(crate) fn set_track(&mut self, track: TrackKind, enabled: bool) {
        match track {
            TrackKind::Video => self.video_enabled = enabled,
            TrackKind::Audio => self.audio_enabled = enabled,
        }
    }

    pub(crate) fn end(&mut self, reason: EndReason) {
        if self.lifecycle != CaptureLifecycle::Ended {
            self.lifecycle = CaptureLifecycle::Ended;
            self.end_reason = Some(reason);
        }
    }
}
