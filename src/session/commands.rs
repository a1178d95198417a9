//! JSON-friendly command surface for a presentation layer.

use serde::{Deserialize, Serialize};

use crate::capture::{CaptureKind, CaptureSession, DeviceInfo, TrackKind};
use crate::error::SessionResult;
use crate::transport::ChatMessage;
use crate::workout::WorkoutRunView;

use super::orchestrator::SessionOrchestrator;
use super::snapshot::SessionSnapshot;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum SessionCommand {
    #[serde(rename_all = "camelCase")]
    StartCapture {
        kind: CaptureKind,
        #[serde(default)]
        device_id: Option<String>,
    },
    StopCapture,
    ToggleTrack {
        track: TrackKind,
    },
    SwitchSource,
    RetryCapture,
    ListDevices,
    ConnectTransport,
    DisconnectTransport,
    SendChat {
        body: String,
    },
    #[serde(rename_all = "camelCase")]
    SetTyping {
        is_typing: bool,
    },
    StartWorkout,
    PauseWorkout,
    ResumeWorkout,
    SkipStep,
    Snapshot,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "reply", rename_all = "camelCase")]
pub enum CommandReply {
    Capture { session: CaptureSession },
    Devices { devices: Vec<DeviceInfo> },
    Chat { message: ChatMessage },
    Workout { run: WorkoutRunView },
    Snapshot { snapshot: Box<SessionSnapshot> },
    Done,
}

pub async fn dispatch(
    orchestrator: &SessionOrchestrator,
    command: SessionCommand,
) -> SessionResult<CommandReply> {
    let reply = match command {
        SessionCommand::StartCapture { kind, device_id } => CommandReply::Capture {
            session: orchestrator.start_capture(kind, device_id).await?,
        },
        SessionCommand::StopCapture => {
            orchestrator.stop_capture().await?;
            CommandReply::Done
        }
        SessionCommand::ToggleTrack { track } => CommandReply::Capture {
            session: orchestrator.toggle_track(track).await?,
        },
        SessionCommand::SwitchSource => CommandReply::Capture {
            session: orchestrator.switch_source().await?,
        },
        SessionCommand::RetryCapture => CommandReply::Capture {
            session: orchestrator.retry_capture().await?,
        },
        SessionCommand::ListDevices => CommandReply::Devices {
            devices: orchestrator.list_devices().await?,
        },
        SessionCommand::ConnectTransport => {
            orchestrator.connect_transport().await?;
            CommandReply::Done
        }
        SessionCommand::DisconnectTransport => {
            orchestrator.disconnect_transport().await?;
            CommandReply::Done
        }
        SessionCommand::SendChat { body } => CommandReply::Chat {
            message: orchestrator.send_chat(body).await?,
        },
        SessionCommand::SetTyping { is_typing } => {
            orchestrator.set_typing(is_typing).await?;
            CommandReply::Done
        }
        SessionCommand::StartWorkout => CommandReply::Workout {
            run: orchestrator.start_workout().await?,
        },
        SessionCommand::PauseWorkout => CommandReply::Workout {
            run: orchestrator.pause_workout().await?,
        },
        SessionCommand::ResumeWorkout => CommandReply::Workout {
            run: orchestrator.resume_workout().await?,
        },
        SessionCommand::SkipStep => CommandReply::Workout {
            run: orchestrator.skip_step().await?,
        },
        SessionCommand::Snapshot => CommandReply::Snapshot {
            snapshot: Box::new(orchestrator.snapshot()),
        },
        SessionCommand::Shutdown => {
            orchestrator.shutdown().await;
            CommandReply::Done
        }
    };
    Ok(reply)
}
