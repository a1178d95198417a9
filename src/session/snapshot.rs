use std::collections::VecDeque;

use serde::Serialize;
use tokio::time::Instant;

use crate::capture::{CaptureEvent, CaptureLifecycle, CaptureSession, DeviceInfo, EndReason};
use crate::error::SessionError;
use crate::settings::PresenceSettings;
use crate::transport::{
    ChatMessage, ConnectionState, InboundEvent, MessageLog, TransportEnvelope, TypingTracker,
};
use crate::workout::{Achievement, InstructorCue, WorkoutEvent, WorkoutRunView};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CaptureErrorView {
    pub error: SessionError,
    pub retry_available: bool,
}

/// Everything the presentation layer renders, rebuilt on every change.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub capture: Option<CaptureSession>,
    pub capture_error: Option<CaptureErrorView>,
    /// Why the last capture ended, until a new one goes live.
    pub capture_ended: Option<EndReason>,
    pub devices: Vec<DeviceInfo>,
    pub connection: Option<ConnectionState>,
    pub participant_count: u32,
    pub messages: Vec<ChatMessage>,
    pub typing_authors: Vec<String>,
    pub workout_run: WorkoutRunView,
    /// Achievements still on display, oldest first.
    pub toasts: Vec<Achievement>,
    pub cue: Option<InstructorCue>,
}

/// Mutable state behind [`SessionSnapshot`]. Every `apply_*` returns whether
/// anything visible changed.
pub(crate) struct SessionView {
    capture: Option<CaptureSession>,
    capture_error: Option<CaptureErrorView>,
    capture_ended: Option<EndReason>,
    devices: Vec<DeviceInfo>,
    connection: Option<ConnectionState>,
    connection_id: Option<u64>,
    participant_count: u32,
    messages: MessageLog,
    typing: TypingTracker,
    workout_run: WorkoutRunView,
    toasts: VecDeque<(Achievement, Instant)>,
    cue: Option<(InstructorCue, Instant)>,
    presence: PresenceSettings,
}

impl SessionView {
    pub(crate) fn new(
        presence: PresenceSettings,
        chat_history_limit: usize,
        workout_run: WorkoutRunView,
    ) -> Self {
        Self {
            capture: None,
            capture_error: None,
            capture_ended: None,
            devices: Vec::new(),
            connection: None,
            connection_id: None,
            participant_count: 0,
            messages: MessageLog::with_limit(chat_history_limit),
            typing: TypingTracker::new(presence.typing_expiry()),
            workout_run,
            toasts: VecDeque::new(),
            cue: None,
            presence,
        }
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            capture: self.capture.clone(),
            capture_error: self.capture_error.clone(),
            capture_ended: self.capture_ended,
            devices: self.devices.clone(),
            connection: self.connection,
            participant_count: self.participant_count,
            messages: self.messages.messages().to_vec(),
            typing_authors: self.typing.authors(),
            workout_run: self.workout_run.clone(),
            toasts: self.toasts.iter().map(|(a, _)| a.clone()).collect(),
            cue: self.cue.as_ref().map(|(cue, _)| cue.clone()),
        }
    }

    pub(crate) fn apply_capture(&mut self, event: CaptureEvent) -> bool {
        match event {
            CaptureEvent::Changed(session) => {
                if let Some(live) = &session {
                    if live.lifecycle == CaptureLifecycle::Active {
                        self.capture_ended = None;
                        self.capture_error = None;
                    }
                }
                self.capture = session;
            }
            CaptureEvent::Ended { reason, .. } => {
                self.capture_ended = Some(reason);
            }
            CaptureEvent::DevicesChanged(devices) => {
                self.devices = devices;
            }
        }
        true
    }

    pub(crate) fn set_capture_error(&mut self, error: Option<CaptureErrorView>) {
        self.capture_error = error;
    }

    pub(crate) fn set_devices(&mut self, devices: Vec<DeviceInfo>) -> bool {
        if self.devices == devices {
            return false;
        }
        self.devices = devices;
        true
    }

    /// Track a fresh connection. Events from any other connection id are
    /// dropped from here on.
    pub(crate) fn begin_connection(&mut self, connection_id: u64) {
        self.connection_id = Some(connection_id);
        self.connection = Some(ConnectionState::Connecting);
        self.participant_count = 0;
        self.typing.clear();
    }

    pub(crate) fn apply_transport(&mut self, envelope: TransportEnvelope, now: Instant) -> bool {
        if self.connection_id != Some(envelope.connection_id) {
            return false;
        }
        match envelope.event {
            InboundEvent::Open => {
                self.connection = Some(ConnectionState::Open);
            }
            InboundEvent::ChatReceived {
                id,
                author,
                body,
                sent_at,
                client_id,
            } => {
                self.messages.receive(id, author, body, sent_at, client_id);
            }
            InboundEvent::Typing { author, is_typing } => {
                self.typing.apply(author, is_typing, now);
            }
            InboundEvent::Reaction { message_id, symbol } => {
                return self.messages.react(&message_id, symbol);
            }
            InboundEvent::ParticipantCount { count } => {
                self.participant_count = count;
            }
            InboundEvent::Close => {
                self.connection = Some(ConnectionState::Closed);
                self.typing.clear();
            }
        }
        true
    }

    pub(crate) fn messages_mut(&mut self) -> &mut MessageLog {
        &mut self.messages
    }

    pub(crate) fn apply_workout(&mut self, event: WorkoutEvent, now: Instant) -> bool {
        match event {
            WorkoutEvent::Changed(run) => {
                self.workout_run = run;
            }
            WorkoutEvent::Achievement(achievement) => {
                let until = now + self.presence.achievement_display();
                self.toasts.push_back((achievement, until));
            }
            WorkoutEvent::Cue(cue) => {
                self.cue = Some((cue, now + self.presence.cue_display()));
            }
        }
        true
    }

    /// Drop typing entries, toasts and the cue whose display window ran out.
    pub(crate) fn expire(&mut self, now: Instant) -> bool {
        let mut changed = self.typing.prune(now);

        let before = self.toasts.len();
        self.toasts.retain(|(_, until)| *until > now);
        changed |= self.toasts.len() != before;

        if matches!(&self.cue, Some((_, until)) if *until <= now) {
            self.cue = None;
            changed = true;
        }
        changed
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let toasts = self.toasts.iter().map(|(_, until)| *until);
        let cue = self.cue.as_ref().map(|(_, until)| *until);
        toasts.chain(cue).chain(self.typing.next_expiry()).min()
    }
}
