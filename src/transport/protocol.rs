//! Event schema any transport must speak to be a drop-in replacement for
//! the simulated one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum OutboundEvent {
    #[serde(rename_all = "camelCase")]
    ChatSend {
        body: String,
        /// Echoed back so the sender can match its optimistic copy.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Typing { author: String, is_typing: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum InboundEvent {
    Open,
    #[serde(rename_all = "camelCase")]
    ChatReceived {
        id: String,
        author: String,
        body: String,
        sent_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Typing { author: String, is_typing: bool },
    #[serde(rename_all = "camelCase")]
    Reaction { message_id: String, symbol: String },
    ParticipantCount { count: u32 },
    Close,
}

impl InboundEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::Open => "open",
            InboundEvent::ChatReceived { .. } => "chatReceived",
            InboundEvent::Typing { .. } => "typing",
            InboundEvent::Reaction { .. } => "reaction",
            InboundEvent::ParticipantCount { .. } => "participantCount",
            InboundEvent::Close => "close",
        }
    }
}
