use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub author: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    /// Symbol -> count. Only ever grows.
    pub reactions: BTreeMap<String, u32>,
    /// Still waiting for the server echo.
    pub pending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// Ordered chat history with optimistic sends.
///
/// Once the history passes `limit`, the oldest confirmed messages are
/// dropped. Pending copies are never trimmed so an echo always finds them.
#[derive(Debug, Clone)]
pub struct MessageLog {
    messages: Vec<ChatMessage>,
    limit: usize,
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::with_limit(usize::MAX)
    }
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            messages: Vec::new(),
            limit,
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Record a locally sent message before the server has acknowledged it.
    pub fn push_optimistic(&mut self, client_id: String, author: String, body: String) -> ChatMessage {
        let message = ChatMessage {
            id: client_id.clone(),
            author,
            body,
            sent_at: Utc::now(),
            reactions: BTreeMap::new(),
            pending: true,
            client_id: Some(client_id),
        };
        self.messages.push(message.clone());
        self.trim();
        message
    }

    /// Apply an inbound `chatReceived`. An echo of an optimistic send takes
    /// over the local copy; a repeat of a known id is ignored.
    pub fn receive(
        &mut self,
        id: String,
        author: String,
        body: String,
        sent_at: DateTime<Utc>,
        client_id: Option<String>,
    ) {
        if self.messages.iter().any(|m| m.id == id) {
            return;
        }
        if let Some(client_id) = client_id.as_deref() {
            if let Some(local) = self
                .messages
                .iter_mut()
                .find(|m| m.client_id.as_deref() == Some(client_id))
            {
                local.id = id;
                local.sent_at = sent_at;
                local.pending = false;
                return;
            }
        }
        self.messages.push(ChatMessage {
            id,
            author,
            body,
            sent_at,
            reactions: BTreeMap::new(),
            pending: false,
            client_id,
        });
        self.trim();
    }

    /// Returns false when the message is unknown.
    pub fn react(&mut self, message_id: &str, symbol: String) -> bool {
        match self.messages.iter_mut().find(|m| m.id == message_id) {
            Some(message) => {
                *message.reactions.entry(symbol).or_insert(0) += 1;
                true
            }
            None => false,
        }
    }

    /// Drop an optimistic copy whose send was rejected.
    pub fn discard_pending(&mut self, client_id: &str) {
        self.messages
            .retain(|m| !(m.pending && m.client_id.as_deref() == Some(client_id)));
    }

    fn trim(&mut self) {
        while self.messages.len() > self.limit {
            match self.messages.iter().position(|m| !m.pending) {
                Some(oldest) => {
                    self.messages.remove(oldest);
                }
                None => break,
            }
        }
    }
}
