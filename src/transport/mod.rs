pub mod chat;
pub mod protocol;
pub mod scheduler;
pub mod simulated;
pub mod typing;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::SessionResult;

pub use chat::{ChatMessage, MessageLog};
pub use protocol::{InboundEvent, OutboundEvent};
pub use scheduler::{FixedScheduler, PushKind, PushScheduler, RandomScheduler};
pub use simulated::{SimulatedTransport, SimulatedTransportFactory};
pub use typing::TypingTracker;

/// `Connecting -> Open -> Closed`. `Closed` is terminal and reachable from
/// any state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// An inbound event tagged with the connection that produced it, so events
/// from a replaced connection can be told apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEnvelope {
    pub connection_id: u64,
    pub event: InboundEvent,
}

/// One duplex connection speaking the [`protocol`] schema.
///
/// Outbound calls are rejected with `NotConnected` until `Open` has been
/// delivered and with `ConnectionClosed` after `close`. Nothing is queued.
pub trait SessionTransport: Send + Sync {
    fn connection_id(&self) -> u64;

    fn state(&self) -> ConnectionState;

    fn participant_count(&self) -> u32;

    fn send(&self, event: OutboundEvent) -> SessionResult<()>;

    /// Idempotent. Delivers a final `Close` event the first time.
    fn close(&self);
}

/// Opens connections. Swapping the simulated factory for a networked one
/// requires no orchestrator changes.
pub trait TransportFactory: Send + Sync {
    /// The returned connection starts in `Connecting`.
    fn connect(
        &self,
        connection_id: u64,
        events: mpsc::UnboundedSender<TransportEnvelope>,
    ) -> Arc<dyn SessionTransport>;
}
