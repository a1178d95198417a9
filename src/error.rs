//! Error taxonomy shared by the capture, transport and workout components.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Typed failures returned across the command boundary.
///
/// Capture and transport failures are always returned as values so the
/// presentation layer can render a retry or reconnect affordance.
/// `InvalidTransition` is produced by the workout state machine but is
/// swallowed by the controller, since it usually comes from a double click.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SessionError {
    #[error("permission to access the capture device was denied")]
    PermissionDenied,

    #[error("capture device unavailable: {device_id}")]
    DeviceUnavailable { device_id: String },

    #[error("transport is not connected")]
    NotConnected,

    #[error("transport connection is closed")]
    ConnectionClosed,

    #[error("cannot {action} while {from}")]
    InvalidTransition { from: String, action: String },

    /// The capture request was abandoned because the owner was torn down.
    #[error("capture request was cancelled")]
    Cancelled,

    #[error("no active capture session")]
    NoActiveCapture,

    #[error("capture retry limit reached after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("session engine has been shut down")]
    ShutDown,
}

impl SessionError {
    /// Whether the UI should offer the user another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::PermissionDenied | SessionError::DeviceUnavailable { .. }
        )
    }

    pub(crate) fn invalid_transition(from: impl Into<String>, action: impl Into<String>) -> Self {
        SessionError::InvalidTransition {
            from: from.into(),
            action: action.into(),
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_failures_are_retryable() {
        assert!(SessionError::PermissionDenied.is_retryable());
        assert!(SessionError::DeviceUnavailable {
            device_id: "cam-1".into()
        }
        .is_retryable());
        assert!(!SessionError::NotConnected.is_retryable());
        assert!(!SessionError::RetriesExhausted { attempts: 3 }.is_retryable());
    }

    #[test]
    fn serializes_with_kind_tag() {
        let json = serde_json::to_value(SessionError::DeviceUnavailable {
            device_id: "cam-1".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "deviceUnavailable");
        assert_eq!(json["device_id"], "cam-1");
    }

    #[test]
    fn invalid_transition_message() {
        let err = SessionError::invalid_transition("stopped", "resume");
        assert_eq!(err.to_string(), "cannot resume while stopped");
    }
}
