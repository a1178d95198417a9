use std::time::Duration;

use crate::error::{SessionError, SessionResult};
use crate::settings::RetrySettings;

use super::session::CaptureRequest;

/// Bounded exponential backoff for re-acquiring capture hardware after a
/// permission or device failure.
///
/// Default:
/// Retry 1: 500ms
/// Retry 2: 1s
/// Retry 3: 2s
/// then `RetriesExhausted` until a fresh user-initiated start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: u32,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            multiplier: settings.multiplier.max(1),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }

    /// Delay before the given 1-based retry, or `None` once past the limit.
    pub fn backoff_for(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_attempts {
            return None;
        }
        let factor = self.multiplier.saturating_pow(retry - 1);
        Some(
            self.initial_backoff
                .saturating_mul(factor)
                .min(self.max_backoff),
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

/// Remembers the last failed request and how many retries it has used.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    policy: RetryPolicy,
    failed: Option<CaptureRequest>,
    retries: u32,
}

impl RetryTracker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failed: None,
            retries: 0,
        }
    }

    pub fn record_failure(&mut self, request: CaptureRequest) {
        self.failed = Some(request);
    }

    pub fn record_success(&mut self) {
        self.failed = None;
        self.retries = 0;
    }

    /// A user-initiated start begins a new retry budget.
    pub fn reset(&mut self) {
        self.record_success();
    }

    pub fn retry_available(&self) -> bool {
        self.failed.is_some() && self.retries < self.policy.max_attempts
    }

    /// Claim the next retry: the request to re-issue and how long to wait.
    pub fn next_retry(&mut self) -> SessionResult<(CaptureRequest, Duration)> {
        let request = self.failed.clone().ok_or(SessionError::NoActiveCapture)?;
        let retry = self.retries + 1;
        let backoff = self
            .policy
            .backoff_for(retry)
            .ok_or(SessionError::RetriesExhausted {
                attempts: self.retries,
            })?;
        self.retries = retry;
        Ok((request, backoff))
    }
}
