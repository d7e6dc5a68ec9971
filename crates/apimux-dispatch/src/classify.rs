//! Upstream failure classification: retry the same candidate, move to the
//! next one, or stop the whole failover because the caller's request is bad.

use crate::attempt::AttemptFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry the same candidate (with backoff handled by the caller).
    Continue,
    /// Give up on this candidate, try the next one.
    Break,
    /// The caller's request is at fault; stop the failover entirely.
    Raise,
}

/// Body fragments that identify a request the caller must fix. The classifier
/// only ever sees sanitized excerpts, never the full body.
const CLIENT_ERROR_MARKERS: [&str; 8] = [
    "missing required",
    "missing field",
    "invalid json",
    "json parse",
    "schema",
    "invalid_request",
    "safety",
    "content policy",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn is_client_error(&self, excerpt: &str) -> bool {
        let lowered = excerpt.to_ascii_lowercase();
        CLIENT_ERROR_MARKERS
            .iter()
            .any(|marker| lowered.contains(marker))
    }

    pub fn classify(&self, failure: &AttemptFailure, has_retry_left: bool) -> ErrorAction {
        match failure {
            AttemptFailure::Http { status, body_excerpt } => match status {
                // Key/permission/limit trouble: another candidate may work.
                401 | 403 | 429 => ErrorAction::Break,
                400..=499 => {
                    if self.is_client_error(body_excerpt) {
                        ErrorAction::Raise
                    } else {
                        ErrorAction::Break
                    }
                }
                _ => {
                    if has_retry_left {
                        ErrorAction::Continue
                    } else {
                        ErrorAction::Break
                    }
                }
            },
            AttemptFailure::Network { .. } | AttemptFailure::Timeout { .. } => {
                if has_retry_left {
                    ErrorAction::Continue
                } else {
                    ErrorAction::Break
                }
            }
            AttemptFailure::StreamProbe { .. } => ErrorAction::Break,
            AttemptFailure::ConcurrencyDenied => ErrorAction::Break,
            AttemptFailure::EmptyTaskId => ErrorAction::Break,
            AttemptFailure::Adapter { .. } => ErrorAction::Break,
        }
    }
}
