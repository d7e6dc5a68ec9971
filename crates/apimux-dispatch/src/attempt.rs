use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use http::HeaderMap;
use serde_json::Value as JsonValue;

use apimux_scheduling::ProviderCandidate;

/// Failures an attempt can produce, in the shape the classifier consumes.
/// Messages carried here are already sanitized.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AttemptFailure {
    #[error("upstream http {status}: {body_excerpt}")]
    Http { status: u16, body_excerpt: String },
    #[error("network error: {message}")]
    Network { message: String },
    #[error("timeout: {message}")]
    Timeout { message: String },
    #[error("stream probe failed (http {status}): {message}")]
    StreamProbe { status: u16, message: String },
    #[error("rpm limit reached")]
    ConcurrencyDenied,
    #[error("upstream returned empty task id")]
    EmptyTaskId,
    #[error("{message}")]
    Adapter { message: String },
}

impl AttemptFailure {
    pub fn status(&self) -> Option<u16> {
        match self {
            AttemptFailure::Http { status, .. } | AttemptFailure::StreamProbe { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// Stable label persisted in audit rows.
    pub fn kind(&self) -> &'static str {
        match self {
            AttemptFailure::Http { .. } => "http_error",
            AttemptFailure::Network { .. } => "network_error",
            AttemptFailure::Timeout { .. } => "timeout",
            AttemptFailure::StreamProbe { .. } => "stream_probe_error",
            AttemptFailure::ConcurrencyDenied => "concurrency",
            AttemptFailure::EmptyTaskId => "empty_task_id",
            AttemptFailure::Adapter { .. } => "adapter_error",
        }
    }
}

pub type DispatchStream = BoxStream<'static, Result<Bytes, AttemptFailure>>;

/// Unified result of one upstream attempt. The variant dictates how the
/// failover engine verifies success.
pub enum AttemptResult {
    SyncResponse {
        status: u16,
        headers: HeaderMap,
        body: Bytes,
    },
    Stream {
        status: u16,
        headers: HeaderMap,
        stream: DispatchStream,
    },
    AsyncSubmit {
        status: u16,
        headers: HeaderMap,
        payload: JsonValue,
    },
}

impl AttemptResult {
    pub fn status(&self) -> u16 {
        match self {
            AttemptResult::SyncResponse { status, .. }
            | AttemptResult::Stream { status, .. }
            | AttemptResult::AsyncSubmit { status, .. } => *status,
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        match self {
            AttemptResult::SyncResponse { headers, .. }
            | AttemptResult::Stream { headers, .. }
            | AttemptResult::AsyncSubmit { headers, .. } => headers,
        }
    }
}

/// `(candidate_index, retry_index)` of one attempt; doubles as the audit-slot
/// key.
pub type AttemptSlot = (usize, u32);

pub type AttemptFuture = BoxFuture<'static, Result<AttemptResult, AttemptFailure>>;

/// One upstream attempt for a candidate. The engine never fans out: attempts
/// are strictly sequential within a request.
pub trait AttemptFunc: Send + Sync {
    fn call(&self, candidate: &ProviderCandidate, slot: AttemptSlot) -> AttemptFuture;
}

impl<F> AttemptFunc for F
where
    F: Fn(&ProviderCandidate, AttemptSlot) -> AttemptFuture + Send + Sync,
{
    fn call(&self, candidate: &ProviderCandidate, slot: AttemptSlot) -> AttemptFuture {
        (self)(candidate, slot)
    }
}
