//! The failover engine: try candidates in order, retry per policy, probe
//! streams before handing them to the caller, and leave every audit slot in a
//! terminal state.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;
use http::HeaderMap;
use serde_json::{Map, Value as JsonValue, json};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use apimux_provider::AuthType;
use apimux_scheduling::ProviderCandidate;

use crate::attempt::{AttemptFailure, AttemptFunc, AttemptResult, DispatchStream};
use crate::classify::{ErrorAction, ErrorClassifier};
use crate::error::{CandidateAttempt, DispatchError};
use crate::recorder::CandidateRecorder;
use crate::sanitize::sanitize_error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// Each candidate is tried exactly once.
    Disabled,
    /// The classifier may re-run the same candidate up to the cap.
    OnDemand,
    /// Audit slots for every retry are pre-created; unused ones are closed in
    /// one sweep on success.
    PreExpand,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub mode: RetryMode,
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            mode: RetryMode::Disabled,
            max_retries: 1,
        }
    }

    /// Attempts allowed on one candidate. When the provider carries its own
    /// cap, the tighter of the two wins.
    pub fn attempts_per_candidate(&self, provider_max_retries: Option<u32>) -> u32 {
        let base = match self.mode {
            RetryMode::Disabled => 1,
            RetryMode::OnDemand | RetryMode::PreExpand => self.max_retries.max(1),
        };
        match provider_max_retries {
            Some(cap) => base.min(cap.max(1)),
            None => base,
        }
    }

    /// Audit slots to pre-create per candidate.
    pub fn expanded_slots(&self) -> u32 {
        match self.mode {
            RetryMode::PreExpand => self.max_retries.max(1),
            _ => 1,
        }
    }
}

pub type BillingGate = Arc<dyn Fn(&ProviderCandidate) -> bool + Send + Sync>;
pub type TaskIdExtractor = Arc<dyn Fn(&JsonValue) -> Option<String> + Send + Sync>;

/// Pre-flight filters applied before a candidate is attempted.
#[derive(Clone)]
pub struct SkipPolicy {
    pub supported_auth_types: Option<HashSet<AuthType>>,
    pub allow_format_conversion: bool,
    /// Present when `billing_require_rule` is on; candidates without a
    /// matching rule are skipped.
    pub billing_rule: Option<BillingGate>,
}

impl Default for SkipPolicy {
    fn default() -> Self {
        Self {
            supported_auth_types: None,
            allow_format_conversion: true,
            billing_rule: None,
        }
    }
}

/// What the engine hands back on success.
pub enum AttemptResponse {
    Sync {
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
        task_id: String,
        payload: JsonValue,
    },
}

pub struct FailoverOutcome {
    pub candidate_index: usize,
    pub retry_index: u32,
    pub attempt_count: u32,
    pub candidate: ProviderCandidate,
    pub response: AttemptResponse,
}

impl std::fmt::Debug for AttemptResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptResponse::Sync {
                status,
                headers,
                body,
            } => f
                .debug_struct("Sync")
                .field("status", status)
                .field("headers", headers)
                .field("body", body)
                .finish(),
            AttemptResponse::Stream { status, headers, .. } => f
                .debug_struct("Stream")
                .field("status", status)
                .field("headers", headers)
                .field("stream", &"<stream>")
                .finish(),
            AttemptResponse::AsyncSubmit {
                status,
                headers,
                task_id,
                payload,
            } => f
                .debug_struct("AsyncSubmit")
                .field("status", status)
                .field("headers", headers)
                .field("task_id", task_id)
                .field("payload", payload)
                .finish(),
        }
    }
}

impl std::fmt::Debug for FailoverOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverOutcome")
            .field("candidate_index", &self.candidate_index)
            .field("retry_index", &self.retry_index)
            .field("attempt_count", &self.attempt_count)
            .field("candidate", &self.candidate)
            .field("response", &self.response)
            .finish()
    }
}

pub struct FailoverParams<'a> {
    pub candidates: Vec<ProviderCandidate>,
    pub attempt_func: &'a dyn AttemptFunc,
    pub retry_policy: RetryPolicy,
    pub skip_policy: &'a SkipPolicy,
    pub recorder: &'a CandidateRecorder,
    /// Required for `AsyncSubmit` attempts; a submission without a non-empty
    /// task id is a failure.
    pub extract_task_id: Option<TaskIdExtractor>,
}

#[derive(Default)]
pub struct FailoverEngine {
    classifier: ErrorClassifier,
}

enum AttemptVerdict {
    Succeeded(Box<FailoverOutcome>),
    Failed(AttemptFailure),
}

impl FailoverEngine {
    pub fn new(classifier: ErrorClassifier) -> Self {
        Self { classifier }
    }

    /// Run the failover. On return, every pre-created audit slot is terminal:
    /// skipped, failed, success/streaming, or unused.
    pub async fn execute(
        &self,
        params: FailoverParams<'_>,
    ) -> Result<FailoverOutcome, DispatchError> {
        let recorder = params.recorder;
        let result = self.run(params).await;
        recorder.finish_unused(OffsetDateTime::now_utc()).await;
        result
    }

    async fn run(&self, params: FailoverParams<'_>) -> Result<FailoverOutcome, DispatchError> {
        let FailoverParams {
            candidates,
            attempt_func,
            retry_policy,
            skip_policy,
            recorder,
            extract_task_id,
        } = params;

        if candidates.is_empty() {
            return Err(DispatchError::NoEligibleCandidates { audit: Vec::new() });
        }

        let mut audit: Vec<CandidateAttempt> = Vec::new();
        let mut eligible = 0usize;
        let mut last_status: Option<u16> = None;
        let mut attempt_count = 0u32;

        for (index, candidate) in candidates.iter().enumerate() {
            let mut entry = CandidateAttempt::from_candidate(index, candidate);

            if let Some(reason) = self.preflight_skip(candidate, skip_policy) {
                debug!(index, %reason, "candidate skipped before attempt");
                recorder
                    .mark_skipped((index, 0), &reason, None, None, None, OffsetDateTime::now_utc())
                    .await;
                entry.skipped = true;
                entry.skip_reason = Some(reason);
                audit.push(entry);
                continue;
            }

            eligible += 1;
            let max_attempts = retry_policy.attempts_per_candidate(candidate.provider.max_retries);
            let mut retry = 0u32;

            loop {
                recorder
                    .mark_pending((index, retry), OffsetDateTime::now_utc())
                    .await;
                attempt_count += 1;

                let verdict = self
                    .attempt_once(
                        candidate,
                        index,
                        retry,
                        attempt_count,
                        attempt_func,
                        recorder,
                        extract_task_id.as_ref(),
                    )
                    .await;

                let failure = match verdict {
                    AttemptVerdict::Succeeded(outcome) => {
                        entry.status_code = Some(match &outcome.response {
                            AttemptResponse::Sync { status, .. }
                            | AttemptResponse::Stream { status, .. }
                            | AttemptResponse::AsyncSubmit { status, .. } => *status,
                        });
                        audit.push(entry);
                        info!(index, retry, "candidate succeeded");
                        return Ok(*outcome);
                    }
                    AttemptVerdict::Failed(failure) => failure,
                };

                if matches!(failure, AttemptFailure::ConcurrencyDenied) {
                    // Not a candidate failure: the key's window is full right
                    // now, so hand the request to the next candidate.
                    let mut extra = Map::new();
                    extra.insert("concurrency_denied".to_string(), json!(true));
                    recorder
                        .mark_skipped(
                            (index, retry),
                            "concurrency",
                            None,
                            None,
                            Some(extra),
                            OffsetDateTime::now_utc(),
                        )
                        .await;
                    entry.skipped = true;
                    entry.skip_reason = Some("concurrency".to_string());
                    audit.push(entry);
                    break;
                }

                last_status = failure.status().or(last_status);
                entry.status_code = failure.status();
                entry.error_type = Some(failure.kind());
                entry.error_message = Some(failure.to_string());
                recorder
                    .mark_failed((index, retry), &failure, OffsetDateTime::now_utc())
                    .await;

                let has_retry_left = retry + 1 < max_attempts;
                match self.classifier.classify(&failure, has_retry_left) {
                    ErrorAction::Raise => {
                        let status = failure.status().unwrap_or(400);
                        let message = sanitize_error(&failure.to_string());
                        audit.push(entry);
                        return Err(DispatchError::UpstreamClientRequest {
                            status,
                            message,
                            audit,
                        });
                    }
                    ErrorAction::Continue if has_retry_left => {
                        warn!(index, retry, error = %failure, "retrying candidate");
                        retry += 1;
                        continue;
                    }
                    _ => {
                        warn!(index, retry, error = %failure, "moving to next candidate");
                        audit.push(entry);
                        break;
                    }
                }
            }
        }

        if eligible == 0 {
            return Err(DispatchError::NoEligibleCandidates { audit });
        }
        Err(DispatchError::AllCandidatesFailed {
            reason: "all_candidates_failed",
            audit,
            last_status,
        })
    }

    fn preflight_skip(
        &self,
        candidate: &ProviderCandidate,
        skip_policy: &SkipPolicy,
    ) -> Option<String> {
        if candidate.is_skipped {
            return Some(
                candidate
                    .skip_reason
                    .clone()
                    .unwrap_or_else(|| "skipped".to_string()),
            );
        }
        if let Some(supported) = &skip_policy.supported_auth_types
            && !supported.contains(&candidate.key.auth_type)
        {
            return Some(format!(
                "unsupported_auth_type:{}",
                candidate.key.auth_type.as_str()
            ));
        }
        if !skip_policy.allow_format_conversion && candidate.needs_conversion {
            return Some("format_conversion_not_supported".to_string());
        }
        if let Some(billing_rule) = &skip_policy.billing_rule
            && !(billing_rule)(candidate)
        {
            return Some("billing_rule_missing".to_string());
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_once(
        &self,
        candidate: &ProviderCandidate,
        index: usize,
        retry: u32,
        attempt_count: u32,
        attempt_func: &dyn AttemptFunc,
        recorder: &CandidateRecorder,
        extract_task_id: Option<&TaskIdExtractor>,
    ) -> AttemptVerdict {
        let result = match attempt_func.call(candidate, (index, retry)).await {
            Ok(result) => result,
            Err(failure) => return AttemptVerdict::Failed(failure),
        };

        match result {
            AttemptResult::SyncResponse {
                status,
                headers,
                body,
            } => {
                if !(200..300).contains(&status) {
                    let excerpt = sanitize_error(&String::from_utf8_lossy(&body));
                    return AttemptVerdict::Failed(AttemptFailure::Http {
                        status,
                        body_excerpt: excerpt,
                    });
                }
                recorder
                    .mark_success(
                        (index, retry),
                        status,
                        None,
                        None,
                        None,
                        OffsetDateTime::now_utc(),
                    )
                    .await;
                AttemptVerdict::Succeeded(Box::new(FailoverOutcome {
                    candidate_index: index,
                    retry_index: retry,
                    attempt_count,
                    candidate: candidate.clone(),
                    response: AttemptResponse::Sync {
                        status,
                        headers,
                        body,
                    },
                }))
            }
            AttemptResult::Stream {
                status,
                headers,
                stream,
            } => match probe_stream(stream, status).await {
                Ok(stream) => {
                    recorder
                        .mark_streaming((index, retry), status, None, OffsetDateTime::now_utc())
                        .await;
                    AttemptVerdict::Succeeded(Box::new(FailoverOutcome {
                        candidate_index: index,
                        retry_index: retry,
                        attempt_count,
                        candidate: candidate.clone(),
                        response: AttemptResponse::Stream {
                            status,
                            headers,
                            stream,
                        },
                    }))
                }
                Err(failure) => AttemptVerdict::Failed(failure),
            },
            AttemptResult::AsyncSubmit {
                status,
                headers,
                payload,
            } => {
                if !(200..300).contains(&status) {
                    let excerpt = sanitize_error(&payload.to_string());
                    return AttemptVerdict::Failed(AttemptFailure::Http {
                        status,
                        body_excerpt: excerpt,
                    });
                }
                let Some(extract) = extract_task_id else {
                    return AttemptVerdict::Failed(AttemptFailure::Adapter {
                        message: "async submit without a task id extractor".to_string(),
                    });
                };
                let task_id = extract(&payload).filter(|id| !id.is_empty());
                let Some(task_id) = task_id else {
                    return AttemptVerdict::Failed(AttemptFailure::EmptyTaskId);
                };
                recorder
                    .mark_success(
                        (index, retry),
                        status,
                        None,
                        None,
                        None,
                        OffsetDateTime::now_utc(),
                    )
                    .await;
                AttemptVerdict::Succeeded(Box::new(FailoverOutcome {
                    candidate_index: index,
                    retry_index: retry,
                    attempt_count,
                    candidate: candidate.clone(),
                    response: AttemptResponse::AsyncSubmit {
                        status,
                        headers,
                        task_id,
                        payload,
                    },
                }))
            }
        }
    }
}

/// Pull chunks until the first non-empty one arrives, then re-emit everything
/// consumed in front of the rest of the stream. An iterator yielding only
/// empty chunks (or nothing) is a probe failure, not a success with an empty
/// body.
async fn probe_stream(
    mut stream: DispatchStream,
    status: u16,
) -> Result<DispatchStream, AttemptFailure> {
    let mut prefix: Vec<Bytes> = Vec::new();
    loop {
        match stream.next().await {
            None => {
                return Err(AttemptFailure::StreamProbe {
                    status,
                    message: if prefix.is_empty() {
                        "no bytes before first chunk".to_string()
                    } else {
                        "stream ended after empty chunks only".to_string()
                    },
                });
            }
            Some(Err(failure)) => {
                return Err(AttemptFailure::StreamProbe {
                    status: failure.status().unwrap_or(status),
                    message: sanitize_error(&failure.to_string()),
                });
            }
            Some(Ok(chunk)) => {
                let got_data = !chunk.is_empty();
                prefix.push(chunk);
                if got_data {
                    break;
                }
            }
        }
    }
    Ok(stream::iter(prefix.into_iter().map(Ok)).chain(stream).boxed())
}
