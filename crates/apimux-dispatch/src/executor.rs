//! Per-attempt execution: claim an RPM slot, invoke the adapter, feed the
//! health monitor and the adaptive learner, and annotate the audit slot.

use serde_json::{Map, json};
use std::sync::Arc;

use time::OffsetDateTime;
use tracing::debug;

use apimux_ratelimit::{ReservationPhase, detect_rate_limit};
use apimux_scheduling::{ConcurrencyChecker, ConcurrencyError, HealthMonitor, ProviderCandidate};

use crate::attempt::{AttemptFailure, AttemptFuture, AttemptResult, AttemptSlot};
use crate::keystate::AdaptiveService;
use crate::recorder::CandidateRecorder;
use crate::sanitize::sanitize_error;

/// Snapshot of the admission state around one attempt, for logging and audit.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext {
    pub candidate_index: usize,
    pub retry_index: u32,
    pub provider_id: i64,
    pub endpoint_id: i64,
    pub key_id: i64,
    pub is_cached_user: bool,
    pub elapsed_ms: Option<u64>,
    pub concurrent_requests: u32,
    pub rpm_limit: Option<u32>,
    pub reservation_ratio: f64,
    pub reservation_phase: ReservationPhase,
    pub confidence: f64,
    pub load_factor: f64,
}

pub struct RequestExecutor {
    checker: Arc<ConcurrencyChecker>,
    health: Arc<HealthMonitor>,
    adaptive: Arc<AdaptiveService>,
}

impl RequestExecutor {
    pub fn new(
        checker: Arc<ConcurrencyChecker>,
        health: Arc<HealthMonitor>,
        adaptive: Arc<AdaptiveService>,
    ) -> Self {
        Self {
            checker,
            health,
            adaptive,
        }
    }

    pub fn adaptive(&self) -> &AdaptiveService {
        &self.adaptive
    }

    /// Run one attempt under the RPM guard.
    ///
    /// The guard slot is not released afterwards; it expires with the minute
    /// window. Guard denial surfaces as `ConcurrencyDenied`, which the engine
    /// records as a skip rather than a failure.
    pub async fn execute(
        &self,
        candidate: &ProviderCandidate,
        slot: AttemptSlot,
        recorder: &CandidateRecorder,
        invoke: AttemptFuture,
    ) -> Result<AttemptResult, AttemptFailure> {
        let key = &candidate.key;
        let now = OffsetDateTime::now_utc();
        let state = self.adaptive.state_copy(key.id).await;

        let snapshot = match self
            .checker
            .acquire_slot(key.id, key.rpm_limit, &state, candidate.is_cached, now)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(ConcurrencyError::LimitReached { .. }) => {
                return Err(AttemptFailure::ConcurrencyDenied);
            }
            Err(ConcurrencyError::Cache(err)) => {
                return Err(AttemptFailure::Adapter {
                    message: sanitize_error(&err.to_string()),
                });
            }
        };

        let mut context = ExecutionContext {
            candidate_index: slot.0,
            retry_index: slot.1,
            provider_id: candidate.provider.id,
            endpoint_id: candidate.endpoint.id,
            key_id: key.id,
            is_cached_user: candidate.is_cached,
            elapsed_ms: None,
            concurrent_requests: snapshot.key_current,
            rpm_limit: snapshot.key_limit,
            reservation_ratio: snapshot.reservation_ratio,
            reservation_phase: snapshot.reservation_phase,
            confidence: snapshot.confidence,
            load_factor: snapshot.load_factor,
        };

        let started = tokio::time::Instant::now();
        let result = invoke.await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        context.elapsed_ms = Some(elapsed_ms);

        enum Outcome {
            Success,
            Failure {
                rate_info: Option<apimux_ratelimit::RateLimitInfo>,
            },
        }

        let outcome = match &result {
            Ok(response) => {
                let status = response.status();
                if (200..300).contains(&status) {
                    Outcome::Success
                } else {
                    let rate_info = if status == 429 {
                        Some(detect_rate_limit(
                            response.headers(),
                            &throttle_excerpt(response),
                        ))
                    } else {
                        None
                    };
                    Outcome::Failure { rate_info }
                }
            }
            Err(_) => Outcome::Failure { rate_info: None },
        };

        match outcome {
            Outcome::Success => {
                self.health.record_success(key.id, elapsed_ms, now).await;
                self.adaptive
                    .handle_success(key.id, key.rpm_limit, snapshot.key_current, now)
                    .await;
            }
            Outcome::Failure { rate_info } => {
                self.health.record_failure(key.id, now).await;
                if let Some(info) = rate_info {
                    self.adaptive
                        .handle_429(
                            key.id,
                            key.rpm_limit,
                            &info,
                            Some(snapshot.key_current),
                            now,
                        )
                        .await;
                }
            }
        }

        recorder.annotate(slot, context_extra(&context)).await;
        debug!(
            key_id = key.id,
            elapsed_ms,
            concurrent = snapshot.key_current,
            limit = ?snapshot.key_limit,
            "attempt executed"
        );

        result
    }
}

/// Body fragment handed to the 429-kind detector. Streams carry no body at
/// this point; the headers alone have to carry the signal there.
fn throttle_excerpt(response: &AttemptResult) -> String {
    match response {
        AttemptResult::SyncResponse { body, .. } => {
            let cut = body.len().min(512);
            String::from_utf8_lossy(&body[..cut]).into_owned()
        }
        AttemptResult::AsyncSubmit { payload, .. } => {
            let mut text = payload.to_string();
            let mut cut = text.len().min(512);
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
            text
        }
        AttemptResult::Stream { .. } => String::new(),
    }
}

fn context_extra(context: &ExecutionContext) -> Map<String, serde_json::Value> {
    let mut extra = Map::new();
    extra.insert("is_cached_user".to_string(), json!(context.is_cached_user));
    if let Some(elapsed) = context.elapsed_ms {
        extra.insert("elapsed_ms".to_string(), json!(elapsed));
    }
    extra.insert(
        "concurrent_requests".to_string(),
        json!(context.concurrent_requests),
    );
    if let Some(limit) = context.rpm_limit {
        extra.insert("rpm_limit".to_string(), json!(limit));
    }
    if context.reservation_ratio > 0.0 {
        extra.insert(
            "reservation_ratio".to_string(),
            json!(context.reservation_ratio),
        );
    }
    extra
}
