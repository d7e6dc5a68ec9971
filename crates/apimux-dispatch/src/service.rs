//! Top-level dispatch facades.
//!
//! `CandidateService` turns a request into the ordered candidate list;
//! `TaskService` drives the failover engine over it, with every attempt
//! routed through the request executor.

use std::sync::Arc;

use arc_swap::ArcSwap;
use time::OffsetDateTime;
use tracing::{info, warn};

use apimux_common::{DispatchSettings, SchedulingMode};
use apimux_format::{ConverterRegistry, EndpointSignature};
use apimux_provider::AdapterRegistry;
use apimux_scheduling::{
    AccessRestrictions, AvailabilityQuery, CacheAffinity, CacheAffinityManager, CandidateBuilder,
    CandidateSorter, ProviderCandidate,
};
use apimux_storage::{Storage, StorageSnapshot};

use crate::attempt::{AttemptFunc, AttemptFuture, AttemptSlot};
use crate::error::DispatchError;
use crate::executor::RequestExecutor;
use crate::failover::{
    FailoverEngine, FailoverOutcome, FailoverParams, RetryPolicy, SkipPolicy, TaskIdExtractor,
};
use crate::recorder::{CallerIds, CandidateRecorder};

/// Shared lock-free runtime state: snapshot and settings are replaced
/// wholesale by admin writes and read per request.
#[derive(Clone)]
pub struct RuntimeState {
    pub snapshot: Arc<ArcSwap<StorageSnapshot>>,
    pub settings: Arc<ArcSwap<DispatchSettings>>,
}

impl RuntimeState {
    pub fn new(snapshot: StorageSnapshot, settings: DispatchSettings) -> Self {
        Self {
            snapshot: Arc::new(ArcSwap::from_pointee(snapshot)),
            settings: Arc::new(ArcSwap::from_pointee(settings)),
        }
    }
}

pub struct ResolveRequest<'a> {
    pub client_format: EndpointSignature,
    pub model_name: &'a str,
    pub affinity_key: &'a str,
    pub api_key_id: Option<i64>,
    pub is_stream: bool,
}

pub struct ResolvedCandidates {
    pub candidates: Vec<ProviderCandidate>,
    pub resolved_model_name: String,
    pub global_model_id: i64,
    pub affinity: Option<CacheAffinity>,
}

pub struct CandidateService {
    state: RuntimeState,
    registry: Arc<dyn ConverterRegistry>,
    adapters: Option<Arc<AdapterRegistry>>,
    affinity: Arc<CacheAffinityManager>,
}

impl CandidateService {
    pub fn new(
        state: RuntimeState,
        registry: Arc<dyn ConverterRegistry>,
        adapters: Option<Arc<AdapterRegistry>>,
        affinity: Arc<CacheAffinityManager>,
    ) -> Self {
        Self {
            state,
            registry,
            adapters,
            affinity,
        }
    }

    pub fn affinity(&self) -> &Arc<CacheAffinityManager> {
        &self.affinity
    }

    /// Resolve and order candidates for one request.
    pub async fn resolve(
        &self,
        request: &ResolveRequest<'_>,
    ) -> Result<ResolvedCandidates, DispatchError> {
        let snapshot = self.state.snapshot.load_full();
        let settings = self.state.settings.load_full();

        let api_key = request
            .api_key_id
            .and_then(|id| snapshot.api_keys.iter().find(|k| k.id == id && k.is_active));
        let user = api_key.and_then(|k| snapshot.user(k.user_id));
        let restrictions = AccessRestrictions::from_caller(api_key, user);
        if !restrictions.is_api_format_allowed(&request.client_format) {
            return Err(DispatchError::InvalidRequest(format!(
                "api format {} not allowed for caller",
                request.client_format
            )));
        }

        // Candidate space spans every active endpoint signature; the gate
        // decides per endpoint whether a cross-format candidate survives.
        let mut requested: Vec<EndpointSignature> = snapshot
            .endpoints
            .iter()
            .filter(|e| e.is_active)
            .filter_map(|e| EndpointSignature::new(&e.api_family, &e.endpoint_kind).ok())
            .collect();
        requested.sort();
        requested.dedup();

        let rows = AvailabilityQuery::find(
            &snapshot,
            request.model_name,
            &requested,
            &restrictions,
        );
        if rows.is_empty() {
            return Err(DispatchError::NoEligibleCandidates { audit: Vec::new() });
        }
        let global_model_id = rows[0].global_model_id;
        let resolved_model_name = rows[0].resolved_model_name.clone();

        let builder = CandidateBuilder {
            client_format: &request.client_format,
            is_stream: request.is_stream,
            settings: &settings,
            registry: self.registry.as_ref(),
            adapters: self.adapters.as_deref(),
        };
        let candidates = builder.build(rows);

        let affinity = if settings.scheduling_mode == SchedulingMode::CacheAffinity {
            self.affinity
                .get_affinity(request.affinity_key, &request.client_format, request.model_name)
                .await?
        } else {
            None
        };

        let sorter = CandidateSorter::new(&settings);
        let candidates = sorter.sort(
            candidates,
            affinity.as_ref(),
            request.affinity_key,
            &request.client_format,
            rand::random(),
        );

        info!(
            model = request.model_name,
            resolved = %resolved_model_name,
            count = candidates.len(),
            cached = affinity.is_some(),
            "candidates resolved"
        );

        Ok(ResolvedCandidates {
            candidates,
            resolved_model_name,
            global_model_id,
            affinity,
        })
    }
}

pub struct DispatchRequest<'a> {
    pub client_format: EndpointSignature,
    pub model_name: &'a str,
    pub affinity_key: &'a str,
    pub request_id: Option<&'a str>,
    pub user_id: Option<i64>,
    pub api_key_id: Option<i64>,
    pub is_stream: bool,
    pub retry_policy: RetryPolicy,
    pub skip_policy: SkipPolicy,
    /// Truncate the candidate list before dispatch (async submit paths).
    pub max_candidates: Option<usize>,
}

/// The failover result plus the live audit recorder, so stream completions
/// can still flip their slot to success.
pub struct DispatchOutcome {
    pub result: FailoverOutcome,
    pub recorder: Arc<CandidateRecorder>,
}

impl std::fmt::Debug for DispatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchOutcome")
            .field("result", &self.result)
            .field("recorder", &"<CandidateRecorder>")
            .finish()
    }
}

impl DispatchOutcome {
    /// To be called when a streamed body finished flowing to the caller.
    /// Mid-body failures are the caller's to log; they never re-dispatch.
    pub async fn complete_stream(&self) {
        self.recorder
            .mark_stream_completed(
                (self.result.candidate_index, self.result.retry_index),
                OffsetDateTime::now_utc(),
            )
            .await;
    }
}

pub struct TaskService {
    candidates: Arc<CandidateService>,
    executor: Arc<RequestExecutor>,
    engine: FailoverEngine,
    storage: Arc<dyn Storage>,
    state: RuntimeState,
}

impl TaskService {
    pub fn new(
        candidates: Arc<CandidateService>,
        executor: Arc<RequestExecutor>,
        engine: FailoverEngine,
        storage: Arc<dyn Storage>,
        state: RuntimeState,
    ) -> Self {
        Self {
            candidates,
            executor,
            engine,
            storage,
            state,
        }
    }

    pub fn executor(&self) -> &Arc<RequestExecutor> {
        &self.executor
    }

    /// Dispatch with failover for sync and streaming requests.
    pub async fn execute_with_failover(
        &self,
        request: DispatchRequest<'_>,
        attempt_func: Arc<dyn AttemptFunc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.dispatch(request, attempt_func, None).await
    }

    /// Submission-phase failover for async (task-style) requests: once an
    /// upstream task id is obtained the candidate is locked and polling never
    /// switches targets.
    pub async fn submit_with_failover(
        &self,
        request: DispatchRequest<'_>,
        attempt_func: Arc<dyn AttemptFunc>,
        extract_task_id: TaskIdExtractor,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.dispatch(request, attempt_func, Some(extract_task_id)).await
    }

    async fn dispatch(
        &self,
        request: DispatchRequest<'_>,
        attempt_func: Arc<dyn AttemptFunc>,
        extract_task_id: Option<TaskIdExtractor>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let resolved = self
            .candidates
            .resolve(&ResolveRequest {
                client_format: request.client_format.clone(),
                model_name: request.model_name,
                affinity_key: request.affinity_key,
                api_key_id: request.api_key_id,
                is_stream: request.is_stream,
            })
            .await?;

        let mut candidates = resolved.candidates;
        if let Some(max) = request.max_candidates.filter(|max| *max > 0) {
            candidates.truncate(max);
        }

        let recorder = Arc::new(
            CandidateRecorder::create(
                self.storage.clone(),
                &candidates,
                request.request_id,
                CallerIds {
                    user_id: request.user_id,
                    api_key_id: request.api_key_id,
                },
                request.retry_policy.expanded_slots(),
                OffsetDateTime::now_utc(),
            )
            .await,
        );

        // Every attempt runs through the executor: guard, timing, health and
        // adaptive bookkeeping.
        let executor = self.executor.clone();
        let inner = attempt_func.clone();
        let recorder_for_attempts = recorder.clone();
        let wrapped = move |candidate: &ProviderCandidate, slot: AttemptSlot| -> AttemptFuture {
            let executor = executor.clone();
            let inner = inner.clone();
            let recorder = recorder_for_attempts.clone();
            let candidate = candidate.clone();
            Box::pin(async move {
                let invoke = inner.call(&candidate, slot);
                executor.execute(&candidate, slot, &recorder, invoke).await
            })
        };

        let result = self
            .engine
            .execute(FailoverParams {
                candidates,
                attempt_func: &wrapped,
                retry_policy: request.retry_policy,
                skip_policy: &request.skip_policy,
                recorder: &recorder,
                extract_task_id,
            })
            .await?;

        self.record_affinity(&request, &result.candidate).await;

        Ok(DispatchOutcome { result, recorder })
    }

    async fn record_affinity(&self, request: &DispatchRequest<'_>, winner: &ProviderCandidate) {
        let settings = self.state.settings.load_full();
        if settings.scheduling_mode != SchedulingMode::CacheAffinity {
            return;
        }
        let ttl = settings.scheduling_mode.affinity_ttl_secs();
        if let Err(err) = self
            .candidates
            .affinity()
            .set_affinity(
                request.affinity_key,
                &request.client_format,
                request.model_name,
                winner.provider.id,
                winner.endpoint.id,
                winner.key.id,
                ttl,
            )
            .await
        {
            warn!(error = %err, "failed to record cache affinity");
        }
    }
}
