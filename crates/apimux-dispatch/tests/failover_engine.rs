mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;
use http::HeaderMap;
use serde_json::json;
use time::OffsetDateTime;

use apimux_dispatch::{
    AttemptFailure, AttemptFuture, AttemptResponse, AttemptResult, AttemptSlot, CallerIds,
    CandidateRecorder, DispatchError, ErrorClassifier, FailoverEngine, FailoverParams, RetryMode,
    RetryPolicy, SkipPolicy, TaskIdExtractor,
};
use apimux_provider::AuthType;
use apimux_scheduling::ProviderCandidate;

use common::{MemoryStorage, candidate};

fn sync_ok() -> AttemptResult {
    AttemptResult::SyncResponse {
        status: 200,
        headers: HeaderMap::new(),
        body: Bytes::from_static(b"{\"ok\":true}"),
    }
}

fn sync_status(status: u16, body: &'static str) -> AttemptResult {
    AttemptResult::SyncResponse {
        status,
        headers: HeaderMap::new(),
        body: Bytes::from_static(body.as_bytes()),
    }
}

/// Attempt function scripted by a list of closures, one per call.
struct Script {
    steps: Vec<Box<dyn Fn() -> Result<AttemptResult, AttemptFailure> + Send + Sync>>,
    calls: AtomicU32,
}

impl Script {
    fn new(
        steps: Vec<Box<dyn Fn() -> Result<AttemptResult, AttemptFailure> + Send + Sync>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            steps,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl apimux_dispatch::AttemptFunc for Script {
    fn call(&self, _candidate: &ProviderCandidate, _slot: AttemptSlot) -> AttemptFuture {
        let index = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        let result = self.steps[index.min(self.steps.len() - 1)]();
        Box::pin(async move { result })
    }
}

async fn recorder_for(
    storage: &Arc<MemoryStorage>,
    candidates: &[ProviderCandidate],
    slots: u32,
) -> CandidateRecorder {
    CandidateRecorder::create(
        storage.clone() as Arc<dyn apimux_storage::Storage>,
        candidates,
        Some("req-1"),
        CallerIds::default(),
        slots,
        OffsetDateTime::now_utc(),
    )
    .await
}

#[tokio::test]
async fn first_candidate_success_marks_rest_unused() {
    let storage = Arc::new(MemoryStorage::new());
    let candidates = vec![candidate(1), candidate(2)];
    let recorder = recorder_for(&storage, &candidates, 1).await;
    let script = Script::new(vec![Box::new(|| Ok(sync_ok()))]);

    let engine = FailoverEngine::new(ErrorClassifier::new());
    let outcome = engine
        .execute(FailoverParams {
            candidates,
            attempt_func: script.as_ref(),
            retry_policy: RetryPolicy::disabled(),
            skip_policy: &SkipPolicy::default(),
            recorder: &recorder,
            extract_task_id: None,
        })
        .await
        .unwrap();

    assert_eq!(outcome.candidate_index, 0);
    assert_eq!(outcome.attempt_count, 1);
    assert_eq!(script.calls(), 1);
    assert!(matches!(outcome.response, AttemptResponse::Sync { status: 200, .. }));

    let statuses = storage.statuses().await;
    assert_eq!(statuses[&(0, 0)], "success");
    assert_eq!(statuses[&(1, 0)], "unused");
}

#[tokio::test]
async fn network_failure_moves_to_next_candidate() {
    let storage = Arc::new(MemoryStorage::new());
    let candidates = vec![candidate(1), candidate(2)];
    let recorder = recorder_for(&storage, &candidates, 1).await;
    let script = Script::new(vec![
        Box::new(|| {
            Err(AttemptFailure::Network {
                message: "connection reset".to_string(),
            })
        }),
        Box::new(|| Ok(sync_ok())),
    ]);

    let engine = FailoverEngine::new(ErrorClassifier::new());
    let outcome = engine
        .execute(FailoverParams {
            candidates,
            attempt_func: script.as_ref(),
            retry_policy: RetryPolicy::disabled(),
            skip_policy: &SkipPolicy::default(),
            recorder: &recorder,
            extract_task_id: None,
        })
        .await
        .unwrap();

    assert_eq!(outcome.candidate_index, 1);
    assert_eq!(outcome.attempt_count, 2);

    let statuses = storage.statuses().await;
    assert_eq!(statuses[&(0, 0)], "failed");
    assert_eq!(statuses[&(1, 0)], "success");
}

#[tokio::test]
async fn transient_failure_retries_same_candidate_on_demand() {
    let storage = Arc::new(MemoryStorage::new());
    let candidates = vec![candidate(1)];
    let recorder = recorder_for(&storage, &candidates, 1).await;
    let script = Script::new(vec![
        Box::new(|| {
            Err(AttemptFailure::Timeout {
                message: "read timeout".to_string(),
            })
        }),
        Box::new(|| Ok(sync_ok())),
    ]);

    let engine = FailoverEngine::new(ErrorClassifier::new());
    let outcome = engine
        .execute(FailoverParams {
            candidates,
            attempt_func: script.as_ref(),
            retry_policy: RetryPolicy {
                mode: RetryMode::OnDemand,
                max_retries: 2,
            },
            skip_policy: &SkipPolicy::default(),
            recorder: &recorder,
            extract_task_id: None,
        })
        .await
        .unwrap();

    assert_eq!(outcome.candidate_index, 0);
    assert_eq!(outcome.retry_index, 1);
    assert_eq!(outcome.attempt_count, 2);

    let statuses = storage.statuses().await;
    assert_eq!(statuses[&(0, 0)], "failed");
    // The retry slot was created on demand.
    assert_eq!(statuses[&(0, 1)], "success");
}

#[tokio::test]
async fn provider_retry_cap_tightens_the_policy() {
    let storage = Arc::new(MemoryStorage::new());
    let mut first = candidate(1);
    std::sync::Arc::get_mut(&mut first.provider).unwrap().max_retries = Some(1);
    let candidates = vec![first, candidate(2)];
    let recorder = recorder_for(&storage, &candidates, 1).await;
    let script = Script::new(vec![
        Box::new(|| {
            Err(AttemptFailure::Timeout {
                message: "read timeout".to_string(),
            })
        }),
        Box::new(|| Ok(sync_ok())),
    ]);

    let engine = FailoverEngine::new(ErrorClassifier::new());
    let outcome = engine
        .execute(FailoverParams {
            candidates,
            attempt_func: script.as_ref(),
            retry_policy: RetryPolicy {
                mode: RetryMode::OnDemand,
                max_retries: 3,
            },
            skip_policy: &SkipPolicy::default(),
            recorder: &recorder,
            extract_task_id: None,
        })
        .await
        .unwrap();

    // The provider cap (1 attempt) wins over the policy's 3.
    assert_eq!(outcome.candidate_index, 1);
    assert_eq!(outcome.attempt_count, 2);
}

#[tokio::test]
async fn client_error_signature_raises_without_trying_next() {
    let storage = Arc::new(MemoryStorage::new());
    let candidates = vec![candidate(1), candidate(2)];
    let recorder = recorder_for(&storage, &candidates, 1).await;
    let script = Script::new(vec![Box::new(|| {
        Ok(sync_status(400, "{\"error\":\"missing required field: model\"}"))
    })]);

    let engine = FailoverEngine::new(ErrorClassifier::new());
    let err = engine
        .execute(FailoverParams {
            candidates,
            attempt_func: script.as_ref(),
            retry_policy: RetryPolicy::disabled(),
            skip_policy: &SkipPolicy::default(),
            recorder: &recorder,
            extract_task_id: None,
        })
        .await
        .unwrap_err();

    let DispatchError::UpstreamClientRequest { status, audit, .. } = err else {
        panic!("expected UpstreamClientRequest");
    };
    assert_eq!(status, 400);
    assert_eq!(audit.len(), 1);
    assert_eq!(script.calls(), 1);

    // Even on the raise path every slot ends terminal.
    let statuses = storage.statuses().await;
    assert_eq!(statuses[&(0, 0)], "failed");
    assert_eq!(statuses[&(1, 0)], "unused");
}

#[tokio::test]
async fn pre_expand_marks_unused_slots_on_early_success() {
    let storage = Arc::new(MemoryStorage::new());
    let candidates = vec![candidate(1), candidate(2)];
    let recorder = recorder_for(&storage, &candidates, 2).await;
    let script = Script::new(vec![Box::new(|| Ok(sync_ok()))]);

    let engine = FailoverEngine::new(ErrorClassifier::new());
    engine
        .execute(FailoverParams {
            candidates,
            attempt_func: script.as_ref(),
            retry_policy: RetryPolicy {
                mode: RetryMode::PreExpand,
                max_retries: 2,
            },
            skip_policy: &SkipPolicy::default(),
            recorder: &recorder,
            extract_task_id: None,
        })
        .await
        .unwrap();

    let statuses = storage.statuses().await;
    assert_eq!(statuses[&(0, 0)], "success");
    assert_eq!(statuses[&(0, 1)], "unused");
    assert_eq!(statuses[&(1, 0)], "unused");
    assert_eq!(statuses[&(1, 1)], "unused");
}

#[tokio::test]
async fn empty_stream_probe_triggers_failover() {
    let storage = Arc::new(MemoryStorage::new());
    let candidates = vec![candidate(1), candidate(2)];
    let recorder = recorder_for(&storage, &candidates, 1).await;
    let script = Script::new(vec![
        Box::new(|| {
            Ok(AttemptResult::Stream {
                status: 200,
                headers: HeaderMap::new(),
                stream: stream::iter(Vec::<Result<Bytes, AttemptFailure>>::new()).boxed(),
            })
        }),
        Box::new(|| Ok(sync_ok())),
    ]);

    let engine = FailoverEngine::new(ErrorClassifier::new());
    let outcome = engine
        .execute(FailoverParams {
            candidates,
            attempt_func: script.as_ref(),
            retry_policy: RetryPolicy::disabled(),
            skip_policy: &SkipPolicy::default(),
            recorder: &recorder,
            extract_task_id: None,
        })
        .await
        .unwrap();

    assert_eq!(outcome.candidate_index, 1);
    assert_eq!(outcome.attempt_count, 2);
    assert!(matches!(outcome.response, AttemptResponse::Sync { .. }));

    let statuses = storage.statuses().await;
    assert_eq!(statuses[&(0, 0)], "failed");
    assert_eq!(statuses[&(1, 0)], "success");
    let failed = storage.slot(0, 0).await.unwrap();
    assert_eq!(failed.error_type.as_deref(), Some("stream_probe_error"));
}

#[tokio::test]
async fn stream_probe_re_emits_consumed_prefix() {
    let storage = Arc::new(MemoryStorage::new());
    let candidates = vec![candidate(1)];
    let recorder = recorder_for(&storage, &candidates, 1).await;
    let script = Script::new(vec![Box::new(|| {
        let chunks: Vec<Result<Bytes, AttemptFailure>> = vec![
            Ok(Bytes::new()),
            Ok(Bytes::from_static(b"chunk1")),
            Ok(Bytes::from_static(b"chunk2")),
        ];
        Ok(AttemptResult::Stream {
            status: 200,
            headers: HeaderMap::new(),
            stream: stream::iter(chunks).boxed(),
        })
    })]);

    let engine = FailoverEngine::new(ErrorClassifier::new());
    let outcome = engine
        .execute(FailoverParams {
            candidates,
            attempt_func: script.as_ref(),
            retry_policy: RetryPolicy::disabled(),
            skip_policy: &SkipPolicy::default(),
            recorder: &recorder,
            extract_task_id: None,
        })
        .await
        .unwrap();

    let AttemptResponse::Stream { mut stream, .. } = outcome.response else {
        panic!("expected stream response");
    };
    let mut collected = Vec::new();
    while let Some(chunk) = stream.next().await {
        collected.extend_from_slice(&chunk.unwrap());
    }
    // An empty leading chunk is not confused with an empty stream, and the
    // consumed prefix reappears in order.
    assert_eq!(collected, b"chunk1chunk2");

    assert_eq!(storage.statuses().await[&(0, 0)], "streaming");
}

#[tokio::test]
async fn concurrency_denial_skips_candidate() {
    let storage = Arc::new(MemoryStorage::new());
    let candidates = vec![candidate(1), candidate(2)];
    let recorder = recorder_for(&storage, &candidates, 1).await;
    let script = Script::new(vec![
        Box::new(|| Err(AttemptFailure::ConcurrencyDenied)),
        Box::new(|| Ok(sync_ok())),
    ]);

    let engine = FailoverEngine::new(ErrorClassifier::new());
    let outcome = engine
        .execute(FailoverParams {
            candidates,
            attempt_func: script.as_ref(),
            retry_policy: RetryPolicy::disabled(),
            skip_policy: &SkipPolicy::default(),
            recorder: &recorder,
            extract_task_id: None,
        })
        .await
        .unwrap();

    assert_eq!(outcome.candidate_index, 1);
    let skipped = storage.slot(0, 0).await.unwrap();
    assert_eq!(skipped.status, "skipped");
    assert_eq!(skipped.skip_reason.as_deref(), Some("concurrency"));
}

#[tokio::test]
async fn preflight_skips_and_no_eligible_candidates() {
    let storage = Arc::new(MemoryStorage::new());
    let mut blocked = candidate(1);
    blocked.is_skipped = true;
    blocked.skip_reason = Some("oauth_account_blocked".to_string());
    let mut oauth = candidate(2);
    std::sync::Arc::get_mut(&mut oauth.key).unwrap().auth_type = AuthType::Oauth;
    let mut converted = candidate(3);
    converted.needs_conversion = true;

    let candidates = vec![blocked, oauth, converted];
    let recorder = recorder_for(&storage, &candidates, 1).await;
    let script = Script::new(vec![Box::new(|| Ok(sync_ok()))]);

    let skip_policy = SkipPolicy {
        supported_auth_types: Some(HashSet::from([AuthType::ApiKey])),
        allow_format_conversion: false,
        billing_rule: None,
    };

    let engine = FailoverEngine::new(ErrorClassifier::new());
    let err = engine
        .execute(FailoverParams {
            candidates,
            attempt_func: script.as_ref(),
            retry_policy: RetryPolicy::disabled(),
            skip_policy: &skip_policy,
            recorder: &recorder,
            extract_task_id: None,
        })
        .await
        .unwrap_err();

    let DispatchError::NoEligibleCandidates { audit } = err else {
        panic!("expected NoEligibleCandidates");
    };
    assert_eq!(audit.len(), 3);
    assert_eq!(script.calls(), 0);

    let statuses = storage.statuses().await;
    assert!(statuses.values().all(|s| s == "skipped"));
    assert_eq!(
        storage.slot(0, 0).await.unwrap().skip_reason.as_deref(),
        Some("oauth_account_blocked")
    );
    assert_eq!(
        storage.slot(1, 0).await.unwrap().skip_reason.as_deref(),
        Some("unsupported_auth_type:oauth")
    );
    assert_eq!(
        storage.slot(2, 0).await.unwrap().skip_reason.as_deref(),
        Some("format_conversion_not_supported")
    );
}

#[tokio::test]
async fn billing_gate_skips_candidates_without_a_rule() {
    let storage = Arc::new(MemoryStorage::new());
    let candidates = vec![candidate(1), candidate(2)];
    let recorder = recorder_for(&storage, &candidates, 1).await;
    let script = Script::new(vec![Box::new(|| Ok(sync_ok()))]);

    let skip_policy = SkipPolicy {
        billing_rule: Some(Arc::new(|c: &ProviderCandidate| c.provider.id == 2)),
        ..SkipPolicy::default()
    };

    let engine = FailoverEngine::new(ErrorClassifier::new());
    let outcome = engine
        .execute(FailoverParams {
            candidates,
            attempt_func: script.as_ref(),
            retry_policy: RetryPolicy::disabled(),
            skip_policy: &skip_policy,
            recorder: &recorder,
            extract_task_id: None,
        })
        .await
        .unwrap();

    assert_eq!(outcome.candidate_index, 1);
    assert_eq!(
        storage.slot(0, 0).await.unwrap().skip_reason.as_deref(),
        Some("billing_rule_missing")
    );
}

#[tokio::test]
async fn async_submit_requires_a_non_empty_task_id() {
    let storage = Arc::new(MemoryStorage::new());
    let candidates = vec![candidate(1), candidate(2)];
    let recorder = recorder_for(&storage, &candidates, 1).await;
    let script = Script::new(vec![
        Box::new(|| {
            Ok(AttemptResult::AsyncSubmit {
                status: 200,
                headers: HeaderMap::new(),
                payload: json!({"status": "queued"}),
            })
        }),
        Box::new(|| {
            Ok(AttemptResult::AsyncSubmit {
                status: 200,
                headers: HeaderMap::new(),
                payload: json!({"task_id": "task-42"}),
            })
        }),
    ]);

    let extractor: TaskIdExtractor = Arc::new(|payload| {
        payload
            .get("task_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    });

    let engine = FailoverEngine::new(ErrorClassifier::new());
    let outcome = engine
        .execute(FailoverParams {
            candidates,
            attempt_func: script.as_ref(),
            retry_policy: RetryPolicy::disabled(),
            skip_policy: &SkipPolicy::default(),
            recorder: &recorder,
            extract_task_id: Some(extractor),
        })
        .await
        .unwrap();

    assert_eq!(outcome.candidate_index, 1);
    let AttemptResponse::AsyncSubmit { task_id, .. } = outcome.response else {
        panic!("expected async submit response");
    };
    assert_eq!(task_id, "task-42");

    let failed = storage.slot(0, 0).await.unwrap();
    assert_eq!(failed.status, "failed");
    assert_eq!(failed.error_type.as_deref(), Some("empty_task_id"));
}

#[tokio::test]
async fn all_candidates_failed_carries_last_status() {
    let storage = Arc::new(MemoryStorage::new());
    let candidates = vec![candidate(1), candidate(2)];
    let recorder = recorder_for(&storage, &candidates, 1).await;
    let script = Script::new(vec![
        Box::new(|| Ok(sync_status(502, "bad gateway"))),
        Box::new(|| Ok(sync_status(503, "overloaded"))),
    ]);

    let engine = FailoverEngine::new(ErrorClassifier::new());
    let err = engine
        .execute(FailoverParams {
            candidates,
            attempt_func: script.as_ref(),
            retry_policy: RetryPolicy::disabled(),
            skip_policy: &SkipPolicy::default(),
            recorder: &recorder,
            extract_task_id: None,
        })
        .await
        .unwrap_err();

    let DispatchError::AllCandidatesFailed { audit, last_status, .. } = err else {
        panic!("expected AllCandidatesFailed");
    };
    assert_eq!(audit.len(), 2);
    assert_eq!(last_status, Some(503));

    let statuses = storage.statuses().await;
    assert!(statuses.values().all(|s| s == "failed"));
}
