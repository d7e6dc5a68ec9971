//! Audit-row lifecycle for candidate attempts.
//!
//! Rows are pre-created when dispatch starts and driven through
//! available -> pending -> terminal transitions. Persistence is best-effort:
//! a failing audit write must never fail the request itself.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use apimux_scheduling::ProviderCandidate;
use apimux_storage::{NewRequestCandidate, RequestCandidatePatch, Storage};

use crate::attempt::AttemptFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Available,
    Pending,
    Skipped,
    Streaming,
    Success,
    Failed,
    Unused,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Available => "available",
            RecordStatus::Pending => "pending",
            RecordStatus::Skipped => "skipped",
            RecordStatus::Streaming => "streaming",
            RecordStatus::Success => "success",
            RecordStatus::Failed => "failed",
            RecordStatus::Unused => "unused",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, RecordStatus::Available | RecordStatus::Pending)
    }
}

#[derive(Debug, Clone)]
struct RecordHandle {
    id: String,
    status: RecordStatus,
    extra_data: Map<String, JsonValue>,
}

/// Caller identity stamped on every audit row.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallerIds {
    pub user_id: Option<i64>,
    pub api_key_id: Option<i64>,
}

#[derive(Debug, Clone)]
struct SlotMeta {
    provider_id: i64,
    endpoint_id: i64,
    key_id: i64,
    is_cached: bool,
}

pub struct CandidateRecorder {
    storage: Arc<dyn Storage>,
    records: Mutex<HashMap<(usize, u32), RecordHandle>>,
    request_id: Option<String>,
    caller: CallerIds,
    slots: Vec<SlotMeta>,
    enabled: bool,
}

impl CandidateRecorder {
    /// Pre-create one row per candidate, or `retries_per_candidate` rows each
    /// when the retry policy pre-expands slots. A failed bulk insert disables
    /// recording for this request rather than failing dispatch.
    pub async fn create(
        storage: Arc<dyn Storage>,
        candidates: &[ProviderCandidate],
        request_id: Option<&str>,
        caller: CallerIds,
        retries_per_candidate: u32,
        now: OffsetDateTime,
    ) -> Self {
        let slots: Vec<SlotMeta> = candidates
            .iter()
            .map(|candidate| SlotMeta {
                provider_id: candidate.provider.id,
                endpoint_id: candidate.endpoint.id,
                key_id: candidate.key.id,
                is_cached: candidate.is_cached,
            })
            .collect();

        let Some(request_id) = request_id else {
            return Self {
                storage,
                records: Mutex::new(HashMap::new()),
                request_id: None,
                caller,
                slots,
                enabled: false,
            };
        };

        let retries = retries_per_candidate.max(1);
        let mut rows = Vec::new();
        let mut handles = HashMap::new();
        for (index, candidate) in candidates.iter().enumerate() {
            for retry in 0..retries {
                let id = Uuid::new_v4().to_string();
                rows.push(NewRequestCandidate {
                    id: id.clone(),
                    request_id: request_id.to_string(),
                    candidate_index: index as i32,
                    retry_index: retry as i32,
                    user_id: caller.user_id,
                    api_key_id: caller.api_key_id,
                    provider_id: candidate.provider.id,
                    endpoint_id: candidate.endpoint.id,
                    key_id: candidate.key.id,
                    is_cached: candidate.is_cached,
                    created_at: now,
                });
                handles.insert(
                    (index, retry),
                    RecordHandle {
                        id,
                        status: RecordStatus::Available,
                        extra_data: Map::new(),
                    },
                );
            }
        }

        let enabled = match storage.insert_request_candidates(&rows).await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "failed to create candidate records, auditing disabled");
                handles.clear();
                false
            }
        };

        Self {
            storage,
            records: Mutex::new(handles),
            request_id: Some(request_id.to_string()),
            caller,
            slots,
            enabled,
        }
    }

    /// Insert a row for a retry slot that was not pre-created (on-demand
    /// retries create slots as they happen).
    async fn ensure_slot(&self, slot: (usize, u32)) {
        if !self.enabled || self.records.lock().await.contains_key(&slot) {
            return;
        }
        let (Some(request_id), Some(meta)) = (self.request_id.as_ref(), self.slots.get(slot.0))
        else {
            return;
        };
        let id = Uuid::new_v4().to_string();
        let row = NewRequestCandidate {
            id: id.clone(),
            request_id: request_id.clone(),
            candidate_index: slot.0 as i32,
            retry_index: slot.1 as i32,
            user_id: self.caller.user_id,
            api_key_id: self.caller.api_key_id,
            provider_id: meta.provider_id,
            endpoint_id: meta.endpoint_id,
            key_id: meta.key_id,
            is_cached: meta.is_cached,
            created_at: OffsetDateTime::now_utc(),
        };
        if let Err(err) = self.storage.insert_request_candidates(&[row]).await {
            warn!(error = %err, "failed to create retry candidate record");
            return;
        }
        self.records.lock().await.insert(
            slot,
            RecordHandle {
                id,
                status: RecordStatus::Available,
                extra_data: Map::new(),
            },
        );
    }

    async fn apply(
        &self,
        slot: (usize, u32),
        status: RecordStatus,
        mut patch: RequestCandidatePatch,
        extra: Option<Map<String, JsonValue>>,
    ) {
        if !self.enabled {
            return;
        }
        let mut records = self.records.lock().await;
        let Some(handle) = records.get_mut(&slot) else {
            return;
        };
        handle.status = status;
        if let Some(extra) = extra {
            // Merge rather than replace: earlier stages may have annotated.
            for (key, value) in extra {
                handle.extra_data.insert(key, value);
            }
        }
        if !handle.extra_data.is_empty() {
            patch.extra_data = Some(JsonValue::Object(handle.extra_data.clone()));
        }
        patch.status = Some(status.as_str().to_string());
        let id = handle.id.clone();
        drop(records);

        if let Err(err) = self.storage.update_request_candidate(&id, patch).await {
            warn!(error = %err, record_id = %id, "failed to update candidate record");
        }
    }

    pub async fn mark_skipped(
        &self,
        slot: (usize, u32),
        reason: &str,
        status_code: Option<u16>,
        concurrent_requests: Option<u32>,
        extra: Option<Map<String, JsonValue>>,
        now: OffsetDateTime,
    ) {
        self.apply(
            slot,
            RecordStatus::Skipped,
            RequestCandidatePatch {
                skip_reason: Some(reason.to_string()),
                status_code: status_code.map(i32::from),
                concurrent_requests: concurrent_requests.map(|v| v as i32),
                finished_at: Some(now),
                ..RequestCandidatePatch::default()
            },
            extra,
        )
        .await;
    }

    pub async fn mark_pending(&self, slot: (usize, u32), now: OffsetDateTime) {
        self.ensure_slot(slot).await;
        self.apply(
            slot,
            RecordStatus::Pending,
            RequestCandidatePatch {
                started_at: Some(now),
                ..RequestCandidatePatch::default()
            },
            None,
        )
        .await;
    }

    pub async fn mark_failed(
        &self,
        slot: (usize, u32),
        failure: &AttemptFailure,
        now: OffsetDateTime,
    ) {
        self.apply(
            slot,
            RecordStatus::Failed,
            RequestCandidatePatch {
                status_code: failure.status().map(i32::from),
                error_type: Some(failure.kind().to_string()),
                error_message: Some(failure.to_string()),
                finished_at: Some(now),
                ..RequestCandidatePatch::default()
            },
            None,
        )
        .await;
    }

    pub async fn mark_success(
        &self,
        slot: (usize, u32),
        status_code: u16,
        latency_ms: Option<u64>,
        concurrent_requests: Option<u32>,
        extra: Option<Map<String, JsonValue>>,
        now: OffsetDateTime,
    ) {
        self.apply(
            slot,
            RecordStatus::Success,
            RequestCandidatePatch {
                status_code: Some(i32::from(status_code)),
                latency_ms: latency_ms.map(|v| v as i32),
                concurrent_requests: concurrent_requests.map(|v| v as i32),
                finished_at: Some(now),
                ..RequestCandidatePatch::default()
            },
            extra,
        )
        .await;
    }

    /// Stream accepted: the connection is established but the body is still
    /// flowing. `mark_stream_completed` flips it to success later.
    pub async fn mark_streaming(
        &self,
        slot: (usize, u32),
        status_code: u16,
        concurrent_requests: Option<u32>,
        now: OffsetDateTime,
    ) {
        self.apply(
            slot,
            RecordStatus::Streaming,
            RequestCandidatePatch {
                status_code: Some(i32::from(status_code)),
                concurrent_requests: concurrent_requests.map(|v| v as i32),
                started_at: Some(now),
                ..RequestCandidatePatch::default()
            },
            None,
        )
        .await;
    }

    pub async fn mark_stream_completed(&self, slot: (usize, u32), now: OffsetDateTime) {
        self.apply(
            slot,
            RecordStatus::Success,
            RequestCandidatePatch {
                finished_at: Some(now),
                ..RequestCandidatePatch::default()
            },
            None,
        )
        .await;
    }

    /// Mark every slot still `available` as `unused`. Called once when the
    /// engine returns so no slot is ever left non-terminal.
    pub async fn finish_unused(&self, now: OffsetDateTime) {
        if !self.enabled {
            return;
        }
        let pending: Vec<(usize, u32)> = {
            let records = self.records.lock().await;
            records
                .iter()
                .filter(|(_, handle)| handle.status == RecordStatus::Available)
                .map(|(slot, _)| *slot)
                .collect()
        };
        for slot in pending {
            self.apply(
                slot,
                RecordStatus::Unused,
                RequestCandidatePatch {
                    finished_at: Some(now),
                    ..RequestCandidatePatch::default()
                },
                None,
            )
            .await;
        }
    }

    /// Stash extra data on a slot in memory; it rides along with the next
    /// persisted transition for that slot.
    pub async fn annotate(&self, slot: (usize, u32), extra: Map<String, JsonValue>) {
        if !self.enabled {
            return;
        }
        let mut records = self.records.lock().await;
        if let Some(handle) = records.get_mut(&slot) {
            for (key, value) in extra {
                handle.extra_data.insert(key, value);
            }
        }
    }

    /// Statuses by slot, for assertions and diagnostics.
    pub async fn statuses(&self) -> HashMap<(usize, u32), RecordStatus> {
        self.records
            .lock()
            .await
            .iter()
            .map(|(slot, handle)| (*slot, handle.status))
            .collect()
    }
}
