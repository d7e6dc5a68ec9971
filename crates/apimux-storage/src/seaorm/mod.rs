use sea_orm::{
    ActiveModelTrait, ActiveValue, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection,
    EntityTrait, QueryOrder, Schema,
};
use time::OffsetDateTime;
use tracing::warn;

use apimux_common::{DispatchSettings, GlobalConfig};
use apimux_provider::{AuthType, ProviderType};
use apimux_ratelimit::{AdaptiveState, HistoryRecord, RateLimitKind, UtilizationSample};

use crate::entities;
use crate::snapshot::{
    ApiKeyRow, EndpointRow, GlobalConfigRow, GlobalModelRow, KeyRow, ModelRow, ProviderRow,
    StorageSnapshot, UserRow,
};
use crate::storage::{
    NewRequestCandidate, RequestCandidatePatch, Storage, StorageResult,
};

#[derive(Clone)]
pub struct SeaOrmStorage {
    db: DatabaseConnection,
}

impl SeaOrmStorage {
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let db = Database::connect(dsn).await?;
        // Ensure sqlite enforces foreign keys (required for cascade + integrity).
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        }
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

fn decode_provider_type(raw: &str, provider_id: i64) -> ProviderType {
    match serde_json::from_value(serde_json::Value::String(raw.to_string())) {
        Ok(t) => t,
        Err(_) => {
            warn!(provider_id, provider_type = raw, "unknown provider_type, treating as custom");
            ProviderType::Custom
        }
    }
}

fn decode_auth_type(raw: &str, key_id: i64) -> AuthType {
    match serde_json::from_value(serde_json::Value::String(raw.to_string())) {
        Ok(t) => t,
        Err(_) => {
            warn!(key_id, auth_type = raw, "unknown auth_type, treating as api_key");
            AuthType::ApiKey
        }
    }
}

fn decode_rate_limit_kind(raw: &str) -> Option<RateLimitKind> {
    serde_json::from_value(serde_json::Value::String(raw.to_string())).ok()
}

fn decode_samples(raw: Option<serde_json::Value>, key_id: i64) -> Vec<UtilizationSample> {
    match raw {
        None => Vec::new(),
        Some(value) => serde_json::from_value(value).unwrap_or_else(|err| {
            warn!(key_id, error = %err, "malformed utilization_samples, resetting");
            Vec::new()
        }),
    }
}

fn decode_history(raw: Option<serde_json::Value>, key_id: i64) -> Vec<HistoryRecord> {
    match raw {
        None => Vec::new(),
        Some(value) => serde_json::from_value(value).unwrap_or_else(|err| {
            warn!(key_id, error = %err, "malformed adjustment_history, resetting");
            Vec::new()
        }),
    }
}

fn adaptive_from_key(m: &entities::provider_api_keys::Model) -> AdaptiveState {
    AdaptiveState {
        learned_rpm_limit: m.learned_rpm_limit.map(|v| v.max(0) as u32),
        last_rpm_peak: m.last_rpm_peak.map(|v| v.max(0) as u32),
        last_429_at: m.last_429_at,
        last_429_kind: m.last_429_kind.as_deref().and_then(decode_rate_limit_kind),
        rpm_429_count: m.rpm_429_count.max(0) as u32,
        concurrent_429_count: m.concurrent_429_count.max(0) as u32,
        utilization_samples: decode_samples(m.utilization_samples.clone(), m.id),
        adjustment_history: decode_history(m.adjustment_history.clone(), m.id),
        last_probe_increase_at: m.last_probe_increase_at,
    }
}

#[async_trait::async_trait]
impl Storage for SeaOrmStorage {
    async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::GlobalConfig)
            .register(entities::Providers)
            .register(entities::ProviderEndpoints)
            .register(entities::ProviderApiKeys)
            .register(entities::GlobalModels)
            .register(entities::Models)
            .register(entities::Users)
            .register(entities::ApiKeys)
            .register(entities::RequestCandidates)
            .sync(&self.db)
            .await?;
        Ok(())
    }

    async fn load_global_config(&self) -> StorageResult<Option<GlobalConfigRow>> {
        use entities::global_config::Column;
        let row = entities::GlobalConfig::find()
            .order_by_asc(Column::Id)
            .one(&self.db)
            .await?;
        match row {
            None => Ok(None),
            Some(m) => {
                let config: GlobalConfig = serde_json::from_value(m.config_json)?;
                let dispatch: DispatchSettings = serde_json::from_value(m.dispatch_json)?;
                Ok(Some(GlobalConfigRow {
                    id: m.id,
                    config,
                    dispatch,
                    updated_at: m.updated_at,
                }))
            }
        }
    }

    async fn upsert_global_config(
        &self,
        config: &GlobalConfig,
        dispatch: &DispatchSettings,
    ) -> StorageResult<()> {
        use entities::global_config::{ActiveModel as GlobalActive, Column};
        let now = OffsetDateTime::now_utc();
        let config_json = serde_json::to_value(config)?;
        let dispatch_json = serde_json::to_value(dispatch)?;

        let existing = entities::GlobalConfig::find()
            .order_by_asc(Column::Id)
            .one(&self.db)
            .await?;
        match existing {
            Some(m) => {
                let mut active: GlobalActive = m.into();
                active.config_json = ActiveValue::Set(config_json);
                active.dispatch_json = ActiveValue::Set(dispatch_json);
                active.updated_at = ActiveValue::Set(now);
                active.update(&self.db).await?;
            }
            None => {
                let active = GlobalActive {
                    id: ActiveValue::NotSet,
                    config_json: ActiveValue::Set(config_json),
                    dispatch_json: ActiveValue::Set(dispatch_json),
                    updated_at: ActiveValue::Set(now),
                };
                entities::GlobalConfig::insert(active).exec(&self.db).await?;
            }
        }
        Ok(())
    }

    async fn load_snapshot(&self) -> StorageResult<StorageSnapshot> {
        let providers = entities::Providers::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|m| ProviderRow {
                id: m.id,
                provider_type: decode_provider_type(&m.provider_type, m.id),
                name: m.name,
                is_active: m.is_active,
                provider_priority: m.provider_priority,
                keep_priority_on_conversion: m.keep_priority_on_conversion,
                allow_format_conversion: m.allow_format_conversion,
                proxy: m.proxy,
                max_retries: m.max_retries.map(|v| v.max(0) as u32),
            })
            .collect();

        let endpoints = entities::ProviderEndpoints::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|m| EndpointRow {
                id: m.id,
                provider_id: m.provider_id,
                base_url: m.base_url,
                api_family: m.api_family,
                endpoint_kind: m.endpoint_kind,
                is_active: m.is_active,
                format_acceptance: m.format_acceptance,
            })
            .collect();

        let keys = entities::ProviderApiKeys::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|m| {
                let adaptive = adaptive_from_key(&m);
                KeyRow {
                    id: m.id,
                    provider_id: m.provider_id,
                    auth_type: decode_auth_type(&m.auth_type, m.id),
                    name: m.name,
                    secret: m.secret,
                    api_formats: m.api_formats,
                    allowed_models: m.allowed_models,
                    is_active: m.is_active,
                    rpm_limit: m.rpm_limit.map(|v| v.max(0) as u32),
                    internal_priority: m.internal_priority,
                    global_priority_by_format: m.global_priority_by_format,
                    oauth_invalid_reason: m.oauth_invalid_reason,
                    adaptive,
                }
            })
            .collect();

        let models = entities::Models::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|m| ModelRow {
                id: m.id,
                provider_id: m.provider_id,
                local_model_id: m.local_model_id,
                global_model_id: m.global_model_id,
                is_active: m.is_active,
                is_available: m.is_available,
            })
            .collect();

        let global_models = entities::GlobalModels::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|m| GlobalModelRow {
                id: m.id,
                name: m.name,
                is_active: m.is_active,
            })
            .collect();

        let users = entities::Users::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|m| UserRow {
                id: m.id,
                name: m.name,
                is_active: m.is_active,
                allowed_providers: m.allowed_providers,
                allowed_models: m.allowed_models,
                allowed_api_formats: m.allowed_api_formats,
            })
            .collect();

        let api_keys = entities::ApiKeys::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|m| ApiKeyRow {
                id: m.id,
                user_id: m.user_id,
                key_hash: m.key_hash,
                is_active: m.is_active,
                allowed_providers: m.allowed_providers,
                allowed_models: m.allowed_models,
                allowed_api_formats: m.allowed_api_formats,
            })
            .collect();

        Ok(StorageSnapshot {
            providers,
            endpoints,
            keys,
            models,
            global_models,
            users,
            api_keys,
        })
    }

    async fn insert_request_candidates(
        &self,
        rows: &[NewRequestCandidate],
    ) -> StorageResult<()> {
        use entities::request_candidates::ActiveModel as CandidateActive;
        if rows.is_empty() {
            return Ok(());
        }
        let actives: Vec<CandidateActive> = rows
            .iter()
            .map(|row| CandidateActive {
                id: ActiveValue::Set(row.id.clone()),
                request_id: ActiveValue::Set(row.request_id.clone()),
                candidate_index: ActiveValue::Set(row.candidate_index),
                retry_index: ActiveValue::Set(row.retry_index),
                user_id: ActiveValue::Set(row.user_id),
                api_key_id: ActiveValue::Set(row.api_key_id),
                provider_id: ActiveValue::Set(row.provider_id),
                endpoint_id: ActiveValue::Set(row.endpoint_id),
                key_id: ActiveValue::Set(row.key_id),
                status: ActiveValue::Set("available".to_string()),
                skip_reason: ActiveValue::Set(None),
                status_code: ActiveValue::Set(None),
                error_type: ActiveValue::Set(None),
                error_message: ActiveValue::Set(None),
                is_cached: ActiveValue::Set(row.is_cached),
                concurrent_requests: ActiveValue::Set(None),
                latency_ms: ActiveValue::Set(None),
                extra_data: ActiveValue::Set(None),
                created_at: ActiveValue::Set(row.created_at),
                started_at: ActiveValue::Set(None),
                finished_at: ActiveValue::Set(None),
            })
            .collect();
        entities::RequestCandidates::insert_many(actives)
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn update_request_candidate(
        &self,
        id: &str,
        patch: RequestCandidatePatch,
    ) -> StorageResult<()> {
        use entities::request_candidates::ActiveModel as CandidateActive;
        let mut active = CandidateActive {
            id: ActiveValue::Set(id.to_string()),
            ..Default::default()
        };
        if let Some(status) = patch.status {
            active.status = ActiveValue::Set(status);
        }
        if let Some(skip_reason) = patch.skip_reason {
            active.skip_reason = ActiveValue::Set(Some(skip_reason));
        }
        if let Some(status_code) = patch.status_code {
            active.status_code = ActiveValue::Set(Some(status_code));
        }
        if let Some(error_type) = patch.error_type {
            active.error_type = ActiveValue::Set(Some(error_type));
        }
        if let Some(error_message) = patch.error_message {
            active.error_message = ActiveValue::Set(Some(error_message));
        }
        if let Some(concurrent_requests) = patch.concurrent_requests {
            active.concurrent_requests = ActiveValue::Set(Some(concurrent_requests));
        }
        if let Some(latency_ms) = patch.latency_ms {
            active.latency_ms = ActiveValue::Set(Some(latency_ms));
        }
        if let Some(extra_data) = patch.extra_data {
            active.extra_data = ActiveValue::Set(Some(extra_data));
        }
        if let Some(started_at) = patch.started_at {
            active.started_at = ActiveValue::Set(Some(started_at));
        }
        if let Some(finished_at) = patch.finished_at {
            active.finished_at = ActiveValue::Set(Some(finished_at));
        }
        active.update(&self.db).await?;
        Ok(())
    }

    async fn save_key_adaptive_state(
        &self,
        key_id: i64,
        state: &AdaptiveState,
    ) -> StorageResult<()> {
        use entities::provider_api_keys::ActiveModel as KeyActive;
        let samples = serde_json::to_value(&state.utilization_samples)?;
        let history = serde_json::to_value(&state.adjustment_history)?;
        let kind = state
            .last_429_kind
            .map(|k| serde_json::to_value(k))
            .transpose()?
            .and_then(|v| v.as_str().map(|s| s.to_string()));

        let active = KeyActive {
            id: ActiveValue::Set(key_id),
            learned_rpm_limit: ActiveValue::Set(state.learned_rpm_limit.map(|v| v as i32)),
            last_rpm_peak: ActiveValue::Set(state.last_rpm_peak.map(|v| v as i32)),
            last_429_at: ActiveValue::Set(state.last_429_at),
            last_429_kind: ActiveValue::Set(kind),
            rpm_429_count: ActiveValue::Set(state.rpm_429_count as i32),
            concurrent_429_count: ActiveValue::Set(state.concurrent_429_count as i32),
            utilization_samples: ActiveValue::Set(Some(samples)),
            adjustment_history: ActiveValue::Set(Some(history)),
            last_probe_increase_at: ActiveValue::Set(state.last_probe_increase_at),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        active.update(&self.db).await?;
        Ok(())
    }
}
