use serde_json::Value as JsonValue;
use time::OffsetDateTime;

use apimux_common::{DispatchSettings, GlobalConfig};
use apimux_provider::{AuthType, ProviderType};
use apimux_ratelimit::AdaptiveState;

#[derive(Debug, Clone)]
pub struct GlobalConfigRow {
    pub id: i64,
    pub config: GlobalConfig,
    pub dispatch: DispatchSettings,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct ProviderRow {
    pub id: i64,
    pub name: String,
    pub provider_type: ProviderType,
    pub is_active: bool,
    pub provider_priority: i32,
    pub keep_priority_on_conversion: bool,
    /// Provider-level conversion switch (layer two of the gate).
    pub allow_format_conversion: bool,
    pub proxy: Option<String>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct EndpointRow {
    pub id: i64,
    pub provider_id: i64,
    pub base_url: String,
    pub api_family: String,
    pub endpoint_kind: String,
    pub is_active: bool,
    /// Raw `FormatAcceptance` JSON; decoded at the gate.
    pub format_acceptance: Option<JsonValue>,
}

#[derive(Debug, Clone)]
pub struct KeyRow {
    pub id: i64,
    pub provider_id: i64,
    pub name: Option<String>,
    pub secret: String,
    pub auth_type: AuthType,
    /// Raw JSON on purpose: malformed values must fail closed at the
    /// availability check, not explode at snapshot load.
    pub api_formats: Option<JsonValue>,
    pub allowed_models: Option<JsonValue>,
    pub is_active: bool,
    pub rpm_limit: Option<u32>,
    pub internal_priority: i32,
    pub global_priority_by_format: Option<JsonValue>,
    pub oauth_invalid_reason: Option<String>,
    pub adaptive: AdaptiveState,
}

#[derive(Debug, Clone)]
pub struct ModelRow {
    pub id: i64,
    pub provider_id: i64,
    pub local_model_id: String,
    pub global_model_id: Option<i64>,
    pub is_active: bool,
    pub is_available: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct GlobalModelRow {
    pub id: i64,
    pub name: String,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub name: String,
    pub is_active: bool,
    pub allowed_providers: Option<JsonValue>,
    pub allowed_models: Option<JsonValue>,
    pub allowed_api_formats: Option<JsonValue>,
}

#[derive(Debug, Clone)]
pub struct ApiKeyRow {
    pub id: i64,
    pub user_id: i64,
    pub key_hash: String,
    pub is_active: bool,
    pub allowed_providers: Option<JsonValue>,
    pub allowed_models: Option<JsonValue>,
    pub allowed_api_formats: Option<JsonValue>,
}

/// Runtime reads never hit the DB; they read this snapshot (held behind an
/// `ArcSwap` by the application state and replaced wholesale on admin writes).
#[derive(Debug, Clone, Default)]
pub struct StorageSnapshot {
    pub providers: Vec<ProviderRow>,
    pub endpoints: Vec<EndpointRow>,
    pub keys: Vec<KeyRow>,
    pub models: Vec<ModelRow>,
    pub global_models: Vec<GlobalModelRow>,
    pub users: Vec<UserRow>,
    pub api_keys: Vec<ApiKeyRow>,
}

impl StorageSnapshot {
    pub fn provider(&self, id: i64) -> Option<&ProviderRow> {
        self.providers.iter().find(|p| p.id == id)
    }

    pub fn endpoint(&self, id: i64) -> Option<&EndpointRow> {
        self.endpoints.iter().find(|e| e.id == id)
    }

    pub fn key(&self, id: i64) -> Option<&KeyRow> {
        self.keys.iter().find(|k| k.id == id)
    }

    pub fn global_model_by_name(&self, name: &str) -> Option<&GlobalModelRow> {
        self.global_models.iter().find(|g| g.name == name)
    }

    pub fn user(&self, id: i64) -> Option<&UserRow> {
        self.users.iter().find(|u| u.id == id)
    }
}
