#![allow(dead_code)]

use std::sync::Arc;

use serde_json::json;

use apimux_provider::{AuthType, ProviderType};
use apimux_ratelimit::AdaptiveState;
use apimux_scheduling::ProviderCandidate;
use apimux_storage::{EndpointRow, KeyRow, ProviderRow};

pub fn provider_row(id: i64, priority: i32, keep_priority_on_conversion: bool) -> ProviderRow {
    ProviderRow {
        id,
        name: format!("prov_{id}"),
        provider_type: ProviderType::Custom,
        is_active: true,
        provider_priority: priority,
        keep_priority_on_conversion,
        allow_format_conversion: false,
        proxy: None,
        max_retries: None,
    }
}

pub fn endpoint_row(id: i64, provider_id: i64, family: &str, kind: &str) -> EndpointRow {
    EndpointRow {
        id,
        provider_id,
        base_url: format!("https://upstream-{id}.example"),
        api_family: family.to_string(),
        endpoint_kind: kind.to_string(),
        is_active: true,
        format_acceptance: None,
    }
}

pub fn key_row(id: i64, provider_id: i64, internal_priority: i32) -> KeyRow {
    KeyRow {
        id,
        provider_id,
        name: Some(format!("key_{id}")),
        secret: "enc:test".to_string(),
        auth_type: AuthType::ApiKey,
        api_formats: None,
        allowed_models: None,
        is_active: true,
        rpm_limit: None,
        internal_priority,
        global_priority_by_format: None,
        oauth_invalid_reason: None,
        adaptive: AdaptiveState::default(),
    }
}

#[allow(clippy::too_many_arguments)]
pub fn candidate(
    key_id: i64,
    global_priority: i64,
    needs_conversion: bool,
    provider_keep_priority: bool,
    is_skipped: bool,
) -> ProviderCandidate {
    let provider = provider_row(key_id * 10, 1, provider_keep_priority);
    let endpoint = endpoint_row(key_id * 100, provider.id, "openai", "chat");
    let mut key = key_row(key_id, provider.id, 1);
    key.global_priority_by_format = Some(json!({ "openai:chat": global_priority }));

    ProviderCandidate {
        provider: Arc::new(provider),
        endpoint: Arc::new(endpoint),
        key: Arc::new(key),
        is_cached: false,
        is_skipped,
        skip_reason: is_skipped.then(|| "unhealthy".to_string()),
        needs_conversion,
        provider_api_format: "openai:chat".parse().unwrap(),
        mapping_matched_model: "gpt-test".to_string(),
    }
}
