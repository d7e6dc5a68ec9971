//! Explicit plugin registration: no runtime discovery, just a hand-written
//! list evaluated once at program start.
//!
//! The dispatch core only consumes capability queries and adapter contracts;
//! concrete wire-format converters live in protocol crates and register
//! themselves here as they are added.

use std::sync::Arc;

use async_trait::async_trait;
use http::HeaderValue;

use apimux_format::ConversionTable;
use apimux_provider::{
    AdapterRegistry, AuthConfig, AuthType, BehaviorFlags, EndpointTarget, KeyMaterial, ModelInfo,
    ProviderAdapter, ProviderError, ProviderResult, ProviderType, WireRequest,
};

/// Plain bearer-token passthrough for OpenAI-compatible custom upstreams.
struct CustomAdapter;

#[async_trait]
impl ProviderAdapter for CustomAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Custom
    }

    fn behavior(&self) -> BehaviorFlags {
        BehaviorFlags {
            same_format: true,
            cross_format: true,
        }
    }

    fn wrap_request(
        &self,
        request: &WireRequest,
        key: &KeyMaterial,
        _endpoint: &EndpointTarget,
    ) -> ProviderResult<WireRequest> {
        if key.auth_type != AuthType::ApiKey {
            return Err(ProviderError::Unsupported("oauth on custom provider"));
        }
        let mut wrapped = request.clone();
        let value = HeaderValue::from_str(&format!("Bearer {}", key.secret))
            .map_err(|_| ProviderError::MissingKeyField("secret"))?;
        wrapped.headers.insert(http::header::AUTHORIZATION, value);
        Ok(wrapped)
    }

    fn build_url(
        &self,
        endpoint: &EndpointTarget,
        is_stream: bool,
        query: &[(String, String)],
    ) -> ProviderResult<String> {
        let mut url = endpoint.base_url.trim_end_matches('/').to_string();
        let mut pairs: Vec<String> = query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        if is_stream && endpoint.signature.family() == "gemini" {
            pairs.push("alt=sse".to_string());
        }
        if !pairs.is_empty() {
            url.push('?');
            url.push_str(&pairs.join("&"));
        }
        Ok(url)
    }

    fn enrich_auth(
        &self,
        auth: AuthConfig,
        _token_response: &serde_json::Value,
        _access_token: &str,
        _proxy: Option<&str>,
    ) -> ProviderResult<AuthConfig> {
        Ok(auth)
    }

    async fn fetch_models(
        &self,
        _endpoint: &EndpointTarget,
        _key: &KeyMaterial,
    ) -> ProviderResult<Vec<ModelInfo>> {
        Err(ProviderError::Unsupported("model listing on custom provider"))
    }
}

pub(crate) struct Registries {
    pub adapters: AdapterRegistry,
    pub conversions: ConversionTable,
}

/// The built-in plugin list. Each entry registers everything it brings along.
pub(crate) fn register_builtin() -> Registries {
    let mut adapters = AdapterRegistry::new();
    let conversions = ConversionTable::new();

    adapters.register(Arc::new(CustomAdapter));

    Registries {
        adapters,
        conversions,
    }
}
