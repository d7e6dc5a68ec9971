use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;

use apimux_format::EndpointSignature;

use crate::errors::ProviderResult;
use crate::types::{AuthType, ProviderType};

/// Wire-level request at the adapter seam: headers plus an opaque body.
/// Payload parsing happens in the protocol layer, never here.
#[derive(Debug, Clone, Default)]
pub struct WireRequest {
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The upstream endpoint an adapter is asked to address.
#[derive(Debug, Clone)]
pub struct EndpointTarget {
    pub base_url: String,
    pub signature: EndpointSignature,
}

/// Decrypted credential material handed to an adapter for one attempt.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    pub auth_type: AuthType,
    pub secret: String,
    /// Provider-specific settings (project ids, org headers, ...).
    pub settings: serde_json::Value,
}

/// Opaque per-key auth configuration mutated after OAuth refresh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthConfig(pub serde_json::Value);

/// Provider-specific scheduling quirks consulted by the candidate builder.
#[derive(Debug, Clone, Copy, Default)]
pub struct BehaviorFlags {
    /// Adapter rewrites same-format requests (envelope/auth only).
    pub same_format: bool,
    /// Adapter participates in cross-format dispatch.
    pub cross_format: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: Option<String>,
}

/// Per-provider-type plugin contract.
///
/// Implementations construct wire requests and URLs; a higher layer performs
/// the IO. Registered once at program start via an explicit plugin list.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_type(&self) -> ProviderType;

    fn behavior(&self) -> BehaviorFlags;

    /// Attach auth headers and any provider-specific envelope.
    fn wrap_request(
        &self,
        request: &WireRequest,
        key: &KeyMaterial,
        endpoint: &EndpointTarget,
    ) -> ProviderResult<WireRequest>;

    fn build_url(
        &self,
        endpoint: &EndpointTarget,
        is_stream: bool,
        query: &[(String, String)],
    ) -> ProviderResult<String>;

    /// Fold a fresh token response into the stored auth config after an OAuth
    /// refresh.
    fn enrich_auth(
        &self,
        auth: AuthConfig,
        token_response: &serde_json::Value,
        access_token: &str,
        proxy: Option<&str>,
    ) -> ProviderResult<AuthConfig>;

    /// List upstream models, paginating where the upstream supports it.
    async fn fetch_models(
        &self,
        endpoint: &EndpointTarget,
        key: &KeyMaterial,
    ) -> ProviderResult<Vec<ModelInfo>>;
}
