//! Candidate expansion: availability rows become `ProviderCandidate`s with
//! the conversion gate applied per endpoint.

use std::sync::Arc;

use tracing::warn;

use apimux_common::DispatchSettings;
use apimux_format::{
    ConverterRegistry, EndpointSignature, FormatAcceptance, is_format_compatible,
};
use apimux_provider::{AdapterRegistry, AuthType, is_oauth_account_blocked};
use apimux_storage::{EndpointRow, KeyRow, ProviderRow};

use crate::availability::AvailabilityRow;

/// One `(provider, endpoint, key)` tuple the failover engine may try,
/// in the shape the sorter and engine consume.
#[derive(Debug, Clone)]
pub struct ProviderCandidate {
    pub provider: Arc<ProviderRow>,
    pub endpoint: Arc<EndpointRow>,
    pub key: Arc<KeyRow>,
    pub is_cached: bool,
    pub is_skipped: bool,
    pub skip_reason: Option<String>,
    pub needs_conversion: bool,
    /// The endpoint's canonical signature.
    pub provider_api_format: EndpointSignature,
    /// Provider-local model id that matched the request.
    pub mapping_matched_model: String,
}

impl ProviderCandidate {
    pub fn target(&self) -> (i64, i64, i64) {
        (self.provider.id, self.endpoint.id, self.key.id)
    }
}

pub struct CandidateBuilder<'a> {
    pub client_format: &'a EndpointSignature,
    pub is_stream: bool,
    pub settings: &'a DispatchSettings,
    pub registry: &'a dyn ConverterRegistry,
    /// Provider-type behavior quirks; candidates of adapters that opted out
    /// of cross-format dispatch are skipped when conversion is needed.
    pub adapters: Option<&'a AdapterRegistry>,
}

impl CandidateBuilder<'_> {
    /// Expand availability rows. Gate-incompatible rows and account-blocked
    /// OAuth keys are kept as skipped candidates so the audit trail shows why
    /// they were passed over.
    pub fn build(&self, rows: Vec<AvailabilityRow>) -> Vec<ProviderCandidate> {
        rows.into_iter().map(|row| self.build_one(row)).collect()
    }

    fn build_one(&self, row: AvailabilityRow) -> ProviderCandidate {
        let acceptance = decode_acceptance(&row.endpoint);
        let skip_endpoint_check = row.provider.allow_format_conversion;

        let check = is_format_compatible(
            self.client_format,
            &row.endpoint_signature,
            acceptance.as_ref(),
            self.is_stream,
            self.settings.conversion_enabled,
            skip_endpoint_check,
            self.registry,
        );

        let mut candidate = ProviderCandidate {
            provider: row.provider,
            endpoint: row.endpoint,
            key: row.key,
            is_cached: false,
            is_skipped: false,
            skip_reason: None,
            needs_conversion: check.needs_conversion,
            provider_api_format: row.endpoint_signature,
            mapping_matched_model: row.matched_model,
        };

        if !check.is_compatible {
            candidate.is_skipped = true;
            candidate.skip_reason = check.skip_reason.map(|r| r.to_string());
            return candidate;
        }

        if candidate.needs_conversion
            && let Some(adapters) = self.adapters
            && let Some(adapter) = adapters.get(candidate.provider.provider_type)
            && !adapter.behavior().cross_format
        {
            candidate.is_skipped = true;
            candidate.skip_reason = Some("provider_no_cross_format".to_string());
            return candidate;
        }

        // Account-blocked OAuth keys need operator action; transient OAuth
        // failures stay live for the rate-limit layer to re-evaluate.
        if candidate.key.auth_type == AuthType::Oauth
            && is_oauth_account_blocked(candidate.key.oauth_invalid_reason.as_deref())
        {
            candidate.is_skipped = true;
            candidate.skip_reason = Some("oauth_account_blocked".to_string());
        }

        candidate
    }
}

fn decode_acceptance(endpoint: &EndpointRow) -> Option<FormatAcceptance> {
    let value = endpoint.format_acceptance.as_ref()?;
    match serde_json::from_value(value.clone()) {
        Ok(acceptance) => Some(acceptance),
        Err(err) => {
            warn!(
                endpoint_id = endpoint.id,
                error = %err,
                "malformed format_acceptance, treating endpoint as unconfigured"
            );
            None
        }
    }
}
