//! System-level availability: which `(provider, endpoint, key)` tuples can in
//! principle serve a model, before any per-request compatibility or health
//! logic runs.
//!
//! Runtime reads come from the in-memory snapshot; the caller-level
//! restrictions are applied here so downstream stages only ever see tuples
//! the caller may use.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::warn;

use apimux_format::EndpointSignature;
use apimux_storage::{EndpointRow, KeyRow, ModelRow, ProviderRow, StorageSnapshot};

use crate::restrictions::{AccessRestrictions, AllowedModels, merge_allowed_models};

#[derive(Debug, Clone)]
pub struct AvailabilityRow {
    pub provider: Arc<ProviderRow>,
    pub endpoint: Arc<EndpointRow>,
    pub key: Arc<KeyRow>,
    pub endpoint_signature: EndpointSignature,
    /// Provider-local model id to put on the wire.
    pub matched_model: String,
    pub global_model_id: i64,
    /// Canonical model name the request resolved to.
    pub resolved_model_name: String,
}

pub struct AvailabilityQuery;

impl AvailabilityQuery {
    /// All tuples passing the system-level availability conditions:
    /// provider/endpoint/key/model/global-model active flags, endpoint
    /// signature within the requested set, per-key format support and model
    /// whitelists, and the caller's restrictions.
    pub fn find(
        snapshot: &StorageSnapshot,
        model_name: &str,
        requested_formats: &[EndpointSignature],
        restrictions: &AccessRestrictions,
    ) -> Vec<AvailabilityRow> {
        let requested: BTreeSet<String> = requested_formats
            .iter()
            .filter(|sig| restrictions.is_api_format_allowed(sig))
            .map(|sig| sig.to_string())
            .collect();
        if requested.is_empty() {
            return Vec::new();
        }

        let Some((global_model_id, resolved_name)) = resolve_model(snapshot, model_name) else {
            return Vec::new();
        };

        let providers: HashMap<i64, Arc<ProviderRow>> = snapshot
            .providers
            .iter()
            .filter(|p| p.is_active && restrictions.is_provider_allowed(p.id))
            .map(|p| (p.id, Arc::new(p.clone())))
            .collect();

        // Bound models per provider: active, available (null counts), mapped
        // to the resolved global model.
        let mut model_by_provider: HashMap<i64, &ModelRow> = HashMap::new();
        for model in &snapshot.models {
            if !model.is_active || model.is_available == Some(false) {
                continue;
            }
            if model.global_model_id != Some(global_model_id) {
                continue;
            }
            if !providers.contains_key(&model.provider_id) {
                continue;
            }
            model_by_provider.entry(model.provider_id).or_insert(model);
        }

        let mut endpoints_by_provider: HashMap<i64, Vec<(Arc<EndpointRow>, EndpointSignature)>> =
            HashMap::new();
        for endpoint in &snapshot.endpoints {
            if !endpoint.is_active || !model_by_provider.contains_key(&endpoint.provider_id) {
                continue;
            }
            let Ok(signature) =
                EndpointSignature::new(&endpoint.api_family, &endpoint.endpoint_kind)
            else {
                warn!(endpoint_id = endpoint.id, "unparseable endpoint signature, skipping");
                continue;
            };
            if !requested.contains(&signature.to_string()) {
                continue;
            }
            endpoints_by_provider
                .entry(endpoint.provider_id)
                .or_default()
                .push((Arc::new(endpoint.clone()), signature));
        }

        let mut rows = Vec::new();
        for key in &snapshot.keys {
            if !key.is_active {
                continue;
            }
            let Some(endpoints) = endpoints_by_provider.get(&key.provider_id) else {
                continue;
            };
            let Some(provider) = providers.get(&key.provider_id) else {
                continue;
            };
            let model = model_by_provider[&key.provider_id];

            let provider_endpoint_formats: BTreeSet<String> =
                endpoints.iter().map(|(_, sig)| sig.to_string()).collect();
            let Some(key_formats) =
                decode_key_formats(key, &provider_endpoint_formats)
            else {
                continue;
            };

            let key_allowed_models = match decode_key_allowed_models(key) {
                Ok(allowed) => allowed,
                Err(()) => continue,
            };
            // The caller's whitelist and the key's own whitelist combine by
            // per-signature intersection, wildcard buckets included.
            let effective_models = merge_allowed_models(
                restrictions.allowed_models.as_ref(),
                key_allowed_models.as_ref(),
            );

            for (endpoint, signature) in endpoints {
                let signature_str = signature.to_string();
                if !key_formats.contains(&signature_str) {
                    continue;
                }
                if let Some(allowed) = &effective_models
                    && !allowed.allows(model_name, Some(signature), Some(&resolved_name))
                    && !allowed.allows(&model.local_model_id, Some(signature), Some(&resolved_name))
                {
                    continue;
                }

                rows.push(AvailabilityRow {
                    provider: provider.clone(),
                    endpoint: endpoint.clone(),
                    key: Arc::new(key.clone()),
                    endpoint_signature: signature.clone(),
                    matched_model: model.local_model_id.clone(),
                    global_model_id,
                    resolved_model_name: resolved_name.clone(),
                });
            }
        }

        rows
    }
}

/// Resolve the requested name to an active global model: by canonical name
/// first, then through a provider-local alias bound to an active global model.
fn resolve_model(snapshot: &StorageSnapshot, model_name: &str) -> Option<(i64, String)> {
    if let Some(global) = snapshot
        .global_models
        .iter()
        .find(|g| g.is_active && g.name == model_name)
    {
        return Some((global.id, global.name.clone()));
    }

    for model in &snapshot.models {
        if !model.is_active || model.local_model_id != model_name {
            continue;
        }
        let Some(global_id) = model.global_model_id else {
            continue;
        };
        if let Some(global) = snapshot
            .global_models
            .iter()
            .find(|g| g.id == global_id && g.is_active)
        {
            return Some((global.id, global.name.clone()));
        }
    }

    None
}

/// Key `api_formats` with the fail-closed stance: null means every format of
/// the owning provider's active endpoints; a list is normalized; anything
/// else drops the key.
fn decode_key_formats(
    key: &KeyRow,
    provider_endpoint_formats: &BTreeSet<String>,
) -> Option<BTreeSet<String>> {
    match &key.api_formats {
        None => Some(provider_endpoint_formats.clone()),
        Some(JsonValue::Array(items)) => Some(
            items
                .iter()
                .filter_map(|v| v.as_str())
                .filter_map(|s| s.parse::<EndpointSignature>().ok())
                .map(|sig| sig.to_string())
                .collect(),
        ),
        Some(other) => {
            warn!(
                key_id = key.id,
                value_type = json_type_name(other),
                "key api_formats has unexpected shape, dropping key"
            );
            None
        }
    }
}

fn decode_key_allowed_models(key: &KeyRow) -> Result<Option<AllowedModels>, ()> {
    match &key.allowed_models {
        None => Ok(None),
        Some(value) => match AllowedModels::decode(value) {
            Ok(allowed) => Ok(Some(allowed)),
            Err(_) => {
                warn!(
                    key_id = key.id,
                    "key allowed_models has unexpected shape, dropping key"
                );
                Err(())
            }
        },
    }
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
