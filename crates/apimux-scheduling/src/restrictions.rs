//! Caller-side access restrictions: the ApiKey's own limits with the owning
//! User's limits as fallback.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value as JsonValue;
use tracing::warn;

use apimux_format::EndpointSignature;
use apimux_storage::{ApiKeyRow, UserRow};

/// `allowed_models` comes in two shapes: a flat list applying to every
/// format, or a per-signature map (`*` is the map's default bucket).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedModels {
    List(Vec<String>),
    ByFormat(BTreeMap<String, Vec<String>>),
}

#[derive(Debug, thiserror::Error)]
#[error("unexpected shape for {field}")]
pub struct RestrictionDecodeError {
    pub field: &'static str,
}

fn string_list(value: &JsonValue) -> Option<Vec<String>> {
    value.as_array().map(|items| {
        items
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect()
    })
}

impl AllowedModels {
    /// Decode from the raw JSON column. Anything that is neither a list nor a
    /// `{signature: [model]}` map is an error; callers treat that as more
    /// restrictive than empty and drop the key (fail closed).
    pub fn decode(value: &JsonValue) -> Result<Self, RestrictionDecodeError> {
        if let Some(list) = string_list(value) {
            return Ok(AllowedModels::List(list));
        }
        if let Some(map) = value.as_object() {
            let mut by_format = BTreeMap::new();
            for (key, entry) in map {
                let Some(models) = string_list(entry) else {
                    return Err(RestrictionDecodeError {
                        field: "allowed_models",
                    });
                };
                by_format.insert(normalize_format_key(key), models);
            }
            return Ok(AllowedModels::ByFormat(by_format));
        }
        Err(RestrictionDecodeError {
            field: "allowed_models",
        })
    }

    /// The effective whitelist for one signature. `None` means unrestricted.
    pub fn normalized(&self, api_format: Option<&EndpointSignature>) -> Option<BTreeSet<String>> {
        match self {
            AllowedModels::List(models) => Some(models.iter().cloned().collect()),
            AllowedModels::ByFormat(map) => {
                let Some(format) = api_format else {
                    // No format in play: the union across formats applies.
                    let all: BTreeSet<String> =
                        map.values().flatten().cloned().collect();
                    return if all.is_empty() { None } else { Some(all) };
                };
                let key = format.to_string();
                match map.get(&key).or_else(|| map.get("*")) {
                    Some(models) => Some(models.iter().cloned().collect()),
                    // Unconfigured format in map mode means unrestricted there.
                    None => None,
                }
            }
        }
    }

    /// Whitelist check; the resolved canonical name passes an alias through.
    pub fn allows(
        &self,
        model_name: &str,
        api_format: Option<&EndpointSignature>,
        resolved_model_name: Option<&str>,
    ) -> bool {
        match self.normalized(api_format) {
            None => true,
            Some(set) => {
                if set.is_empty() {
                    return false;
                }
                set.contains(model_name)
                    || resolved_model_name.is_some_and(|resolved| set.contains(resolved))
            }
        }
    }
}

fn normalize_format_key(raw: &str) -> String {
    if raw == "*" {
        return raw.to_string();
    }
    raw.parse::<EndpointSignature>()
        .map(|sig| sig.to_string())
        .unwrap_or_else(|_| raw.trim().to_ascii_lowercase())
}

fn merge_sets(
    a: Option<BTreeSet<String>>,
    b: Option<BTreeSet<String>>,
) -> Option<BTreeSet<String>> {
    match (a, b) {
        (None, b) => b,
        (a, None) => a,
        (Some(a), Some(b)) => Some(a.intersection(&b).cloned().collect()),
    }
}

/// Intersect two `allowed_models` configurations.
///
/// Two lists intersect to a sorted list. As soon as a map is involved the
/// result stays a map: collapsing to a list would broaden permissions on the
/// formats the map never enumerated.
pub fn merge_allowed_models(
    a: Option<&AllowedModels>,
    b: Option<&AllowedModels>,
) -> Option<AllowedModels> {
    let (a, b) = match (a, b) {
        (None, None) => return None,
        (None, Some(b)) => return Some(b.clone()),
        (Some(a), None) => return Some(a.clone()),
        (Some(a), Some(b)) => (a, b),
    };

    if let (AllowedModels::List(la), AllowedModels::List(lb)) = (a, b) {
        let sa: BTreeSet<&String> = la.iter().collect();
        let merged: Vec<String> = lb
            .iter()
            .filter(|m| sa.contains(m))
            .cloned()
            .collect::<BTreeSet<String>>()
            .into_iter()
            .collect();
        return Some(AllowedModels::List(merged));
    }

    fn explicit_keys(m: &AllowedModels) -> BTreeSet<String> {
        match m {
            AllowedModels::List(_) => BTreeSet::new(),
            AllowedModels::ByFormat(map) => map.keys().cloned().collect(),
        }
    }

    fn lookup(m: &AllowedModels, key: &str) -> Option<BTreeSet<String>> {
        match m {
            AllowedModels::List(models) => Some(models.iter().cloned().collect()),
            AllowedModels::ByFormat(map) => map
                .get(key)
                .or_else(|| map.get("*"))
                .map(|models| models.iter().cloned().collect()),
        }
    }

    fn default_bucket(m: &AllowedModels) -> Option<BTreeSet<String>> {
        match m {
            AllowedModels::List(models) => Some(models.iter().cloned().collect()),
            AllowedModels::ByFormat(map) => {
                map.get("*").map(|models| models.iter().cloned().collect())
            }
        }
    }

    let mut keys = explicit_keys(a);
    keys.extend(explicit_keys(b));
    keys.remove("*");

    let mut merged: BTreeMap<String, Vec<String>> = BTreeMap::new();
    // A list restricts every format, so its contribution lands in the
    // wildcard bucket rather than silently freeing unenumerated formats.
    if let Some(default) = merge_sets(default_bucket(a), default_bucket(b)) {
        merged.insert("*".to_string(), default.into_iter().collect());
    }
    for key in keys {
        if let Some(set) = merge_sets(lookup(a, &key), lookup(b, &key)) {
            merged.insert(key, set.into_iter().collect());
        }
    }
    Some(AllowedModels::ByFormat(merged))
}

/// The effective filter for one caller.
#[derive(Debug, Clone, Default)]
pub struct AccessRestrictions {
    /// Allowed provider ids. `None` means unrestricted.
    pub allowed_providers: Option<BTreeSet<i64>>,
    pub allowed_models: Option<AllowedModels>,
    /// Canonical signature strings. `None` means unrestricted.
    pub allowed_api_formats: Option<BTreeSet<String>>,
}

fn decode_provider_ids(value: &JsonValue) -> Option<BTreeSet<i64>> {
    value.as_array().map(|items| {
        items
            .iter()
            .filter_map(|v| {
                v.as_i64()
                    .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
            })
            .collect()
    })
}

fn decode_format_set(value: &JsonValue) -> Option<BTreeSet<String>> {
    string_list(value).map(|list| {
        list.iter()
            .filter(|s| !s.is_empty())
            .map(|s| normalize_format_key(s))
            .collect()
    })
}

impl AccessRestrictions {
    /// Per axis: the ApiKey's own setting wins, the User's is fallback, and
    /// with neither the axis is unrestricted. A malformed value on one axis is
    /// treated as deny-all for that axis (fail closed).
    pub fn from_caller(api_key: Option<&ApiKeyRow>, user: Option<&UserRow>) -> Self {
        fn axis<'a>(
            key_value: Option<&'a JsonValue>,
            user_value: Option<&'a JsonValue>,
        ) -> Option<&'a JsonValue> {
            key_value.or(user_value)
        }

        let key_models = api_key.and_then(|k| k.allowed_models.as_ref());
        let key_providers = api_key.and_then(|k| k.allowed_providers.as_ref());
        let key_formats = api_key.and_then(|k| k.allowed_api_formats.as_ref());
        let user_models = user.and_then(|u| u.allowed_models.as_ref());
        let user_providers = user.and_then(|u| u.allowed_providers.as_ref());
        let user_formats = user.and_then(|u| u.allowed_api_formats.as_ref());

        let allowed_providers = axis(key_providers, user_providers).map(|value| {
            decode_provider_ids(value).unwrap_or_else(|| {
                warn!("malformed allowed_providers on caller, denying all providers");
                BTreeSet::new()
            })
        });

        let allowed_models = axis(key_models, user_models).map(|value| {
            AllowedModels::decode(value).unwrap_or_else(|_| {
                warn!("malformed allowed_models on caller, denying all models");
                AllowedModels::List(Vec::new())
            })
        });

        let allowed_api_formats = axis(key_formats, user_formats).map(|value| {
            decode_format_set(value).unwrap_or_else(|| {
                warn!("malformed allowed_api_formats on caller, denying all formats");
                BTreeSet::new()
            })
        });

        Self {
            allowed_providers,
            allowed_models,
            allowed_api_formats,
        }
    }

    pub fn is_provider_allowed(&self, provider_id: i64) -> bool {
        match &self.allowed_providers {
            None => true,
            Some(set) => set.contains(&provider_id),
        }
    }

    pub fn is_api_format_allowed(&self, api_format: &EndpointSignature) -> bool {
        match &self.allowed_api_formats {
            None => true,
            Some(set) => set.contains(&api_format.to_string()),
        }
    }

    pub fn is_model_allowed(
        &self,
        model_name: &str,
        api_format: Option<&EndpointSignature>,
        resolved_model_name: Option<&str>,
    ) -> bool {
        match &self.allowed_models {
            None => true,
            Some(allowed) => allowed.allows(model_name, api_format, resolved_model_name),
        }
    }
}
