use serde::{Deserialize, Serialize};

use crate::registry::ConverterRegistry;
use crate::signature::EndpointSignature;

/// Per-endpoint opt-in for serving foreign client formats (layer three of the
/// conversion gate).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatAcceptance {
    #[serde(default)]
    pub enabled: bool,
    /// Whitelist. Empty means every format not rejected.
    #[serde(default)]
    pub accept_formats: Vec<String>,
    /// Blacklist, checked before the whitelist.
    #[serde(default)]
    pub reject_formats: Vec<String>,
    /// Whether streamed requests may be converted.
    #[serde(default = "default_true")]
    pub stream_conversion: bool,
}

impl Default for FormatAcceptance {
    fn default() -> Self {
        Self {
            enabled: false,
            accept_formats: Vec::new(),
            reject_formats: Vec::new(),
            stream_conversion: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompatCheck {
    pub is_compatible: bool,
    pub needs_conversion: bool,
    pub skip_reason: Option<&'static str>,
}

impl CompatCheck {
    fn ok(needs_conversion: bool) -> Self {
        Self {
            is_compatible: true,
            needs_conversion,
            skip_reason: None,
        }
    }

    fn deny(reason: &'static str) -> Self {
        Self {
            is_compatible: false,
            needs_conversion: false,
            skip_reason: Some(reason),
        }
    }
}

fn list_contains(list: &[String], signature: &EndpointSignature) -> bool {
    list.iter()
        .filter_map(|raw| raw.parse::<EndpointSignature>().ok())
        .any(|sig| sig == *signature)
}

/// Decide whether `endpoint` may serve a client speaking `client`.
///
/// First match wins:
/// 1. exact signature match or shared data format -> passthrough;
/// 2. otherwise a conversion is required, gated by the endpoint acceptance
///    config unless a higher layer (global or provider switch) forced
///    `skip_endpoint_check`;
/// 3. the converter registry must cover request, response and (for streams)
///    stream conversion.
///
/// `conversion_enabled=false` is not a kill switch: it only stops forcing the
/// endpoint check, so per-provider / per-endpoint opt-ins are still honored.
pub fn is_format_compatible(
    client: &EndpointSignature,
    endpoint: &EndpointSignature,
    acceptance: Option<&FormatAcceptance>,
    is_stream: bool,
    conversion_enabled: bool,
    skip_endpoint_check: bool,
    registry: &dyn ConverterRegistry,
) -> CompatCheck {
    if client == endpoint {
        return CompatCheck::ok(false);
    }

    if EndpointSignature::can_passthrough(client, endpoint) {
        return CompatCheck::ok(false);
    }

    if !(skip_endpoint_check || conversion_enabled) {
        let Some(config) = acceptance else {
            return CompatCheck::deny("endpoint not configured");
        };
        if !config.enabled {
            return CompatCheck::deny("endpoint disabled");
        }
        if list_contains(&config.reject_formats, client) {
            return CompatCheck::deny("rejected");
        }
        if !config.accept_formats.is_empty() && !list_contains(&config.accept_formats, client) {
            return CompatCheck::deny("not accepted");
        }
        if is_stream && !config.stream_conversion {
            return CompatCheck::deny("no stream conversion");
        }
    }

    if !registry.can_convert_full(client, endpoint, is_stream) {
        return CompatCheck::deny("no converter");
    }

    CompatCheck::ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConversionTable, identity_entry};

    fn sig(s: &str) -> EndpointSignature {
        s.parse().unwrap()
    }

    fn full_table() -> ConversionTable {
        let mut table = ConversionTable::new();
        table.register(sig("claude:chat"), sig("openai:chat"), identity_entry(true));
        table.register(sig("claude:cli"), sig("openai:chat"), identity_entry(true));
        table
    }

    fn acceptance(enabled: bool) -> FormatAcceptance {
        FormatAcceptance {
            enabled,
            ..FormatAcceptance::default()
        }
    }

    #[test]
    fn same_signature_is_passthrough() {
        let table = ConversionTable::new();
        let check = is_format_compatible(
            &sig("claude:chat"),
            &sig("claude:chat"),
            None,
            false,
            false,
            false,
            &table,
        );
        assert_eq!(check, CompatCheck::ok(false));
    }

    #[test]
    fn shared_data_format_is_passthrough() {
        let table = ConversionTable::new();
        let check = is_format_compatible(
            &sig("claude:chat"),
            &sig("claude:cli"),
            None,
            true,
            false,
            false,
            &table,
        );
        assert_eq!(check, CompatCheck::ok(false));
    }

    #[test]
    fn global_off_and_endpoint_unconfigured_denies() {
        let check = is_format_compatible(
            &sig("claude:chat"),
            &sig("openai:chat"),
            None,
            false,
            false,
            false,
            &full_table(),
        );
        assert!(!check.is_compatible);
        assert!(!check.needs_conversion);
        assert_eq!(check.skip_reason, Some("endpoint not configured"));
    }

    #[test]
    fn global_off_falls_back_to_endpoint_opt_in() {
        let check = is_format_compatible(
            &sig("claude:chat"),
            &sig("openai:chat"),
            Some(&acceptance(true)),
            false,
            false,
            false,
            &full_table(),
        );
        assert_eq!(check, CompatCheck::ok(true));
    }

    #[test]
    fn endpoint_disabled_denies() {
        let check = is_format_compatible(
            &sig("claude:chat"),
            &sig("openai:chat"),
            Some(&acceptance(false)),
            false,
            true,
            false,
            &full_table(),
        );
        assert_eq!(check.skip_reason, Some("endpoint disabled"));
    }

    #[test]
    fn reject_list_wins_over_accept_list() {
        let config = FormatAcceptance {
            enabled: true,
            accept_formats: vec!["claude:chat".into()],
            reject_formats: vec!["claude:chat".into()],
            stream_conversion: true,
        };
        let check = is_format_compatible(
            &sig("claude:chat"),
            &sig("openai:chat"),
            Some(&config),
            false,
            true,
            false,
            &full_table(),
        );
        assert_eq!(check.skip_reason, Some("rejected"));
    }

    #[test]
    fn accept_list_excludes_unlisted_formats() {
        let config = FormatAcceptance {
            enabled: true,
            accept_formats: vec!["gemini:chat".into()],
            ..acceptance(true)
        };
        let check = is_format_compatible(
            &sig("claude:chat"),
            &sig("openai:chat"),
            Some(&config),
            false,
            true,
            false,
            &full_table(),
        );
        assert_eq!(check.skip_reason, Some("not accepted"));
    }

    #[test]
    fn stream_conversion_switch_blocks_streams_only() {
        let config = FormatAcceptance {
            enabled: true,
            stream_conversion: false,
            ..FormatAcceptance::default()
        };
        let streamed = is_format_compatible(
            &sig("claude:chat"),
            &sig("openai:chat"),
            Some(&config),
            true,
            true,
            false,
            &full_table(),
        );
        assert_eq!(streamed.skip_reason, Some("no stream conversion"));

        let plain = is_format_compatible(
            &sig("claude:chat"),
            &sig("openai:chat"),
            Some(&config),
            false,
            true,
            false,
            &full_table(),
        );
        assert_eq!(plain, CompatCheck::ok(true));
    }

    #[test]
    fn missing_converter_denies_even_when_forced() {
        let table = ConversionTable::new();
        let check = is_format_compatible(
            &sig("claude:chat"),
            &sig("openai:chat"),
            None,
            false,
            true,
            true,
            &table,
        );
        assert_eq!(check.skip_reason, Some("no converter"));
    }

    #[test]
    fn cli_format_converts_through_registry() {
        let check = is_format_compatible(
            &sig("claude:cli"),
            &sig("openai:chat"),
            Some(&acceptance(true)),
            false,
            true,
            false,
            &full_table(),
        );
        assert_eq!(check, CompatCheck::ok(true));
    }
}
