use serde::{Deserialize, Serialize};

/// Candidate ordering strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityMode {
    /// Sort by provider priority first, then key-internal priority.
    #[default]
    Provider,
    /// Sort by the key's per-format global priority, then key-internal priority.
    GlobalKey,
}

/// Tie-breaking strategy inside a priority tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
    /// Strict priority order, ignores affinity.
    FixedOrder,
    /// Sticky callers first, hash-spread inside a tier.
    #[default]
    CacheAffinity,
    /// Random rotation inside a tier, ignores affinity.
    LoadBalance,
}

impl PriorityMode {
    /// Lenient parse: unknown values fall back to the default with a caller-side warning.
    pub fn parse_lenient(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "provider" => Ok(Self::Provider),
            "global_key" => Ok(Self::GlobalKey),
            other => Err(other.to_string()),
        }
    }
}

impl SchedulingMode {
    pub fn parse_lenient(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fixed_order" => Ok(Self::FixedOrder),
            "cache_affinity" => Ok(Self::CacheAffinity),
            "load_balance" => Ok(Self::LoadBalance),
            other => Err(other.to_string()),
        }
    }

    /// Affinity entry lifetime for this mode, seconds. Never below five minutes.
    pub fn affinity_ttl_secs(self) -> u64 {
        match self {
            Self::CacheAffinity => 900,
            Self::FixedOrder | Self::LoadBalance => 300,
        }
    }
}

/// Runtime-mutable dispatch settings, refreshed by admin writes.
///
/// Reads are lock-free (callers hold this behind an `ArcSwap`); updates are
/// single-writer through the admin surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchSettings {
    #[serde(default)]
    pub priority_mode: PriorityMode,
    #[serde(default)]
    pub scheduling_mode: SchedulingMode,
    /// Global override: when true, conversion-requiring candidates keep their tier.
    #[serde(default)]
    pub keep_priority_on_conversion: bool,
    /// Global default-allow for cross-format conversion (layer one of the gate).
    #[serde(default)]
    pub conversion_enabled: bool,
    /// When true, candidates without a matching billing rule are skipped.
    #[serde(default)]
    pub billing_require_rule: bool,
    /// When true, missing billing dimensions fail the request instead of billing zero.
    #[serde(default)]
    pub billing_strict_mode: bool,
}
