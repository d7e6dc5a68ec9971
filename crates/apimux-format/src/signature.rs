use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// API families with first-class support. Signatures are an open set; these
/// are the families whose data-format identity is known to the registry.
pub const KNOWN_FAMILIES: [&str; 4] = ["claude", "openai", "gemini", "antigravity"];

/// Endpoint kinds seen in practice. Open set as well.
pub const KNOWN_KINDS: [&str; 4] = ["chat", "cli", "video", "image"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("invalid endpoint signature '{0}': expected 'family:kind'")]
    Invalid(String),
}

/// Canonical endpoint signature: lowercase `family:kind`, both halves non-empty.
///
/// The signature identifies a wire protocol variant (`claude:chat`,
/// `openai:cli`, `gemini:video`). Two signatures with the same data-format id
/// can be served by passthrough; different ids require a converter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointSignature {
    family: String,
    kind: String,
}

impl EndpointSignature {
    pub fn new(family: &str, kind: &str) -> Result<Self, SignatureError> {
        let family = family.trim().to_ascii_lowercase();
        let kind = kind.trim().to_ascii_lowercase();
        if family.is_empty()
            || kind.is_empty()
            || !family.chars().all(|c| c.is_ascii_lowercase())
            || !kind.chars().all(|c| c.is_ascii_lowercase())
        {
            return Err(SignatureError::Invalid(format!("{family}:{kind}")));
        }
        Ok(Self { family, kind })
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The wire data format this signature carries.
    ///
    /// A property of the family: `claude:chat` and `claude:cli` differ only in
    /// auth and envelope, not payload shape. Antigravity endpoints speak the
    /// Gemini payload format behind their own auth plumbing. Unknown families
    /// are their own data format.
    pub fn data_format_id(&self) -> &str {
        match self.family.as_str() {
            "antigravity" => "gemini",
            other => other,
        }
    }

    /// True iff `client` can be served by `endpoint` without any data
    /// conversion (headers/auth may still differ).
    pub fn can_passthrough(client: &EndpointSignature, endpoint: &EndpointSignature) -> bool {
        client.data_format_id() == endpoint.data_format_id()
    }
}

impl fmt::Display for EndpointSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.family, self.kind)
    }
}

impl FromStr for EndpointSignature {
    type Err = SignatureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let Some((family, kind)) = value.split_once(':') else {
            return Err(SignatureError::Invalid(value.to_string()));
        };
        Self::new(family, kind)
    }
}

impl Serialize for EndpointSignature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EndpointSignature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Parse an externally supplied signature, falling back to `default` when it
/// does not normalize. Input boundaries that must not silently default should
/// call `parse` directly instead.
pub fn normalize_or_default(value: &str, default: &EndpointSignature) -> EndpointSignature {
    value.parse().unwrap_or_else(|_| default.clone())
}
