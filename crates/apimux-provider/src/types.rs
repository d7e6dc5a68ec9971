use serde::{Deserialize, Serialize};

/// Upstream provider families with dedicated adapter plumbing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    #[default]
    Custom,
    ClaudeCode,
    Codex,
    GeminiCli,
    Antigravity,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    #[default]
    ApiKey,
    Oauth,
}

impl ProviderType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderType::Custom => "custom",
            ProviderType::ClaudeCode => "claude_code",
            ProviderType::Codex => "codex",
            ProviderType::GeminiCli => "gemini_cli",
            ProviderType::Antigravity => "antigravity",
        }
    }
}

impl AuthType {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthType::ApiKey => "api_key",
            AuthType::Oauth => "oauth",
        }
    }
}

/// Sentinel prefix on `oauth_invalid_reason` marking failures that require
/// end-user action (re-consent, plan change). Other reasons are transient and
/// the key stays schedulable.
pub const OAUTH_ACCOUNT_BLOCK_PREFIX: &str = "[ACCOUNT_BLOCK] ";

pub fn is_oauth_account_blocked(invalid_reason: Option<&str>) -> bool {
    invalid_reason.is_some_and(|reason| reason.starts_with(OAUTH_ACCOUNT_BLOCK_PREFIX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_block_sentinel_is_prefix_only() {
        assert!(is_oauth_account_blocked(Some(
            "[ACCOUNT_BLOCK] subscription expired"
        )));
        assert!(!is_oauth_account_blocked(Some("token refresh failed")));
        assert!(!is_oauth_account_blocked(Some(
            "transient [ACCOUNT_BLOCK] mention"
        )));
        assert!(!is_oauth_account_blocked(None));
    }

    #[test]
    fn provider_type_serde_names() {
        let json = serde_json::to_string(&ProviderType::ClaudeCode).unwrap();
        assert_eq!(json, "\"claude_code\"");
        let back: ProviderType = serde_json::from_str("\"gemini_cli\"").unwrap();
        assert_eq!(back, ProviderType::GeminiCli);
    }
}
