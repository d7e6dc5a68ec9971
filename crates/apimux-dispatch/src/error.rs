use apimux_provider::AuthType;
use apimux_scheduling::ProviderCandidate;

/// Per-candidate audit line attached to terminal dispatch errors.
#[derive(Debug, Clone)]
pub struct CandidateAttempt {
    pub index: usize,
    pub provider_id: i64,
    pub provider_name: String,
    pub endpoint_id: i64,
    pub key_id: i64,
    pub key_name: Option<String>,
    pub auth_type: AuthType,
    pub is_cached: bool,
    pub skipped: bool,
    pub skip_reason: Option<String>,
    pub status_code: Option<u16>,
    pub error_type: Option<&'static str>,
    pub error_message: Option<String>,
}

impl CandidateAttempt {
    pub fn from_candidate(index: usize, candidate: &ProviderCandidate) -> Self {
        Self {
            index,
            provider_id: candidate.provider.id,
            provider_name: candidate.provider.name.clone(),
            endpoint_id: candidate.endpoint.id,
            key_id: candidate.key.id,
            key_name: candidate.key.name.clone(),
            auth_type: candidate.key.auth_type,
            is_cached: candidate.is_cached,
            skipped: false,
            skip_reason: None,
            status_code: None,
            error_type: None,
            error_message: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("caller request is invalid: {0}")]
    InvalidRequest(String),
    #[error("no eligible candidates")]
    NoEligibleCandidates { audit: Vec<CandidateAttempt> },
    #[error("all candidates failed: {reason}")]
    AllCandidatesFailed {
        reason: &'static str,
        audit: Vec<CandidateAttempt>,
        last_status: Option<u16>,
    },
    /// Upstream 4xx judged to be the caller's fault; never failed over.
    #[error("upstream rejected the request (http {status})")]
    UpstreamClientRequest {
        status: u16,
        message: String,
        audit: Vec<CandidateAttempt>,
    },
    #[error(transparent)]
    Cache(#[from] apimux_cache::CacheError),
    #[error(transparent)]
    Storage(#[from] apimux_storage::StorageError),
}
