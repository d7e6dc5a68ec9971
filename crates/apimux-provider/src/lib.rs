//! Provider adapter contract for apimux.
//!
//! This crate intentionally does **not** depend on any concrete HTTP client.
//! Adapters construct wire requests and URLs; the executor layer performs IO.

pub mod adapter;
pub mod errors;
pub mod registry;
pub mod types;

pub use adapter::{
    AuthConfig, BehaviorFlags, EndpointTarget, KeyMaterial, ModelInfo, ProviderAdapter,
    WireRequest,
};
pub use errors::{ProviderError, ProviderResult};
pub use registry::AdapterRegistry;
pub use types::{
    AuthType, OAUTH_ACCOUNT_BLOCK_PREFIX, ProviderType, is_oauth_account_blocked,
};
