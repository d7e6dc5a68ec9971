pub mod api_keys;
pub mod global_config;
pub mod global_models;
pub mod models;
pub mod provider_api_keys;
pub mod provider_endpoints;
pub mod providers;
pub mod request_candidates;
pub mod users;

pub use api_keys::Entity as ApiKeys;
pub use global_config::Entity as GlobalConfig;
pub use global_models::Entity as GlobalModels;
pub use models::Entity as Models;
pub use provider_api_keys::Entity as ProviderApiKeys;
pub use provider_endpoints::Entity as ProviderEndpoints;
pub use providers::Entity as Providers;
pub use request_candidates::Entity as RequestCandidates;
pub use users::Entity as Users;
