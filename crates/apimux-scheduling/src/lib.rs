//! Candidate scheduling for the dispatch core: restriction merging,
//! availability, candidate building and ordering, cache affinity, and RPM
//! admission.

pub mod affinity;
pub mod availability;
pub mod candidate;
pub mod concurrency;
pub mod health;
pub mod restrictions;
pub mod sorter;

pub use affinity::{CacheAffinity, CacheAffinityManager};
pub use availability::{AvailabilityQuery, AvailabilityRow};
pub use candidate::{CandidateBuilder, ProviderCandidate};
pub use concurrency::{ConcurrencyChecker, ConcurrencyError, ConcurrencySnapshot};
pub use health::{HealthMonitor, KeyHealth};
pub use restrictions::{AccessRestrictions, AllowedModels, merge_allowed_models};
pub use sorter::{CandidateSorter, affinity_hash};
