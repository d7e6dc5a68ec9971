pub mod entities;
pub mod seaorm;
pub mod snapshot;
pub mod storage;

pub use seaorm::SeaOrmStorage;
pub use snapshot::{
    ApiKeyRow, EndpointRow, GlobalConfigRow, GlobalModelRow, KeyRow, ModelRow, ProviderRow,
    StorageSnapshot, UserRow,
};
pub use storage::{
    NewRequestCandidate, RequestCandidatePatch, Storage, StorageError, StorageResult,
};
