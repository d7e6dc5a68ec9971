//! Dispatch core: error classification, failover execution, per-attempt
//! guarding, audit records, and the composition services.

pub mod attempt;
pub mod classify;
pub mod error;
pub mod executor;
pub mod failover;
pub mod keystate;
pub mod recorder;
pub mod sanitize;
pub mod service;

pub use attempt::{
    AttemptFailure, AttemptFunc, AttemptFuture, AttemptResult, AttemptSlot, DispatchStream,
};
pub use classify::{ErrorAction, ErrorClassifier};
pub use error::{CandidateAttempt, DispatchError};
pub use executor::{ExecutionContext, RequestExecutor};
pub use failover::{
    AttemptResponse, BillingGate, FailoverEngine, FailoverOutcome, FailoverParams, RetryMode,
    RetryPolicy, SkipPolicy, TaskIdExtractor,
};
pub use keystate::{AdaptiveService, KeyStateStore};
pub use recorder::{CallerIds, CandidateRecorder, RecordStatus};
pub use service::{
    CandidateService, DispatchOutcome, DispatchRequest, ResolveRequest, ResolvedCandidates,
    RuntimeState, TaskService,
};
