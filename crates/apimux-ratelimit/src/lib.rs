//! Adaptive rate limiting for upstream keys: 429-driven limit learning with
//! confidence decay, cached-caller budget reservation, and the shared RPM
//! counter.

pub mod adaptive;
pub mod counter;
pub mod detector;
pub mod reservation;
pub mod tuning;

pub use adaptive::{
    AdaptiveRpmManager, AdaptiveState, AdjustmentStats, HistoryRecord, RateLimitInfo,
    RateLimitKind, SuccessOutcome, UtilizationSample,
};
pub use counter::RpmCounter;
pub use detector::detect_rate_limit;
pub use reservation::{
    ReservationManager, ReservationPhase, ReservationResult, ReservationTuning, available_for_new,
};
pub use tuning::RpmTuning;
