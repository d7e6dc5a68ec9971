//! RPM admission: the pre-selection check and the atomic guard.
//!
//! Slots count acquisitions over the trailing minute bucket and are never
//! released early; the window expiring is the release.

use time::OffsetDateTime;
use tracing::debug;

use apimux_cache::CacheError;
use apimux_ratelimit::{
    AdaptiveRpmManager, AdaptiveState, ReservationManager, ReservationPhase, RpmCounter,
    available_for_new,
};

#[derive(Debug, Clone, Copy)]
pub struct ConcurrencySnapshot {
    pub key_current: u32,
    /// The ceiling that applied to this caller class (None when unenforced).
    pub key_limit: Option<u32>,
    pub is_cached_user: bool,
    pub reservation_ratio: f64,
    pub reservation_phase: ReservationPhase,
    pub confidence: f64,
    pub load_factor: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConcurrencyError {
    #[error("rpm limit reached for key {key_id} ({current}/{limit})")]
    LimitReached {
        key_id: i64,
        current: u32,
        limit: u32,
    },
    #[error(transparent)]
    Cache(#[from] CacheError),
}

pub struct ConcurrencyChecker {
    counter: RpmCounter,
    adaptive: AdaptiveRpmManager,
    reservation: ReservationManager,
}

impl ConcurrencyChecker {
    pub fn new(
        counter: RpmCounter,
        adaptive: AdaptiveRpmManager,
        reservation: ReservationManager,
    ) -> Self {
        Self {
            counter,
            adaptive,
            reservation,
        }
    }

    pub fn adaptive(&self) -> &AdaptiveRpmManager {
        &self.adaptive
    }

    pub fn counter(&self) -> &RpmCounter {
        &self.counter
    }

    fn snapshot_parts(
        &self,
        adaptive_state: &AdaptiveState,
        fixed_limit: Option<u32>,
        current: u32,
        now: OffsetDateTime,
    ) -> (Option<u32>, f64, apimux_ratelimit::ReservationResult) {
        let effective = self.adaptive.effective_limit(adaptive_state, fixed_limit, now);
        let confidence = self.adaptive.confidence(adaptive_state, now);
        let enforcement = self.adaptive.is_enforcement_active(adaptive_state, now)
            || fixed_limit.is_some();
        let reservation =
            self.reservation
                .calculate(confidence, enforcement, current, effective);
        (effective, confidence, reservation)
    }

    /// Read-only admission check used during candidate selection.
    ///
    /// Cached callers may use the whole budget; new callers only the
    /// non-reserved tranche (never less than one slot). Without an effective
    /// limit everything is admitted.
    pub async fn check_available(
        &self,
        key_id: i64,
        fixed_limit: Option<u32>,
        adaptive_state: &AdaptiveState,
        is_cached_user: bool,
        now: OffsetDateTime,
    ) -> Result<(bool, ConcurrencySnapshot), ConcurrencyError> {
        let current = self.counter.count(key_id, now).await?;
        let (effective, confidence, reservation) =
            self.snapshot_parts(adaptive_state, fixed_limit, current, now);

        let (ok, caller_limit) = match effective {
            None => (true, None),
            Some(limit) if is_cached_user => (current < limit, Some(limit)),
            Some(limit) => {
                let tranche = available_for_new(limit, reservation.ratio);
                if current >= tranche {
                    debug!(
                        key_id,
                        current,
                        tranche,
                        limit,
                        ratio = reservation.ratio,
                        "new-caller tranche exhausted"
                    );
                }
                (current < tranche, Some(tranche))
            }
        };

        Ok((
            ok,
            ConcurrencySnapshot {
                key_current: current,
                key_limit: caller_limit,
                is_cached_user,
                reservation_ratio: reservation.ratio,
                reservation_phase: reservation.phase,
                confidence,
                load_factor: reservation.load_factor,
            },
        ))
    }

    /// Atomically claim an RPM slot for one attempt.
    ///
    /// The slot is not released on completion; it expires with the minute
    /// bucket, which is what makes the counter an RPM counter rather than a
    /// concurrency semaphore.
    pub async fn acquire_slot(
        &self,
        key_id: i64,
        fixed_limit: Option<u32>,
        adaptive_state: &AdaptiveState,
        is_cached_user: bool,
        now: OffsetDateTime,
    ) -> Result<ConcurrencySnapshot, ConcurrencyError> {
        let current = self.counter.count(key_id, now).await?;
        let (effective, confidence, reservation) =
            self.snapshot_parts(adaptive_state, fixed_limit, current, now);

        let caller_limit = effective.map(|limit| {
            if is_cached_user {
                limit
            } else {
                available_for_new(limit, reservation.ratio)
            }
        });

        let acquired = self.counter.acquire(key_id, caller_limit, now).await?;
        if !acquired {
            return Err(ConcurrencyError::LimitReached {
                key_id,
                current,
                limit: caller_limit.unwrap_or(0),
            });
        }

        Ok(ConcurrencySnapshot {
            key_current: current + 1,
            key_limit: caller_limit,
            is_cached_user,
            reservation_ratio: reservation.ratio,
            reservation_phase: reservation.phase,
            confidence,
            load_factor: reservation.load_factor,
        })
    }
}
