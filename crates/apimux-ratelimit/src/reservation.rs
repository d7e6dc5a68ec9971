//! Dynamic reservation of RPM budget for sticky (cached) callers.
//!
//! Without confidence in the learned limit there is nothing worth reserving:
//! pinning cached callers onto a key that is still learning would let them
//! push it straight into 429 storms. With confidence, the reserved share
//! grows with load so a sticky caller is not starved by fresh arrivals.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationPhase {
    /// No enforceable limit yet; nothing is reserved.
    Learning,
    Active,
    /// Load is high enough that the reserved share is at its ceiling.
    Saturating,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReservationResult {
    /// Fraction of the effective limit reserved for cached callers, `[0, R_MAX]`.
    pub ratio: f64,
    pub phase: ReservationPhase,
    pub confidence: f64,
    pub load_factor: f64,
}

#[derive(Debug, Clone)]
pub struct ReservationTuning {
    /// Ceiling on the reserved fraction.
    pub max_ratio: f64,
    /// Load below the knee reserves nothing.
    pub load_knee: f64,
    /// Load at which the phase reports saturating.
    pub saturation_load: f64,
}

impl Default for ReservationTuning {
    fn default() -> Self {
        Self {
            max_ratio: 0.5,
            load_knee: 0.3,
            saturation_load: 0.8,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReservationManager {
    tuning: ReservationTuning,
}

impl ReservationManager {
    pub fn new(tuning: ReservationTuning) -> Self {
        Self { tuning }
    }

    /// Compute the reserved fraction right now.
    ///
    /// Monotone non-decreasing in load, zero without enforcement confidence,
    /// and capped so the non-reserved tranche keeps at least one slot.
    pub fn calculate(
        &self,
        confidence: f64,
        enforcement_active: bool,
        current_usage: u32,
        effective_limit: Option<u32>,
    ) -> ReservationResult {
        let Some(limit) = effective_limit.filter(|l| *l > 0) else {
            return ReservationResult {
                ratio: 0.0,
                phase: ReservationPhase::Learning,
                confidence,
                load_factor: 0.0,
            };
        };

        let load_factor = (current_usage as f64 / limit as f64).clamp(0.0, 1.0);

        if !enforcement_active {
            return ReservationResult {
                ratio: 0.0,
                phase: ReservationPhase::Learning,
                confidence,
                load_factor,
            };
        }

        let knee = self.tuning.load_knee;
        let ramp = ((load_factor - knee) / (1.0 - knee)).clamp(0.0, 1.0);
        let mut ratio = self.tuning.max_ratio * ramp * confidence.clamp(0.0, 1.0);

        // Keep the new-caller tranche non-empty: floor(limit * (1 - ratio)) >= 1.
        let ratio_cap = 1.0 - 1.0 / limit as f64;
        ratio = ratio.min(ratio_cap).max(0.0);

        let phase = if load_factor >= self.tuning.saturation_load {
            ReservationPhase::Saturating
        } else {
            ReservationPhase::Active
        };

        ReservationResult {
            ratio,
            phase,
            confidence,
            load_factor,
        }
    }
}

/// Slots available to non-cached callers under a reservation, never below one.
pub fn available_for_new(effective_limit: u32, reservation_ratio: f64) -> u32 {
    (((effective_limit as f64) * (1.0 - reservation_ratio)).floor() as u32).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_limit_or_no_confidence_reserves_nothing() {
        let manager = ReservationManager::default();
        let r = manager.calculate(0.0, false, 10, None);
        assert_eq!(r.ratio, 0.0);
        assert_eq!(r.phase, ReservationPhase::Learning);

        let r = manager.calculate(0.2, false, 10, Some(20));
        assert_eq!(r.ratio, 0.0);
        assert_eq!(r.phase, ReservationPhase::Learning);
    }

    #[test]
    fn ratio_is_monotone_in_load() {
        let manager = ReservationManager::default();
        let mut last = -1.0;
        for usage in [0u32, 5, 10, 15, 20, 25, 30] {
            let r = manager.calculate(0.8, true, usage, Some(30));
            assert!(r.ratio >= last, "ratio decreased at usage={usage}");
            last = r.ratio;
        }
    }

    #[test]
    fn new_caller_tranche_keeps_a_slot() {
        let manager = ReservationManager::default();
        for limit in 1u32..=40 {
            let r = manager.calculate(1.0, true, limit, Some(limit));
            assert!(available_for_new(limit, r.ratio) >= 1, "limit={limit}");
            assert!(((limit as f64) * (1.0 - r.ratio)).floor() >= 1.0 || limit == 1);
        }
    }

    #[test]
    fn saturating_phase_at_high_load() {
        let manager = ReservationManager::default();
        let r = manager.calculate(0.8, true, 28, Some(30));
        assert_eq!(r.phase, ReservationPhase::Saturating);
        let r = manager.calculate(0.8, true, 10, Some(30));
        assert_eq!(r.phase, ReservationPhase::Active);
    }
}
