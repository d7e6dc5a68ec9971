//! Adaptive per-key RPM learning.
//!
//! The hidden upstream limit is learned from 429 observations: a limit is
//! confirmed only after multiple consistent observations (two with upstream
//! headers, three local-only), and the resulting confidence decays over time
//! so a learned limit never ossifies. Below the enforcement threshold the key
//! runs unrestricted and upstream 429s pass through as fresh evidence.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::tuning::RpmTuning;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKind {
    Rpm,
    Concurrent,
    Unknown,
}

/// What the upstream told us alongside a 429.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitInfo {
    pub kind: RateLimitKind,
    /// Limit parsed from the upstream rate-limit header, if any.
    pub limit_value: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UtilizationSample {
    /// Unix seconds.
    pub ts: i64,
    pub util: f64,
}

/// One entry of the bounded per-key history. Observations are the learning
/// substrate; adjustments are the decisions derived from them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HistoryRecord {
    #[serde(rename = "429_observation")]
    Observation {
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
        current_rpm: Option<u32>,
        upstream_limit: Option<u32>,
    },
    #[serde(rename = "adjustment")]
    Adjustment {
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
        old_limit: u32,
        new_limit: u32,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        confidence: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        current_rpm: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        upstream_limit: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        avg_utilization: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        sample_count: Option<usize>,
    },
}

impl HistoryRecord {
    fn timestamp(&self) -> OffsetDateTime {
        match self {
            HistoryRecord::Observation { timestamp, .. }
            | HistoryRecord::Adjustment { timestamp, .. } => *timestamp,
        }
    }

    fn is_observation(&self) -> bool {
        matches!(self, HistoryRecord::Observation { .. })
    }
}

/// Mutable learning state carried on the provider key row as bounded JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveState {
    pub learned_rpm_limit: Option<u32>,
    /// RPM level at the most recent confirmed 429 (known boundary).
    pub last_rpm_peak: Option<u32>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub last_429_at: Option<OffsetDateTime>,
    pub last_429_kind: Option<RateLimitKind>,
    pub rpm_429_count: u32,
    pub concurrent_429_count: u32,
    #[serde(default)]
    pub utilization_samples: Vec<UtilizationSample>,
    #[serde(default)]
    pub adjustment_history: Vec<HistoryRecord>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub last_probe_increase_at: Option<OffsetDateTime>,
}

/// Outcome of a successful-request bookkeeping pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuccessOutcome {
    pub new_limit: Option<u32>,
    /// The sample window changed enough that it is worth persisting even
    /// without an adjustment.
    pub should_persist: bool,
}

/// Summary view for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct AdjustmentStats {
    pub adaptive_mode: bool,
    pub fixed_limit: Option<u32>,
    pub effective_limit: Option<u32>,
    pub learned_limit: Option<u32>,
    pub known_boundary: Option<u32>,
    pub rpm_429_count: u32,
    pub concurrent_429_count: u32,
    pub observation_count: usize,
    pub header_observation_count: usize,
    pub window_sample_count: usize,
    pub window_avg_utilization: Option<f64>,
    pub confidence: Option<f64>,
    pub enforcement_active: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct AdaptiveRpmManager {
    tuning: RpmTuning,
}

impl AdaptiveRpmManager {
    pub fn new(tuning: RpmTuning) -> Self {
        Self { tuning }
    }

    pub fn tuning(&self) -> &RpmTuning {
        &self.tuning
    }

    /// Record a 429 and re-evaluate the learned limit.
    ///
    /// A single 429 never sets a limit; consistency across observations does.
    /// Keys with a fixed operator limit are untouched.
    pub fn handle_429(
        &self,
        state: &mut AdaptiveState,
        fixed_rpm_limit: Option<u32>,
        info: &RateLimitInfo,
        current_rpm: Option<u32>,
        now: OffsetDateTime,
    ) -> Option<u32> {
        if let Some(fixed) = fixed_rpm_limit {
            debug!(limit = fixed, "fixed rpm limit set, skipping adaptive handling");
            return Some(fixed);
        }

        state.last_429_at = Some(now);
        state.last_429_kind = Some(info.kind);
        state.utilization_samples.clear();

        match info.kind {
            RateLimitKind::Rpm => {
                state.rpm_429_count += 1;
                self.record_observation(state, current_rpm, info.limit_value, now);

                let (evaluated, confidence) = self.evaluate_observations(state);
                let old_limit = state.learned_rpm_limit;

                if let Some(new_limit) = evaluated
                    && confidence >= self.tuning.enforcement_confidence_threshold
                {
                    self.record_adjustment(
                        state,
                        old_limit.unwrap_or(0),
                        new_limit,
                        "rpm_429",
                        Some(confidence),
                        current_rpm,
                        info.limit_value,
                        None,
                        None,
                        now,
                    );
                    state.learned_rpm_limit = Some(new_limit);
                    if let Some(upstream) = info.limit_value.filter(|v| *v > 0) {
                        state.last_rpm_peak = Some(upstream);
                    } else if let Some(rpm) = current_rpm.filter(|v| *v > 0) {
                        state.last_rpm_peak = Some(rpm);
                    }
                    warn!(
                        current_rpm,
                        upstream_limit = info.limit_value,
                        old_limit,
                        new_limit,
                        confidence,
                        "rpm limit confirmed"
                    );
                } else {
                    info!(
                        current_rpm,
                        upstream_limit = info.limit_value,
                        "429 observed, still learning"
                    );
                }
            }
            RateLimitKind::Concurrent => {
                // Concurrency pressure, not an RPM problem; leave the limit alone.
                state.concurrent_429_count += 1;
            }
            RateLimitKind::Unknown => {
                if let Some(old_limit) = state.learned_rpm_limit {
                    let reduced = ((old_limit as f64) * 0.95) as u32;
                    let new_limit = reduced.max(self.tuning.min_rpm_limit);
                    warn!(old_limit, new_limit, "unknown 429 kind, conservative reduction");
                    self.record_adjustment(
                        state,
                        old_limit,
                        new_limit,
                        "unknown_429",
                        None,
                        current_rpm,
                        None,
                        None,
                        None,
                        now,
                    );
                    state.learned_rpm_limit = Some(new_limit);
                }
            }
        }

        state.learned_rpm_limit
    }

    /// Current confidence in the learned limit, with time decay applied.
    pub fn confidence(&self, state: &AdaptiveState, now: OffsetDateTime) -> f64 {
        if state.learned_rpm_limit.is_none() {
            return 0.0;
        }
        let base = self.base_confidence(state);
        if base <= 0.0 {
            return 0.0;
        }
        let decay = match state.last_429_at {
            Some(last) => {
                let minutes = ((now - last).whole_seconds().max(0) as f64) / 60.0;
                minutes * self.tuning.confidence_decay_per_minute
            }
            // No 429 on record: nothing sustains the confidence.
            None => 1.0,
        };
        (base - decay).clamp(0.0, 1.0)
    }

    pub fn is_enforcement_active(&self, state: &AdaptiveState, now: OffsetDateTime) -> bool {
        self.confidence(state, now) >= self.tuning.enforcement_confidence_threshold
    }

    /// The RPM ceiling actually enforced locally right now.
    ///
    /// Fixed operator limits always win; learned limits count only while
    /// enforcement is active; otherwise the key is locally unlimited.
    pub fn effective_limit(
        &self,
        state: &AdaptiveState,
        fixed_rpm_limit: Option<u32>,
        now: OffsetDateTime,
    ) -> Option<u32> {
        if fixed_rpm_limit.is_some() {
            return fixed_rpm_limit;
        }
        match state.learned_rpm_limit {
            Some(limit) if self.is_enforcement_active(state, now) => Some(limit),
            _ => None,
        }
    }

    /// Successful-request bookkeeping: update the utilization window and
    /// consider an additive increase (high utilization below the known
    /// boundary, or a slow probe past it).
    pub fn handle_success(
        &self,
        state: &mut AdaptiveState,
        fixed_rpm_limit: Option<u32>,
        current_rpm: u32,
        now: OffsetDateTime,
    ) -> SuccessOutcome {
        let no_op = SuccessOutcome {
            new_limit: None,
            should_persist: false,
        };

        if fixed_rpm_limit.is_some() {
            return no_op;
        }
        let Some(current_limit) = state.learned_rpm_limit else {
            return no_op;
        };
        let confidence = self.confidence(state, now);
        if confidence < self.tuning.enforcement_confidence_threshold {
            return no_op;
        }

        let known_boundary = state.last_rpm_peak;
        let utilization = if current_limit > 0 {
            current_rpm as f64 / current_limit as f64
        } else {
            0.0
        };
        self.update_utilization_window(state, now.unix_timestamp(), utilization);

        let increase_reason = self.check_increase_conditions(state, now, known_boundary);

        if let Some(reason) = increase_reason
            && current_limit < self.tuning.max_rpm_limit
        {
            let is_probe = reason == "probe_increase";
            let new_limit = self.increase_limit(current_limit, known_boundary, is_probe);
            if new_limit <= current_limit {
                return no_op;
            }

            let samples = &state.utilization_samples;
            let avg_util = if samples.is_empty() {
                0.0
            } else {
                samples.iter().map(|s| s.util).sum::<f64>() / samples.len() as f64
            };
            info!(
                reason,
                sample_count = samples.len(),
                avg_util,
                known_boundary,
                old_limit = current_limit,
                new_limit,
                "rpm limit increased"
            );
            let sample_count = samples.len();
            self.record_adjustment(
                state,
                current_limit,
                new_limit,
                reason,
                Some(confidence),
                Some(current_rpm),
                None,
                Some(avg_util),
                Some(sample_count),
                now,
            );
            state.learned_rpm_limit = Some(new_limit);
            if is_probe {
                state.last_probe_increase_at = Some(now);
            }
            // Start a fresh window under the new limit.
            state.utilization_samples.clear();

            return SuccessOutcome {
                new_limit: Some(new_limit),
                should_persist: true,
            };
        }

        // Persist the window opportunistically so restarts keep recent samples.
        SuccessOutcome {
            new_limit: None,
            should_persist: !state.utilization_samples.is_empty()
                && state.utilization_samples.len() % 5 == 0,
        }
    }

    /// Operator reset: forget everything learned.
    pub fn reset_learning(&self, state: &mut AdaptiveState) {
        *state = AdaptiveState::default();
    }

    pub fn adjustment_stats(
        &self,
        state: &AdaptiveState,
        fixed_rpm_limit: Option<u32>,
        now: OffsetDateTime,
    ) -> AdjustmentStats {
        let adaptive_mode = fixed_rpm_limit.is_none();
        let observations: Vec<&HistoryRecord> = state
            .adjustment_history
            .iter()
            .filter(|r| r.is_observation())
            .collect();
        let header_observations = observations
            .iter()
            .filter(|r| {
                matches!(
                    r,
                    HistoryRecord::Observation {
                        upstream_limit: Some(v),
                        ..
                    } if *v > 0
                )
            })
            .count();
        let samples = &state.utilization_samples;
        let window_avg_utilization = if samples.is_empty() {
            None
        } else {
            Some(samples.iter().map(|s| s.util).sum::<f64>() / samples.len() as f64)
        };
        let confidence = adaptive_mode.then(|| self.confidence(state, now));

        AdjustmentStats {
            adaptive_mode,
            fixed_limit: fixed_rpm_limit,
            effective_limit: self.effective_limit(state, fixed_rpm_limit, now),
            learned_limit: state.learned_rpm_limit,
            known_boundary: state.last_rpm_peak,
            rpm_429_count: state.rpm_429_count,
            concurrent_429_count: state.concurrent_429_count,
            observation_count: observations.len(),
            header_observation_count: header_observations,
            window_sample_count: samples.len(),
            window_avg_utilization,
            confidence,
            enforcement_active: confidence
                .map(|c| c >= self.tuning.enforcement_confidence_threshold),
        }
    }

    fn record_observation(
        &self,
        state: &mut AdaptiveState,
        current_rpm: Option<u32>,
        upstream_limit: Option<u32>,
        now: OffsetDateTime,
    ) {
        state.adjustment_history.push(HistoryRecord::Observation {
            timestamp: now,
            current_rpm,
            upstream_limit,
        });
        self.trim_history(state);
    }

    /// Evaluate observation consistency. Header-bearing observations are
    /// preferred evidence over local RPM counts.
    fn evaluate_observations(&self, state: &AdaptiveState) -> (Option<u32>, f64) {
        let observations: Vec<&HistoryRecord> = state
            .adjustment_history
            .iter()
            .filter(|r| r.is_observation())
            .collect();
        if observations.is_empty() {
            return (None, 0.0);
        }

        let header_values: Vec<u32> = observations
            .iter()
            .filter_map(|r| match r {
                HistoryRecord::Observation {
                    upstream_limit: Some(v),
                    ..
                } if *v > 0 => Some(*v),
                _ => None,
            })
            .collect();
        if header_values.len() >= self.tuning.min_header_confirmations {
            let last_n =
                &header_values[header_values.len() - self.tuning.min_header_confirmations..];
            if self.check_consistency(last_n) {
                let limit = (median(last_n) * self.tuning.header_limit_safety_margin) as u32;
                return (Some(self.clamp_limit(limit)), 0.8);
            }
        }

        let local_values: Vec<u32> = observations
            .iter()
            .filter_map(|r| match r {
                HistoryRecord::Observation {
                    current_rpm: Some(v),
                    ..
                } if *v > 0 => Some(*v),
                _ => None,
            })
            .collect();
        if local_values.len() >= self.tuning.min_consistent_observations {
            let last_n =
                &local_values[local_values.len() - self.tuning.min_consistent_observations..];
            if self.check_consistency(last_n) {
                let limit = (median(last_n) * self.tuning.observation_limit_safety_margin) as u32;
                return (Some(self.clamp_limit(limit)), 0.6);
            }
        }

        (None, 0.0)
    }

    fn clamp_limit(&self, limit: u32) -> u32 {
        limit
            .max(self.tuning.min_rpm_limit)
            .min(self.tuning.max_rpm_limit)
    }

    fn check_consistency(&self, values: &[u32]) -> bool {
        if values.is_empty() {
            return false;
        }
        let med = median(values);
        if med <= 0.0 {
            return false;
        }
        values
            .iter()
            .all(|v| ((*v as f64) - med).abs() / med <= self.tuning.observation_consistency_threshold)
    }

    /// Base confidence from the most recent adjustment that recorded one;
    /// re-evaluated from observations for histories predating confidence
    /// tracking, with a low floor when only a learned limit survives.
    fn base_confidence(&self, state: &AdaptiveState) -> f64 {
        for record in state.adjustment_history.iter().rev() {
            if let HistoryRecord::Adjustment {
                confidence: Some(confidence),
                ..
            } = record
            {
                return *confidence;
            }
        }

        let (_, confidence) = self.evaluate_observations(state);
        if confidence > 0.0 {
            return confidence;
        }

        if state.learned_rpm_limit.is_some() {
            return 0.3;
        }

        0.0
    }

    fn update_utilization_window(&self, state: &mut AdaptiveState, now_ts: i64, utilization: f64) {
        state.utilization_samples.push(UtilizationSample {
            ts: now_ts,
            util: utilization,
        });
        let cutoff = now_ts - self.tuning.utilization_window_seconds;
        state.utilization_samples.retain(|s| s.ts > cutoff);
        let excess = state
            .utilization_samples
            .len()
            .saturating_sub(self.tuning.utilization_window_size);
        if excess > 0 {
            state.utilization_samples.drain(..excess);
        }
    }

    fn check_increase_conditions(
        &self,
        state: &AdaptiveState,
        now: OffsetDateTime,
        known_boundary: Option<u32>,
    ) -> Option<&'static str> {
        if self.in_cooldown(state, now) {
            return None;
        }

        let current_limit = state.learned_rpm_limit.unwrap_or(self.tuning.min_rpm_limit);
        let samples = &state.utilization_samples;

        if samples.len() >= self.tuning.min_samples_for_decision {
            let high = samples
                .iter()
                .filter(|s| s.util >= self.tuning.utilization_threshold)
                .count();
            let ratio = high as f64 / samples.len() as f64;
            if ratio >= self.tuning.high_utilization_ratio {
                match known_boundary {
                    Some(boundary) if current_limit >= boundary => {}
                    _ => return Some("high_utilization"),
                }
            }
        }

        if self.should_probe_increase(state, now) {
            return Some("probe_increase");
        }

        None
    }

    fn should_probe_increase(&self, state: &AdaptiveState, now: OffsetDateTime) -> bool {
        let interval_secs = self.tuning.probe_increase_interval_minutes * 60;

        if let Some(last_429) = state.last_429_at
            && (now - last_429).whole_seconds() < interval_secs
        {
            return false;
        }
        if let Some(last_probe) = state.last_probe_increase_at
            && (now - last_probe).whole_seconds() < interval_secs
        {
            return false;
        }

        let samples = &state.utilization_samples;
        if samples.len() < self.tuning.probe_increase_min_requests {
            return false;
        }
        let avg = samples.iter().map(|s| s.util).sum::<f64>() / samples.len() as f64;
        avg >= 0.3
    }

    fn in_cooldown(&self, state: &AdaptiveState, now: OffsetDateTime) -> bool {
        match state.last_429_at {
            Some(last) => {
                (now - last).whole_seconds() < self.tuning.cooldown_after_429_minutes * 60
            }
            None => false,
        }
    }

    fn increase_limit(
        &self,
        current_limit: u32,
        known_boundary: Option<u32>,
        is_probe: bool,
    ) -> u32 {
        let mut new_limit = if is_probe {
            // A probe crosses the remembered boundary one step at a time.
            current_limit + 1
        } else {
            let stepped = current_limit + self.tuning.increase_step;
            match known_boundary {
                Some(boundary) => stepped.min(boundary),
                None => stepped,
            }
        };
        new_limit = new_limit.min(self.tuning.max_rpm_limit);
        if new_limit <= current_limit {
            current_limit
        } else {
            new_limit
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_adjustment(
        &self,
        state: &mut AdaptiveState,
        old_limit: u32,
        new_limit: u32,
        reason: &str,
        confidence: Option<f64>,
        current_rpm: Option<u32>,
        upstream_limit: Option<u32>,
        avg_utilization: Option<f64>,
        sample_count: Option<usize>,
        now: OffsetDateTime,
    ) {
        state.adjustment_history.push(HistoryRecord::Adjustment {
            timestamp: now,
            old_limit,
            new_limit,
            reason: reason.to_string(),
            confidence,
            current_rpm,
            upstream_limit,
            avg_utilization,
            sample_count,
        });
        self.trim_history(state);
    }

    /// Bound the history, shedding oldest adjustments before any observation.
    fn trim_history(&self, state: &mut AdaptiveState) {
        let cap = self.tuning.max_history_records;
        if state.adjustment_history.len() <= cap {
            return;
        }

        let mut observations: Vec<HistoryRecord> = Vec::new();
        let mut adjustments: Vec<HistoryRecord> = Vec::new();
        for record in state.adjustment_history.drain(..) {
            if record.is_observation() {
                observations.push(record);
            } else {
                adjustments.push(record);
            }
        }
        observations.sort_by_key(HistoryRecord::timestamp);
        adjustments.sort_by_key(HistoryRecord::timestamp);

        let mut overflow = observations.len() + adjustments.len() - cap;
        let trim_adjustments = overflow.min(adjustments.len());
        adjustments.drain(..trim_adjustments);
        overflow -= trim_adjustments;
        if overflow > 0 {
            observations.drain(..overflow);
        }

        let mut merged = observations;
        merged.extend(adjustments);
        merged.sort_by_key(HistoryRecord::timestamp);
        state.adjustment_history = merged;
    }
}

fn median(values: &[u32]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<u32> = values.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] as f64 + sorted[mid] as f64) / 2.0
    } else {
        sorted[mid] as f64
    }
}
