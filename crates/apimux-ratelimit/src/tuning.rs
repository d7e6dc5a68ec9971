/// Tuning knobs for adaptive RPM learning.
///
/// Defaults follow the operational values the learning algorithm was
/// calibrated with; operators rarely need to touch anything beyond the
/// min/max clamp.
#[derive(Debug, Clone)]
pub struct RpmTuning {
    pub min_rpm_limit: u32,
    pub max_rpm_limit: u32,
    /// High-utilization additive increase step.
    pub increase_step: u32,
    pub utilization_window_size: usize,
    pub utilization_window_seconds: i64,
    pub utilization_threshold: f64,
    pub high_utilization_ratio: f64,
    pub min_samples_for_decision: usize,
    pub probe_increase_interval_minutes: i64,
    pub probe_increase_min_requests: usize,
    pub cooldown_after_429_minutes: i64,
    pub min_consistent_observations: usize,
    pub min_header_confirmations: usize,
    pub observation_consistency_threshold: f64,
    pub header_limit_safety_margin: f64,
    pub observation_limit_safety_margin: f64,
    pub enforcement_confidence_threshold: f64,
    pub confidence_decay_per_minute: f64,
    pub max_history_records: usize,
}

impl Default for RpmTuning {
    fn default() -> Self {
        Self {
            min_rpm_limit: 1,
            max_rpm_limit: 1000,
            increase_step: 5,
            utilization_window_size: 15,
            utilization_window_seconds: 300,
            utilization_threshold: 0.7,
            high_utilization_ratio: 0.6,
            min_samples_for_decision: 5,
            probe_increase_interval_minutes: 30,
            probe_increase_min_requests: 5,
            cooldown_after_429_minutes: 5,
            min_consistent_observations: 3,
            min_header_confirmations: 2,
            observation_consistency_threshold: 0.2,
            header_limit_safety_margin: 0.95,
            observation_limit_safety_margin: 0.85,
            enforcement_confidence_threshold: 0.5,
            confidence_decay_per_minute: 0.01,
            max_history_records: 20,
        }
    }
}
