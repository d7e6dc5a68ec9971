//! Candidate ordering: priority mode, conversion demotion, cache-affinity
//! promotion, and per-tier tie-breaking.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use apimux_common::{DispatchSettings, PriorityMode, SchedulingMode};
use apimux_format::EndpointSignature;

use crate::affinity::CacheAffinity;
use crate::candidate::ProviderCandidate;

/// First 16 hex chars of SHA-256 over `affinity_key:key_id`: deterministic
/// per-caller spread that stays sticky for the caller.
pub fn affinity_hash(affinity_key: &str, key_id: i64) -> String {
    let digest = Sha256::digest(format!("{affinity_key}:{key_id}").as_bytes());
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

pub struct CandidateSorter<'a> {
    settings: &'a DispatchSettings,
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum TieBreak {
    Index(usize),
    Hash(String),
    Rand(u64),
}

impl<'a> CandidateSorter<'a> {
    pub fn new(settings: &'a DispatchSettings) -> Self {
        Self { settings }
    }

    /// Conversion-demotion group: demoted candidates sort strictly after the
    /// exact-format group unless the provider (or the global flag) keeps
    /// priority on conversion.
    fn group(&self, candidate: &ProviderCandidate) -> u8 {
        if self.settings.keep_priority_on_conversion {
            return 0;
        }
        if candidate.needs_conversion && !candidate.provider.keep_priority_on_conversion {
            1
        } else {
            0
        }
    }

    /// Ascending sort key. Provider priorities are weights (higher wins);
    /// per-format global priorities are ranks (lower wins).
    fn priority(&self, candidate: &ProviderCandidate, client_format: &EndpointSignature) -> (i64, i64) {
        match self.settings.priority_mode {
            PriorityMode::Provider => (
                -(candidate.provider.provider_priority as i64),
                -(candidate.key.internal_priority as i64),
            ),
            PriorityMode::GlobalKey => {
                let global = candidate
                    .key
                    .global_priority_by_format
                    .as_ref()
                    .and_then(|map| map.get(client_format.to_string()))
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                (global, -(candidate.key.internal_priority as i64))
            }
        }
    }

    /// Sort candidates and apply affinity promotion.
    ///
    /// `load_balance_seed` keeps the sorter deterministic: the caller draws
    /// one random seed per request.
    pub fn sort(
        &self,
        candidates: Vec<ProviderCandidate>,
        affinity: Option<&CacheAffinity>,
        affinity_key: &str,
        client_format: &EndpointSignature,
        load_balance_seed: u64,
    ) -> Vec<ProviderCandidate> {
        let mut rng = StdRng::seed_from_u64(load_balance_seed);

        let mut keyed: Vec<(u8, i64, i64, TieBreak, ProviderCandidate)> = candidates
            .into_iter()
            .enumerate()
            .map(|(index, candidate)| {
                let group = self.group(&candidate);
                let (primary, secondary) = self.priority(&candidate, client_format);
                let tie = match self.settings.scheduling_mode {
                    SchedulingMode::FixedOrder => TieBreak::Index(index),
                    SchedulingMode::CacheAffinity => {
                        TieBreak::Hash(affinity_hash(affinity_key, candidate.key.id))
                    }
                    SchedulingMode::LoadBalance => TieBreak::Rand(rng.random()),
                };
                (group, primary, secondary, tie, candidate)
            })
            .collect();

        keyed.sort_by(|a, b| (&a.0, &a.1, &a.2, &a.3).cmp(&(&b.0, &b.1, &b.2, &b.3)));
        let mut sorted: Vec<ProviderCandidate> =
            keyed.into_iter().map(|(_, _, _, _, c)| c).collect();

        // Affinity promotion only applies in cache-affinity scheduling; the
        // other modes deliberately ignore stickiness.
        if self.settings.scheduling_mode == SchedulingMode::CacheAffinity
            && let Some(affinity) = affinity
        {
            self.promote_affinity(&mut sorted, affinity);
        }

        sorted
    }

    fn promote_affinity(&self, sorted: &mut Vec<ProviderCandidate>, affinity: &CacheAffinity) {
        let target = (affinity.provider_id, affinity.endpoint_id, affinity.key_id);
        let Some(position) = sorted.iter().position(|c| c.target() == target) else {
            // The sticky target is no longer in the candidate set; never
            // synthesize a candidate from the affinity record.
            return;
        };

        let mut candidate = sorted.remove(position);
        candidate.is_cached = true;

        if !candidate.is_skipped {
            // Healthy sticky target jumps everything, demotion included.
            sorted.insert(0, candidate);
            return;
        }

        // A skipped sticky target only leads its own conversion group.
        let group = self.group(&candidate);
        let insert_at = sorted
            .iter()
            .position(|c| self.group(c) >= group)
            .unwrap_or(sorted.len());
        sorted.insert(insert_at, candidate);
    }
}
