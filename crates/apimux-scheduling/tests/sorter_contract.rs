mod common;

use apimux_common::{DispatchSettings, PriorityMode, SchedulingMode};
use apimux_format::EndpointSignature;
use apimux_scheduling::{CacheAffinity, CandidateSorter, ProviderCandidate};

use common::candidate;

fn settings(priority: PriorityMode, scheduling: SchedulingMode) -> DispatchSettings {
    DispatchSettings {
        priority_mode: priority,
        scheduling_mode: scheduling,
        keep_priority_on_conversion: false,
        ..DispatchSettings::default()
    }
}

fn client_format() -> EndpointSignature {
    "openai:chat".parse().unwrap()
}

fn affinity_for(c: &ProviderCandidate) -> CacheAffinity {
    CacheAffinity {
        provider_id: c.provider.id,
        endpoint_id: c.endpoint.id,
        key_id: c.key.id,
        request_count: 7,
    }
}

fn key_ids(candidates: &[ProviderCandidate]) -> Vec<i64> {
    candidates.iter().map(|c| c.key.id).collect()
}

#[test]
fn affinity_hit_on_healthy_candidate_is_always_promoted_to_front() {
    let settings = settings(PriorityMode::GlobalKey, SchedulingMode::CacheAffinity);
    let sorter = CandidateSorter::new(&settings);

    let keep_1 = candidate(1, 1, false, false, false);
    let keep_2 = candidate(2, 2, false, false, false);
    let matched_demote = candidate(3, 0, true, false, false);
    let affinity = affinity_for(&matched_demote);

    let result = sorter.sort(
        vec![keep_1, matched_demote, keep_2],
        Some(&affinity),
        "a1",
        &client_format(),
        0,
    );

    // The sticky target wins over both its demotion group and its priority.
    assert_eq!(key_ids(&result), vec![3, 1, 2]);
    assert!(result[0].is_cached);
    assert!(result[1..].iter().all(|c| !c.is_cached));
}

#[test]
fn affinity_hit_on_skipped_candidate_only_leads_its_own_group() {
    let settings = settings(PriorityMode::GlobalKey, SchedulingMode::CacheAffinity);
    let sorter = CandidateSorter::new(&settings);

    let keep_1 = candidate(1, 1, false, false, false);
    let demote_other = candidate(2, 0, true, false, false);
    let keep_2 = candidate(3, 2, false, false, false);
    let matched_demote_skipped = candidate(4, 10, true, false, true);
    let affinity = affinity_for(&matched_demote_skipped);

    let result = sorter.sort(
        vec![keep_1, demote_other, keep_2, matched_demote_skipped],
        Some(&affinity),
        "a1",
        &client_format(),
        0,
    );

    // Exact-format group stays in front; the skipped sticky target leads the
    // demoted group despite its worse priority.
    assert_eq!(key_ids(&result), vec![1, 3, 4, 2]);
    assert!(result[2].is_cached);
    assert!(
        result
            .iter()
            .enumerate()
            .all(|(i, c)| (i == 2) == c.is_cached)
    );
}

#[test]
fn affinity_target_missing_from_candidates_is_ignored() {
    let settings = settings(PriorityMode::GlobalKey, SchedulingMode::CacheAffinity);
    let sorter = CandidateSorter::new(&settings);

    let keep_1 = candidate(1, 1, false, false, false);
    let keep_2 = candidate(2, 2, false, false, false);
    let affinity = CacheAffinity {
        provider_id: 999,
        endpoint_id: 999,
        key_id: 999,
        request_count: 1,
    };

    let result = sorter.sort(
        vec![keep_1, keep_2],
        Some(&affinity),
        "a1",
        &client_format(),
        0,
    );

    assert_eq!(key_ids(&result), vec![1, 2]);
    assert!(result.iter().all(|c| !c.is_cached));
}

#[test]
fn global_keep_priority_disables_demotion_grouping() {
    let mut settings = settings(PriorityMode::GlobalKey, SchedulingMode::FixedOrder);
    settings.keep_priority_on_conversion = true;
    let sorter = CandidateSorter::new(&settings);

    let exact = candidate(1, 10, false, false, false);
    let demoted = candidate(2, 1, true, false, false);

    let result = sorter.sort(vec![exact, demoted], None, "a1", &client_format(), 0);
    assert_eq!(key_ids(&result), vec![2, 1]);
}

#[test]
fn conversion_demotion_groups_convertible_candidates_last() {
    let settings = settings(PriorityMode::GlobalKey, SchedulingMode::FixedOrder);
    let sorter = CandidateSorter::new(&settings);

    let exact = candidate(1, 10, false, false, false);
    let demoted = candidate(2, 1, true, false, false);

    let result = sorter.sort(vec![exact, demoted], None, "a1", &client_format(), 0);
    assert_eq!(key_ids(&result), vec![1, 2]);
}

#[test]
fn provider_keep_priority_overrides_demotion_for_its_candidates() {
    let settings = settings(PriorityMode::GlobalKey, SchedulingMode::FixedOrder);
    let sorter = CandidateSorter::new(&settings);

    let exact = candidate(1, 10, false, false, false);
    let convertible_keep = candidate(2, 1, true, true, false);
    let convertible_demote = candidate(3, 0, true, false, false);

    let result = sorter.sort(
        vec![exact, convertible_demote, convertible_keep],
        None,
        "a1",
        &client_format(),
        0,
    );
    assert_eq!(key_ids(&result), vec![2, 1, 3]);
}

#[test]
fn provider_mode_orders_by_provider_priority_descending() {
    let settings = settings(PriorityMode::Provider, SchedulingMode::FixedOrder);
    let sorter = CandidateSorter::new(&settings);

    let mut low = candidate(1, 0, false, false, false);
    let mut high = candidate(2, 0, false, false, false);
    let mut mid = candidate(3, 0, false, false, false);
    std::sync::Arc::get_mut(&mut low.provider).unwrap().provider_priority = 1;
    std::sync::Arc::get_mut(&mut high.provider).unwrap().provider_priority = 9;
    std::sync::Arc::get_mut(&mut mid.provider).unwrap().provider_priority = 5;

    let result = sorter.sort(vec![low, high, mid], None, "a1", &client_format(), 0);

    // Higher provider priority dispatches first; no demotion in play here.
    let priorities: Vec<i32> = result.iter().map(|c| c.provider.provider_priority).collect();
    assert_eq!(priorities, vec![9, 5, 1]);
    for pair in result.windows(2) {
        assert!(pair[0].provider.provider_priority >= pair[1].provider.provider_priority);
    }
}

#[test]
fn fixed_order_is_stable_for_equal_priorities() {
    let settings = settings(PriorityMode::GlobalKey, SchedulingMode::FixedOrder);
    let sorter = CandidateSorter::new(&settings);

    let a = candidate(1, 5, false, false, false);
    let b = candidate(2, 5, false, false, false);
    let c = candidate(3, 5, false, false, false);

    let result = sorter.sort(vec![a, b, c], None, "a1", &client_format(), 0);
    assert_eq!(key_ids(&result), vec![1, 2, 3]);
}

#[test]
fn cache_affinity_tie_break_is_sticky_per_caller() {
    let settings = settings(PriorityMode::GlobalKey, SchedulingMode::CacheAffinity);
    let sorter = CandidateSorter::new(&settings);

    let make = || {
        vec![
            candidate(1, 5, false, false, false),
            candidate(2, 5, false, false, false),
            candidate(3, 5, false, false, false),
        ]
    };

    let first = key_ids(&sorter.sort(make(), None, "caller-a", &client_format(), 0));
    let second = key_ids(&sorter.sort(make(), None, "caller-a", &client_format(), 99));
    // Same caller, same order regardless of the per-request seed.
    assert_eq!(first, second);
}

#[test]
fn load_balance_permutes_deterministically_per_seed() {
    let settings = settings(PriorityMode::GlobalKey, SchedulingMode::LoadBalance);
    let sorter = CandidateSorter::new(&settings);

    let make = || {
        vec![
            candidate(1, 5, false, false, false),
            candidate(2, 5, false, false, false),
            candidate(3, 5, false, false, false),
            candidate(4, 5, false, false, false),
        ]
    };

    let a = key_ids(&sorter.sort(make(), None, "a1", &client_format(), 42));
    let b = key_ids(&sorter.sort(make(), None, "a1", &client_format(), 42));
    assert_eq!(a, b);

    let mut sorted = a.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![1, 2, 3, 4]);

    // A higher-priority candidate still wins regardless of the shuffle.
    let mut with_leader = make();
    with_leader.push(candidate(5, 1, false, false, false));
    let result = sorter.sort(with_leader, None, "a1", &client_format(), 42);
    assert_eq!(result[0].key.id, 5);
}
