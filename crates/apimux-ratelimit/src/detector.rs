//! Classify what kind of limit an upstream 429 is reporting.
//!
//! The observation log must only learn RPM ceilings from RPM throttles:
//! concurrency pushback says nothing about requests-per-minute, and
//! token/daily quotas would teach the wrong boundary entirely. Heuristic:
//! explicit concurrency signals win, then non-RPM quota signals, and a bare
//! 429 defaults to RPM so local learning still works against upstreams that
//! send no hints at all.

use http::HeaderMap;

use crate::adaptive::{RateLimitInfo, RateLimitKind};

/// Headers that declare a requests-per-window ceiling, in preference order.
const RPM_LIMIT_HEADERS: [&str; 3] = [
    "x-ratelimit-limit-requests",
    "x-ratelimit-limit",
    "ratelimit-limit",
];

/// The throttle is about in-flight requests, not request rate.
const CONCURRENT_MARKERS: [&str; 4] = [
    "concurren",
    "simultaneous",
    "in-flight",
    "parallel request",
];

/// The throttle is a quota the RPM learner must not train on.
const NON_RPM_MARKERS: [&str; 5] = [
    "tokens per min",
    "token rate",
    "tpm",
    "per day",
    "daily",
];

pub fn detect_rate_limit(headers: &HeaderMap, body_excerpt: &str) -> RateLimitInfo {
    let lowered = body_excerpt.to_ascii_lowercase();

    let concurrent_header = headers
        .keys()
        .any(|name| name.as_str().contains("concurren"));
    if concurrent_header || CONCURRENT_MARKERS.iter().any(|m| lowered.contains(m)) {
        return RateLimitInfo {
            kind: RateLimitKind::Concurrent,
            limit_value: None,
        };
    }

    if NON_RPM_MARKERS.iter().any(|m| lowered.contains(m)) {
        return RateLimitInfo {
            kind: RateLimitKind::Unknown,
            limit_value: None,
        };
    }

    let limit_value = RPM_LIMIT_HEADERS
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u32>().ok());

    RateLimitInfo {
        kind: RateLimitKind::Rpm,
        limit_value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn rpm_header_yields_rpm_with_limit() {
        let info = detect_rate_limit(
            &headers(&[("x-ratelimit-limit-requests", "60")]),
            "rate limit exceeded",
        );
        assert_eq!(info.kind, RateLimitKind::Rpm);
        assert_eq!(info.limit_value, Some(60));
    }

    #[test]
    fn bare_429_defaults_to_rpm_without_limit() {
        let info = detect_rate_limit(&HeaderMap::new(), "");
        assert_eq!(info.kind, RateLimitKind::Rpm);
        assert_eq!(info.limit_value, None);
    }

    #[test]
    fn concurrency_signals_win_over_rpm_headers() {
        let info = detect_rate_limit(
            &headers(&[("x-ratelimit-limit-requests", "60")]),
            "too many concurrent requests",
        );
        assert_eq!(info.kind, RateLimitKind::Concurrent);
        assert_eq!(info.limit_value, None);

        let info = detect_rate_limit(
            &headers(&[("x-ratelimit-limit-concurrent-requests", "4")]),
            "",
        );
        assert_eq!(info.kind, RateLimitKind::Concurrent);
    }

    #[test]
    fn quota_throttles_are_unknown_to_the_rpm_learner() {
        for body in [
            "tokens per min exceeded",
            "TPM limit reached",
            "daily quota exhausted",
        ] {
            let info = detect_rate_limit(&HeaderMap::new(), body);
            assert_eq!(info.kind, RateLimitKind::Unknown, "body: {body}");
        }
    }

    #[test]
    fn unparseable_limit_header_still_counts_as_rpm() {
        let info = detect_rate_limit(&headers(&[("x-ratelimit-limit", "1m")]), "slow down");
        assert_eq!(info.kind, RateLimitKind::Rpm);
        assert_eq!(info.limit_value, None);
    }
}
