mod common;

use std::sync::Arc;
use std::time::Duration;

use apimux_cache::MemoryCacheBackend;
use apimux_format::EndpointSignature;
use apimux_scheduling::CacheAffinityManager;

fn sig(s: &str) -> EndpointSignature {
    s.parse().unwrap()
}

#[tokio::test]
async fn set_then_get_roundtrips_target() {
    let manager = CacheAffinityManager::new(Arc::new(MemoryCacheBackend::new()));
    let format = sig("claude:chat");

    manager
        .set_affinity("caller-1", &format, "claude-sonnet", 1, 11, 21, 900)
        .await
        .unwrap();

    let affinity = manager
        .get_affinity("caller-1", &format, "claude-sonnet")
        .await
        .unwrap()
        .unwrap();
    assert_eq!((affinity.provider_id, affinity.endpoint_id, affinity.key_id), (1, 11, 21));
    assert_eq!(affinity.request_count, 1);

    // Different model key is a different affinity slot.
    assert!(
        manager
            .get_affinity("caller-1", &format, "claude-haiku")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn refresh_same_target_increments_request_count() {
    let manager = CacheAffinityManager::new(Arc::new(MemoryCacheBackend::new()));
    let format = sig("claude:chat");

    for _ in 0..3 {
        manager
            .set_affinity("caller-1", &format, "claude-sonnet", 1, 11, 21, 900)
            .await
            .unwrap();
    }
    let affinity = manager
        .get_affinity("caller-1", &format, "claude-sonnet")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(affinity.request_count, 3);

    // Switching targets resets the counter.
    manager
        .set_affinity("caller-1", &format, "claude-sonnet", 2, 12, 22, 900)
        .await
        .unwrap();
    let affinity = manager
        .get_affinity("caller-1", &format, "claude-sonnet")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(affinity.key_id, 22);
    assert_eq!(affinity.request_count, 1);
}

#[tokio::test(start_paused = true)]
async fn affinity_expires_with_ttl() {
    let manager = CacheAffinityManager::new(Arc::new(MemoryCacheBackend::new()));
    let format = sig("claude:chat");

    manager
        .set_affinity("caller-1", &format, "claude-sonnet", 1, 11, 21, 900)
        .await
        .unwrap();
    tokio::time::advance(Duration::from_secs(901)).await;
    assert!(
        manager
            .get_affinity("caller-1", &format, "claude-sonnet")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn invalidate_key_removes_matching_entries_only() {
    let manager = CacheAffinityManager::new(Arc::new(MemoryCacheBackend::new()));
    let format = sig("claude:chat");

    manager
        .set_affinity("caller-1", &format, "claude-sonnet", 1, 11, 21, 900)
        .await
        .unwrap();
    manager
        .set_affinity("caller-2", &format, "claude-sonnet", 1, 11, 21, 900)
        .await
        .unwrap();
    manager
        .set_affinity("caller-3", &format, "claude-sonnet", 2, 12, 22, 900)
        .await
        .unwrap();

    let removed = manager.invalidate_key(21).await.unwrap();
    assert_eq!(removed, 2);

    assert!(
        manager
            .get_affinity("caller-1", &format, "claude-sonnet")
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        manager
            .get_affinity("caller-3", &format, "claude-sonnet")
            .await
            .unwrap()
            .is_some()
    );
}
