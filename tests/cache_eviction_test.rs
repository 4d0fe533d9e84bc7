// Comprehensive Cache Lifecycle Integration Tests
// Test ID Format: CACHE-XXX

use fasq::{CacheConfig, EvictionStrategy, QueryCache};
use std::time::Duration;

// CACHE-001: memory-budget LRU eviction evicts in ascending last-access
// order down to 85% of the cap.
#[tokio::test]
async fn test_cache_001_lru_eviction_order() {
    let cache = QueryCache::new(CacheConfig {
        max_memory_bytes: Some(1000),
        eviction: EvictionStrategy::Lru,
        default_stale_time: Duration::from_secs(60),
        ..CacheConfig::default()
    })
    .unwrap();

    // Ten ~100-byte entries fill the budget exactly.
    for i in 0..10 {
        cache
            .set(&format!("e:{}", i), vec![0u8; 76], None, None)
            .unwrap();
    }
    assert_eq!(cache.memory_usage(), 1000);

    // Bump recency on the first six.
    for i in 0..6 {
        cache.get::<Vec<u8>>(&format!("e:{}", i)).unwrap();
    }

    // Overflowing write triggers eviction of the least recently used.
    cache.set("e:10", vec![0u8; 76], None, None).unwrap();

    assert!(cache.memory_usage() <= 850);
    for evicted in ["e:6", "e:7", "e:8"] {
        assert!(!cache.contains_key(evicted), "{} should be evicted", evicted);
    }
    for kept in ["e:0", "e:1", "e:2", "e:3", "e:4", "e:5", "e:10"] {
        assert!(cache.contains_key(kept), "{} should survive", kept);
    }

    let stats = cache.metrics();
    assert_eq!(stats.metrics.evictions, 3);
}

// CACHE-002: entries with live references are never eviction victims,
// even when the budget stays exceeded.
#[tokio::test]
async fn test_cache_002_referenced_entries_survive_eviction() {
    let cache = QueryCache::new(CacheConfig {
        max_memory_bytes: Some(300),
        ..CacheConfig::default()
    })
    .unwrap();

    cache.set("held:1", vec![0u8; 76], None, None).unwrap();
    cache.set("held:2", vec![0u8; 76], None, None).unwrap();
    let _g1 = cache.acquire("held:1");
    let _g2 = cache.acquire("held:2");

    for i in 0..6 {
        cache
            .set(&format!("idle:{}", i), vec![0u8; 76], None, None)
            .unwrap();
    }

    assert!(cache.contains_key("held:1"));
    assert!(cache.contains_key("held:2"));
}

// CACHE-003: LFU evicts the least-accessed entries first.
#[tokio::test]
async fn test_cache_003_lfu_eviction() {
    let cache = QueryCache::new(CacheConfig {
        max_entries: Some(3),
        eviction: EvictionStrategy::Lfu,
        ..CacheConfig::default()
    })
    .unwrap();

    cache.set("hot", 1u64, None, None).unwrap();
    cache.set("warm", 2u64, None, None).unwrap();
    cache.set("cold", 3u64, None, None).unwrap();
    for _ in 0..5 {
        cache.get::<u64>("hot").unwrap();
    }
    cache.get::<u64>("warm").unwrap();

    cache.set("new", 4u64, None, None).unwrap();

    assert!(cache.contains_key("hot"));
    assert!(!cache.contains_key("cold"));
}

// CACHE-004: balanced acquire/release leaves entries unreferenced, and a
// GC sweep reclaims them only after their cache time of inactivity.
#[tokio::test]
async fn test_cache_004_refcount_and_gc() {
    let cache = QueryCache::new(CacheConfig {
        default_cache_time: Duration::from_millis(30),
        ..CacheConfig::default()
    })
    .unwrap();

    cache.set("gc:1", 1u64, None, None).unwrap();
    let guard = cache.acquire("gc:1");
    let second = cache.acquire("gc:1");
    assert_eq!(cache.entry_info("gc:1").unwrap().reference_count, 2);

    drop(guard);
    drop(second);
    assert_eq!(cache.entry_info("gc:1").unwrap().reference_count, 0);

    // Still inside its cache time: the sweep spares it.
    cache.gc_sweep();
    assert!(cache.contains_key("gc:1"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    cache.gc_sweep();
    assert!(!cache.contains_key("gc:1"));
}

// CACHE-005: the periodic GC timer sweeps on its own. Paused tokio time
// drives the timer; a zero cache time makes the entry eligible as soon
// as the tick fires.
#[tokio::test(start_paused = true)]
async fn test_cache_005_gc_timer() {
    let cache = QueryCache::new(CacheConfig {
        gc_interval: Duration::from_secs(30),
        default_cache_time: Duration::ZERO,
        ..CacheConfig::default()
    })
    .unwrap();

    cache.set("timed:1", 1u64, None, None).unwrap();
    assert!(cache.contains_key("timed:1"));

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(!cache.contains_key("timed:1"));
}

// CACHE-006: adaptive strategy drops everything inactive under critical
// pressure but only stale entries under low pressure.
#[tokio::test]
async fn test_cache_006_trim_severity() {
    let cache = QueryCache::new(CacheConfig {
        eviction: EvictionStrategy::Adaptive,
        ..CacheConfig::default()
    })
    .unwrap();

    cache
        .set("fresh", 1u64, Some(Duration::from_secs(60)), None)
        .unwrap();
    cache.set("stale", 2u64, Some(Duration::ZERO), None).unwrap();
    cache
        .set("held", 3u64, Some(Duration::ZERO), None)
        .unwrap();
    let _guard = cache.acquire("held");

    cache.trim(false);
    assert!(cache.contains_key("fresh"));
    assert!(!cache.contains_key("stale"));
    assert!(cache.contains_key("held"));

    cache.trim(true);
    assert!(!cache.contains_key("fresh"));
    assert!(cache.contains_key("held"));
}
