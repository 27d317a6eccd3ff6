//! Integration tests for the tiered cache across simulated processes
//!
//! Each `TieredCache` stands in for one process; they share a distributed
//! tier the way separate processes share one ValKey instance.

mod common;

use common::init_test_logging;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use zephyr_core::cache::{DistributedTier, InMemoryDistributedCache, TieredCache};
use zephyr_core::config::CacheConfig;
use zephyr_core::error::ErrorKind;
use zephyr_core::CoreError;

fn process(shared: &InMemoryDistributedCache) -> TieredCache {
    process_with(shared, CacheConfig::default())
}

fn process_with(shared: &InMemoryDistributedCache, config: CacheConfig) -> TieredCache {
    TieredCache::new(&config, DistributedTier::in_memory(shared.clone()))
}

#[tokio::test]
async fn test_put_is_visible_to_other_processes_without_loading() {
    init_test_logging();
    let shared = InMemoryDistributedCache::new();
    let writer = process(&shared);
    let reader = process(&shared);

    writer
        .put("todo:1", b"draft".to_vec(), Duration::from_secs(60))
        .await
        .unwrap();

    let loads = AtomicUsize::new(0);
    let value = reader
        .get("todo:1", || async {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(Some(b"from store".to_vec()))
        })
        .await
        .unwrap();

    assert_eq!(value, Some(b"draft".to_vec()));
    assert_eq!(loads.load(Ordering::SeqCst), 0);
    assert_eq!(reader.stats().distributed_hits, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_load_once() {
    init_test_logging();
    let cache = Arc::new(process(&InMemoryDistributedCache::new()));
    let loads = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let cache = Arc::clone(&cache);
        let loads = Arc::clone(&loads);
        tasks.push(tokio::spawn(async move {
            cache
                .get("todo:hot", || async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(Some(b"hot".to_vec()))
                })
                .await
        }));
    }

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), Some(b"hot".to_vec()));
    }
    assert_eq!(loads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_invalidate_is_never_followed_by_the_old_value() {
    init_test_logging();
    let shared = InMemoryDistributedCache::new();
    let a = process(&shared);
    let b = process(&shared);

    a.put("todo:1", b"v1".to_vec(), Duration::from_secs(60))
        .await
        .unwrap();
    a.invalidate("todo:1").await.unwrap();

    for cache in [&a, &b] {
        let value = cache
            .get("todo:1", || async { Ok(Some(b"v2".to_vec())) })
            .await
            .unwrap();
        assert_eq!(value, Some(b"v2".to_vec()));
    }
}

#[tokio::test]
async fn test_failed_distributed_delete_still_drops_local_entry() {
    init_test_logging();
    let shared = InMemoryDistributedCache::new();
    let cache = process(&shared);
    cache
        .put("todo:1", b"v1".to_vec(), Duration::from_secs(60))
        .await
        .unwrap();

    shared.set_offline(true);
    let err = cache.invalidate("todo:1").await.unwrap_err();
    assert_eq!(CoreError::from(err).kind(), ErrorKind::DependencyFailure);
    assert!(cache.local().get("todo:1").await.is_none());
}

#[tokio::test]
async fn test_tombstone_expires_after_negative_ttl() {
    init_test_logging();
    let config = CacheConfig {
        negative_ttl_ms: 50,
        ..CacheConfig::default()
    };
    let cache = process_with(&InMemoryDistributedCache::new(), config);
    let loads = AtomicUsize::new(0);
    let load = || async {
        loads.fetch_add(1, Ordering::SeqCst);
        Ok::<Option<Vec<u8>>, CoreError>(None)
    };

    assert_eq!(cache.get("todo:404", load).await.unwrap(), None);
    assert_eq!(cache.get("todo:404", load).await.unwrap(), None);
    assert_eq!(loads.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(cache.get("todo:404", load).await.unwrap(), None);
    assert_eq!(loads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_prefix_invalidation_spans_both_tiers() {
    init_test_logging();
    let shared = InMemoryDistributedCache::new();
    let a = process(&shared);
    let b = process(&shared);

    for id in 1..=3 {
        a.put(&format!("todo_by_id:[{id}]"), vec![id], Duration::from_secs(60))
            .await
            .unwrap();
    }
    a.put("user:1", b"u".to_vec(), Duration::from_secs(60))
        .await
        .unwrap();

    b.invalidate_prefix("todo_by_id:").await.unwrap();

    let reloaded = b
        .get("todo_by_id:[2]", || async { Ok(Some(b"fresh".to_vec())) })
        .await
        .unwrap();
    assert_eq!(reloaded, Some(b"fresh".to_vec()));
    assert_eq!(
        b.get("user:1", || async { Ok(None) }).await.unwrap(),
        Some(b"u".to_vec())
    );
}
