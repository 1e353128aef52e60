//! Integration Tests for the Cache Facade
//!
//! Exercises the public API end to end without persistence: expiry,
//! bounds, concurrency, rebalancing and topology changes.

use std::sync::Arc;
use std::time::Duration;

use shard_cache::cache::ConsistentHashRing;
use shard_cache::{CacheConfig, CacheError, CacheFacade, LoadMetric, Lookup};

// == Helper Functions ==

fn config() -> CacheConfig {
    CacheConfig {
        shard_count: 4,
        virtual_nodes: 64,
        ..Default::default()
    }
}

async fn open(config: CacheConfig) -> CacheFacade {
    CacheFacade::open(config).await.unwrap()
}

/// Keys the default ring for `config` places on `shard`.
fn keys_on_shard(config: &CacheConfig, shard: usize, count: usize) -> Vec<String> {
    let ring = ConsistentHashRing::new(config.shard_count, config.virtual_nodes);
    (0..)
        .map(|i| format!("hot:{i}"))
        .filter(|k| ring.assign(k).unwrap() == shard)
        .take(count)
        .collect()
}

// == Expiry ==

#[tokio::test]
async fn test_entry_expires_after_ttl() {
    let cache = open(config()).await;
    cache
        .set("session:1", "alive", Some(Duration::from_millis(50)))
        .await
        .unwrap();
    assert_eq!(
        cache.get("session:1").await.unwrap(),
        Lookup::Hit(b"alive".to_vec())
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cache.get("session:1").await.unwrap(), Lookup::Miss);
    // An expired entry cannot be deleted either
    assert!(!cache.delete("session:1").await.unwrap());
    assert_eq!(cache.stats().await.total_entries, 0);
}

#[tokio::test]
async fn test_sweep_reclaims_expired_entries() {
    let cache = open(config()).await;
    for i in 0..20 {
        cache
            .set(&format!("tmp:{i}"), "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
    }
    cache.set("keep", "v", None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    let report = cache.sweep().await;
    assert_eq!(report.expired, 20);
    assert_eq!(report.shards, 4);

    let stats = cache.stats().await;
    assert_eq!(stats.total_entries, 1);
    assert_eq!(stats.expirations, 20);
}

#[tokio::test]
async fn test_default_ttl_applies() {
    let cache = open(CacheConfig {
        default_ttl: Duration::from_millis(30),
        ..config()
    })
    .await;
    cache.set("k", "v", None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(70)).await;
    assert!(!cache.get("k").await.unwrap().is_hit());
}

// == Bounds ==

#[tokio::test]
async fn test_lru_keeps_most_recent_entries() {
    let cache = open(CacheConfig {
        shard_count: 1,
        max_items_per_shard: 100,
        ..config()
    })
    .await;

    for i in 0..150 {
        cache.set(&format!("item:{i}"), "v", None).await.unwrap();
    }

    let stats = cache.stats().await;
    assert_eq!(stats.total_entries, 100);
    assert_eq!(stats.evictions, 50);
    for i in 0..50 {
        assert!(!cache.get(&format!("item:{i}")).await.unwrap().is_hit());
    }
    for i in 50..150 {
        assert!(cache.get(&format!("item:{i}")).await.unwrap().is_hit());
    }
}

#[tokio::test]
async fn test_reads_refresh_lru_position() {
    let cache = open(CacheConfig {
        shard_count: 1,
        max_items_per_shard: 3,
        ..config()
    })
    .await;
    cache.set("a", "1", None).await.unwrap();
    cache.set("b", "2", None).await.unwrap();
    cache.set("c", "3", None).await.unwrap();
    assert!(cache.get("a").await.unwrap().is_hit());

    cache.set("d", "4", None).await.unwrap();
    assert!(cache.get("a").await.unwrap().is_hit());
    assert!(!cache.get("b").await.unwrap().is_hit());
}

#[tokio::test]
async fn test_byte_bound_evicts() {
    let cache = open(CacheConfig {
        shard_count: 1,
        max_bytes_per_shard: 4_096,
        ..config()
    })
    .await;
    for i in 0..20 {
        cache
            .set(&format!("blob:{i}"), vec![7u8; 512], None)
            .await
            .unwrap();
    }
    let stats = cache.stats().await;
    assert!(stats.total_bytes <= 4_096);
    assert!(stats.evictions > 0);
    assert!(cache.get("blob:19").await.unwrap().is_hit());
}

// == Validation ==

#[tokio::test]
async fn test_oversized_value_is_rejected() {
    let cache = open(config()).await;
    let result = cache
        .set("big", vec![0u8; shard_cache::cache::MAX_VALUE_SIZE + 1], None)
        .await;
    assert!(matches!(result, Err(CacheError::Validation(_))));
    assert_eq!(cache.stats().await.sets, 0);
}

#[tokio::test]
async fn test_zero_shards_is_rejected() {
    let result = CacheFacade::open(CacheConfig {
        shard_count: 0,
        ..config()
    })
    .await;
    assert!(matches!(result, Err(CacheError::NoShardsAvailable)));
}

// == Invalidation ==

#[tokio::test]
async fn test_invalidate_pattern_across_shards() {
    let cache = open(config()).await;
    for i in 0..50 {
        cache.set(&format!("tenant:a:{i}"), "v", None).await.unwrap();
        cache.set(&format!("tenant:b:{i}"), "v", None).await.unwrap();
    }

    assert_eq!(cache.invalidate_pattern("tenant:a:*").await.unwrap(), 50);
    assert_eq!(cache.invalidate_pattern("tenant:a:*").await.unwrap(), 0);
    assert!(cache.get("tenant:b:7").await.unwrap().is_hit());
    assert!(!cache.get("tenant:a:7").await.unwrap().is_hit());

    let stats = cache.stats().await;
    assert_eq!(stats.total_entries, 50);
    assert_eq!(stats.deletes, 50);
}

// == Concurrency ==

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_on_disjoint_keys() {
    let cache = open(config()).await;

    let mut handles = Vec::new();
    for writer in 0..8 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..100 {
                let key = format!("w{writer}:{i}");
                cache.set(&key, format!("{writer}-{i}"), None).await.unwrap();
                assert_eq!(
                    cache.get(&key).await.unwrap(),
                    Lookup::Hit(format!("{writer}-{i}").into_bytes())
                );
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let stats = cache.stats().await;
    assert_eq!(stats.total_entries, 800);
    assert_eq!(stats.sets, 800);
    assert_eq!(stats.hits, 800);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_on_one_key_settle_on_a_written_value() {
    let cache = open(config()).await;

    let mut handles = Vec::new();
    for writer in 0..8u8 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..50 {
                cache.set("shared", vec![writer], None).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let value = cache.get("shared").await.unwrap().into_value().unwrap();
    assert_eq!(value.len(), 1);
    assert!(value[0] < 8);
    assert_eq!(cache.stats().await.total_entries, 1);
}

// == Rebalancing ==

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rebalance_under_concurrent_reads_never_misses() {
    let config = CacheConfig {
        shard_count: 2,
        imbalance_threshold: 2.0,
        balance_min_load: 10,
        migration_batch_size: 64,
        load_metric: LoadMetric::Operations,
        ..config()
    };
    let keys = Arc::new(keys_on_shard(&config, 0, 200));
    let cache = open(config).await;
    for key in keys.iter() {
        cache.set(key, key.as_str(), None).await.unwrap();
    }

    let mut readers = Vec::new();
    for _ in 0..4 {
        let cache = cache.clone();
        let keys = keys.clone();
        readers.push(tokio::spawn(async move {
            for _ in 0..5 {
                for key in keys.iter() {
                    assert_eq!(
                        cache.get(key).await.unwrap(),
                        Lookup::Hit(key.clone().into_bytes()),
                        "{key} missed during rebalance"
                    );
                }
            }
        }));
    }

    let mut migrated = 0;
    for _ in 0..3 {
        migrated += cache.rebalance().await.unwrap().migrated;
    }
    for reader in readers {
        reader.await.unwrap();
    }

    assert!(migrated > 0);
    let stats = cache.stats().await;
    assert_eq!(stats.migrations as usize, migrated);
    assert_eq!(stats.total_entries, 200);
    assert!(stats.shard_loads[1].entries > 0);
}

#[tokio::test]
async fn test_balanced_cache_is_left_alone() {
    let cache = open(CacheConfig {
        balance_min_load: 10,
        ..config()
    })
    .await;
    let report = cache.rebalance().await.unwrap();
    assert_eq!(report.migrated, 0);
    assert_eq!(report.hot, None);
}

#[tokio::test]
async fn test_deleted_migrated_key_is_not_resurrected() {
    let config = CacheConfig {
        shard_count: 2,
        balance_min_load: 10,
        migration_batch_size: 8,
        ..config()
    };
    let keys = keys_on_shard(&config, 0, 40);
    let cache = open(config).await;
    for key in &keys {
        cache.set(key, "v", None).await.unwrap();
    }
    assert!(cache.rebalance().await.unwrap().migrated > 0);

    for key in &keys {
        assert!(cache.delete(key).await.unwrap(), "{key} not found to delete");
    }
    for key in &keys {
        assert!(!cache.get(key).await.unwrap().is_hit());
    }
    assert_eq!(cache.stats().await.total_entries, 0);
}

// == Topology ==

#[tokio::test]
async fn test_growing_and_shrinking_keeps_every_key() {
    let cache = open(config()).await;
    for i in 0..300 {
        cache.set(&format!("k{i}"), format!("{i}"), None).await.unwrap();
    }

    cache.add_shard().await.unwrap();
    cache.add_shard().await.unwrap();
    assert_eq!(cache.shard_count().await, 6);
    cache.remove_shard().await.unwrap();
    assert_eq!(cache.shard_count().await, 5);

    for i in 0..300 {
        assert_eq!(
            cache.get(&format!("k{i}")).await.unwrap(),
            Lookup::Hit(format!("{i}").into_bytes())
        );
    }
    assert_eq!(cache.stats().await.total_entries, 300);
}

// == Lifecycle ==

#[tokio::test]
async fn test_start_and_stop_without_persistence() {
    let cache = open(CacheConfig {
        sweep_interval_floor: Duration::from_millis(10),
        sweep_interval_ceiling: Duration::from_millis(50),
        ..config()
    })
    .await;
    cache.start();
    cache.start();
    cache
        .set("short", "v", Some(Duration::from_millis(10)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    cache.stop().await.unwrap();

    let stats = cache.stats().await;
    assert_eq!(stats.total_entries, 0);
    assert_eq!(stats.expirations, 1);
}
