//! Integration tests against a real Redis.
//!
//! These tests verify the remote tier end to end:
//! - `RedisStore` primitives (TTL, exists, SCAN-based pattern delete)
//! - L2 promotion and tag invalidation across orchestrator instances
//! - Pub/Sub invalidation of other instances' L1
//!
//! Tests use testcontainers to spin up a real Redis instance.

use octofhir_cache::remote::RemoteStore;
use octofhir_cache::{
    CacheConfig, CacheOrchestrator, CacheSettings, EntryOptions, RedisConfig, RedisStore,
    create_remote_store,
};
use std::time::Duration;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;
use uuid::Uuid;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

/// Get or create the shared Redis container
async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");

            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);

            (container, url)
        })
        .await;

    url.clone()
}

/// Settings with L2 enabled and a key prefix unique to the calling test.
fn redis_settings(url: String, pubsub: bool) -> CacheSettings {
    let unique = Uuid::new_v4().simple().to_string();
    CacheSettings {
        cache: CacheConfig {
            l2_enabled: true,
            l2_timeout_ms: 2000,
            compression_threshold_bytes: 256,
            key_prefix: format!("test:{unique}"),
            ..Default::default()
        },
        redis: RedisConfig {
            url,
            pool_size: 5,
            timeout_ms: 5000,
            pubsub_enabled: pubsub,
            invalidation_channel: format!("cache:invalidate:{unique}"),
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_redis_store_primitives() -> anyhow::Result<()> {
    let redis_url = get_redis_url().await;
    let settings = redis_settings(redis_url, false);
    let store = RedisStore::connect(&settings.redis).await?;
    let prefix = &settings.cache.key_prefix;

    let key = format!("{prefix}:k:a");
    store.set_with_ttl(&key, b"1", Duration::from_secs(60)).await?;
    assert_eq!(store.get(&key).await?, Some(b"1".to_vec()));
    assert!(store.exists(&key).await?);
    assert!(store.delete(&key).await?);
    assert!(!store.delete(&key).await?);

    // Sub-second TTLs are honored
    let short = format!("{prefix}:k:short");
    store
        .set_with_ttl(&short, b"1", Duration::from_millis(100))
        .await?;
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(store.get(&short).await?, None);

    for i in 0..10 {
        store
            .set_with_ttl(&format!("{prefix}:t:orders:{i}"), b"1", Duration::ZERO)
            .await?;
    }
    store
        .set_with_ttl(&format!("{prefix}:t:users:1"), b"1", Duration::ZERO)
        .await?;

    let removed = store
        .delete_pattern(&format!("{prefix}:t:orders:*"))
        .await?;
    assert_eq!(removed, 10);
    assert!(store.exists(&format!("{prefix}:t:users:1")).await?);
    Ok(())
}

#[tokio::test]
async fn test_redis_connection() {
    let redis_url = get_redis_url().await;
    let settings = redis_settings(redis_url, false);

    let store = create_remote_store(&settings).await.expect("redis store");
    assert!(store.is_available().await);

    let cache = CacheOrchestrator::from_settings(&settings).await.unwrap();
    assert!(cache.has_remote());
    cache.shutdown().await;
}

#[tokio::test]
async fn test_redis_l1_l2_promotion() {
    let redis_url = get_redis_url().await;
    let settings = redis_settings(redis_url, false);

    // Create first cache instance
    let cache1 = CacheOrchestrator::from_settings(&settings).await.unwrap();
    assert!(
        cache1
            .set(
                "patient:1",
                &"promotion_value".to_string(),
                EntryOptions::new()
                    .with_ttl(Duration::from_secs(60))
                    .with_tag("patients"),
            )
            .await
    );

    // Create second cache instance (simulating another server)
    let cache2 = CacheOrchestrator::from_settings(&settings).await.unwrap();

    // Get from cache2 - should retrieve from L2 (Redis) and promote to L1
    let value: Option<String> = cache2.get("patient:1").await;
    assert_eq!(value.as_deref(), Some("promotion_value"));
    assert!(cache2.local().contains("patient:1"));
    assert_eq!(cache2.local().keys_for_tag("patients"), vec!["patient:1"]);

    // Second get should hit L1
    let value: Option<String> = cache2.get("patient:1").await;
    assert_eq!(value.as_deref(), Some("promotion_value"));

    let stats = cache2.get_stats();
    assert_eq!(stats.l2_hits, 1);
    assert_eq!(stats.l1_hits, 1);

    cache1.shutdown().await;
    cache2.shutdown().await;
}

#[tokio::test]
async fn test_redis_tag_invalidation_across_instances() {
    let redis_url = get_redis_url().await;
    let settings = redis_settings(redis_url, false);

    let cache1 = CacheOrchestrator::from_settings(&settings).await.unwrap();
    let cache2 = CacheOrchestrator::from_settings(&settings).await.unwrap();

    let options = EntryOptions::new().with_tag("orders");
    cache1.set("order:1", &1u32, options.clone()).await;
    cache1.set("order:2", &2u32, options).await;
    cache1.set("user:1", &3u32, EntryOptions::default()).await;

    cache1.invalidate_tags(&["orders"]).await;

    // cache2 never had the entries in L1, so these reads go to Redis
    assert_eq!(cache2.get::<u32>("order:1").await, None);
    assert_eq!(cache2.get::<u32>("order:2").await, None);
    assert_eq!(cache2.get::<u32>("user:1").await, Some(3));

    cache1.shutdown().await;
    cache2.shutdown().await;
}

#[tokio::test]
async fn test_redis_large_values_round_trip_compressed() {
    let redis_url = get_redis_url().await;
    let settings = redis_settings(redis_url, false);
    let cache1 = CacheOrchestrator::from_settings(&settings).await.unwrap();
    let cache2 = CacheOrchestrator::from_settings(&settings).await.unwrap();

    let document: Vec<String> = (0..200).map(|i| format!("observation-{i}")).collect();
    cache1.set("bundle:1", &document, EntryOptions::default()).await;

    let store = RedisStore::connect(&settings.redis).await.unwrap();
    let raw = store
        .get(&format!("{}:k:bundle:1", settings.cache.key_prefix))
        .await
        .unwrap()
        .expect("stored in redis");
    assert_eq!(&raw[..2], &[0x1f, 0x8b]);

    let value: Option<Vec<String>> = cache2.get("bundle:1").await;
    assert_eq!(value, Some(document));

    cache1.shutdown().await;
    cache2.shutdown().await;
}

#[tokio::test]
async fn test_redis_invalidation() {
    let redis_url = get_redis_url().await;
    let settings = redis_settings(redis_url, false);
    let cache = CacheOrchestrator::from_settings(&settings).await.unwrap();

    cache
        .set("invalidate_test", &"value", EntryOptions::default())
        .await;
    assert!(cache.get::<String>("invalidate_test").await.is_some());

    assert!(cache.delete("invalidate_test").await);

    // Should be gone from both L1 and L2
    assert!(!cache.local().contains("invalidate_test"));
    assert!(cache.get::<String>("invalidate_test").await.is_none());

    cache.shutdown().await;
}

#[tokio::test]
async fn test_redis_pubsub_invalidates_other_instances() {
    let redis_url = get_redis_url().await;
    let settings = redis_settings(redis_url, true);

    let cache1 = CacheOrchestrator::from_settings(&settings).await.unwrap();
    let cache2 = CacheOrchestrator::from_settings(&settings).await.unwrap();

    // Give the listeners time to subscribe
    tokio::time::sleep(Duration::from_millis(300)).await;

    cache1.set("shared", &1u32, EntryOptions::default()).await;
    assert_eq!(cache2.get::<u32>("shared").await, Some(1));
    assert!(cache2.local().contains("shared"));

    cache1.invalidate_key("shared").await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!cache2.local().contains("shared"));

    cache1.shutdown().await;
    cache2.shutdown().await;
}

#[tokio::test]
async fn test_graceful_degradation_invalid_url() {
    let mut settings = redis_settings("redis://nonexistent:9999".to_string(), true);
    settings.redis.timeout_ms = 1000;

    // Should fall back to local cache
    assert!(create_remote_store(&settings).await.is_none());
    let cache = CacheOrchestrator::from_settings(&settings).await.unwrap();
    assert!(!cache.has_remote());

    // But should still work as local cache
    cache
        .set("fallback_key", &"fallback_value", EntryOptions::default())
        .await;
    let value: Option<String> = cache.get("fallback_key").await;
    assert_eq!(value.as_deref(), Some("fallback_value"));

    cache.shutdown().await;
}

#[tokio::test]
async fn test_disabled_redis() {
    let settings = CacheSettings::default();

    assert!(create_remote_store(&settings).await.is_none());
    let cache = CacheOrchestrator::from_settings(&settings).await.unwrap();
    assert!(!cache.has_remote());
    cache.shutdown().await;
}
