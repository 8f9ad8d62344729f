//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Redis集成测试
//!
//! 测试Redis计数器存储的条件更新与限流器行为

use gateron::ratelimit::redis::{RedisConfig, RedisRateLimitStore};
use gateron::ratelimit::{RateLimitCounter, RateLimitStore, RateLimiter, UpdateOutcome};
use std::sync::Arc;
use std::time::Duration;

async fn store() -> RedisRateLimitStore {
    let config = RedisConfig::new("redis://localhost:6379").key_prefix("gateron:test:");
    RedisRateLimitStore::new(config).await.unwrap()
}

fn unique_key(name: &str) -> String {
    format!("{}:{}", name, uuid::Uuid::new_v4())
}

/// 测试条件更新的版本检查
#[tokio::test]
#[ignore] // 需要Redis服务器运行
async fn test_redis_conditional_update() {
    let store = store().await;
    let key = unique_key("cas");

    assert!(store.get(&key).await.unwrap().is_none());

    let mut counter = RateLimitCounter::new(&key, 10, i64::MAX);
    counter.counter = 1;
    let created = match store
        .conditional_update(&key, None, counter.clone())
        .await
        .unwrap()
    {
        UpdateOutcome::Updated(stored) => stored,
        UpdateOutcome::Conflict => panic!("creating a fresh counter must not conflict"),
    };
    assert_eq!(created.version, 1);

    // 再次以“不存在”为前提创建应冲突
    let outcome = store
        .conditional_update(&key, None, counter.clone())
        .await
        .unwrap();
    assert!(matches!(outcome, UpdateOutcome::Conflict));

    counter.counter = 2;
    let outcome = store
        .conditional_update(&key, Some(1), counter.clone())
        .await
        .unwrap();
    assert!(matches!(outcome, UpdateOutcome::Updated(ref c) if c.version == 2));

    // 过期版本
    let outcome = store.conditional_update(&key, Some(1), counter).await.unwrap();
    assert!(matches!(outcome, UpdateOutcome::Conflict));

    let stored = store.get(&key).await.unwrap().unwrap();
    assert_eq!(stored.counter, 2);
    assert_eq!(stored.version, 2);
}

/// 测试多个任务经Redis并发自增
#[tokio::test]
#[ignore]
async fn test_redis_concurrent_increments() {
    let limiter = RateLimiter::new(Arc::new(store().await));
    let key = unique_key("concurrent");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let limiter = limiter.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..10 {
                limiter
                    .increment_and_get(&key, 1_000, Duration::from_secs(60))
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let counter = limiter.store().get(&key).await.unwrap().unwrap();
    assert_eq!(counter.counter, 80);
}

/// 测试超过限额
#[tokio::test]
#[ignore]
async fn test_redis_limit_exceeded() {
    let limiter = RateLimiter::new(Arc::new(store().await));
    let key = unique_key("limit");

    for expected in 1..=3 {
        let result = limiter
            .increment_and_get(&key, 3, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(result.count, expected);
        assert!(!result.exceeded);
    }

    let result = limiter
        .increment_and_get(&key, 3, Duration::from_secs(60))
        .await
        .unwrap();
    assert!(result.exceeded);
    assert_eq!(result.remaining, 0);
}
