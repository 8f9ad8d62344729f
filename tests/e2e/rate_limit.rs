//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 限流策略端到端测试

use crate::common::{get, keyless_api, ok_backend, TestGateway};
use gateron::constants::keys;
use gateron::{Flow, PolicyReference};
use std::time::Duration;

fn rate_limited_api(policy: &str, limit: u64) -> gateron::ApiDefinition {
    keyless_api("limited", "/limited").with_flow(
        Flow::new("limit", "/").with_pre(PolicyReference::new(policy).with_configuration(
            format!(
                r#"{{"limit": {}, "periodTime": 60, "periodTimeUnit": "SECONDS"}}"#,
                limit
            ),
        )),
    )
}

#[tokio::test]
async fn test_rate_limit_rejects_third_request_and_resets() {
    let env = TestGateway::new(ok_backend());
    env.registry.deploy(rate_limited_api("rate-limit", 2)).unwrap();

    let first = env.gateway.handle(get("/limited")).await;
    assert_eq!(first.status, 200);
    assert_eq!(first.header("x-rate-limit-limit"), Some("2"));
    assert_eq!(first.header("x-rate-limit-remaining"), Some("1"));
    assert_eq!(first.header("x-rate-limit-reset"), Some("1060000"));

    let second = env.gateway.handle(get("/limited")).await;
    assert_eq!(second.status, 200);
    assert_eq!(second.header("x-rate-limit-remaining"), Some("0"));

    let third = env.gateway.handle(get("/limited")).await;
    assert_eq!(third.status, 429);
    assert_eq!(
        third.reason.as_deref(),
        Some(keys::RATE_LIMIT_TOO_MANY_REQUESTS)
    );
    assert_eq!(third.header("x-rate-limit-remaining"), Some("0"));
    assert!(String::from_utf8_lossy(&third.body).contains("Rate limit exceeded"));
    assert_eq!(
        env.reporter.last().error_key.as_deref(),
        Some(keys::RATE_LIMIT_TOO_MANY_REQUESTS)
    );

    env.clock.advance(Duration::from_secs(61));

    let after_reset = env.gateway.handle(get("/limited")).await;
    assert_eq!(after_reset.status, 200);
    assert_eq!(after_reset.header("x-rate-limit-remaining"), Some("1"));
    assert_eq!(after_reset.header("x-rate-limit-reset"), Some("1121000"));
}

#[tokio::test]
async fn test_rate_limit_is_counted_per_client() {
    let env = TestGateway::new(ok_backend());
    env.registry.deploy(rate_limited_api("rate-limit", 1)).unwrap();

    let first = get("/limited").with_remote_address("10.0.0.1");
    assert_eq!(env.gateway.handle(first).await.status, 200);
    let again = get("/limited").with_remote_address("10.0.0.1");
    assert_eq!(env.gateway.handle(again).await.status, 429);

    let other = get("/limited").with_remote_address("10.0.0.2");
    assert_eq!(env.gateway.handle(other).await.status, 200);
}

#[tokio::test]
async fn test_rejected_request_never_reaches_backend() {
    let env = TestGateway::new(ok_backend());
    env.registry.deploy(rate_limited_api("quota", 1)).unwrap();

    assert_eq!(env.gateway.handle(get("/limited")).await.status, 200);
    let rejected = env.gateway.handle(get("/limited")).await;
    assert_eq!(rejected.status, 429);
    assert_eq!(rejected.reason.as_deref(), Some(keys::QUOTA_TOO_MANY_REQUESTS));
    assert_eq!(rejected.header("x-quota-limit"), Some("1"));
    assert_ne!(rejected.body.as_ref(), b"backend-body");

    let record = env.reporter.last();
    assert!(record.api_response_time_ms.is_none());
}

#[tokio::test]
async fn test_counter_key_uses_keyless_subscription() {
    let env = TestGateway::new(ok_backend());
    env.registry.deploy(rate_limited_api("rate-limit", 5)).unwrap();

    env.gateway.handle(get("/limited")).await;
    env.gateway.handle(get("/limited")).await;

    // keyless 计划以客户端地址作为订阅
    let counter = env
        .limiter
        .store()
        .get("203.0.113.7:limited:rate-limit")
        .await
        .unwrap()
        .expect("counter should exist");
    assert_eq!(counter.counter, 2);
    assert_eq!(counter.limit, 5);
    assert_eq!(counter.subscription.as_deref(), Some("203.0.113.7"));
}
