//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 热部署端到端测试
//!
//! 部署、更新、卸载事件在运行中的网关上立即生效。

use crate::common::{get, keyless_api, ok_backend, DelayedInvoker, TestGateway};
use gateron::{ApiDefinition, DeploymentEvent, DeploymentOutcome, Flow, PolicyReference};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_update_switches_flows_for_new_requests() {
    let env = TestGateway::new(ok_backend());
    let calls = Arc::new(Mutex::new(Vec::new()));
    env.register_recording("v1-policy", &calls);
    env.register_recording("v2-policy", &calls);

    let v1 = keyless_api("catalog", "/catalog")
        .with_deployed_at(1_000)
        .with_flow(Flow::new("f", "/").with_pre(PolicyReference::new("v1-policy")));
    assert_eq!(env.registry.deploy(v1).unwrap(), DeploymentOutcome::Deployed);
    env.gateway.handle(get("/catalog")).await;

    let v2 = keyless_api("catalog", "/catalog")
        .with_deployed_at(2_000)
        .with_flow(Flow::new("f", "/").with_pre(PolicyReference::new("v2-policy")));
    let outcome = env.registry.apply(DeploymentEvent::Update(v2)).unwrap();
    assert_eq!(outcome, DeploymentOutcome::Updated);
    env.gateway.handle(get("/catalog")).await;

    assert_eq!(*calls.lock(), vec!["v1-policy", "v2-policy"]);
}

#[tokio::test]
async fn test_redelivered_and_stale_events_change_nothing() {
    let env = TestGateway::new(ok_backend());
    let definition = keyless_api("catalog", "/catalog").with_deployed_at(5_000);

    assert_eq!(
        env.registry.deploy(definition.clone()).unwrap(),
        DeploymentOutcome::Deployed
    );
    assert_eq!(
        env.registry.deploy(definition.clone()).unwrap(),
        DeploymentOutcome::Unchanged
    );

    let stale = keyless_api("catalog", "/old-catalog").with_deployed_at(4_000);
    assert_eq!(env.registry.deploy(stale).unwrap(), DeploymentOutcome::Ignored);

    assert_eq!(env.gateway.handle(get("/catalog/items")).await.status, 200);
    assert_eq!(env.gateway.handle(get("/old-catalog")).await.status, 404);

    let stats = env.registry.stats();
    assert_eq!(stats.deployed, 1);
    assert_eq!(stats.unchanged, 1);
    assert_eq!(stats.ignored, 1);
}

#[tokio::test]
async fn test_undeploy_then_404() {
    let env = TestGateway::new(ok_backend());
    env.registry.deploy(keyless_api("gone", "/gone")).unwrap();
    assert_eq!(env.gateway.handle(get("/gone")).await.status, 200);

    assert_eq!(
        env.registry.undeploy("gone").unwrap(),
        DeploymentOutcome::Undeployed
    );
    let response = env.gateway.handle(get("/gone")).await;
    assert_eq!(response.status, 404);
    assert_eq!(response.header("connection"), Some("close"));

    assert_eq!(
        env.registry.undeploy("gone").unwrap(),
        DeploymentOutcome::Unchanged
    );
}

#[tokio::test]
async fn test_disabled_api_is_not_routed() {
    let env = TestGateway::new(ok_backend());
    env.registry
        .deploy(keyless_api("off", "/off").with_enabled(false))
        .unwrap();

    assert_eq!(env.registry.len(), 1);
    assert_eq!(env.gateway.handle(get("/off")).await.status, 404);
}

#[tokio::test]
async fn test_invalid_definition_keeps_previous_version() {
    let env = TestGateway::new(ok_backend());
    env.registry
        .deploy(keyless_api("api", "/api").with_deployed_at(1))
        .unwrap();

    let broken = ApiDefinition::new("api", "no-leading-slash").with_deployed_at(2);
    assert!(env.registry.deploy(broken).is_err());

    assert_eq!(env.gateway.handle(get("/api")).await.status, 200);
    assert_eq!(env.registry.stats().rejected, 1);
}

#[tokio::test]
async fn test_longest_context_path_wins_after_deploy() {
    let env = TestGateway::new(ok_backend());
    env.registry.deploy(keyless_api("root", "/shop")).unwrap();
    env.gateway.handle(get("/shop/cart/1")).await;
    assert_eq!(env.reporter.last().api_id.as_deref(), Some("root"));

    env.registry.deploy(keyless_api("cart", "/shop/cart")).unwrap();
    env.gateway.handle(get("/shop/cart/1")).await;
    assert_eq!(env.reporter.last().api_id.as_deref(), Some("cart"));

    env.gateway.handle(get("/shop/cartography")).await;
    assert_eq!(env.reporter.last().api_id.as_deref(), Some("root"));
}

#[tokio::test]
async fn test_definition_loaded_from_json() {
    let env = TestGateway::new(ok_backend());
    let definition = ApiDefinition::from_json(
        r#"{
            "id": "json-api",
            "name": "JSON API",
            "virtual_hosts": [{"path": "/json"}],
            "plans": [{"id": "open", "security": "KEY_LESS"}],
            "flows": [{
                "path": "/",
                "pre": [{
                    "policy": "transform-headers",
                    "configuration": {"addHeaders": [{"name": "X-From", "value": "json"}]}
                }]
            }],
            "deployed_at": 42
        }"#,
    )
    .unwrap();
    env.registry.deploy(definition).unwrap();

    let response = env.gateway.handle(get("/json/ping")).await;
    assert_eq!(response.status, 200);

    let record = env.reporter.last();
    assert_eq!(record.api_name.as_deref(), Some("JSON API"));
    assert_eq!(record.plan_id.as_deref(), Some("open"));
}

#[tokio::test]
async fn test_in_flight_request_keeps_its_snapshot() {
    let env = Arc::new(TestGateway::new(Arc::new(DelayedInvoker {
        delay: Duration::from_millis(50),
        status: 200,
    })));
    env.registry.deploy(keyless_api("slow", "/slow")).unwrap();

    let pending = {
        let env = env.clone();
        tokio::spawn(async move { env.gateway.handle(get("/slow")).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    env.registry.undeploy("slow").unwrap();

    let response = pending.await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body.as_ref(), b"late");
    assert_eq!(env.gateway.handle(get("/slow")).await.status, 404);
}
