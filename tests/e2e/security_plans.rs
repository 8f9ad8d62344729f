//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 安全计划选择端到端测试

use crate::common::{get, ok_backend, TestGateway};
use chrono::{Duration as ChronoDuration, Utc};
use gateron::constants::{keys, DEFAULT_API_KEY_HEADER};
use gateron::{
    ApiDefinition, Flow, Plan, PolicyReference, SecurityType, Subscription, SubscriptionStatus,
};

fn payments_api() -> ApiDefinition {
    ApiDefinition::new("payments", "/payments")
        .with_plan(Plan::new("gold", SecurityType::ApiKey).with_order(1))
        .with_plan(Plan::new("silver", SecurityType::ApiKey).with_order(2))
}

fn env_with_subscriptions() -> TestGateway {
    let env = TestGateway::new(ok_backend());
    env.registry.deploy(payments_api()).unwrap();
    env.subscriptions.save(
        Subscription::new("sub-gold", "payments", "gold", "app-gold").with_api_key("key-gold"),
    );
    env.subscriptions.save(
        Subscription::new("sub-silver", "payments", "silver", "app-silver")
            .with_api_key("key-silver"),
    );
    env
}

#[tokio::test]
async fn test_api_key_selects_subscribed_plan() {
    let env = env_with_subscriptions();

    let response = env
        .gateway
        .handle(get("/payments").with_header(DEFAULT_API_KEY_HEADER, "key-silver"))
        .await;
    assert_eq!(response.status, 200);

    let record = env.reporter.last();
    assert_eq!(record.plan_id.as_deref(), Some("silver"));
    assert_eq!(record.application.as_deref(), Some("app-silver"));
    assert_eq!(record.subscription.as_deref(), Some("sub-silver"));
    assert_eq!(record.security_type.as_deref(), Some("API_KEY"));
}

#[tokio::test]
async fn test_api_key_from_query_parameter() {
    let env = env_with_subscriptions();

    let response = env
        .gateway
        .handle(get("/payments/charges").with_query_param("api-key", "key-gold"))
        .await;
    assert_eq!(response.status, 200);
    assert_eq!(env.reporter.last().plan_id.as_deref(), Some("gold"));
}

#[tokio::test]
async fn test_unknown_api_key_is_rejected_by_policy() {
    let env = env_with_subscriptions();

    let response = env
        .gateway
        .handle(get("/payments").with_header(DEFAULT_API_KEY_HEADER, "stolen"))
        .await;
    assert_eq!(response.status, 401);
    assert_eq!(response.reason.as_deref(), Some(keys::API_KEY_INVALID));

    let record = env.reporter.last();
    assert_eq!(record.error_key.as_deref(), Some(keys::API_KEY_INVALID));
    assert!(record.api_response_time_ms.is_none());
}

#[tokio::test]
async fn test_key_of_another_api_plan_finds_no_plan() {
    let env = env_with_subscriptions();
    env.subscriptions.save(
        Subscription::new("sub-bronze", "payments", "bronze", "app-bronze")
            .with_api_key("key-bronze"),
    );

    let response = env
        .gateway
        .handle(get("/payments").with_header(DEFAULT_API_KEY_HEADER, "key-bronze"))
        .await;
    assert_eq!(response.status, 401);
    assert_eq!(
        response.reason.as_deref(),
        Some(keys::GATEWAY_MISSING_SECURED_REQUEST_PLAN)
    );
}

#[tokio::test]
async fn test_paused_and_expired_subscriptions_are_refused() {
    let env = TestGateway::new(ok_backend());
    env.registry.deploy(payments_api()).unwrap();
    env.subscriptions.save(
        Subscription::new("sub-paused", "payments", "gold", "app")
            .with_api_key("key-paused")
            .with_status(SubscriptionStatus::Paused),
    );
    env.subscriptions.save(
        Subscription::new("sub-expired", "payments", "gold", "app")
            .with_api_key("key-expired")
            .with_validity(None, Some(Utc::now() - ChronoDuration::hours(1))),
    );

    for key in ["key-paused", "key-expired"] {
        let response = env
            .gateway
            .handle(get("/payments").with_header(DEFAULT_API_KEY_HEADER, key))
            .await;
        assert_eq!(response.status, 401, "key {} should be refused", key);
    }
}

#[tokio::test]
async fn test_keyless_fallback_when_no_credentials() {
    let env = TestGateway::new(ok_backend());
    env.registry
        .deploy(payments_api().with_plan(Plan::new("open", SecurityType::KeyLess).with_order(3)))
        .unwrap();
    env.subscriptions.save(
        Subscription::new("sub-gold", "payments", "gold", "app-gold").with_api_key("key-gold"),
    );

    let response = env.gateway.handle(get("/payments")).await;
    assert_eq!(response.status, 200);
    let record = env.reporter.last();
    assert_eq!(record.plan_id.as_deref(), Some("open"));
    assert_eq!(record.application.as_deref(), Some("1"));
    assert_eq!(record.subscription.as_deref(), Some("203.0.113.7"));
    assert_eq!(record.security_type.as_deref(), Some("KEY_LESS"));

    let response = env
        .gateway
        .handle(get("/payments").with_header(DEFAULT_API_KEY_HEADER, "key-gold"))
        .await;
    assert_eq!(response.status, 200);
    assert_eq!(env.reporter.last().plan_id.as_deref(), Some("gold"));
}

#[tokio::test]
async fn test_selection_rule_and_plan_flows() {
    let env = TestGateway::new(ok_backend());
    env.registry
        .deploy(
            ApiDefinition::new("reports", "/reports")
                .with_plan(
                    Plan::new("internal", SecurityType::KeyLess)
                        .with_order(1)
                        .with_selection_rule("{#request.headers['x-network'] == 'internal'}")
                        .with_flow(Flow::new("tag", "/").with_post(
                            PolicyReference::new("transform-headers").with_configuration(
                                r#"{"scope": "RESPONSE", "addHeaders": [{"name": "X-Plan", "value": "internal"}]}"#,
                            ),
                        )),
                )
                .with_plan(Plan::new("public", SecurityType::KeyLess).with_order(2)),
        )
        .unwrap();

    let internal = env
        .gateway
        .handle(get("/reports").with_header("X-Network", "internal"))
        .await;
    assert_eq!(internal.header("x-plan"), Some("internal"));
    assert_eq!(env.reporter.last().plan_id.as_deref(), Some("internal"));

    let public = env.gateway.handle(get("/reports")).await;
    assert!(public.header("x-plan").is_none());
    assert_eq!(env.reporter.last().plan_id.as_deref(), Some("public"));
}

#[tokio::test]
async fn test_mtls_plan_uses_certificate_subscription() {
    let env = TestGateway::new(ok_backend());
    env.registry
        .deploy(ApiDefinition::new("ledger", "/ledger").with_plan(Plan::new("certs", SecurityType::Mtls)))
        .unwrap();
    env.subscriptions.save(
        Subscription::new("sub-cert", "ledger", "certs", "app-cert").with_client_id("AB:CD:EF"),
    );

    let trusted = get("/ledger").with_client_certificate("AB:CD:EF");
    assert_eq!(env.gateway.handle(trusted).await.status, 200);
    assert_eq!(env.reporter.last().subscription.as_deref(), Some("sub-cert"));

    let unknown = get("/ledger").with_client_certificate("00:11:22");
    assert_eq!(env.gateway.handle(unknown).await.status, 401);

    assert_eq!(env.gateway.handle(get("/ledger")).await.status, 401);
}

#[tokio::test]
async fn test_unsigned_jwt_is_refused_when_policy_resolution_is_lenient() {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    let config = gateron::GatewayConfig {
        strict_policy_resolution: false,
        ..Default::default()
    };
    let env = TestGateway::with_config(ok_backend(), config);
    env.registry
        .deploy(
            ApiDefinition::new("ledger", "/ledger").with_plan(Plan::new("jwt-plan", SecurityType::Jwt)),
        )
        .unwrap();
    env.subscriptions.save(
        Subscription::new("sub-public", "ledger", "jwt-plan", "app-public")
            .with_client_id("public-client"),
    );

    let token = format!(
        "{}.{}.{}",
        URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#),
        URL_SAFE_NO_PAD.encode(r#"{"client_id":"public-client"}"#),
        URL_SAFE_NO_PAD.encode("garbage"),
    );
    let response = env
        .gateway
        .handle(get("/ledger").with_header("Authorization", &format!("Bearer {}", token)))
        .await;

    assert_ne!(response.status, 200);
    assert_eq!(response.status, 500);
    assert_eq!(response.reason.as_deref(), Some(keys::POLICY_NOT_FOUND));

    let record = env.reporter.last();
    assert_eq!(record.plan_id.as_deref(), Some("jwt-plan"));
    assert!(record.api_response_time_ms.is_none());
}
