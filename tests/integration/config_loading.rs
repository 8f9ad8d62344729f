//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 配置文件加载集成测试

use crate::common::{get, keyless_api, ok_backend, TestGateway};
use gateron::{
    ApiDefinition, Flow, GatewayConfig, Plan, PolicyReference, SecurityType, Subscription,
};
use std::io::Write;
use tempfile::Builder;

fn write_config(suffix: &str, content: &str) -> tempfile::NamedTempFile {
    let mut file = Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

fn mixed_api() -> ApiDefinition {
    ApiDefinition::new("mixed", "/mixed")
        .with_plan(Plan::new("keyed", SecurityType::ApiKey))
        .with_plan(Plan::new("open", SecurityType::KeyLess))
}

#[tokio::test]
async fn test_yaml_config_overrides_api_key_header() {
    let file = write_config(
        ".yaml",
        r#"
request_timeout_ms: 5000
security:
  api_key_header: X-Api-Key
"#,
    );
    let config = GatewayConfig::from_file(file.path()).unwrap();
    assert_eq!(config.request_timeout_ms, 5000);

    let env = TestGateway::with_config(ok_backend(), config);
    env.registry.deploy(mixed_api()).unwrap();
    env.subscriptions
        .save(Subscription::new("sub-1", "mixed", "keyed", "app-1").with_api_key("secret"));

    env.gateway
        .handle(get("/mixed").with_header("X-Api-Key", "secret"))
        .await;
    assert_eq!(env.reporter.last().plan_id.as_deref(), Some("keyed"));

    // 默认请求头不再被识别
    env.gateway
        .handle(get("/mixed").with_header("X-Gravitee-Api-Key", "secret"))
        .await;
    assert_eq!(env.reporter.last().plan_id.as_deref(), Some("open"));
}

#[tokio::test]
async fn test_toml_config_reorders_handlers() {
    let file = write_config(
        ".toml",
        r#"
[security.handler_orders]
key-less = -1
"#,
    );
    let config = GatewayConfig::from_file(file.path()).unwrap();

    let env = TestGateway::with_config(ok_backend(), config);
    env.registry.deploy(mixed_api()).unwrap();
    env.subscriptions
        .save(Subscription::new("sub-1", "mixed", "keyed", "app-1").with_api_key("secret"));

    env.gateway
        .handle(get("/mixed").with_header("X-Gravitee-Api-Key", "secret"))
        .await;
    assert_eq!(env.reporter.last().plan_id.as_deref(), Some("open"));
}

#[tokio::test]
async fn test_lenient_resolution_skips_unknown_policies() {
    let file = write_config(".yml", "strict_policy_resolution: false\n");
    let config = GatewayConfig::from_file(file.path()).unwrap();
    assert!(!config.strict_policy_resolution);

    let env = TestGateway::with_config(ok_backend(), config);
    env.registry
        .deploy(keyless_api("lenient", "/lenient").with_flow(
            Flow::new("f", "/")
                .with_pre(PolicyReference::new("not-installed"))
                .with_post(PolicyReference::new("transform-headers").with_configuration(
                    r#"{"scope": "RESPONSE", "addHeaders": [{"name": "X-Ok", "value": "1"}]}"#,
                )),
        ))
        .unwrap();

    let response = env.gateway.handle(get("/lenient")).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.header("x-ok"), Some("1"));
}

#[test]
fn test_invalid_config_files_are_rejected() {
    let unknown_handler = write_config(
        ".yaml",
        "security:\n  handler_orders:\n    basic-auth: 1\n",
    );
    assert!(GatewayConfig::from_file(unknown_handler.path()).is_err());

    let wrong_extension = write_config(".ini", "request_timeout_ms = 1\n");
    assert!(GatewayConfig::from_file(wrong_extension.path()).is_err());

    let no_cas = write_config(".toml", "[rate_limit]\nmax_cas_attempts = 0\n");
    assert!(GatewayConfig::from_file(no_cas.path()).is_err());
}
