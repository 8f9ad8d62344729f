//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 完整调度流程端到端测试
//!
//! 路由 -> 计划选择 -> 请求链 -> 后端 -> 响应链 -> 流式响应体 -> 上报

use crate::common::{get, keyless_api, ok_backend, DelayedInvoker, TestGateway};
use gateron::constants::keys;
use gateron::{
    ApiDefinition, Flow, GatewayConfig, GatewayError, GatewayRequest, HttpMethod, Invoker,
    PathOperator, Plan, PolicyReference, SecurityType, StaticInvoker,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn calls() -> Arc<Mutex<Vec<String>>> {
    Arc::new(Mutex::new(Vec::new()))
}

#[tokio::test]
async fn test_get_only_flow_runs_for_get_and_skips_post() {
    let env = TestGateway::new(ok_backend());
    let calls = calls();
    env.register_recording("audit", &calls);

    env.registry
        .deploy(
            keyless_api("v1-api", "/v1/api").with_flow(
                Flow::new("get-only", "/")
                    .with_methods([HttpMethod::Get])
                    .with_pre(PolicyReference::new("audit")),
            ),
        )
        .unwrap();

    let response = env.gateway.handle(get("/v1/api/items")).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body.as_ref(), b"backend-body");
    assert_eq!(*calls.lock(), vec!["audit"]);

    let post = GatewayRequest::new(HttpMethod::Post, "/v1/api/items").with_body("{}");
    let response = env.gateway.handle(post).await;
    assert_eq!(response.status, 200);
    assert_eq!(calls.lock().len(), 1, "POST must not run the GET-only flow");

    let record = env.reporter.last();
    assert_eq!(record.method, "POST");
    assert_eq!(record.request_content_length, 2);
}

#[tokio::test]
async fn test_policies_run_in_plan_then_api_order() {
    let env = TestGateway::new(ok_backend());
    let calls = calls();
    for id in ["plan-pre", "api-pre", "api-post", "plan-post"] {
        env.register_recording(id, &calls);
    }

    env.registry
        .deploy(
            ApiDefinition::new("orders", "/orders")
                .with_plan(
                    Plan::new("keyless", SecurityType::KeyLess).with_flow(
                        Flow::new("plan", "/")
                            .with_pre(PolicyReference::new("plan-pre"))
                            .with_post(PolicyReference::new("plan-post")),
                    ),
                )
                .with_flow(
                    Flow::new("api", "/")
                        .with_pre(PolicyReference::new("api-pre"))
                        .with_post(PolicyReference::new("api-post")),
                ),
        )
        .unwrap();

    let response = env.gateway.handle(get("/orders/1")).await;
    assert_eq!(response.status, 200);
    assert_eq!(
        *calls.lock(),
        vec!["plan-pre", "api-pre", "plan-post", "api-post"]
    );
}

#[tokio::test]
async fn test_disabled_step_and_conditional_flow() {
    let env = TestGateway::new(ok_backend());
    let calls = calls();
    for id in ["always", "disabled", "debug-only"] {
        env.register_recording(id, &calls);
    }

    env.registry
        .deploy(
            keyless_api("conditional", "/c")
                .with_flow(
                    Flow::new("base", "/")
                        .with_pre(PolicyReference::new("always"))
                        .with_pre(PolicyReference::new("disabled").with_enabled(false)),
                )
                .with_flow(
                    Flow::new("debug", "/")
                        .with_condition("{#request.headers['x-debug'] == 'on'}")
                        .with_pre(PolicyReference::new("debug-only")),
                ),
        )
        .unwrap();

    env.gateway.handle(get("/c/x")).await;
    assert_eq!(*calls.lock(), vec!["always"]);

    calls.lock().clear();
    env.gateway
        .handle(get("/c/x").with_header("X-Debug", "on"))
        .await;
    assert_eq!(*calls.lock(), vec!["always", "debug-only"]);
}

#[tokio::test]
async fn test_equals_flow_only_matches_exact_path() {
    let env = TestGateway::new(ok_backend());
    let calls = calls();
    env.register_recording("health", &calls);

    env.registry
        .deploy(
            keyless_api("svc", "/svc").with_flow(
                Flow::new("health", "/health")
                    .with_operator(PathOperator::Equals)
                    .with_pre(PolicyReference::new("health")),
            ),
        )
        .unwrap();

    env.gateway.handle(get("/svc/health/deep")).await;
    assert!(calls.lock().is_empty());

    env.gateway.handle(get("/svc/health")).await;
    assert_eq!(*calls.lock(), vec!["health"]);
}

#[tokio::test]
async fn test_path_mapping_is_reported() {
    let env = TestGateway::new(ok_backend());
    env.registry
        .deploy(
            keyless_api("mapped", "/v1")
                .with_path_mapping("/path/:id/info")
                .with_path_mapping("/path")
                .with_path_mapping("/products/:id"),
        )
        .unwrap();

    env.gateway.handle(get("/v1/path/42/info")).await;
    assert_eq!(env.reporter.last().mapped_path.as_deref(), Some("/path"));

    env.gateway.handle(get("/v1/products/7")).await;
    assert_eq!(
        env.reporter.last().mapped_path.as_deref(),
        Some("/products/:id")
    );

    env.gateway.handle(get("/v1/unmapped")).await;
    assert!(env.reporter.last().mapped_path.is_none());
}

#[tokio::test]
async fn test_response_headers_transformed_and_body_counted() {
    let invoker = StaticInvoker::new(200)
        .with_header("X-Internal", "secret")
        .with_chunk("backend-")
        .with_chunk("body");
    let env = TestGateway::new(Arc::new(invoker));

    env.registry
        .deploy(
            keyless_api("headers", "/h").with_flow(
                Flow::new("strip", "/").with_post(
                    PolicyReference::new("transform-headers").with_configuration(
                        r#"{
                            "scope": "RESPONSE",
                            "addHeaders": [{"name": "X-Gateway", "value": "gateron"}],
                            "removeHeaders": ["X-Internal"]
                        }"#,
                    ),
                ),
            ),
        )
        .unwrap();

    let response = env.gateway.handle(get("/h")).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.header("x-gateway"), Some("gateron"));
    assert!(response.header("x-internal").is_none());
    assert_eq!(response.body.as_ref(), b"backend-body");

    let record = env.reporter.last();
    assert_eq!(record.response_content_length, 12);
    assert!(record.api_response_time_ms.is_some());
}

#[tokio::test]
async fn test_streaming_response_hands_body_to_caller() {
    use futures::StreamExt;

    let invoker = StaticInvoker::new(200)
        .with_header("X-Internal", "secret")
        .with_chunk("backend-")
        .with_chunk("body");
    let env = TestGateway::new(Arc::new(invoker));
    env.registry
        .deploy(
            keyless_api("headers", "/h").with_flow(
                Flow::new("strip", "/").with_post(
                    PolicyReference::new("transform-headers").with_configuration(
                        r#"{"scope": "RESPONSE", "removeHeaders": ["X-Internal"]}"#,
                    ),
                ),
            ),
        )
        .unwrap();

    let response = env.gateway.handle_streaming(get("/h")).await;
    assert_eq!(response.status, 200);
    assert!(response.header("x-internal").is_none());
    assert_eq!(env.reporter.count(), 0);

    let chunks: Vec<bytes::Bytes> = response.body.map(|c| c.unwrap()).collect().await;
    assert_eq!(chunks, vec![bytes::Bytes::from("backend-"), bytes::Bytes::from("body")]);

    assert_eq!(env.reporter.count(), 1);
    assert_eq!(env.reporter.last().response_content_length, 12);
    assert_eq!(env.gateway.in_flight(), 0);
}

#[tokio::test]
async fn test_request_body_stream_reaches_backend() {
    use futures::StreamExt;

    struct EchoBodyInvoker;

    #[async_trait::async_trait]
    impl Invoker for EchoBodyInvoker {
        async fn invoke(
            &self,
            ctx: &mut gateron::ExecutionContext,
        ) -> Result<gateron::policy::stream::BodyStream, GatewayError> {
            ctx.response.status = 200;
            Ok(ctx.take_request_body())
        }
    }

    let env = TestGateway::new(Arc::new(EchoBodyInvoker));
    env.registry
        .deploy(keyless_api("upload", "/upload").with_flow(Flow::new("count", "/").with_pre(
            PolicyReference::new("transform-headers").with_configuration(r#"{"scope": "REQUEST"}"#),
        )))
        .unwrap();

    let parts: Vec<Result<bytes::Bytes, GatewayError>> = vec![
        Ok(bytes::Bytes::from("part-1,")),
        Ok(bytes::Bytes::from("part-2")),
    ];
    let ctx = gateron::ExecutionContext::new(GatewayRequest::new(HttpMethod::Post, "/upload"))
        .with_request_body_stream(futures::stream::iter(parts).boxed());
    let ctx = env.gateway.dispatch(ctx).await;

    assert_eq!(ctx.response.status, 200);
    assert_eq!(ctx.response.body.as_ref(), b"part-1,part-2");
    assert_eq!(
        ctx.attribute(gateron::constants::attributes::REQUEST_BYTES)
            .and_then(|v| v.as_i64()),
        Some(13)
    );
    assert_eq!(env.reporter.last().request_content_length, 13);
}

#[tokio::test]
async fn test_request_header_transform_reaches_backend() {
    struct EchoHeaderInvoker;

    #[async_trait::async_trait]
    impl Invoker for EchoHeaderInvoker {
        async fn invoke(
            &self,
            ctx: &mut gateron::ExecutionContext,
        ) -> Result<gateron::policy::stream::BodyStream, GatewayError> {
            let tenant = ctx.request.header("x-tenant").unwrap_or("none").to_string();
            ctx.response.status = 200;
            Ok(gateron::policy::stream::once(bytes::Bytes::from(tenant)))
        }
    }

    let env = TestGateway::new(Arc::new(EchoHeaderInvoker));
    env.registry
        .deploy(
            keyless_api("tenant", "/t").with_flow(
                Flow::new("tenant", "/").with_pre(
                    PolicyReference::new("transform-headers").with_configuration(
                        r#"{"addHeaders": [{"name": "X-Tenant", "value": "acme"}]}"#,
                    ),
                ),
            ),
        )
        .unwrap();

    let response = env.gateway.handle(get("/t")).await;
    assert_eq!(response.body.as_ref(), b"acme");
}

#[tokio::test]
async fn test_error_responses_are_reported() {
    struct DownInvoker;

    #[async_trait::async_trait]
    impl Invoker for DownInvoker {
        async fn invoke(
            &self,
            _ctx: &mut gateron::ExecutionContext,
        ) -> Result<gateron::policy::stream::BodyStream, GatewayError> {
            Err(GatewayError::InvokerError("connection refused".into()))
        }
    }

    let env = TestGateway::new(Arc::new(DownInvoker));
    env.registry
        .deploy(keyless_api("down", "/down"))
        .unwrap();
    env.registry
        .deploy(
            ApiDefinition::new("secured", "/secured")
                .with_plan(Plan::new("key", SecurityType::ApiKey)),
        )
        .unwrap();

    let response = env.gateway.handle(get("/nowhere")).await;
    assert_eq!(response.status, 404);
    assert_eq!(
        env.reporter.last().error_key.as_deref(),
        Some(keys::NO_API_FOUND)
    );

    let response = env.gateway.handle(get("/secured")).await;
    assert_eq!(response.status, 401);
    assert_eq!(
        env.reporter.last().error_key.as_deref(),
        Some(keys::GATEWAY_MISSING_SECURED_REQUEST_PLAN)
    );

    let response = env.gateway.handle(get("/down")).await;
    assert_eq!(response.status, 502);
    assert_eq!(
        env.reporter.last().error_key.as_deref(),
        Some(keys::GATEWAY_INVOKER_ERROR)
    );

    assert_eq!(env.reporter.count(), 3);
    assert_eq!(env.gateway.in_flight(), 0);
}

#[tokio::test]
async fn test_unregistered_policy_fails_strict_gateway() {
    let env = TestGateway::new(ok_backend());
    env.registry
        .deploy(keyless_api("strict", "/strict").with_flow(
            Flow::new("f", "/").with_pre(PolicyReference::new("not-installed")),
        ))
        .unwrap();

    let response = env.gateway.handle(get("/strict")).await;
    assert_eq!(response.status, 500);
    assert_eq!(response.reason.as_deref(), Some(keys::POLICY_NOT_FOUND));
}

#[tokio::test(start_paused = true)]
async fn test_slow_backend_times_out_with_504() {
    let config = GatewayConfig {
        request_timeout_ms: 100,
        request_timeout_grace_ms: 30,
        ..GatewayConfig::default()
    };
    let env = TestGateway::with_config(
        Arc::new(DelayedInvoker {
            delay: Duration::from_secs(5),
            status: 200,
        }),
        config,
    );
    env.registry.deploy(keyless_api("slow", "/slow")).unwrap();

    let response = env.gateway.handle(get("/slow")).await;
    assert_eq!(response.status, 504);
    assert_eq!(response.reason.as_deref(), Some(keys::REQUEST_TIMEOUT));

    let record = env.reporter.last();
    assert_eq!(record.status, 504);
    assert_eq!(record.error_key.as_deref(), Some(keys::REQUEST_TIMEOUT));
    assert_eq!(env.gateway.in_flight(), 0);
}

#[tokio::test]
async fn test_hooks_observe_both_phases_and_failures() {
    #[derive(Default)]
    struct EventHook {
        events: Mutex<Vec<String>>,
    }

    impl gateron::ChainHook for EventHook {
        fn name(&self) -> &str {
            "events"
        }

        fn pre(&self, policy: &str, phase: gateron::Phase, _ctx: &gateron::ExecutionContext) {
            self.events.lock().push(format!("pre {} {}", phase, policy));
        }

        fn on_failure(
            &self,
            policy: &str,
            phase: gateron::Phase,
            _ctx: &gateron::ExecutionContext,
            failure: &gateron::ExecutionFailure,
        ) {
            self.events
                .lock()
                .push(format!("fail {} {} {}", phase, policy, failure.status));
        }
    }

    let registry = Arc::new(gateron::ApiRegistry::new());
    registry
        .deploy(
            keyless_api("hooked", "/hooked").with_flow(
                Flow::new("f", "/")
                    .with_pre(
                        PolicyReference::new("rate-limit")
                            .with_name("limit")
                            .with_configuration(
                                r#"{"limit": 1, "periodTime": 1, "periodTimeUnit": "MINUTES"}"#,
                            ),
                    )
                    .with_post(PolicyReference::new("transform-headers")),
            ),
        )
        .unwrap();

    let hook = Arc::new(EventHook::default());
    let gateway = gateron::Gateway::builder(registry, ok_backend())
        .with_hook(hook.clone())
        .build()
        .unwrap();

    assert_eq!(gateway.handle(get("/hooked")).await.status, 200);
    assert_eq!(gateway.handle(get("/hooked")).await.status, 429);

    assert_eq!(
        *hook.events.lock(),
        vec![
            "pre REQUEST limit",
            "pre RESPONSE transform-headers",
            "pre REQUEST limit",
            "fail REQUEST limit 429",
        ]
    );

    let stats = gateway.chain_stats();
    assert_eq!(stats.completed_count, 2);
}
