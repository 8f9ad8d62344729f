//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 测试通用工具模块
//!
//! 提供测试中常用的工具函数和辅助结构。

#![allow(dead_code)]

use async_trait::async_trait;
use gateron::{
    ApiDefinition, ApiRegistry, ExecutionContext, Gateway, GatewayConfig, GatewayError,
    GatewayRequest, HttpMethod, InMemorySubscriptionService, Invoker, MetricsRecord, Plan, Policy,
    PolicyResult, RateLimiter, Reporter, SecurityType, StaticInvoker,
};
use gateron::policy::stream::{self, BodyStream};
use gateron::ratelimit::{ManualClock, MemoryRateLimitStore};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// 收集所有指标记录的上报器
#[derive(Default)]
pub struct CollectingReporter {
    pub records: Mutex<Vec<MetricsRecord>>,
}

impl CollectingReporter {
    pub fn last(&self) -> MetricsRecord {
        self.records
            .lock()
            .last()
            .cloned()
            .expect("no metrics record reported")
    }

    pub fn count(&self) -> usize {
        self.records.lock().len()
    }
}

impl Reporter for CollectingReporter {
    fn name(&self) -> &str {
        "collecting"
    }

    fn report(&self, record: &MetricsRecord) -> Result<(), GatewayError> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// 记录执行顺序的策略
pub struct RecordingPolicy {
    pub id: String,
    pub calls: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Policy for RecordingPolicy {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, _ctx: &mut ExecutionContext) -> Result<PolicyResult, GatewayError> {
        self.calls.lock().push(self.id.clone());
        Ok(PolicyResult::Continue)
    }
}

/// 等待一段时间后返回的后端
pub struct DelayedInvoker {
    pub delay: Duration,
    pub status: u16,
}

#[async_trait]
impl Invoker for DelayedInvoker {
    async fn invoke(&self, ctx: &mut ExecutionContext) -> Result<BodyStream, GatewayError> {
        tokio::time::sleep(self.delay).await;
        ctx.response.status = self.status;
        Ok(stream::once(bytes::Bytes::from_static(b"late")))
    }
}

/// 完整的测试环境
pub struct TestGateway {
    pub gateway: Gateway,
    pub registry: Arc<ApiRegistry>,
    pub subscriptions: Arc<InMemorySubscriptionService>,
    pub reporter: Arc<CollectingReporter>,
    pub clock: Arc<ManualClock>,
    pub limiter: RateLimiter,
}

impl TestGateway {
    pub fn new(invoker: Arc<dyn Invoker>) -> Self {
        Self::with_config(invoker, GatewayConfig::default())
    }

    pub fn with_config(invoker: Arc<dyn Invoker>, config: GatewayConfig) -> Self {
        let registry = Arc::new(ApiRegistry::new());
        let subscriptions = Arc::new(InMemorySubscriptionService::new());
        let reporter = Arc::new(CollectingReporter::default());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let limiter =
            RateLimiter::new(Arc::new(MemoryRateLimitStore::new())).with_clock(clock.clone());

        let gateway = Gateway::builder(registry.clone(), invoker)
            .with_config(config)
            .with_subscriptions(subscriptions.clone())
            .with_rate_limiter(limiter.clone())
            .with_reporter(reporter.clone())
            .build()
            .expect("gateway should build");

        Self {
            gateway,
            registry,
            subscriptions,
            reporter,
            clock,
            limiter,
        }
    }

    /// 注册记录执行顺序的策略
    pub fn register_recording(&self, id: &'static str, calls: &Arc<Mutex<Vec<String>>>) {
        let calls = calls.clone();
        self.gateway
            .policies()
            .register_fn(id, move |_| {
                Ok(Arc::new(RecordingPolicy {
                    id: id.to_string(),
                    calls: calls.clone(),
                }) as Arc<dyn Policy>)
            })
            .expect("policy id should be free");
    }
}

/// 返回 200 和固定响应体的后端
pub fn ok_backend() -> Arc<dyn Invoker> {
    Arc::new(StaticInvoker::new(200).with_chunk("backend-body"))
}

/// 带 keyless 计划的 API
pub fn keyless_api(id: &str, context_path: &str) -> ApiDefinition {
    ApiDefinition::new(id, context_path).with_plan(Plan::new("keyless", SecurityType::KeyLess))
}

pub fn get(path: &str) -> GatewayRequest {
    GatewayRequest::new(HttpMethod::Get, path).with_remote_address("203.0.113.7")
}
