//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 内置策略
//!
//! - `rate-limit` / `quota`：基于 [`RateLimiter`] 的固定窗口计数
//! - `transform-headers`：增删请求头或响应头，参与流式阶段并统计响应字节数

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Policy, PolicyFactory, PolicyRegistry, PolicyResult};
use crate::constants::{attributes, keys};
use crate::context::ExecutionContext;
use crate::definition::Phase;
use crate::error::{ExecutionFailure, GatewayError};
use crate::ratelimit::{RateLimitResult, RateLimiter};
use crate::security::API_KEY_POLICY;

pub const RATE_LIMIT_POLICY: &str = "rate-limit";
pub const QUOTA_POLICY: &str = "quota";
pub const TRANSFORM_HEADERS_POLICY: &str = "transform-headers";

fn parse_configuration<T: for<'de> Deserialize<'de>>(
    policy: &str,
    configuration: Option<&str>,
) -> Result<T, GatewayError> {
    let raw = configuration.ok_or_else(|| GatewayError::PolicyConfigurationError {
        policy: policy.to_string(),
        message: "缺少配置".to_string(),
    })?;
    serde_json::from_str(raw).map_err(|e| GatewayError::PolicyConfigurationError {
        policy: policy.to_string(),
        message: e.to_string(),
    })
}

// ============================================================================
// 限流与配额
// ============================================================================

/// 时间单位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeUnit {
    #[serde(alias = "seconds")]
    Seconds,
    #[serde(alias = "minutes")]
    Minutes,
    #[serde(alias = "hours")]
    Hours,
    #[serde(alias = "days")]
    Days,
}

impl TimeUnit {
    pub fn duration(&self, amount: u64) -> Duration {
        let seconds = match self {
            TimeUnit::Seconds => 1,
            TimeUnit::Minutes => 60,
            TimeUnit::Hours => 3_600,
            TimeUnit::Days => 86_400,
        };
        Duration::from_secs(amount.saturating_mul(seconds))
    }

    fn label(&self) -> &'static str {
        match self {
            TimeUnit::Seconds => "seconds",
            TimeUnit::Minutes => "minutes",
            TimeUnit::Hours => "hours",
            TimeUnit::Days => "days",
        }
    }
}

/// `rate-limit` / `quota` 的配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitPolicyConfiguration {
    pub limit: u64,
    pub period_time: u64,
    pub period_time_unit: TimeUnit,
    /// 附加到计数键上的自定义部分
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_add_headers")]
    pub add_headers: bool,
}

fn default_add_headers() -> bool {
    true
}

impl RateLimitPolicyConfiguration {
    pub fn window(&self) -> Duration {
        self.period_time_unit.duration(self.period_time)
    }
}

/// 计数类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    RateLimit,
    Quota,
}

impl CounterKind {
    fn policy_id(&self) -> &'static str {
        match self {
            CounterKind::RateLimit => RATE_LIMIT_POLICY,
            CounterKind::Quota => QUOTA_POLICY,
        }
    }

    fn header_prefix(&self) -> &'static str {
        match self {
            CounterKind::RateLimit => "X-Rate-Limit",
            CounterKind::Quota => "X-Quota",
        }
    }

    fn error_key(&self) -> &'static str {
        match self {
            CounterKind::RateLimit => keys::RATE_LIMIT_TOO_MANY_REQUESTS,
            CounterKind::Quota => keys::QUOTA_TOO_MANY_REQUESTS,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            CounterKind::RateLimit => "Rate limit",
            CounterKind::Quota => "Quota",
        }
    }
}

/// 限流/配额策略
pub struct RateLimitPolicy {
    kind: CounterKind,
    configuration: RateLimitPolicyConfiguration,
    limiter: RateLimiter,
}

impl RateLimitPolicy {
    pub fn new(
        kind: CounterKind,
        configuration: RateLimitPolicyConfiguration,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            kind,
            configuration,
            limiter,
        }
    }

    /// 计数键：`<订阅或客户端IP>:<API>:<策略>[:自定义键]`
    pub fn counter_key(&self, ctx: &ExecutionContext) -> String {
        let identity = ctx
            .attribute_str(attributes::SUBSCRIPTION_ID)
            .map(str::to_string)
            .or_else(|| ctx.request.remote_address.clone())
            .unwrap_or_else(|| "anonymous".to_string());
        let api = ctx.attribute_str(attributes::API).unwrap_or("-");

        let mut key = format!("{}:{}:{}", identity, api, self.kind.policy_id());
        if let Some(custom) = self.configuration.key.as_deref().filter(|k| !k.is_empty()) {
            key.push(':');
            key.push_str(custom);
        }
        key
    }

    fn write_headers(&self, ctx: &mut ExecutionContext, result: &RateLimitResult) {
        if !self.configuration.add_headers {
            return;
        }
        let prefix = self.kind.header_prefix();
        ctx.response
            .set_header(&format!("{}-Limit", prefix), result.limit.to_string());
        ctx.response
            .set_header(&format!("{}-Remaining", prefix), result.remaining.to_string());
        ctx.response
            .set_header(&format!("{}-Reset", prefix), result.reset_time.to_string());
    }

    fn exceeded_failure(&self) -> ExecutionFailure {
        ExecutionFailure::new(429)
            .with_key(self.kind.error_key())
            .with_message(format!(
                "{} exceeded ! You reach the limit of {} requests per {} {}",
                self.kind.label(),
                self.configuration.limit,
                self.configuration.period_time,
                self.configuration.period_time_unit.label()
            ))
    }
}

#[async_trait]
impl Policy for RateLimitPolicy {
    fn id(&self) -> &str {
        self.kind.policy_id()
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<PolicyResult, GatewayError> {
        let key = self.counter_key(ctx);
        let subscription = ctx
            .attribute_str(attributes::SUBSCRIPTION_ID)
            .map(str::to_string);

        let result = match self
            .limiter
            .increment_and_get_for(
                &key,
                self.configuration.limit,
                self.configuration.window(),
                subscription.as_deref(),
            )
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!("{} counter {} unavailable: {}", self.kind.label(), key, e);
                return Ok(PolicyResult::Fail(
                    ExecutionFailure::new(500)
                        .with_key(keys::RATE_LIMIT_SERVER_ERROR)
                        .with_message("Internal Server Error"),
                ));
            }
        };

        self.write_headers(ctx, &result);

        if result.exceeded {
            debug!("{} exceeded for {} ({}/{})", self.kind.label(), key, result.count, result.limit);
            return Ok(PolicyResult::Fail(self.exceeded_failure()));
        }
        Ok(PolicyResult::Continue)
    }
}

/// 限流/配额策略工厂
pub struct RateLimitPolicyFactory {
    kind: CounterKind,
    limiter: RateLimiter,
}

impl RateLimitPolicyFactory {
    pub fn new(kind: CounterKind, limiter: RateLimiter) -> Self {
        Self { kind, limiter }
    }
}

impl PolicyFactory for RateLimitPolicyFactory {
    fn id(&self) -> &str {
        self.kind.policy_id()
    }

    fn create(&self, configuration: Option<&str>) -> Result<Arc<dyn Policy>, GatewayError> {
        let configuration: RateLimitPolicyConfiguration =
            parse_configuration(self.kind.policy_id(), configuration)?;
        if configuration.period_time == 0 {
            return Err(GatewayError::PolicyConfigurationError {
                policy: self.kind.policy_id().to_string(),
                message: "periodTime 必须大于0".to_string(),
            });
        }
        Ok(Arc::new(RateLimitPolicy::new(
            self.kind,
            configuration,
            self.limiter.clone(),
        )))
    }
}

// ============================================================================
// 请求头/响应头转换
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}

/// `transform-headers` 的配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformHeadersConfiguration {
    #[serde(default = "default_scope")]
    pub scope: Phase,
    #[serde(default)]
    pub add_headers: Vec<HeaderEntry>,
    #[serde(default)]
    pub remove_headers: Vec<String>,
}

fn default_scope() -> Phase {
    Phase::Request
}

impl Default for TransformHeadersConfiguration {
    fn default() -> Self {
        Self {
            scope: default_scope(),
            add_headers: Vec::new(),
            remove_headers: Vec::new(),
        }
    }
}

/// 请求头/响应头转换策略
#[derive(Debug, Default)]
pub struct TransformHeadersPolicy {
    configuration: TransformHeadersConfiguration,
    /// 流式阶段经过的字节数
    bytes: AtomicU64,
}

impl TransformHeadersPolicy {
    pub fn new(configuration: TransformHeadersConfiguration) -> Self {
        Self {
            configuration,
            bytes: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Policy for TransformHeadersPolicy {
    fn id(&self) -> &str {
        TRANSFORM_HEADERS_POLICY
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<PolicyResult, GatewayError> {
        let headers = match self.configuration.scope {
            Phase::Request => &mut ctx.request.headers,
            Phase::Response => &mut ctx.response.headers,
        };

        for name in &self.configuration.remove_headers {
            headers.remove(&name.to_lowercase());
        }
        for entry in &self.configuration.add_headers {
            headers.insert(entry.name.to_lowercase(), entry.value.clone());
        }
        Ok(PolicyResult::Continue)
    }

    fn is_streamable(&self) -> bool {
        true
    }

    fn transform_chunk(&self, chunk: Bytes) -> Result<Bytes, GatewayError> {
        self.bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        Ok(chunk)
    }

    fn finish_stream(&self, ctx: &mut ExecutionContext) {
        let total = i64::try_from(self.bytes.load(Ordering::Relaxed)).unwrap_or(i64::MAX);
        let attribute = match self.configuration.scope {
            Phase::Request => attributes::REQUEST_BYTES,
            Phase::Response => attributes::RESPONSE_BYTES,
        };
        ctx.set_attribute(attribute, total);
    }
}

struct TransformHeadersFactory;

impl PolicyFactory for TransformHeadersFactory {
    fn id(&self) -> &str {
        TRANSFORM_HEADERS_POLICY
    }

    fn create(&self, configuration: Option<&str>) -> Result<Arc<dyn Policy>, GatewayError> {
        let configuration = match configuration {
            Some(_) => parse_configuration(TRANSFORM_HEADERS_POLICY, configuration)?,
            None => TransformHeadersConfiguration::default(),
        };
        Ok(Arc::new(TransformHeadersPolicy::new(configuration)))
    }
}

// ===== api-key =====

/// API Key 校验策略
///
/// 计划选择阶段只要求订阅（若存在）属于该计划；凭证未解析出订阅时由该策略拒绝请求。
#[derive(Debug, Default)]
pub struct ApiKeyPolicy;

#[async_trait]
impl Policy for ApiKeyPolicy {
    fn id(&self) -> &str {
        API_KEY_POLICY
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<PolicyResult, GatewayError> {
        if ctx.attribute_str(attributes::SUBSCRIPTION_ID).is_some() {
            return Ok(PolicyResult::Continue);
        }

        debug!(request_id = %ctx.id(), "API key does not resolve to a subscription");
        Ok(PolicyResult::Fail(
            ExecutionFailure::new(401)
                .with_key(keys::API_KEY_INVALID)
                .with_message("API Key is not valid or is expired / revoked."),
        ))
    }
}

/// 注册所有内置策略
pub fn register_builtins(registry: &PolicyRegistry, limiter: RateLimiter) -> Result<(), GatewayError> {
    registry.register(Arc::new(RateLimitPolicyFactory::new(
        CounterKind::RateLimit,
        limiter.clone(),
    )))?;
    registry.register(Arc::new(RateLimitPolicyFactory::new(CounterKind::Quota, limiter)))?;
    registry.register(Arc::new(TransformHeadersFactory))?;
    registry.register_fn(API_KEY_POLICY, |_| Ok(Arc::new(ApiKeyPolicy) as Arc<dyn Policy>))?;
    Ok(())
}
