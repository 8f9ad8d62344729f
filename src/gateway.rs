//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 网关调度器
//!
//! 对单个请求执行完整的处理流程：
//!
//! 1. 路由解析（未命中返回 404 `NO_API_FOUND`）
//! 2. 安全计划选择（无候选返回 401）
//! 3. 请求阶段处理链（认证策略在流程策略之前），请求体流经其中可流式处理的策略
//! 4. 后端调用（失败返回 502）
//! 5. 响应阶段处理链
//! 6. 响应体流经可流式处理的策略
//!
//! [`Gateway::dispatch`] 读完整个响应体后返回；[`Gateway::stream`] 在控制流阶段结束后
//! 立即返回响应头，响应体由调用方按需拉取。请求超时覆盖响应体传输。
//!
//! 任何失败路径都会生成格式正确的响应，并上报一条指标记录。

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use scopeguard::ScopeGuard;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use crate::config::{GatewayConfig, ReportingConfig};
use crate::constants::attributes;
use crate::context::{CancellationToken, ExecutionContext, GatewayRequest, GatewayResponse};
use crate::definition::{Phase, PolicyReference};
use crate::el::{ConditionEvaluator, ExpressionConditionEvaluator};
use crate::error::{ExecutionFailure, GatewayError};
use crate::flow::FlowResolver;
use crate::policy::stream::{self as body_stream, transform_stream, BodyStream};
use crate::policy::{
    builtin, ChainHook, ChainOutcome, ChainStats, Policy, PolicyChain, PolicyRegistry,
};
use crate::ratelimit::{MemoryRateLimitStore, RateLimiter};
use crate::registry::RouteResolver;
use crate::reporter::{self, Reporter, RequestLog, TracingReporter};
use crate::security::{
    CachedSubscriptionService, InMemorySubscriptionService, SecurityPlanSelector,
    SubscriptionService,
};

#[cfg(feature = "monitoring")]
use crate::telemetry::GatewayMetrics;

// ============================================================================
// 后端调用
// ============================================================================

/// 后端调用器
///
/// 通过 [`ExecutionContext::take_request_body`] 读取请求体，写入响应状态和响应头，
/// 返回惰性的响应体流。
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, ctx: &mut ExecutionContext) -> Result<BodyStream, GatewayError>;
}

/// 返回固定响应的调用器
#[derive(Debug, Clone)]
pub struct StaticInvoker {
    status: u16,
    headers: Vec<(String, String)>,
    chunks: Vec<Bytes>,
}

impl StaticInvoker {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            chunks: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// 追加一个响应体分片
    pub fn with_chunk(mut self, chunk: impl Into<Bytes>) -> Self {
        self.chunks.push(chunk.into());
        self
    }
}

#[async_trait]
impl Invoker for StaticInvoker {
    async fn invoke(&self, ctx: &mut ExecutionContext) -> Result<BodyStream, GatewayError> {
        ctx.response.status = self.status;
        for (name, value) in &self.headers {
            ctx.response.set_header(name, value.clone());
        }
        let chunks: Vec<Result<Bytes, GatewayError>> =
            self.chunks.iter().cloned().map(Ok).collect();
        Ok(stream::iter(chunks).boxed())
    }
}

/// 在取消令牌触发时提前结束
async fn cancellable<F: Future>(token: &CancellationToken, future: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        output = future => Some(output),
    }
}

// ============================================================================
// 流式响应
// ============================================================================

/// 流式响应
///
/// 状态码和响应头在控制流阶段结束时确定。响应体按需拉取，
/// 读完、出错或被丢弃时上报该请求的指标。传输中途失败时，
/// 流以 [`GatewayError::Aborted`] 结束。
pub struct StreamingResponse {
    pub status: u16,
    pub reason: Option<String>,
    /// 响应头（键为小写）
    pub headers: HashMap<String, String>,
    pub body: BodyStream,
}

impl StreamingResponse {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(&key.to_lowercase()).map(String::as_str)
    }
}

impl std::fmt::Debug for StreamingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("status", &self.status)
            .field("reason", &self.reason)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

type Release<T> = ScopeGuard<Arc<T>, fn(Arc<T>)>;

fn release_count(count: Arc<AtomicUsize>) {
    count.fetch_sub(1, Ordering::AcqRel);
}

#[cfg(feature = "monitoring")]
fn release_gauge(metrics: Arc<GatewayMetrics>) {
    metrics.in_flight.dec();
}

/// 在途请求计数，请求结束（包括响应体流被丢弃）时释放
struct InFlight {
    _count: Release<AtomicUsize>,
    #[cfg(feature = "monitoring")]
    _gauge: Option<Release<GatewayMetrics>>,
}

/// 指标上报出口，由网关和流式响应体共享
struct ReportSink {
    reporters: Vec<Arc<dyn Reporter>>,
    config: ReportingConfig,
    #[cfg(feature = "monitoring")]
    metrics: Option<Arc<GatewayMetrics>>,
}

impl ReportSink {
    fn report(&self, ctx: &mut ExecutionContext, response_len: usize, request_len: usize) {
        let attribute = |name: &str| ctx.attribute_str(name).map(str::to_string);
        let api_id = attribute(attributes::API);
        let api_name = attribute(attributes::API_NAME);
        let plan_id = attribute(attributes::PLAN);
        let application = attribute(attributes::APPLICATION);
        let subscription = attribute(attributes::SUBSCRIPTION_ID);
        let security_type = attribute(attributes::SECURITY_TYPE);
        let mapped_path = attribute(attributes::MAPPED_PATH);
        let latency_ms = ctx.started_at().elapsed().as_millis() as u64;

        let record = &mut ctx.metrics;
        record.api_id = api_id;
        record.api_name = api_name;
        record.plan_id = plan_id;
        record.application = application;
        record.subscription = subscription;
        record.security_type = security_type;
        record.mapped_path = mapped_path;
        record.status = ctx.response.status;
        record.latency_ms = latency_ms;
        record.response_content_length = response_len;
        if request_len > 0 {
            record.request_content_length = request_len;
        }

        if self.config.log_requests {
            record.log = Some(RequestLog {
                request_headers: ctx.request.headers.clone(),
                response_headers: ctx.response.headers.clone(),
                request_body_len: record.request_content_length,
                response_body_len: response_len,
            });
        }

        #[cfg(feature = "monitoring")]
        if let Some(metrics) = &self.metrics {
            metrics.record_request(
                record.status,
                std::time::Duration::from_millis(record.latency_ms),
            );
        }

        if self.config.enabled {
            reporter::emit(&self.reporters, &ctx.metrics);
        }
    }
}

/// 控制流阶段完成后待传输的响应体
struct BodyTransfer {
    body: BodyStream,
    token: CancellationToken,
    deadline: Option<tokio::time::Instant>,
    /// 请求与响应阶段的可流式处理策略，传输完成后回写上下文
    streamable: Vec<Arc<dyn Policy>>,
    request_bytes: Arc<AtomicUsize>,
    sent: usize,
}

impl BodyTransfer {
    /// 拉取下一个分片
    ///
    /// 取消、超时和分片失败都以 `Err` 结束传输。
    async fn next_chunk(&mut self) -> Option<Result<Bytes, ExecutionFailure>> {
        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        let chunk = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Some(Err(self.cancel_reason())),
            _ = expired => {
                if self.token.cancel(ExecutionFailure::request_timeout()) {
                    debug!("Request timed out while streaming the body");
                }
                return Some(Err(self.cancel_reason()));
            }
            chunk = self.body.next() => chunk,
        };

        match chunk? {
            Ok(chunk) => {
                self.sent += chunk.len();
                Some(Ok(chunk))
            }
            Err(GatewayError::InvokerError(e)) => {
                warn!("Backend body failed: {}", e);
                Some(Err(ExecutionFailure::bad_gateway()))
            }
            Err(e) => {
                error!("Body transformation failed: {}", e);
                Some(Err(ExecutionFailure::policy_fault()))
            }
        }
    }

    fn cancel_reason(&self) -> ExecutionFailure {
        self.token
            .reason()
            .unwrap_or_else(ExecutionFailure::client_closed)
    }

    fn request_bytes(&self) -> usize {
        self.request_bytes.load(Ordering::Relaxed)
    }

    fn complete(&self, ctx: &mut ExecutionContext) {
        for policy in &self.streamable {
            policy.finish_stream(ctx);
        }
    }
}

/// 流式响应体的状态，结束时回写上下文并上报
struct StreamingBody {
    ctx: ExecutionContext,
    transfer: BodyTransfer,
    sink: Arc<ReportSink>,
    finished: bool,
    _in_flight: InFlight,
}

impl StreamingBody {
    fn into_stream(self) -> BodyStream {
        stream::unfold(self, |mut state| async move {
            if state.finished {
                return None;
            }
            match state.transfer.next_chunk().await {
                Some(Ok(chunk)) => Some((Ok(chunk), state)),
                Some(Err(failure)) => {
                    state.finish(Some(failure.clone()));
                    Some((Err(GatewayError::Aborted(failure)), state))
                }
                None => {
                    state.finish(None);
                    None
                }
            }
        })
        .boxed()
    }

    fn finish(&mut self, failure: Option<ExecutionFailure>) {
        if self.finished {
            return;
        }
        self.finished = true;

        match failure {
            None => self.transfer.complete(&mut self.ctx),
            Some(failure) => {
                debug!("Response body aborted: {}", failure);
                self.ctx.metrics.error_key = failure.key;
            }
        }
        let (sent, request_len) = (self.transfer.sent, self.transfer.request_bytes());
        self.sink.report(&mut self.ctx, sent, request_len);
    }
}

impl Drop for StreamingBody {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(Some(ExecutionFailure::client_closed()));
        }
    }
}

fn fail(ctx: &mut ExecutionContext, failure: ExecutionFailure) {
    ctx.response.apply_failure(&failure);
    ctx.metrics.error_key = failure.key;
}

fn cancelled(ctx: &mut ExecutionContext, token: &CancellationToken) {
    let reason = token
        .reason()
        .unwrap_or_else(ExecutionFailure::client_closed);
    debug!("Request cancelled: {}", reason);
    fail(ctx, reason);
}

// ============================================================================
// 构建器
// ============================================================================

/// 网关构建器
pub struct GatewayBuilder {
    routes: Arc<dyn RouteResolver>,
    invoker: Arc<dyn Invoker>,
    config: GatewayConfig,
    evaluator: Option<Arc<dyn ConditionEvaluator>>,
    policies: Option<Arc<PolicyRegistry>>,
    selector: Option<Arc<SecurityPlanSelector>>,
    subscriptions: Option<Arc<dyn SubscriptionService>>,
    rate_limiter: Option<RateLimiter>,
    reporters: Vec<Arc<dyn Reporter>>,
    hooks: Vec<Arc<dyn ChainHook>>,
    #[cfg(feature = "monitoring")]
    metrics: Option<Arc<GatewayMetrics>>,
}

impl GatewayBuilder {
    pub fn new(routes: Arc<dyn RouteResolver>, invoker: Arc<dyn Invoker>) -> Self {
        Self {
            routes,
            invoker,
            config: GatewayConfig::default(),
            evaluator: None,
            policies: None,
            selector: None,
            subscriptions: None,
            rate_limiter: None,
            reporters: Vec::new(),
            hooks: Vec::new(),
            #[cfg(feature = "monitoring")]
            metrics: None,
        }
    }

    pub fn with_config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// 使用自定义策略注册表（不会再注册内置策略）
    pub fn with_policy_registry(mut self, policies: Arc<PolicyRegistry>) -> Self {
        self.policies = Some(policies);
        self
    }

    pub fn with_selector(mut self, selector: Arc<SecurityPlanSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// 默认选择器使用的订阅服务（会包一层 LRU 缓存）
    pub fn with_subscriptions(mut self, subscriptions: Arc<dyn SubscriptionService>) -> Self {
        self.subscriptions = Some(subscriptions);
        self
    }

    /// 内置限流策略使用的计数器
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporters.push(reporter);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn ChainHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    #[cfg(feature = "monitoring")]
    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// 构建网关
    ///
    /// 未指定的组件使用默认实现：模板表达式求值器、内存订阅服务（带缓存）、
    /// 注册了内置策略的策略注册表、`tracing` 上报器。
    ///
    /// 在 tokio 运行时内构建时，内置限流策略的计数器由后台任务定期清理
    /// （`rate_limit.cleanup_interval_ms`），任务随网关一起结束。
    pub fn build(self) -> Result<Gateway, GatewayError> {
        self.config.validate().map_err(GatewayError::ConfigError)?;

        let evaluator = self.evaluator.unwrap_or_else(|| {
            Arc::new(ExpressionConditionEvaluator::new(
                self.config.expression_cache_capacity,
            )) as Arc<dyn ConditionEvaluator>
        });

        let mut cleanup = None;
        let policies = match self.policies {
            Some(policies) => policies,
            None => {
                let registry =
                    PolicyRegistry::new().with_strict(self.config.strict_policy_resolution);
                let limiter = self.rate_limiter.unwrap_or_else(|| {
                    RateLimiter::new(Arc::new(MemoryRateLimitStore::new()))
                        .with_config(self.config.rate_limit.clone())
                });
                if let Some(interval) = self.config.rate_limit.cleanup_interval() {
                    match tokio::runtime::Handle::try_current() {
                        Ok(_) => cleanup = Some(limiter.spawn_cleanup(interval)),
                        Err(_) => debug!("No tokio runtime, expired counters will not be swept"),
                    }
                }
                builtin::register_builtins(&registry, limiter)?;
                Arc::new(registry)
            }
        };

        let selector = match self.selector {
            Some(selector) => selector,
            None => {
                let inner = self.subscriptions.unwrap_or_else(|| {
                    Arc::new(InMemorySubscriptionService::new()) as Arc<dyn SubscriptionService>
                });
                let subscriptions = Arc::new(CachedSubscriptionService::new(
                    inner,
                    self.config.subscription_cache_capacity,
                ));
                Arc::new(SecurityPlanSelector::with_default_handlers(
                    evaluator.clone(),
                    subscriptions,
                    &self.config.security,
                ))
            }
        };

        let mut reporters = self.reporters;
        if reporters.is_empty() {
            reporters.push(Arc::new(TracingReporter));
        }
        let sink = Arc::new(ReportSink {
            reporters,
            config: self.config.reporting.clone(),
            #[cfg(feature = "monitoring")]
            metrics: self.metrics,
        });

        Ok(Gateway {
            routes: self.routes,
            invoker: self.invoker,
            flows: FlowResolver::new(evaluator),
            policies,
            selector,
            sink,
            hooks: self.hooks,
            config: self.config,
            chain_stats: Arc::new(RwLock::new(ChainStats::default())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            cleanup,
        })
    }
}

// ============================================================================
// 网关
// ============================================================================

/// 网关调度器
pub struct Gateway {
    routes: Arc<dyn RouteResolver>,
    invoker: Arc<dyn Invoker>,
    flows: FlowResolver,
    policies: Arc<PolicyRegistry>,
    selector: Arc<SecurityPlanSelector>,
    sink: Arc<ReportSink>,
    hooks: Vec<Arc<dyn ChainHook>>,
    config: GatewayConfig,
    chain_stats: Arc<RwLock<ChainStats>>,
    in_flight: Arc<AtomicUsize>,
    cleanup: Option<JoinHandle<()>>,
}

impl Gateway {
    pub fn builder(routes: Arc<dyn RouteResolver>, invoker: Arc<dyn Invoker>) -> GatewayBuilder {
        GatewayBuilder::new(routes, invoker)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn policies(&self) -> &Arc<PolicyRegistry> {
        &self.policies
    }

    /// 所有处理链汇总的统计信息
    pub fn chain_stats(&self) -> ChainStats {
        self.chain_stats.read().clone()
    }

    /// 正在处理的请求数（含尚未读完响应体的流式响应）
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// 处理请求并返回完整响应
    pub async fn handle(&self, request: GatewayRequest) -> GatewayResponse {
        self.dispatch(ExecutionContext::new(request)).await.response
    }

    /// 处理请求并返回流式响应
    pub async fn handle_streaming(&self, request: GatewayRequest) -> StreamingResponse {
        self.stream(ExecutionContext::new(request)).await
    }

    /// 处理已创建的执行上下文，读完响应体后返回
    ///
    /// 调用方可以在调用前克隆 [`ExecutionContext::cancellation`]，在客户端断开时取消请求。
    #[instrument(
        skip(self, ctx),
        fields(request_id = %ctx.id(), method = %ctx.request.method, path = %ctx.request.path)
    )]
    pub async fn dispatch(&self, mut ctx: ExecutionContext) -> ExecutionContext {
        let _in_flight = self.enter();

        let mut request_len = 0;
        if let Some(mut transfer) = self.run_with_timeout(&mut ctx).await {
            let mut buffer = BytesMut::new();
            let outcome = loop {
                match transfer.next_chunk().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(failure)) => break Err(failure),
                    None => break Ok(()),
                }
            };
            match outcome {
                Ok(()) => {
                    ctx.response.body = buffer.freeze();
                    transfer.complete(&mut ctx);
                }
                Err(failure) => fail(&mut ctx, failure),
            }
            request_len = transfer.request_bytes();
        }

        let response_len = ctx.response.body.len();
        self.sink.report(&mut ctx, response_len, request_len);
        ctx
    }

    /// 处理已创建的执行上下文，控制流阶段结束后立即返回响应头
    ///
    /// 响应体在调用方拉取时才从后端读取并经过可流式处理的策略；
    /// 丢弃响应体流视为客户端断开。
    #[instrument(
        skip(self, ctx),
        fields(request_id = %ctx.id(), method = %ctx.request.method, path = %ctx.request.path)
    )]
    pub async fn stream(&self, mut ctx: ExecutionContext) -> StreamingResponse {
        let in_flight = self.enter();
        let transfer = self.run_with_timeout(&mut ctx).await;

        let status = ctx.response.status;
        let reason = ctx.response.reason.clone();
        let headers = ctx.response.headers.clone();

        let body = match transfer {
            Some(transfer) => StreamingBody {
                ctx,
                transfer,
                sink: Arc::clone(&self.sink),
                finished: false,
                _in_flight: in_flight,
            }
            .into_stream(),
            None => {
                let body = ctx.response.body.clone();
                self.sink.report(&mut ctx, body.len(), 0);
                if body.is_empty() {
                    body_stream::empty()
                } else {
                    body_stream::once(body)
                }
            }
        };

        StreamingResponse {
            status,
            reason,
            headers,
            body,
        }
    }

    fn enter(&self) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let release: fn(Arc<AtomicUsize>) = release_count;

        #[cfg(feature = "monitoring")]
        let gauge = self.sink.metrics.clone().map(|metrics| {
            metrics.in_flight.inc();
            let release: fn(Arc<GatewayMetrics>) = release_gauge;
            scopeguard::guard(metrics, release)
        });

        InFlight {
            _count: scopeguard::guard(Arc::clone(&self.in_flight), release),
            #[cfg(feature = "monitoring")]
            _gauge: gauge,
        }
    }

    /// 在请求超时内执行控制流阶段
    ///
    /// 超时后取消令牌，再给流水线一个宽限期收尾；仍未结束则直接丢弃并返回 504。
    async fn run_with_timeout(&self, ctx: &mut ExecutionContext) -> Option<BodyTransfer> {
        let Some(timeout) = self.config.request_timeout() else {
            return self.pipeline(ctx, None).await;
        };

        let deadline = tokio::time::Instant::now() + timeout;
        let token = ctx.cancellation().clone();
        let grace = self.config.request_timeout_grace();
        let settled = {
            let pipeline = self.pipeline(ctx, Some(deadline));
            tokio::pin!(pipeline);
            tokio::select! {
                transfer = &mut pipeline => Some(transfer),
                _ = tokio::time::sleep_until(deadline) => {
                    if token.cancel(ExecutionFailure::request_timeout()) {
                        debug!("Request timed out after {:?}", timeout);
                    }
                    tokio::time::timeout(grace, &mut pipeline).await.ok()
                }
            }
        };

        match settled {
            None => {
                warn!("Request did not settle within the timeout grace period");
                fail(ctx, ExecutionFailure::request_timeout());
                None
            }
            Some(Some(_)) if token.is_cancelled() => {
                cancelled(ctx, &token);
                None
            }
            Some(transfer) => transfer,
        }
    }

    /// 控制流阶段：路由、计划选择、请求处理链、后端调用、响应处理链
    ///
    /// 成功时返回待传输的响应体；失败已写入 `ctx.response` 时返回 `None`。
    async fn pipeline(
        &self,
        ctx: &mut ExecutionContext,
        deadline: Option<tokio::time::Instant>,
    ) -> Option<BodyTransfer> {
        let token = ctx.cancellation().clone();

        // ===== 路由 =====
        let Some(route) = self
            .routes
            .resolve(ctx.request.host.as_deref(), &ctx.request.path)
        else {
            debug!("No API matches {}", ctx.request.path);
            fail(ctx, ExecutionFailure::no_api_found());
            ctx.response.set_header("connection", "close");
            return None;
        };
        let api = route.api;

        ctx.set_attribute(attributes::API, api.id());
        ctx.set_attribute(attributes::API_NAME, api.name());
        ctx.set_attribute(attributes::API_DEPLOYED_AT, api.deployed_at());
        ctx.set_attribute(attributes::CONTEXT_PATH, route.context_path);
        if let Some(mapped) = self.flows.resolve_mapped_path(&api, ctx) {
            ctx.set_attribute(attributes::MAPPED_PATH, mapped);
        }

        // ===== 安全计划 =====
        let selected = match cancellable(&token, self.selector.select(&api, ctx)).await {
            None => {
                cancelled(ctx, &token);
                return None;
            }
            Some(Ok(Some(selected))) => selected,
            Some(Ok(None)) => {
                fail(ctx, ExecutionFailure::missing_plan());
                return None;
            }
            Some(Err(e)) => {
                error!(api = api.id(), "Plan selection failed: {}", e);
                fail(ctx, ExecutionFailure::internal());
                return None;
            }
        };

        // ===== 请求阶段 =====
        let references = self.flows.resolve(&api, ctx, Phase::Request);
        let request_chain =
            match self.build_chain(Phase::Request, &selected.policies, &references) {
                Ok(chain) => chain,
                Err(failure) => {
                    fail(ctx, failure);
                    return None;
                }
            };
        let outcome = request_chain.execute(ctx).await;
        if !settled(ctx, outcome) {
            return None;
        }

        let mut streamable = request_chain.streamable();
        let request_bytes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&request_bytes);
        let request_body = transform_stream(streamable.clone(), ctx.take_request_body())
            .inspect(move |chunk| {
                if let Ok(chunk) = chunk {
                    counter.fetch_add(chunk.len(), Ordering::Relaxed);
                }
            })
            .boxed();
        ctx.set_request_body(request_body);

        // ===== 后端调用 =====
        let invoked_at = Instant::now();
        let body = match cancellable(&token, self.invoker.invoke(ctx)).await {
            None => {
                cancelled(ctx, &token);
                return None;
            }
            Some(Ok(body)) => body,
            Some(Err(e)) => {
                warn!(api = api.id(), "Backend invocation failed: {}", e);
                fail(ctx, ExecutionFailure::bad_gateway());
                return None;
            }
        };
        ctx.metrics.api_response_time_ms = Some(invoked_at.elapsed().as_millis() as u64);

        // ===== 响应阶段 =====
        let references = self.flows.resolve(&api, ctx, Phase::Response);
        let response_chain = match self.build_chain(Phase::Response, &[], &references) {
            Ok(chain) => chain,
            Err(failure) => {
                fail(ctx, failure);
                return None;
            }
        };
        let outcome = response_chain.execute(ctx).await;
        if !settled(ctx, outcome) {
            return None;
        }

        // ===== 响应体 =====
        let response_streamable = response_chain.streamable();
        let body = transform_stream(response_streamable.clone(), body);
        streamable.extend(response_streamable);

        Some(BodyTransfer {
            body,
            token,
            deadline,
            streamable,
            request_bytes,
            sent: 0,
        })
    }

    /// 构建处理链
    ///
    /// 认证策略总是严格解析：计划选中后缺少其认证策略时以 500 `POLICY_NOT_FOUND` 失败，
    /// 不受 `strict_policy_resolution` 影响。
    fn build_chain(
        &self,
        phase: Phase,
        security: &[PolicyReference],
        references: &[PolicyReference],
    ) -> Result<PolicyChain, ExecutionFailure> {
        let build_failure = |e: GatewayError| {
            error!("[{}] chain build failed: {}", phase, e);
            match e {
                GatewayError::PolicyNotFound(_) => ExecutionFailure::policy_not_found(),
                _ => ExecutionFailure::policy_fault(),
            }
        };

        let mut steps = self
            .policies
            .build_required(security)
            .map_err(build_failure)?;
        steps.extend(self.policies.build(references).map_err(build_failure)?);

        Ok(PolicyChain::new(phase, steps)
            .with_hooks(self.hooks.iter().cloned())
            .with_stats(Arc::clone(&self.chain_stats)))
    }
}

/// 处理链是否完成；未完成时记录失败键
fn settled(ctx: &mut ExecutionContext, outcome: ChainOutcome) -> bool {
    if outcome.is_completed() {
        return true;
    }
    if let Some(failure) = outcome.failure {
        ctx.metrics.error_key = failure.key;
    }
    false
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.abort();
        }
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("policies", &self.policies)
            .field("reporters", &self.sink.reporters.len())
            .field("hooks", &self.hooks.len())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
