//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 安全计划选择
//!
//! 按顺序尝试认证处理器；对每个处理器，按计划顺序评估其服务的安全类型的计划。
//! 第一个满足以下条件的候选胜出：
//!
//! 1. 处理器可以处理该请求；
//! 2. 计划的选择规则为真（作用域中可访问处理器提供的认证上下文，例如 `#token`）；
//! 3. 凭证解析出的订阅属于该计划且仍然有效。
//!
//! 胜出的计划记录在上下文中，其认证策略会被放到请求阶段处理链的最前面。

pub mod handlers;
pub mod subscription;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::config::SecurityConfig;
use crate::constants::{attributes, DEFAULT_API_KEY_HANDLER_ORDER, DEFAULT_JWT_HANDLER_ORDER,
    DEFAULT_KEYLESS_HANDLER_ORDER, DEFAULT_MTLS_HANDLER_ORDER, DEFAULT_OAUTH2_HANDLER_ORDER};
use crate::context::ExecutionContext;
use crate::definition::{Plan, PolicyReference, SecurityType};
use crate::el::ConditionEvaluator;
use crate::error::GatewayError;
use crate::registry::Api;

pub use handlers::{
    decode_jwt_claims, ApiKeyAuthenticationHandler, JwtAuthenticationHandler,
    KeylessAuthenticationHandler, MtlsAuthenticationHandler, OAuth2AuthenticationHandler,
    API_KEY_POLICY, JWT_POLICY, OAUTH2_POLICY,
};
pub use subscription::{
    CachedSubscriptionService, InMemorySubscriptionService, Subscription, SubscriptionService,
    SubscriptionStatus,
};

/// 无订阅的 keyless 请求使用的应用ID
pub const KEYLESS_APPLICATION: &str = "1";

/// 认证处理器
#[async_trait]
pub trait AuthenticationHandler: Send + Sync {
    fn name(&self) -> &str;

    /// 顺序，越小越先尝试
    fn order(&self) -> i32;

    /// 服务的安全类型
    fn security_type(&self) -> SecurityType;

    fn can_handle(&self, ctx: &ExecutionContext) -> bool;

    /// 暴露给选择规则的额外变量
    fn context_variables(&self, _ctx: &ExecutionContext) -> Vec<(String, Value)> {
        Vec::new()
    }

    /// 请求携带的原始凭证
    fn token(&self, _ctx: &ExecutionContext) -> Option<String> {
        None
    }

    /// 没有订阅时是否拒绝候选计划
    fn requires_subscription(&self) -> bool {
        false
    }

    /// 用凭证查找订阅
    async fn resolve_subscription(
        &self,
        _api: &str,
        _ctx: &ExecutionContext,
        _subscriptions: &dyn SubscriptionService,
    ) -> Result<Option<Subscription>, GatewayError> {
        Ok(None)
    }

    /// 认证策略（有序）
    fn handle(&self, plan: &Plan) -> Vec<PolicyReference>;
}

/// 选中的计划
#[derive(Debug, Clone)]
pub struct SelectedPlan {
    pub plan: Plan,
    pub handler: String,
    pub security_type: SecurityType,
    pub subscription: Option<Subscription>,
    /// 需要放到请求处理链最前面的认证策略
    pub policies: Vec<PolicyReference>,
}

/// 安全计划选择器
pub struct SecurityPlanSelector {
    handlers: Vec<Arc<dyn AuthenticationHandler>>,
    evaluator: Arc<dyn ConditionEvaluator>,
    subscriptions: Arc<dyn SubscriptionService>,
}

impl SecurityPlanSelector {
    pub fn new(
        evaluator: Arc<dyn ConditionEvaluator>,
        subscriptions: Arc<dyn SubscriptionService>,
    ) -> Self {
        Self {
            handlers: Vec::new(),
            evaluator,
            subscriptions,
        }
    }

    /// 使用内置处理器，顺序取自配置
    pub fn with_default_handlers(
        evaluator: Arc<dyn ConditionEvaluator>,
        subscriptions: Arc<dyn SubscriptionService>,
        config: &SecurityConfig,
    ) -> Self {
        Self::new(evaluator, subscriptions)
            .with_handler(Arc::new(MtlsAuthenticationHandler::new().with_order(
                config.handler_order("mtls", DEFAULT_MTLS_HANDLER_ORDER),
            )))
            .with_handler(Arc::new(
                ApiKeyAuthenticationHandler::new(
                    config.api_key_header.clone(),
                    config.api_key_query_param.clone(),
                )
                .with_order(config.handler_order("api-key", DEFAULT_API_KEY_HANDLER_ORDER)),
            ))
            .with_handler(Arc::new(JwtAuthenticationHandler::new().with_order(
                config.handler_order("jwt", DEFAULT_JWT_HANDLER_ORDER),
            )))
            .with_handler(Arc::new(OAuth2AuthenticationHandler::new().with_order(
                config.handler_order("oauth2", DEFAULT_OAUTH2_HANDLER_ORDER),
            )))
            .with_handler(Arc::new(KeylessAuthenticationHandler::new().with_order(
                config.handler_order("key-less", DEFAULT_KEYLESS_HANDLER_ORDER),
            )))
    }

    /// 添加处理器（保持按顺序排列，同顺序保留添加次序）
    pub fn with_handler(mut self, handler: Arc<dyn AuthenticationHandler>) -> Self {
        self.handlers.push(handler);
        self.handlers.sort_by_key(|h| h.order());
        self
    }

    pub fn handlers(&self) -> impl Iterator<Item = &str> {
        self.handlers.iter().map(|h| h.name())
    }

    /// 选择计划
    ///
    /// 选中时把计划、应用、订阅和安全类型写入上下文属性，并把处理器变量绑定到上下文。
    ///
    /// # 返回
    /// - `Ok(None)`: 没有满足条件的候选
    /// - `Err`: 订阅查询失败
    pub async fn select(
        &self,
        api: &Api,
        ctx: &mut ExecutionContext,
    ) -> Result<Option<SelectedPlan>, GatewayError> {
        let mut plans: Vec<&Plan> = api.definition().plans.iter().collect();
        plans.sort_by_key(|p| p.order);

        let now = Utc::now();

        for handler in &self.handlers {
            let security_type = handler.security_type();
            let candidates: Vec<&Plan> = plans
                .iter()
                .copied()
                .filter(|p| p.security == security_type)
                .collect();
            if candidates.is_empty() || !handler.can_handle(ctx) {
                continue;
            }

            let variables = handler.context_variables(ctx);
            let mut scope = ctx.scope();
            for (name, value) in &variables {
                scope.bind(name.clone(), value.clone());
            }

            let subscription = handler
                .resolve_subscription(api.id(), ctx, self.subscriptions.as_ref())
                .await?;

            for plan in candidates {
                if !self
                    .evaluator
                    .evaluate(plan.selection_rule.as_deref(), &scope)
                {
                    trace!(plan = %plan.id, "Selection rule rejected plan");
                    continue;
                }

                match &subscription {
                    Some(sub) if sub.plan != plan.id => {
                        trace!(plan = %plan.id, subscription = %sub.id, "Subscription belongs to another plan");
                        continue;
                    }
                    Some(sub) if !sub.is_valid_at(now) => {
                        debug!(plan = %plan.id, subscription = %sub.id, "Subscription is not valid");
                        continue;
                    }
                    None if handler.requires_subscription() => continue,
                    _ => {}
                }

                debug!(
                    api = api.id(),
                    plan = %plan.id,
                    handler = handler.name(),
                    "Security plan selected"
                );

                let selected = SelectedPlan {
                    plan: plan.clone(),
                    handler: handler.name().to_string(),
                    security_type: security_type.clone(),
                    subscription: subscription.clone(),
                    policies: handler.handle(plan),
                };
                self.record(ctx, handler.as_ref(), &selected, variables);
                return Ok(Some(selected));
            }
        }

        debug!(api = api.id(), "No security plan matches the request");
        Ok(None)
    }

    fn record(
        &self,
        ctx: &mut ExecutionContext,
        handler: &dyn AuthenticationHandler,
        selected: &SelectedPlan,
        variables: Vec<(String, Value)>,
    ) {
        ctx.set_attribute(attributes::PLAN, selected.plan.id.clone());
        ctx.set_attribute(attributes::SECURITY_TYPE, selected.security_type.to_string());

        match &selected.subscription {
            Some(sub) => {
                ctx.set_attribute(attributes::APPLICATION, sub.application.clone());
                ctx.set_attribute(attributes::SUBSCRIPTION_ID, sub.id.clone());
            }
            None if selected.security_type == SecurityType::KeyLess => {
                let remote = ctx
                    .request
                    .remote_address
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string());
                ctx.set_attribute(attributes::APPLICATION, KEYLESS_APPLICATION);
                ctx.set_attribute(attributes::SUBSCRIPTION_ID, remote);
            }
            None => {}
        }

        if let Some(token) = handler.token(ctx) {
            ctx.set_attribute(attributes::SECURITY_TOKEN, token);
        }
        for (name, value) in variables {
            ctx.bind_variable(name, value);
        }
    }
}
