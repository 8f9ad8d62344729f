//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 流程解析
//!
//! 给定已解析的 API 和请求，按声明顺序收集当前阶段适用的策略引用。
//! 一个流程只有在启用、方法匹配、路径匹配且条件为真时才会贡献策略；
//! 所有适用的流程都会贡献（不是第一个命中即停止）。

pub mod pattern;

use std::sync::Arc;
use tracing::{debug, trace};

use crate::context::ExecutionContext;
use crate::definition::{Flow, Phase, PolicyReference};
use crate::el::{ConditionEvaluator, EvaluationScope};
use crate::error::GatewayError;
use crate::registry::Api;

pub use pattern::{normalize_path, PathPattern};

/// 编译后的流程
#[derive(Debug, Clone)]
pub struct CompiledFlow {
    pub flow: Flow,
    pattern: PathPattern,
}

impl CompiledFlow {
    pub fn compile(flow: Flow) -> Result<Self, GatewayError> {
        let pattern = PathPattern::compile(&flow.path, flow.operator)?;
        Ok(Self { flow, pattern })
    }

    pub fn pattern(&self) -> &PathPattern {
        &self.pattern
    }
}

/// 流程解析器
#[derive(Clone)]
pub struct FlowResolver {
    evaluator: Arc<dyn ConditionEvaluator>,
}

impl FlowResolver {
    pub fn new(evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        Self { evaluator }
    }

    /// 解析指定阶段的策略引用
    ///
    /// 已选中计划的流程排在 API 流程之前。
    ///
    /// # 返回
    /// - 按声明顺序拼接的策略引用；从不失败，条件错误按 false 处理
    pub fn resolve(
        &self,
        api: &Api,
        ctx: &ExecutionContext,
        phase: Phase,
    ) -> Vec<PolicyReference> {
        let scope = ctx.scope();
        let path = normalize_path(ctx.path_info());

        let mut policies = Vec::new();
        if let Some(plan_flows) = ctx
            .attribute_str(crate::constants::attributes::PLAN)
            .and_then(|plan| api.plan_flows(plan))
        {
            policies.extend(self.collect(plan_flows, ctx, &scope, &path, phase));
        }
        policies.extend(self.collect(api.flows(), ctx, &scope, &path, phase));

        debug!(
            api = api.id(),
            phase = %phase,
            "Resolved {} policies for {} {}",
            policies.len(),
            ctx.request.method,
            path
        );
        policies
    }

    /// 解析任意流程列表（不含计划流程）
    pub fn resolve_flows(
        &self,
        flows: &[CompiledFlow],
        ctx: &ExecutionContext,
        phase: Phase,
    ) -> Vec<PolicyReference> {
        let scope = ctx.scope();
        let path = normalize_path(ctx.path_info());
        self.collect(flows, ctx, &scope, &path, phase)
    }

    /// 路径映射查找（仅用于指标）
    pub fn resolve_mapped_path(&self, api: &Api, ctx: &ExecutionContext) -> Option<String> {
        let path = normalize_path(ctx.path_info());
        pattern::most_specific(api.path_mappings(), &path).map(|p| p.template().to_string())
    }

    fn collect(
        &self,
        flows: &[CompiledFlow],
        ctx: &ExecutionContext,
        scope: &EvaluationScope,
        path: &str,
        phase: Phase,
    ) -> Vec<PolicyReference> {
        flows
            .iter()
            .filter(|compiled| self.applies(compiled, ctx, scope, path))
            .flat_map(|compiled| compiled.flow.steps(phase).iter())
            .filter(|step| step.enabled)
            .filter(|step| self.evaluator.evaluate(step.condition.as_deref(), scope))
            .cloned()
            .collect()
    }

    fn applies(
        &self,
        compiled: &CompiledFlow,
        ctx: &ExecutionContext,
        scope: &EvaluationScope,
        path: &str,
    ) -> bool {
        let flow = &compiled.flow;
        if !flow.enabled {
            trace!("Skipping disabled flow: {}", flow.name);
            return false;
        }
        if !flow.methods.is_empty() && !flow.methods.contains(&ctx.request.method) {
            return false;
        }
        if !compiled.pattern.matches(path) {
            return false;
        }
        self.evaluator.evaluate(flow.condition.as_deref(), scope)
    }
}
