//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 策略处理链
//!
//! 严格按顺序执行策略：前一个策略完成（包括异步等待）后才会开始下一个。
//!
//! # 状态
//!
//! `Pending → Running(i) → Running(i+1) | Failed | Interrupted | Completed`
//!
//! - 策略返回 `Fail`：失败写入响应，剩余策略跳过
//! - 策略返回 `Interrupt`：剩余策略跳过
//! - 策略返回错误或 panic：以 500 `POLICY_EXECUTION_ERROR` 失败，细节只进日志
//! - 取消令牌触发：在当前等待点结束，状态为 `Interrupted`，取消原因写入响应

use futures::FutureExt;
use parking_lot::RwLock;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, trace, warn};

use super::hook::{invoke_all, ChainHook};
use super::{Policy, PolicyResult};
use crate::context::ExecutionContext;
use crate::definition::Phase;
use crate::error::ExecutionFailure;

// ============================================================================
// 处理链节点
// ============================================================================

/// 处理链中的一个策略实例
#[derive(Clone)]
pub struct ChainStep {
    /// 步骤名称（未命名时为策略ID）
    pub name: String,
    pub policy: Arc<dyn Policy>,
}

impl ChainStep {
    pub fn new(name: impl Into<String>, policy: Arc<dyn Policy>) -> Self {
        Self {
            name: name.into(),
            policy,
        }
    }
}

impl std::fmt::Debug for ChainStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainStep")
            .field("name", &self.name)
            .field("policy", &self.policy.id())
            .finish()
    }
}

// ============================================================================
// 状态与结果
// ============================================================================

/// 处理链状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Pending,
    Running(usize),
    Completed,
    Failed,
    Interrupted,
}

/// 处理链执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainOutcome {
    /// 终止状态
    pub state: ChainState,
    /// 终止时所在的策略下标；完成时等于策略数量
    pub index: usize,
    /// 失败或被取消时写入响应的失败
    pub failure: Option<ExecutionFailure>,
}

impl ChainOutcome {
    fn completed(index: usize) -> Self {
        Self {
            state: ChainState::Completed,
            index,
            failure: None,
        }
    }

    fn failed(index: usize, failure: ExecutionFailure) -> Self {
        Self {
            state: ChainState::Failed,
            index,
            failure: Some(failure),
        }
    }

    fn interrupted(index: usize, failure: Option<ExecutionFailure>) -> Self {
        Self {
            state: ChainState::Interrupted,
            index,
            failure,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == ChainState::Completed
    }
}

/// 处理链统计信息
#[derive(Debug, Clone, Default)]
pub struct ChainStats {
    /// 总执行次数
    pub total_executions: u64,
    /// 完成次数
    pub completed_count: u64,
    /// 失败次数
    pub failed_count: u64,
    /// 中断次数
    pub interrupted_count: u64,
    /// 策略错误或 panic 次数
    pub fault_count: u64,
}

// ============================================================================
// 处理链
// ============================================================================

/// 策略处理链
pub struct PolicyChain {
    phase: Phase,
    steps: Vec<ChainStep>,
    hooks: Vec<Arc<dyn ChainHook>>,
    stats: Arc<RwLock<ChainStats>>,
}

impl std::fmt::Debug for PolicyChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyChain")
            .field("phase", &self.phase)
            .field("steps", &self.steps)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl PolicyChain {
    pub fn new(phase: Phase, steps: Vec<ChainStep>) -> Self {
        Self {
            phase,
            steps,
            hooks: Vec::new(),
            stats: Arc::new(RwLock::new(ChainStats::default())),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn ChainHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_hooks(mut self, hooks: impl IntoIterator<Item = Arc<dyn ChainHook>>) -> Self {
        self.hooks.extend(hooks);
        self
    }

    /// 共享统计信息（多个链可以汇总到同一份统计）
    pub fn with_stats(mut self, stats: Arc<RwLock<ChainStats>>) -> Self {
        self.stats = stats;
        self
    }

    /// 在链首插入步骤（安全策略在流程策略之前执行）
    pub fn prepend(&mut self, steps: Vec<ChainStep>) {
        self.steps.splice(0..0, steps);
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn steps(&self) -> &[ChainStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn stats(&self) -> ChainStats {
        self.stats.read().clone()
    }

    /// 声明为可流式处理的策略，按链中顺序
    pub fn streamable(&self) -> Vec<Arc<dyn Policy>> {
        self.steps
            .iter()
            .filter(|s| s.policy.is_streamable())
            .map(|s| Arc::clone(&s.policy))
            .collect()
    }

    /// 执行处理链
    pub async fn execute(&self, ctx: &mut ExecutionContext) -> ChainOutcome {
        let outcome = self.run(ctx).await;

        let mut stats = self.stats.write();
        stats.total_executions += 1;
        match outcome.state {
            ChainState::Completed => stats.completed_count += 1,
            ChainState::Failed => stats.failed_count += 1,
            ChainState::Interrupted => stats.interrupted_count += 1,
            ChainState::Pending | ChainState::Running(_) => {}
        }
        outcome
    }

    async fn run(&self, ctx: &mut ExecutionContext) -> ChainOutcome {
        let mut state = ChainState::Pending;
        let cancellation = ctx.cancellation().clone();

        for (index, step) in self.steps.iter().enumerate() {
            state = ChainState::Running(index);
            trace!("[{}] chain state {:?}", self.phase, state);

            if let Some(reason) = cancellation.reason() {
                return self.cancelled(ctx, step, index, reason);
            }

            invoke_all(&self.hooks, |h| h.pre(&step.name, self.phase, ctx));

            let result = {
                let execution = AssertUnwindSafe(step.policy.execute(ctx)).catch_unwind();
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => None,
                    result = execution => Some(result),
                }
            };

            match result {
                None => {
                    let reason = cancellation
                        .reason()
                        .unwrap_or_else(ExecutionFailure::client_closed);
                    return self.cancelled(ctx, step, index, reason);
                }
                Some(Ok(Ok(PolicyResult::Continue))) => {
                    invoke_all(&self.hooks, |h| h.post(&step.name, self.phase, ctx));
                }
                Some(Ok(Ok(PolicyResult::Fail(failure)))) => {
                    return self.fail(ctx, step, index, failure);
                }
                Some(Ok(Ok(PolicyResult::Interrupt))) => {
                    invoke_all(&self.hooks, |h| h.on_interrupt(&step.name, self.phase, ctx));
                    return ChainOutcome::interrupted(index, None);
                }
                Some(Ok(Err(e))) => {
                    error!(
                        request_id = %ctx.id(),
                        "[{}] policy {} failed: {}", self.phase, step.name, e
                    );
                    self.stats.write().fault_count += 1;
                    return self.fail(ctx, step, index, ExecutionFailure::policy_fault());
                }
                Some(Err(panic)) => {
                    error!(
                        request_id = %ctx.id(),
                        "[{}] policy {} panicked: {}",
                        self.phase,
                        step.name,
                        panic_message(panic.as_ref())
                    );
                    self.stats.write().fault_count += 1;
                    return self.fail(ctx, step, index, ExecutionFailure::policy_fault());
                }
            }
        }

        trace!("[{}] chain completed from {:?}", self.phase, state);
        ChainOutcome::completed(self.steps.len())
    }

    fn fail(
        &self,
        ctx: &mut ExecutionContext,
        step: &ChainStep,
        index: usize,
        failure: ExecutionFailure,
    ) -> ChainOutcome {
        ctx.response.apply_failure(&failure);
        invoke_all(&self.hooks, |h| h.on_failure(&step.name, self.phase, ctx, &failure));
        ChainOutcome::failed(index, failure)
    }

    fn cancelled(
        &self,
        ctx: &mut ExecutionContext,
        step: &ChainStep,
        index: usize,
        reason: ExecutionFailure,
    ) -> ChainOutcome {
        warn!(
            request_id = %ctx.id(),
            "[{}] chain cancelled before completing {}: {}", self.phase, step.name, reason
        );
        ctx.response.apply_failure(&reason);
        invoke_all(&self.hooks, |h| h.on_interrupt(&step.name, self.phase, ctx));
        ChainOutcome::interrupted(index, Some(reason))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
