//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 处理链钩子
//!
//! 钩子在每个策略执行前后以及失败、中断时被调用，用于日志、追踪等横切关注点。
//! 钩子内的 panic 会被捕获并记录，不会改变处理链的结果。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::context::ExecutionContext;
use crate::definition::Phase;
use crate::error::ExecutionFailure;

/// 处理链钩子
pub trait ChainHook: Send + Sync {
    fn name(&self) -> &str;

    fn pre(&self, _policy: &str, _phase: Phase, _ctx: &ExecutionContext) {}

    fn post(&self, _policy: &str, _phase: Phase, _ctx: &ExecutionContext) {}

    fn on_failure(
        &self,
        _policy: &str,
        _phase: Phase,
        _ctx: &ExecutionContext,
        _failure: &ExecutionFailure,
    ) {
    }

    fn on_interrupt(&self, _policy: &str, _phase: Phase, _ctx: &ExecutionContext) {}
}

/// 依次调用所有钩子，吞掉 panic
pub(crate) fn invoke_all<F>(hooks: &[Arc<dyn ChainHook>], f: F)
where
    F: Fn(&dyn ChainHook),
{
    for hook in hooks {
        if std::panic::catch_unwind(AssertUnwindSafe(|| f(hook.as_ref()))).is_err() {
            warn!("Hook {} panicked, ignoring", hook.name());
        }
    }
}

/// 输出调试日志的钩子
#[derive(Debug, Clone, Default)]
pub struct TracingHook;

impl ChainHook for TracingHook {
    fn name(&self) -> &str {
        "tracing"
    }

    fn pre(&self, policy: &str, phase: Phase, ctx: &ExecutionContext) {
        debug!(request_id = %ctx.id(), "[{}] -> {}", phase, policy);
    }

    fn post(&self, policy: &str, phase: Phase, ctx: &ExecutionContext) {
        debug!(request_id = %ctx.id(), "[{}] <- {}", phase, policy);
    }

    fn on_failure(
        &self,
        policy: &str,
        phase: Phase,
        ctx: &ExecutionContext,
        failure: &ExecutionFailure,
    ) {
        debug!(request_id = %ctx.id(), "[{}] {} failed: {}", phase, policy, failure);
    }

    fn on_interrupt(&self, policy: &str, phase: Phase, ctx: &ExecutionContext) {
        debug!(request_id = %ctx.id(), "[{}] {} interrupted the chain", phase, policy);
    }
}
