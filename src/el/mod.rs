//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 条件表达式模块
//!
//! 流程条件、步骤条件和计划选择规则都是字符串表达式，
//! 通过 [`ConditionEvaluator`] 在请求作用域上求值为布尔值。
//!
//! # 语义
//!
//! - 空表达式（`None` 或空白）视为 true
//! - 解析或求值失败视为 false，并记录 warn 日志
//! - 求值无副作用，可并发调用
//!
//! # 方言
//!
//! - [`LiteralConditionEvaluator`]：只接受 `true` / `false`
//! - [`ExpressionConditionEvaluator`]：`{#request.method == 'GET' && ...}` 模板表达式，
//!   非 `{}` 包裹的文本回退到字面量方言

pub mod ast;
pub mod parser;
pub mod scope;

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{trace, warn};

pub use ast::Expr;
pub use parser::parse_expression;
pub use scope::EvaluationScope;

use crate::constants::DEFAULT_EXPRESSION_CACHE_CAPACITY;

/// 表达式错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    /// 语法错误
    #[error("表达式语法错误: {0}")]
    Parse(String),
    /// 类型错误
    #[error("表达式类型错误: {0}")]
    Type(String),
}

impl From<EvaluationError> for crate::error::GatewayError {
    fn from(err: EvaluationError) -> Self {
        crate::error::GatewayError::EvaluationError(err.to_string())
    }
}

/// 条件求值器
pub trait ConditionEvaluator: Send + Sync {
    /// 求值器名称
    fn name(&self) -> &str;

    /// 求值非空表达式，错误交给调用方处理
    fn try_evaluate(&self, expression: &str, scope: &EvaluationScope)
        -> Result<bool, EvaluationError>;

    /// 求值条件
    ///
    /// 空表达式为 true；失败时记录警告并返回 false。
    fn evaluate(&self, expression: Option<&str>, scope: &EvaluationScope) -> bool {
        let expression = match expression.map(str::trim) {
            None | Some("") => return true,
            Some(e) => e,
        };

        match self.try_evaluate(expression, scope) {
            Ok(result) => {
                trace!("Condition {:?} evaluated to {}", expression, result);
                result
            }
            Err(e) => {
                warn!(
                    evaluator = self.name(),
                    "Condition {:?} could not be evaluated, treating as false: {}",
                    expression,
                    e
                );
                false
            }
        }
    }
}

// ============================================================================
// 字面量方言
// ============================================================================

/// 字面量求值器
#[derive(Debug, Clone, Default)]
pub struct LiteralConditionEvaluator;

impl ConditionEvaluator for LiteralConditionEvaluator {
    fn name(&self) -> &str {
        "literal"
    }

    fn try_evaluate(
        &self,
        expression: &str,
        _scope: &EvaluationScope,
    ) -> Result<bool, EvaluationError> {
        match expression.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(EvaluationError::Parse(format!("不是布尔字面量: {}", other))),
        }
    }
}

// ============================================================================
// 模板表达式方言
// ============================================================================

type CachedParse = Result<Arc<Expr>, EvaluationError>;

/// 模板表达式求值器
///
/// 解析结果（包括失败）缓存在有界 LRU 中，同一表达式只解析一次。
pub struct ExpressionConditionEvaluator {
    cache: Mutex<LruCache<String, CachedParse>>,
    literal: LiteralConditionEvaluator,
}

impl ExpressionConditionEvaluator {
    pub fn new(cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            literal: LiteralConditionEvaluator,
        }
    }

    /// 已缓存的表达式数量
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }

    fn compile(&self, source: &str) -> CachedParse {
        if let Some(hit) = self.cache.lock().get(source) {
            return hit.clone();
        }

        let parsed = parse_expression(source).map(Arc::new);
        self.cache.lock().put(source.to_string(), parsed.clone());
        parsed
    }
}

impl Default for ExpressionConditionEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_EXPRESSION_CACHE_CAPACITY)
    }
}

impl std::fmt::Debug for ExpressionConditionEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpressionConditionEvaluator")
            .field("cached", &self.cached())
            .finish()
    }
}

impl ConditionEvaluator for ExpressionConditionEvaluator {
    fn name(&self) -> &str {
        "expression"
    }

    fn try_evaluate(
        &self,
        expression: &str,
        scope: &EvaluationScope,
    ) -> Result<bool, EvaluationError> {
        let trimmed = expression.trim();
        match trimmed
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
        {
            Some(inner) => self.compile(inner)?.evaluate(scope),
            None => self.literal.try_evaluate(trimmed, scope),
        }
    }
}
