//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 策略
//!
//! 策略是请求处理链中的一个步骤。`execute` 的返回值是唯一的控制信号：
//! 继续、失败（携带 [`ExecutionFailure`]）或中断。
//!
//! 策略实例由 [`PolicyFactory`] 在构建处理链时根据不透明的 JSON 配置创建，
//! 每次构建都是新实例，不在请求之间共享可变状态。

pub mod builtin;
pub mod chain;
pub mod hook;
pub mod stream;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::context::ExecutionContext;
use crate::definition::PolicyReference;
use crate::error::{ExecutionFailure, GatewayError};

pub use chain::{ChainOutcome, ChainState, ChainStats, ChainStep, PolicyChain};
pub use hook::{ChainHook, TracingHook};

// ============================================================================
// 策略接口
// ============================================================================

/// 策略执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyResult {
    /// 继续执行下一个策略
    Continue,
    /// 失败，剩余策略被跳过，失败写入响应
    Fail(ExecutionFailure),
    /// 中断，剩余策略被跳过，响应保持策略写入的内容
    Interrupt,
}

/// 策略
#[async_trait]
pub trait Policy: Send + Sync {
    /// 策略类型ID
    fn id(&self) -> &str;

    /// 执行策略
    ///
    /// # 返回
    /// - `Ok(PolicyResult)`: 控制信号
    /// - `Err(_)`: 策略内部错误，链以 500 `POLICY_EXECUTION_ERROR` 失败
    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<PolicyResult, GatewayError>;

    /// 是否参与响应体的流式阶段
    fn is_streamable(&self) -> bool {
        false
    }

    /// 转换一个响应体分片
    fn transform_chunk(&self, chunk: Bytes) -> Result<Bytes, GatewayError> {
        Ok(chunk)
    }

    /// 流式阶段结束后回写上下文
    fn finish_stream(&self, _ctx: &mut ExecutionContext) {}
}

// ============================================================================
// 策略工厂
// ============================================================================

/// 策略工厂
pub trait PolicyFactory: Send + Sync {
    /// 工厂负责的策略类型ID
    fn id(&self) -> &str;

    /// 根据不透明配置创建策略实例
    fn create(&self, configuration: Option<&str>) -> Result<Arc<dyn Policy>, GatewayError>;
}

type CreateFn =
    dyn Fn(Option<&str>) -> Result<Arc<dyn Policy>, GatewayError> + Send + Sync + 'static;

/// 基于闭包的工厂
pub struct FnPolicyFactory {
    id: String,
    create: Box<CreateFn>,
}

impl FnPolicyFactory {
    pub fn new<F>(id: impl Into<String>, create: F) -> Self
    where
        F: Fn(Option<&str>) -> Result<Arc<dyn Policy>, GatewayError> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            create: Box::new(create),
        }
    }
}

impl PolicyFactory for FnPolicyFactory {
    fn id(&self) -> &str {
        &self.id
    }

    fn create(&self, configuration: Option<&str>) -> Result<Arc<dyn Policy>, GatewayError> {
        (self.create)(configuration)
    }
}

// ============================================================================
// 策略注册表
// ============================================================================

/// 策略注册表
///
/// 策略类型ID到工厂的映射。严格模式下引用未注册的策略会使处理链构建失败；
/// 宽松模式下跳过并记录警告。
pub struct PolicyRegistry {
    factories: RwLock<HashMap<String, Arc<dyn PolicyFactory>>>,
    strict: bool,
}

impl std::fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyRegistry")
            .field("policies", &self.list())
            .field("strict", &self.strict)
            .finish()
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            strict: true,
        }
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// 注册工厂
    ///
    /// # 返回
    /// - `Err(GatewayError::ConfigError)`: 同名策略已存在
    pub fn register(&self, factory: Arc<dyn PolicyFactory>) -> Result<(), GatewayError> {
        let mut factories = self.factories.write();
        let id = factory.id().to_string();

        if factories.contains_key(&id) {
            let error_msg = format!("策略 '{}' 已存在", id);
            warn!("{}", error_msg);
            return Err(GatewayError::ConfigError(error_msg));
        }

        info!("注册策略: {}", id);
        factories.insert(id, factory);
        debug!("当前注册的策略数量: {}", factories.len());
        Ok(())
    }

    /// 以闭包注册工厂
    pub fn register_fn<F>(&self, id: &str, create: F) -> Result<(), GatewayError>
    where
        F: Fn(Option<&str>) -> Result<Arc<dyn Policy>, GatewayError> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnPolicyFactory::new(id, create)))
    }

    pub fn unregister(&self, id: &str) -> Result<(), GatewayError> {
        match self.factories.write().remove(id) {
            Some(_) => {
                info!("注销策略: {}", id);
                Ok(())
            }
            None => Err(GatewayError::PolicyNotFound(id.to_string())),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.read().contains_key(id)
    }

    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.factories.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 为一组策略引用创建实例
    ///
    /// 已禁用的引用被忽略。
    ///
    /// # 返回
    /// - `Err(GatewayError::PolicyNotFound)`: 严格模式下引用了未注册的策略
    /// - `Err(GatewayError::PolicyConfigurationError)`: 工厂拒绝了配置
    pub fn build(&self, references: &[PolicyReference]) -> Result<Vec<ChainStep>, GatewayError> {
        self.build_with(references, self.strict)
    }

    /// 为认证策略创建实例
    ///
    /// 与 [`build`](Self::build) 相同，但无论注册表是否宽松，缺失的策略都会使构建失败：
    /// 计划一旦选中就必须被执行。
    pub fn build_required(
        &self,
        references: &[PolicyReference],
    ) -> Result<Vec<ChainStep>, GatewayError> {
        self.build_with(references, true)
    }

    fn build_with(
        &self,
        references: &[PolicyReference],
        strict: bool,
    ) -> Result<Vec<ChainStep>, GatewayError> {
        let factories = self.factories.read();
        let mut steps = Vec::with_capacity(references.len());

        for reference in references.iter().filter(|r| r.enabled) {
            let Some(factory) = factories.get(&reference.policy) else {
                if strict {
                    warn!("Policy {} is not registered", reference.policy);
                    return Err(GatewayError::PolicyNotFound(reference.policy.clone()));
                }
                warn!("Policy {} is not registered, skipping", reference.policy);
                continue;
            };

            let policy = factory
                .create(reference.configuration.as_deref())
                .map_err(|e| match e {
                    GatewayError::PolicyConfigurationError { .. } => e,
                    other => GatewayError::PolicyConfigurationError {
                        policy: reference.policy.clone(),
                        message: other.to_string(),
                    },
                })?;

            steps.push(ChainStep::new(
                reference.name.clone().unwrap_or_else(|| reference.policy.clone()),
                policy,
            ));
        }

        Ok(steps)
    }
}
