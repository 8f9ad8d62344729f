//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 错误类型定义
//!
//! 使用thiserror定义网关内部错误，以及对客户端可见的执行失败 [`ExecutionFailure`]。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::keys;

/// 网关错误类型
#[derive(Error, Debug)]
pub enum GatewayError {
    /// 配置错误
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// 存储错误
    #[error("存储错误: {0}")]
    StorageError(#[from] StorageError),

    /// 策略未注册
    #[error("策略未注册: {0}")]
    PolicyNotFound(String),

    /// 策略配置无效
    #[error("策略配置无效 [{policy}]: {message}")]
    PolicyConfigurationError { policy: String, message: String },

    /// 策略执行错误
    #[error("策略执行错误: {0}")]
    PolicyError(String),

    /// 表达式求值错误
    #[error("表达式求值错误: {0}")]
    EvaluationError(String),

    /// 后端调用错误
    #[error("后端调用错误: {0}")]
    InvokerError(String),

    /// IO错误
    #[error("IO错误: {0}")]
    IoError(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// YAML解析错误
    #[error("YAML解析错误: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML解析错误
    #[error("TOML解析错误: {0}")]
    TomlError(#[from] toml::de::Error),

    /// 响应体传输中止（响应头已发出）
    #[error("响应体传输中止: {0}")]
    Aborted(ExecutionFailure),

    /// 其他错误
    #[error("未知错误: {0}")]
    Other(String),
}

/// 存储错误
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// 连接错误
    #[error("连接错误: {0}")]
    ConnectionError(String),

    /// 查询错误
    #[error("查询错误: {0}")]
    QueryError(String),

    /// 超时错误
    #[error("超时错误: {0}")]
    TimeoutError(String),

    /// 版本冲突（乐观并发控制）
    #[error("版本冲突: {0}")]
    Conflict(String),

    /// 未找到
    #[error("未找到: {0}")]
    NotFound(String),
}

impl StorageError {
    /// 是否为可重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::ConnectionError(_) | StorageError::TimeoutError(_)
        )
    }
}

// ============================================================================
// 执行失败
// ============================================================================

/// 执行失败
///
/// 策略、安全链或网关自身中断请求时写回客户端的失败描述。
/// `key` 是稳定的机器可读错误码（例如 `RATE_LIMIT_TOO_MANY_REQUESTS`），
/// `message` 面向客户端，不包含内部细节。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    /// HTTP 状态码
    pub status: u16,
    /// 错误码
    pub key: Option<String>,
    /// 错误消息
    pub message: Option<String>,
    /// 响应内容类型
    pub content_type: Option<String>,
}

impl ExecutionFailure {
    /// 创建新的执行失败
    pub fn new(status: u16) -> Self {
        Self {
            status,
            key: None,
            message: None,
            content_type: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// 404：没有匹配的API
    pub fn no_api_found() -> Self {
        Self::new(404)
            .with_key(keys::NO_API_FOUND)
            .with_message("No context-path matches the request URI.")
    }

    /// 401：没有可用的安全计划
    pub fn missing_plan() -> Self {
        Self::new(401)
            .with_key(keys::GATEWAY_MISSING_SECURED_REQUEST_PLAN)
            .with_message("Unauthorized")
    }

    /// 500：策略内部错误
    pub fn policy_fault() -> Self {
        Self::new(500)
            .with_key(keys::POLICY_EXECUTION_ERROR)
            .with_message("Internal Server Error")
    }

    /// 500：策略未注册
    pub fn policy_not_found() -> Self {
        Self::new(500)
            .with_key(keys::POLICY_NOT_FOUND)
            .with_message("Internal Server Error")
    }

    /// 504：请求超时
    pub fn request_timeout() -> Self {
        Self::new(504)
            .with_key(keys::REQUEST_TIMEOUT)
            .with_message("Request timeout")
    }

    /// 499：客户端断开
    pub fn client_closed() -> Self {
        Self::new(499).with_key(keys::CLIENT_CLOSED_REQUEST)
    }

    /// 502：后端不可用
    pub fn bad_gateway() -> Self {
        Self::new(502)
            .with_key(keys::GATEWAY_INVOKER_ERROR)
            .with_message("Bad Gateway")
    }

    /// 500：网关内部错误
    pub fn internal() -> Self {
        Self::new(500)
            .with_key(keys::GATEWAY_INTERNAL_ERROR)
            .with_message("Internal Server Error")
    }

    /// 渲染为JSON响应体
    ///
    /// 格式为 `{"message": ..., "http_status_code": ...}`，
    /// 与客户端约定的错误响应保持一致。
    pub fn to_body(&self) -> String {
        serde_json::json!({
            "message": self.message.clone().unwrap_or_default(),
            "http_status_code": self.status,
        })
        .to_string()
    }
}

impl std::fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}",
            self.status,
            self.key.as_deref().unwrap_or("UNKNOWN")
        )?;
        if let Some(message) = &self.message {
            write!(f, ": {}", message)?;
        }
        Ok(())
    }
}
