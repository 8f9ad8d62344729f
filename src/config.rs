//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 配置模块
//!
//! 定义网关运行时配置，支持从YAML/TOML文本或文件加载。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::constants::*;
use crate::error::GatewayError;

/// 网关配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// 请求超时（毫秒，0 表示不限制）
    pub request_timeout_ms: u64,
    /// 超时后留给响应阶段的宽限时间（毫秒）
    pub request_timeout_grace_ms: u64,
    /// 限流计数器配置
    pub rate_limit: RateLimitConfig,
    /// 安全链配置
    pub security: SecurityConfig,
    /// 上报配置
    pub reporting: ReportingConfig,
    /// 订阅缓存容量
    pub subscription_cache_capacity: usize,
    /// 表达式解析缓存容量
    pub expression_cache_capacity: usize,
    /// 严格策略解析：未注册的策略使链构建失败，否则跳过并告警
    pub strict_policy_resolution: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            request_timeout_grace_ms: DEFAULT_REQUEST_TIMEOUT_GRACE_MS,
            rate_limit: RateLimitConfig::default(),
            security: SecurityConfig::default(),
            reporting: ReportingConfig::default(),
            subscription_cache_capacity: DEFAULT_SUBSCRIPTION_CACHE_CAPACITY,
            expression_cache_capacity: DEFAULT_EXPRESSION_CACHE_CAPACITY,
            strict_policy_resolution: true,
        }
    }
}

impl GatewayConfig {
    /// 从YAML文本加载
    pub fn from_yaml_str(content: &str) -> Result<Self, GatewayError> {
        let config: GatewayConfig = serde_yaml::from_str(content)?;
        config.validate().map_err(GatewayError::ConfigError)?;
        Ok(config)
    }

    /// 从TOML文本加载
    pub fn from_toml_str(content: &str) -> Result<Self, GatewayError> {
        let config: GatewayConfig = toml::from_str(content)?;
        config.validate().map_err(GatewayError::ConfigError)?;
        Ok(config)
    }

    /// 从文件加载，按扩展名选择格式
    ///
    /// # 参数
    /// - `path`: 配置文件路径（`.yaml`/`.yml`/`.toml`）
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        debug!("Loading gateway config from {}", path.display());

        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            Some("toml") => Self::from_toml_str(&content),
            other => Err(GatewayError::ConfigError(format!(
                "不支持的配置文件格式: {:?}",
                other
            ))),
        }
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), String> {
        if self.request_timeout_ms > 0 && self.request_timeout_grace_ms > self.request_timeout_ms
        {
            return Err("超时宽限时间不能大于请求超时".to_string());
        }

        self.rate_limit.validate()?;
        self.security.validate()?;

        if self.subscription_cache_capacity == 0 {
            return Err("订阅缓存容量必须大于0".to_string());
        }

        if self.expression_cache_capacity == 0 {
            return Err("表达式缓存容量必须大于0".to_string());
        }

        Ok(())
    }

    /// 请求超时，`None` 表示不限制
    pub fn request_timeout(&self) -> Option<Duration> {
        if self.request_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.request_timeout_ms))
        }
    }

    pub fn request_timeout_grace(&self) -> Duration {
        Duration::from_millis(self.request_timeout_grace_ms)
    }
}

/// 限流计数器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// 瞬时存储错误的最大重试次数
    pub max_retries: u32,
    /// 重试初始退避（毫秒）
    pub retry_initial_backoff_ms: u64,
    /// 最大CAS尝试次数
    pub max_cas_attempts: u32,
    /// 过期计数器清理间隔（毫秒，0 表示不清理）
    pub cleanup_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_RATE_LIMIT_MAX_RETRIES,
            retry_initial_backoff_ms: DEFAULT_RATE_LIMIT_RETRY_BACKOFF_MS,
            max_cas_attempts: DEFAULT_RATE_LIMIT_MAX_CAS_ATTEMPTS,
            cleanup_interval_ms: DEFAULT_RATE_LIMIT_CLEANUP_INTERVAL_MS,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_cas_attempts == 0 {
            return Err("max_cas_attempts 必须大于0".to_string());
        }
        if self.max_retries > 10 {
            return Err(format!("max_retries 过大: {}（最大 10）", self.max_retries));
        }
        Ok(())
    }

    pub fn retry_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_initial_backoff_ms)
    }

    pub fn cleanup_interval(&self) -> Option<Duration> {
        (self.cleanup_interval_ms > 0).then(|| Duration::from_millis(self.cleanup_interval_ms))
    }
}

/// 安全链配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// API Key 请求头
    pub api_key_header: String,
    /// API Key 查询参数
    pub api_key_query_param: String,
    /// 认证处理器顺序覆盖（处理器名称 -> 顺序）
    pub handler_orders: HashMap<String, i32>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            api_key_header: DEFAULT_API_KEY_HEADER.to_string(),
            api_key_query_param: DEFAULT_API_KEY_QUERY_PARAM.to_string(),
            handler_orders: HashMap::new(),
        }
    }
}

impl SecurityConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.api_key_header.trim().is_empty() {
            return Err("api_key_header 不能为空".to_string());
        }
        if self.api_key_query_param.trim().is_empty() {
            return Err("api_key_query_param 不能为空".to_string());
        }
        let known = ["mtls", "api-key", "jwt", "oauth2", "key-less"];
        for name in self.handler_orders.keys() {
            if !known.contains(&name.as_str()) {
                return Err(format!(
                    "未知的认证处理器: {}, 有效值: {:?}",
                    name, known
                ));
            }
        }
        Ok(())
    }

    /// 获取处理器顺序，未覆盖时使用默认值
    pub fn handler_order(&self, name: &str, default: i32) -> i32 {
        self.handler_orders.get(name).copied().unwrap_or(default)
    }
}

/// 上报配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReportingConfig {
    /// 是否上报请求指标
    pub enabled: bool,
    /// 是否记录请求/响应日志
    pub log_requests: bool,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_requests: false,
        }
    }
}
