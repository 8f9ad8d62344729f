//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 指标上报
//!
//! 每个请求（包括失败路径）产生一条 [`MetricsRecord`]，由 [`Reporter`] 发送到外部系统。
//! 上报失败或 panic 只记录日志，不影响已经生成的响应。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::GatewayRequest;
use crate::error::GatewayError;

/// 请求/响应日志
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestLog {
    pub request_headers: HashMap<String, String>,
    pub response_headers: HashMap<String, String>,
    pub request_body_len: usize,
    pub response_body_len: usize,
}

/// 单个请求的指标记录
#[derive(Debug, Clone, Serialize)]
pub struct MetricsRecord {
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub host: Option<String>,
    pub uri: String,
    pub remote_address: Option<String>,
    pub api_id: Option<String>,
    pub api_name: Option<String>,
    pub plan_id: Option<String>,
    pub application: Option<String>,
    pub subscription: Option<String>,
    pub security_type: Option<String>,
    /// 匹配到的路径映射模板
    pub mapped_path: Option<String>,
    pub status: u16,
    pub error_key: Option<String>,
    /// 网关总耗时（毫秒）
    pub latency_ms: u64,
    /// 后端调用耗时（毫秒）
    pub api_response_time_ms: Option<u64>,
    pub request_content_length: usize,
    pub response_content_length: usize,
    pub log: Option<RequestLog>,
}

impl MetricsRecord {
    pub fn new(request: &GatewayRequest) -> Self {
        Self {
            request_id: request.id,
            timestamp: Utc::now(),
            method: request.method.to_string(),
            host: request.host.clone(),
            uri: request.path.clone(),
            remote_address: request.remote_address.clone(),
            api_id: None,
            api_name: None,
            plan_id: None,
            application: None,
            subscription: None,
            security_type: None,
            mapped_path: None,
            status: 0,
            error_key: None,
            latency_ms: 0,
            api_response_time_ms: None,
            request_content_length: request.body.len(),
            response_content_length: 0,
            log: None,
        }
    }
}

/// 上报器
pub trait Reporter: Send + Sync {
    fn name(&self) -> &str;

    fn report(&self, record: &MetricsRecord) -> Result<(), GatewayError>;
}

/// 上报并吞掉错误与 panic
pub(crate) fn emit(reporters: &[Arc<dyn Reporter>], record: &MetricsRecord) {
    for reporter in reporters {
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| reporter.report(record)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Reporter {} failed: {}", reporter.name(), e),
            Err(_) => warn!("Reporter {} panicked, record dropped", reporter.name()),
        }
    }
}

/// 基于 tracing 的上报器
///
/// 每个请求输出一行结构化日志。
#[derive(Debug, Clone, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn name(&self) -> &str {
        "tracing"
    }

    fn report(&self, record: &MetricsRecord) -> Result<(), GatewayError> {
        info!(
            target: "gateron::metrics",
            request_id = %record.request_id,
            api = record.api_id.as_deref().unwrap_or("-"),
            plan = record.plan_id.as_deref().unwrap_or("-"),
            application = record.application.as_deref().unwrap_or("-"),
            mapped_path = record.mapped_path.as_deref().unwrap_or("-"),
            status = record.status,
            error_key = record.error_key.as_deref().unwrap_or("-"),
            latency_ms = record.latency_ms,
            "{} {}",
            record.method,
            record.uri
        );
        Ok(())
    }
}
