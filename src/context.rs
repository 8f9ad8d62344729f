//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 执行上下文
//!
//! 每个请求独占一个 [`ExecutionContext`]：请求视图、响应视图、类型化属性、
//! 取消令牌和该请求的指标记录。上下文从不在请求间共享。

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::definition::HttpMethod;
use crate::el::scope::string_map;
use crate::el::EvaluationScope;
use crate::error::ExecutionFailure;
use crate::policy::stream::{self, BodyStream};
use crate::reporter::MetricsRecord;

// ============================================================================
// 请求与响应
// ============================================================================

/// 网关请求视图
#[derive(Clone)]
pub struct GatewayRequest {
    /// 请求ID
    pub id: Uuid,
    pub method: HttpMethod,
    pub host: Option<String>,
    pub path: String,
    /// 请求头（键为小写）
    pub headers: HashMap<String, String>,
    pub query_params: HashMap<String, String>,
    pub body: Bytes,
    pub remote_address: Option<String>,
    /// 客户端证书指纹（mTLS 终止后由传输层填入）
    pub client_certificate: Option<String>,
}

impl std::fmt::Debug for GatewayRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("GatewayRequest");
        debug
            .field("id", &self.id)
            .field("method", &self.method)
            .field("host", &self.host)
            .field("path", &self.path);

        // 脱敏 headers
        let headers: HashMap<&String, &str> = self
            .headers
            .iter()
            .map(|(k, v)| {
                let k_lower = k.to_lowercase();
                let v = if k_lower.contains("auth")
                    || k_lower.contains("cookie")
                    || k_lower.contains("key")
                {
                    "***"
                } else {
                    v.as_str()
                };
                (k, v)
            })
            .collect();
        debug.field("headers", &headers);

        // 脱敏 query_params
        let query_params: HashMap<&String, &str> = self
            .query_params
            .iter()
            .map(|(k, v)| {
                let k_lower = k.to_lowercase();
                let v = if k_lower.contains("token")
                    || k_lower.contains("key")
                    || k_lower.contains("secret")
                {
                    "***"
                } else {
                    v.as_str()
                };
                (k, v)
            })
            .collect();
        debug.field("query_params", &query_params);

        debug
            .field("body_len", &self.body.len())
            .field("remote_address", &self.remote_address)
            .field(
                "client_certificate",
                &self.client_certificate.as_ref().map(|_| "***"),
            )
            .finish()
    }
}

impl GatewayRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            method,
            host: None,
            path: path.into(),
            headers: HashMap::new(),
            query_params: HashMap::new(),
            body: Bytes::new(),
            remote_address: None,
            client_certificate: None,
        }
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    /// 添加HTTP头
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_lowercase(), value.to_string());
        self
    }

    /// 添加查询参数
    pub fn with_query_param(mut self, key: &str, value: &str) -> Self {
        self.query_params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_remote_address(mut self, address: &str) -> Self {
        self.remote_address = Some(address.to_string());
        self
    }

    pub fn with_client_certificate(mut self, fingerprint: &str) -> Self {
        self.client_certificate = Some(fingerprint.to_string());
        self
    }

    /// 获取HTTP头（不区分大小写）
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(&key.to_lowercase()).map(String::as_str)
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query_params.get(key).map(String::as_str)
    }
}

/// 网关响应视图
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    pub reason: Option<String>,
    /// 响应头（键为小写）
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl Default for GatewayResponse {
    fn default() -> Self {
        Self {
            status: 200,
            reason: None,
            headers: HashMap::new(),
            body: Bytes::new(),
        }
    }
}

impl GatewayResponse {
    pub fn set_header(&mut self, key: &str, value: impl Into<String>) {
        self.headers.insert(key.to_lowercase(), value.into());
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(&key.to_lowercase()).map(String::as_str)
    }

    /// 把执行失败写入响应
    pub fn apply_failure(&mut self, failure: &ExecutionFailure) {
        self.status = failure.status;
        self.reason = failure.key.clone();
        self.set_header(
            "content-type",
            failure
                .content_type
                .clone()
                .unwrap_or_else(|| "application/json".to_string()),
        );
        self.body = Bytes::from(failure.to_body());
    }
}

// ============================================================================
// 属性
// ============================================================================

/// 类型化属性值
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Bool(bool),
    Json(Value),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            AttributeValue::String(s) => Value::String(s.clone()),
            AttributeValue::Int(i) => Value::from(*i),
            AttributeValue::Bool(b) => Value::Bool(*b),
            AttributeValue::Json(v) => v.clone(),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl From<Value> for AttributeValue {
    fn from(value: Value) -> Self {
        AttributeValue::Json(value)
    }
}

// ============================================================================
// 取消令牌
// ============================================================================

#[derive(Debug, Default)]
struct CancellationInner {
    cancelled: AtomicBool,
    reason: Mutex<Option<ExecutionFailure>>,
    notify: Notify,
}

/// 取消令牌
///
/// 客户端断开或请求超时时触发；只有第一次取消的原因会被保留。
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<CancellationInner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取消，返回本次调用是否真正触发了取消
    pub fn cancel(&self, reason: ExecutionFailure) -> bool {
        {
            let mut slot = self.inner.reason.lock();
            if self.inner.cancelled.load(Ordering::Acquire) {
                return false;
            }
            *slot = Some(reason);
            self.inner.cancelled.store(true, Ordering::Release);
        }
        self.inner.notify.notify_waiters();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// 取消原因，未设置时视为客户端断开
    pub fn reason(&self) -> Option<ExecutionFailure> {
        if !self.is_cancelled() {
            return None;
        }
        Some(
            self.inner
                .reason
                .lock()
                .clone()
                .unwrap_or_else(ExecutionFailure::client_closed),
        )
    }

    /// 等待取消
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

// ============================================================================
// 执行上下文
// ============================================================================

/// 请求体流的存放位置
///
/// 流本身不是 `Sync`，放在锁里让上下文可以跨 `await` 共享引用。
#[derive(Default)]
struct RequestBody(Mutex<Option<BodyStream>>);

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.lock().as_ref() {
            Some(_) => f.write_str("BodyStream"),
            None => f.write_str("None"),
        }
    }
}

/// 执行上下文
#[derive(Debug)]
pub struct ExecutionContext {
    pub request: GatewayRequest,
    pub response: GatewayResponse,
    request_body: RequestBody,
    attributes: HashMap<String, AttributeValue>,
    /// 额外绑定到表达式作用域的根变量（例如 `token`）
    variables: HashMap<String, Value>,
    cancellation: CancellationToken,
    /// 该请求的指标记录
    pub metrics: MetricsRecord,
    started_at: Instant,
}

impl ExecutionContext {
    pub fn new(request: GatewayRequest) -> Self {
        let metrics = MetricsRecord::new(&request);
        Self {
            request,
            response: GatewayResponse::default(),
            request_body: RequestBody::default(),
            attributes: HashMap::new(),
            variables: HashMap::new(),
            cancellation: CancellationToken::new(),
            metrics,
            started_at: Instant::now(),
        }
    }

    /// 以分片流提供请求体，替代 [`GatewayRequest::body`]
    pub fn with_request_body_stream(mut self, body: BodyStream) -> Self {
        *self.request_body.0.get_mut() = Some(body);
        self
    }

    /// 取出请求体流
    ///
    /// 未设置流时由 [`GatewayRequest::body`] 生成。后端调用器通过它读取
    /// 经过请求阶段可流式处理策略后的请求体。
    pub fn take_request_body(&mut self) -> BodyStream {
        match self.request_body.0.get_mut().take() {
            Some(body) => body,
            None if self.request.body.is_empty() => stream::empty(),
            None => stream::once(self.request.body.clone()),
        }
    }

    pub fn set_request_body(&mut self, body: BodyStream) {
        *self.request_body.0.get_mut() = Some(body);
    }

    pub fn id(&self) -> Uuid {
        self.request.id
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(name.into(), value.into());
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// 字符串属性的便捷访问
    pub fn attribute_str(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(AttributeValue::as_str)
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<AttributeValue> {
        self.attributes.remove(name)
    }

    pub fn attributes(&self) -> &HashMap<String, AttributeValue> {
        &self.attributes
    }

    /// 绑定额外的表达式根变量
    pub fn bind_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn unbind_variable(&mut self, name: &str) -> Option<Value> {
        self.variables.remove(name)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// 去掉上下文路径后的请求路径
    pub fn path_info(&self) -> &str {
        let context_path = self
            .attribute_str(crate::constants::attributes::CONTEXT_PATH)
            .unwrap_or("");
        let context_path = context_path.trim_end_matches('/');
        match self.request.path.strip_prefix(context_path) {
            Some(rest) if rest.is_empty() => "/",
            Some(rest) => rest,
            None => &self.request.path,
        }
    }

    /// 构建表达式作用域
    ///
    /// 暴露 `#request`、`#response`、`#context.attributes` 以及额外绑定的变量。
    pub fn scope(&self) -> EvaluationScope {
        let context_path = self
            .attribute_str(crate::constants::attributes::CONTEXT_PATH)
            .unwrap_or("")
            .to_string();

        let request = json!({
            "id": self.request.id.to_string(),
            "method": self.request.method.as_str(),
            "host": self.request.host,
            "path": self.request.path,
            "pathInfo": self.path_info(),
            "contextPath": context_path,
            "headers": string_map(&self.request.headers),
            "params": string_map(&self.request.query_params),
            "remoteAddress": self.request.remote_address,
        });

        let response = json!({
            "status": self.response.status,
            "headers": string_map(&self.response.headers),
        });

        let attributes: Map<String, Value> = self
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();

        let mut scope = EvaluationScope::new()
            .with_variable("request", request)
            .with_variable("response", response)
            .with_variable("context", json!({ "attributes": attributes }));

        for (name, value) in &self.variables {
            scope.bind(name.clone(), value.clone());
        }

        scope
    }
}
