//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! API 定义模型
//!
//! 部署到网关的 API 定义是纯数据：虚拟主机、流程、计划和路径映射模板。
//! 定义可以从 JSON/YAML 文档反序列化；编译后的可执行形式见 [`crate::registry::Api`]。

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::GatewayError;

// ============================================================================
// 基础枚举
// ============================================================================

/// HTTP 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Connect,
    Delete,
    Get,
    Head,
    Options,
    Patch,
    Post,
    Put,
    Trace,
    Other,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Connect => "CONNECT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Trace => "TRACE",
            HttpMethod::Other => "OTHER",
        }
    }
}

impl FromStr for HttpMethod {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CONNECT" => Ok(HttpMethod::Connect),
            "DELETE" => Ok(HttpMethod::Delete),
            "GET" => Ok(HttpMethod::Get),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            "PATCH" => Ok(HttpMethod::Patch),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "TRACE" => Ok(HttpMethod::Trace),
            "" => Err(GatewayError::ConfigError("HTTP方法不能为空".to_string())),
            _ => Ok(HttpMethod::Other),
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 执行阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// 请求阶段（执行 `pre` 策略）
    Request,
    /// 响应阶段（执行 `post` 策略）
    Response,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Request => f.write_str("REQUEST"),
            Phase::Response => f.write_str("RESPONSE"),
        }
    }
}

/// 路径匹配操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PathOperator {
    /// 前缀匹配
    #[default]
    StartsWith,
    /// 完全匹配
    Equals,
}

/// 安全类型
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SecurityType {
    KeyLess,
    ApiKey,
    Jwt,
    OAuth2,
    Mtls,
    /// 插件提供的自定义安全类型
    Custom(String),
}

impl SecurityType {
    pub fn as_str(&self) -> &str {
        match self {
            SecurityType::KeyLess => "KEY_LESS",
            SecurityType::ApiKey => "API_KEY",
            SecurityType::Jwt => "JWT",
            SecurityType::OAuth2 => "OAUTH2",
            SecurityType::Mtls => "MTLS",
            SecurityType::Custom(name) => name,
        }
    }
}

impl From<String> for SecurityType {
    fn from(value: String) -> Self {
        match value.to_ascii_uppercase().replace('-', "_").as_str() {
            "KEY_LESS" | "KEYLESS" => SecurityType::KeyLess,
            "API_KEY" | "APIKEY" => SecurityType::ApiKey,
            "JWT" => SecurityType::Jwt,
            "OAUTH2" => SecurityType::OAuth2,
            "MTLS" => SecurityType::Mtls,
            _ => SecurityType::Custom(value),
        }
    }
}

impl From<SecurityType> for String {
    fn from(value: SecurityType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for SecurityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// 定义结构
// ============================================================================

/// 虚拟主机
///
/// `host` 为空或 `*` 时匹配任意主机；`*.example.com` 匹配其任意子域名。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualHost {
    #[serde(default)]
    pub host: Option<String>,
    pub path: String,
}

impl VirtualHost {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            host: None,
            path: path.into(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }
}

/// 策略引用
///
/// 策略在每次构建链时按 `policy` 标识从注册表实例化；
/// `configuration` 是不透明的 JSON 文本，由策略工厂自行解析。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyReference {
    pub policy: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_configuration")]
    pub configuration: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 步骤级条件，为假时跳过该策略
    #[serde(default)]
    pub condition: Option<String>,
}

impl PolicyReference {
    pub fn new(policy: impl Into<String>) -> Self {
        Self {
            policy: policy.into(),
            name: None,
            configuration: None,
            enabled: true,
            condition: None,
        }
    }

    pub fn with_configuration(mut self, configuration: impl Into<String>) -> Self {
        self.configuration = Some(configuration.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// 流程
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_flow_path")]
    pub path: String,
    #[serde(default)]
    pub operator: PathOperator,
    /// 为空表示匹配所有方法
    #[serde(default)]
    pub methods: BTreeSet<HttpMethod>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub pre: Vec<PolicyReference>,
    #[serde(default)]
    pub post: Vec<PolicyReference>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Flow {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            operator: PathOperator::StartsWith,
            methods: BTreeSet::new(),
            condition: None,
            pre: Vec::new(),
            post: Vec::new(),
            enabled: true,
        }
    }

    pub fn with_operator(mut self, operator: PathOperator) -> Self {
        self.operator = operator;
        self
    }

    pub fn with_methods(mut self, methods: impl IntoIterator<Item = HttpMethod>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_pre(mut self, policy: PolicyReference) -> Self {
        self.pre.push(policy);
        self
    }

    pub fn with_post(mut self, policy: PolicyReference) -> Self {
        self.post.push(policy);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// 指定阶段的策略列表
    pub fn steps(&self, phase: Phase) -> &[PolicyReference] {
        match phase {
            Phase::Request => &self.pre,
            Phase::Response => &self.post,
        }
    }
}

/// 计划
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub security: SecurityType,
    /// 交给认证处理器的安全配置（不透明 JSON 文本）
    #[serde(default, deserialize_with = "deserialize_configuration")]
    pub security_definition: Option<String>,
    #[serde(default)]
    pub selection_rule: Option<String>,
    #[serde(default)]
    pub order: i32,
    /// 仅在该计划被选中时执行的流程
    #[serde(default)]
    pub flows: Vec<Flow>,
}

impl Plan {
    pub fn new(id: impl Into<String>, security: SecurityType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            security,
            security_definition: None,
            selection_rule: None,
            order: 0,
            flows: Vec::new(),
        }
    }

    pub fn with_selection_rule(mut self, rule: impl Into<String>) -> Self {
        self.selection_rule = Some(rule.into());
        self
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn with_flow(mut self, flow: Flow) -> Self {
        self.flows.push(flow);
        self
    }

    pub fn with_security_definition(mut self, definition: impl Into<String>) -> Self {
        self.security_definition = Some(definition.into());
        self
    }
}

/// API 定义
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub virtual_hosts: Vec<VirtualHost>,
    #[serde(default)]
    pub flows: Vec<Flow>,
    #[serde(default)]
    pub plans: Vec<Plan>,
    /// 指标用的路径映射模板，例如 `/products/:id`
    #[serde(default)]
    pub path_mappings: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 部署时间戳（毫秒），同时作为定义版本
    #[serde(default)]
    pub deployed_at: i64,
}

impl ApiDefinition {
    pub fn new(id: impl Into<String>, context_path: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            virtual_hosts: vec![VirtualHost::new(context_path)],
            flows: Vec::new(),
            plans: Vec::new(),
            path_mappings: Vec::new(),
            enabled: true,
            deployed_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 从 JSON 文档解析
    pub fn from_json(content: &str) -> Result<Self, GatewayError> {
        let definition: ApiDefinition = serde_json::from_str(content)?;
        definition.validate().map_err(GatewayError::ConfigError)?;
        Ok(definition)
    }

    /// 从 YAML 文档解析
    pub fn from_yaml(content: &str) -> Result<Self, GatewayError> {
        let definition: ApiDefinition = serde_yaml::from_str(content)?;
        definition.validate().map_err(GatewayError::ConfigError)?;
        Ok(definition)
    }

    pub fn with_virtual_host(mut self, virtual_host: VirtualHost) -> Self {
        self.virtual_hosts.push(virtual_host);
        self
    }

    pub fn with_flow(mut self, flow: Flow) -> Self {
        self.flows.push(flow);
        self
    }

    pub fn with_plan(mut self, plan: Plan) -> Self {
        self.plans.push(plan);
        self
    }

    pub fn with_path_mapping(mut self, template: impl Into<String>) -> Self {
        self.path_mappings.push(template.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_deployed_at(mut self, deployed_at: i64) -> Self {
        self.deployed_at = deployed_at;
        self
    }

    pub fn plan(&self, plan_id: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.id == plan_id)
    }

    /// 校验定义
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("API ID不能为空".to_string());
        }

        if self.virtual_hosts.is_empty() {
            return Err(format!("API {} 至少需要一个虚拟主机", self.id));
        }

        for vhost in &self.virtual_hosts {
            if !vhost.path.starts_with('/') {
                return Err(format!(
                    "API {} 的上下文路径必须以 '/' 开头: {}",
                    self.id, vhost.path
                ));
            }
        }

        let mut plan_ids = ahash::AHashSet::new();
        for plan in &self.plans {
            if !plan_ids.insert(plan.id.as_str()) {
                return Err(format!("API {} 的计划ID重复: {}", self.id, plan.id));
            }
        }

        for flow in self.flows.iter().chain(self.plans.iter().flat_map(|p| &p.flows)) {
            for step in flow.pre.iter().chain(flow.post.iter()) {
                if step.policy.trim().is_empty() {
                    return Err(format!("流程 {} 包含空的策略标识", flow.name));
                }
            }
        }

        Ok(())
    }
}

// ============================================================================
// serde 辅助
// ============================================================================

fn default_enabled() -> bool {
    true
}

fn default_flow_path() -> String {
    "/".to_string()
}

/// 接受 JSON 字符串或任意 JSON 值，统一保存为文本
fn deserialize_configuration<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}
