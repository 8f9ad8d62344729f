//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! API 注册表与路由
//!
//! 注册表消费部署事件（部署/更新/卸载），维护一份不可变的路由表快照。
//! 每个事件在写锁内重建路由表并原子替换 `Arc` 指针；
//! 请求线程只克隆指针，不会因重新部署而阻塞或看到半更新状态。
//!
//! # 路由规则
//!
//! 在所有启用的 API 中，选择虚拟主机匹配且上下文路径是请求路径前缀的候选：
//!
//! 1. 上下文路径更长者优先
//! 2. 主机更具体者优先（精确主机 > 子域通配 > 任意主机）
//! 3. 部署时间更新者优先
//! 4. API ID 字典序

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::definition::{ApiDefinition, PathOperator};
use crate::error::GatewayError;
use crate::flow::{normalize_path, CompiledFlow, PathPattern};

// ============================================================================
// 编译后的 API
// ============================================================================

/// 已部署的 API
///
/// 定义的可执行形式：流程路径和路径映射在部署时编译，
/// 编译失败的定义不会被部署。
#[derive(Debug)]
pub struct Api {
    definition: ApiDefinition,
    flows: Vec<CompiledFlow>,
    plan_flows: HashMap<String, Vec<CompiledFlow>>,
    path_mappings: Vec<PathPattern>,
}

impl Api {
    pub fn compile(definition: ApiDefinition) -> Result<Self, GatewayError> {
        definition.validate().map_err(GatewayError::ConfigError)?;

        let flows = definition
            .flows
            .iter()
            .cloned()
            .map(CompiledFlow::compile)
            .collect::<Result<Vec<_>, _>>()?;

        let mut plan_flows = HashMap::new();
        for plan in &definition.plans {
            let compiled = plan
                .flows
                .iter()
                .cloned()
                .map(CompiledFlow::compile)
                .collect::<Result<Vec<_>, _>>()?;
            plan_flows.insert(plan.id.clone(), compiled);
        }

        let path_mappings = definition
            .path_mappings
            .iter()
            .map(|t| PathPattern::compile(t, PathOperator::StartsWith))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            definition,
            flows,
            plan_flows,
            path_mappings,
        })
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn deployed_at(&self) -> i64 {
        self.definition.deployed_at
    }

    pub fn definition(&self) -> &ApiDefinition {
        &self.definition
    }

    pub fn flows(&self) -> &[CompiledFlow] {
        &self.flows
    }

    pub fn plan_flows(&self, plan_id: &str) -> Option<&[CompiledFlow]> {
        self.plan_flows.get(plan_id).map(Vec::as_slice)
    }

    pub fn path_mappings(&self) -> &[PathPattern] {
        &self.path_mappings
    }
}

// ============================================================================
// 路由表
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostMatcher {
    Any,
    /// `*.example.com`，保存为 `.example.com`
    Subdomain(String),
    Exact(String),
}

impl HostMatcher {
    fn parse(host: Option<&str>) -> Self {
        match host.map(|h| h.trim().to_ascii_lowercase()) {
            None => HostMatcher::Any,
            Some(h) if h.is_empty() || h == "*" => HostMatcher::Any,
            Some(h) => match h.strip_prefix('*') {
                Some(suffix) if suffix.starts_with('.') => HostMatcher::Subdomain(suffix.to_string()),
                _ => HostMatcher::Exact(h),
            },
        }
    }

    fn matches(&self, host: Option<&str>) -> bool {
        match (self, host) {
            (HostMatcher::Any, _) => true,
            (_, None) => false,
            (HostMatcher::Exact(expected), Some(h)) => expected == h,
            (HostMatcher::Subdomain(suffix), Some(h)) => {
                h.len() > suffix.len() && h.ends_with(suffix.as_str())
            }
        }
    }

    fn specificity(&self) -> u8 {
        match self {
            HostMatcher::Any => 0,
            HostMatcher::Subdomain(_) => 1,
            HostMatcher::Exact(_) => 2,
        }
    }
}

#[derive(Debug, Clone)]
struct Acceptor {
    host: HostMatcher,
    /// 规范化的上下文路径
    base_path: String,
    /// 定义中声明的原始上下文路径
    context_path: String,
    api: Arc<Api>,
}

#[derive(Debug, Default)]
struct RoutingTable {
    acceptors: Vec<Acceptor>,
}

impl RoutingTable {
    fn build<'a>(apis: impl Iterator<Item = &'a Arc<Api>>) -> Self {
        let mut acceptors: Vec<Acceptor> = apis
            .filter(|api| api.definition.enabled)
            .flat_map(|api| {
                api.definition.virtual_hosts.iter().map(move |vhost| Acceptor {
                    host: HostMatcher::parse(vhost.host.as_deref()),
                    base_path: normalize_path(&vhost.path),
                    context_path: vhost.path.clone(),
                    api: Arc::clone(api),
                })
            })
            .collect();

        acceptors.sort_by(|a, b| {
            b.base_path
                .len()
                .cmp(&a.base_path.len())
                .then_with(|| b.host.specificity().cmp(&a.host.specificity()))
                .then_with(|| b.api.deployed_at().cmp(&a.api.deployed_at()))
                .then_with(|| a.api.id().cmp(b.api.id()))
        });

        Self { acceptors }
    }

    fn resolve(&self, host: Option<&str>, path: &str) -> Option<RouteMatch> {
        let host = host.map(strip_port);
        let path = normalize_path(path);
        self.acceptors
            .iter()
            .find(|a| a.host.matches(host.as_deref()) && path.starts_with(a.base_path.as_str()))
            .map(|a| RouteMatch {
                api: Arc::clone(&a.api),
                context_path: a.context_path.clone(),
            })
    }
}

/// 去掉 Host 头中的端口；IPv6 字面量保留方括号（`[::1]:8080` -> `[::1]`）
fn strip_port(host: &str) -> String {
    let host = host.trim().to_ascii_lowercase();
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => host[..=end].to_string(),
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port))
            if !name.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            name.to_string()
        }
        _ => host,
    }
}

/// 路由结果
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub api: Arc<Api>,
    /// 命中的上下文路径
    pub context_path: String,
}

/// 路由解析器
pub trait RouteResolver: Send + Sync {
    /// 把 (host, path) 映射到唯一的已部署 API，没有匹配时返回 `None`
    fn resolve(&self, host: Option<&str>, path: &str) -> Option<RouteMatch>;
}

// ============================================================================
// 部署事件
// ============================================================================

/// 部署事件
#[derive(Debug, Clone)]
pub enum DeploymentEvent {
    Deploy(ApiDefinition),
    Update(ApiDefinition),
    Undeploy(String),
}

/// 事件处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentOutcome {
    Deployed,
    Updated,
    Undeployed,
    /// 同一版本重复投递，或卸载不存在的 API
    Unchanged,
    /// 比已部署版本更旧的定义
    Ignored,
}

/// 注册表统计
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub deployed: u64,
    pub updated: u64,
    pub undeployed: u64,
    pub unchanged: u64,
    pub ignored: u64,
    pub rejected: u64,
}

// ============================================================================
// 注册表
// ============================================================================

/// API 注册表
pub struct ApiRegistry {
    /// 权威集合；持锁期间完成事件应用和路由表重建
    apis: Mutex<HashMap<String, Arc<Api>>>,
    table: RwLock<Arc<RoutingTable>>,
    stats: RwLock<RegistryStats>,
}

impl ApiRegistry {
    pub fn new() -> Self {
        Self {
            apis: Mutex::new(HashMap::new()),
            table: RwLock::new(Arc::new(RoutingTable::default())),
            stats: RwLock::new(RegistryStats::default()),
        }
    }

    /// 应用部署事件
    ///
    /// 事件是幂等的：相同 ID 与部署时间的重复投递不产生变化。
    ///
    /// # 返回
    /// - `Ok(outcome)`: 事件已处理
    /// - `Err(GatewayError::ConfigError)`: 定义无效，注册表保持不变
    pub fn apply(&self, event: DeploymentEvent) -> Result<DeploymentOutcome, GatewayError> {
        let mut apis = self.apis.lock();

        let outcome = match event {
            DeploymentEvent::Deploy(definition) | DeploymentEvent::Update(definition) => {
                let existing = apis.get(&definition.id).map(|a| a.deployed_at());
                match existing {
                    Some(current) if current == definition.deployed_at => {
                        debug!("API {} already deployed at {}, skipping", definition.id, current);
                        DeploymentOutcome::Unchanged
                    }
                    Some(current) if current > definition.deployed_at => {
                        warn!(
                            "Ignoring stale definition of API {} (deployed_at {} < {})",
                            definition.id, definition.deployed_at, current
                        );
                        DeploymentOutcome::Ignored
                    }
                    _ => {
                        let id = definition.id.clone();
                        let api = match Api::compile(definition) {
                            Ok(api) => api,
                            Err(e) => {
                                warn!("Rejecting definition of API {}: {}", id, e);
                                self.stats.write().rejected += 1;
                                return Err(e);
                            }
                        };
                        let replaced = apis.insert(id.clone(), Arc::new(api)).is_some();
                        if replaced {
                            info!("API {} updated", id);
                            DeploymentOutcome::Updated
                        } else {
                            info!("API {} deployed", id);
                            DeploymentOutcome::Deployed
                        }
                    }
                }
            }
            DeploymentEvent::Undeploy(id) => {
                if apis.remove(&id).is_some() {
                    info!("API {} undeployed", id);
                    DeploymentOutcome::Undeployed
                } else {
                    debug!("API {} not deployed, nothing to undeploy", id);
                    DeploymentOutcome::Unchanged
                }
            }
        };

        if matches!(
            outcome,
            DeploymentOutcome::Deployed | DeploymentOutcome::Updated | DeploymentOutcome::Undeployed
        ) {
            let table = Arc::new(RoutingTable::build(apis.values()));
            *self.table.write() = table;
        }

        let mut stats = self.stats.write();
        match outcome {
            DeploymentOutcome::Deployed => stats.deployed += 1,
            DeploymentOutcome::Updated => stats.updated += 1,
            DeploymentOutcome::Undeployed => stats.undeployed += 1,
            DeploymentOutcome::Unchanged => stats.unchanged += 1,
            DeploymentOutcome::Ignored => stats.ignored += 1,
        }

        Ok(outcome)
    }

    /// 部署
    pub fn deploy(&self, definition: ApiDefinition) -> Result<DeploymentOutcome, GatewayError> {
        self.apply(DeploymentEvent::Deploy(definition))
    }

    /// 卸载
    pub fn undeploy(&self, api_id: &str) -> Result<DeploymentOutcome, GatewayError> {
        self.apply(DeploymentEvent::Undeploy(api_id.to_string()))
    }

    pub fn get(&self, api_id: &str) -> Option<Arc<Api>> {
        self.apis.lock().get(api_id).cloned()
    }

    /// 已部署的 API 数量（包括未启用的）
    pub fn len(&self) -> usize {
        self.apis.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RegistryStats {
        self.stats.read().clone()
    }

    fn snapshot(&self) -> Arc<RoutingTable> {
        Arc::clone(&self.table.read())
    }
}

impl Default for ApiRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteResolver for ApiRegistry {
    fn resolve(&self, host: Option<&str>, path: &str) -> Option<RouteMatch> {
        let table = self.snapshot();
        let matched = table.resolve(host, path);
        if let Some(m) = &matched {
            debug!("Request {} resolved to API {}", path, m.api.id());
        }
        matched
    }
}
