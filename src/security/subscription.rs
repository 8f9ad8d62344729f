//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 订阅查询
//!
//! 订阅把应用绑定到某个 API 的某个计划。计划选择时，凭证（API Key、JWT client_id、
//! 客户端证书）解析出的订阅必须属于被评估的计划，且处于有效期内。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::constants::DEFAULT_SUBSCRIPTION_CACHE_CAPACITY;
use crate::error::GatewayError;

/// 订阅状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Pending,
    Accepted,
    Paused,
    Rejected,
    Closed,
}

/// 订阅
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub api: String,
    pub plan: String,
    pub application: String,
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub valid_to: Option<DateTime<Utc>>,
    /// API Key 凭证
    #[serde(default)]
    pub api_key: Option<String>,
    /// OAuth2/JWT 客户端ID或证书指纹
    #[serde(default)]
    pub client_id: Option<String>,
}

impl Subscription {
    pub fn new(
        id: impl Into<String>,
        api: impl Into<String>,
        plan: impl Into<String>,
        application: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            api: api.into(),
            plan: plan.into(),
            application: application.into(),
            status: SubscriptionStatus::Accepted,
            valid_from: None,
            valid_to: None,
            api_key: None,
            client_id: None,
        }
    }

    pub fn with_status(mut self, status: SubscriptionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_validity(
        mut self,
        valid_from: Option<DateTime<Utc>>,
        valid_to: Option<DateTime<Utc>>,
    ) -> Self {
        self.valid_from = valid_from;
        self.valid_to = valid_to;
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// 在给定时间点是否有效：已接受，且 `valid_from <= at < valid_to`
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Accepted
            && self.valid_from.map_or(true, |from| from <= at)
            && self.valid_to.map_or(true, |to| at < to)
    }
}

/// 订阅查询服务
#[async_trait]
pub trait SubscriptionService: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Subscription>, GatewayError>;

    async fn find_by_api_key(
        &self,
        api: &str,
        api_key: &str,
    ) -> Result<Option<Subscription>, GatewayError>;

    async fn find_by_client_id(
        &self,
        api: &str,
        client_id: &str,
    ) -> Result<Option<Subscription>, GatewayError>;
}

// ============================================================================
// 内存实现
// ============================================================================

/// 内存订阅服务
#[derive(Debug, Default)]
pub struct InMemorySubscriptionService {
    subscriptions: DashMap<String, Subscription>,
    /// (api, api_key) -> 订阅ID
    api_keys: DashMap<(String, String), String>,
    /// (api, client_id) -> 订阅ID
    client_ids: DashMap<(String, String), String>,
}

impl InMemorySubscriptionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// 保存订阅并更新凭证索引
    pub fn save(&self, subscription: Subscription) {
        self.remove(&subscription.id);

        if let Some(key) = &subscription.api_key {
            self.api_keys.insert(
                (subscription.api.clone(), key.clone()),
                subscription.id.clone(),
            );
        }
        if let Some(client_id) = &subscription.client_id {
            self.client_ids.insert(
                (subscription.api.clone(), client_id.clone()),
                subscription.id.clone(),
            );
        }
        debug!("保存订阅: {} (plan {})", subscription.id, subscription.plan);
        self.subscriptions.insert(subscription.id.clone(), subscription);
    }

    pub fn remove(&self, id: &str) -> Option<Subscription> {
        let (_, removed) = self.subscriptions.remove(id)?;
        if let Some(key) = &removed.api_key {
            self.api_keys.remove(&(removed.api.clone(), key.clone()));
        }
        if let Some(client_id) = &removed.client_id {
            self.client_ids.remove(&(removed.api.clone(), client_id.clone()));
        }
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    fn lookup(&self, index: &DashMap<(String, String), String>, api: &str, credential: &str) -> Option<Subscription> {
        let id = index
            .get(&(api.to_string(), credential.to_string()))
            .map(|id| id.value().clone())?;
        self.subscriptions.get(&id).map(|s| s.value().clone())
    }
}

#[async_trait]
impl SubscriptionService for InMemorySubscriptionService {
    async fn find_by_id(&self, id: &str) -> Result<Option<Subscription>, GatewayError> {
        Ok(self.subscriptions.get(id).map(|s| s.value().clone()))
    }

    async fn find_by_api_key(
        &self,
        api: &str,
        api_key: &str,
    ) -> Result<Option<Subscription>, GatewayError> {
        Ok(self.lookup(&self.api_keys, api, api_key))
    }

    async fn find_by_client_id(
        &self,
        api: &str,
        client_id: &str,
    ) -> Result<Option<Subscription>, GatewayError> {
        Ok(self.lookup(&self.client_ids, api, client_id))
    }
}

// ============================================================================
// 缓存装饰器
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Id(String),
    ApiKey(String, String),
    ClientId(String, String),
}

/// 带 LRU 缓存的订阅服务
///
/// 只缓存命中的结果；未找到的查询每次都会落到底层服务。
pub struct CachedSubscriptionService {
    inner: Arc<dyn SubscriptionService>,
    cache: Mutex<LruCache<CacheKey, Subscription>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CachedSubscriptionService {
    pub fn new(inner: Arc<dyn SubscriptionService>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn with_default_capacity(inner: Arc<dyn SubscriptionService>) -> Self {
        Self::new(inner, DEFAULT_SUBSCRIPTION_CACHE_CAPACITY)
    }

    /// 使某个订阅的所有缓存项失效
    pub fn invalidate(&self, subscription_id: &str) {
        let mut cache = self.cache.lock();
        let stale: Vec<CacheKey> = cache
            .iter()
            .filter(|(_, s)| s.id == subscription_id)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            cache.pop(&key);
        }
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    async fn cached<F, Fut>(&self, key: CacheKey, load: F) -> Result<Option<Subscription>, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Option<Subscription>, GatewayError>>,
    {
        if let Some(hit) = self.cache.lock().get(&key).cloned() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!("Subscription cache hit: {:?}", key);
            return Ok(Some(hit));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let loaded = load().await?;
        if let Some(subscription) = &loaded {
            self.cache.lock().put(key, subscription.clone());
        }
        Ok(loaded)
    }
}

#[async_trait]
impl SubscriptionService for CachedSubscriptionService {
    async fn find_by_id(&self, id: &str) -> Result<Option<Subscription>, GatewayError> {
        self.cached(CacheKey::Id(id.to_string()), || self.inner.find_by_id(id))
            .await
    }

    async fn find_by_api_key(
        &self,
        api: &str,
        api_key: &str,
    ) -> Result<Option<Subscription>, GatewayError> {
        self.cached(
            CacheKey::ApiKey(api.to_string(), api_key.to_string()),
            || self.inner.find_by_api_key(api, api_key),
        )
        .await
    }

    async fn find_by_client_id(
        &self,
        api: &str,
        client_id: &str,
    ) -> Result<Option<Subscription>, GatewayError> {
        self.cached(
            CacheKey::ClientId(api.to_string(), client_id.to_string()),
            || self.inner.find_by_client_id(api, client_id),
        )
        .await
    }
}
