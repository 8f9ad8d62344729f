//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 计数器存储
//!
//! 存储只提供两个原语：读取和带版本的条件更新。
//! 原子的 increment-and-get 由 [`RateLimiter`](super::RateLimiter) 在其上用 CAS 循环实现。

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::StorageError;

/// 限流计数器
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitCounter {
    pub key: String,
    pub counter: u64,
    pub limit: u64,
    /// 窗口结束时间（epoch 毫秒）
    pub reset_time: i64,
    pub subscription: Option<String>,
    /// 单调递增的版本号，由存储在写入时分配
    pub version: u64,
}

impl RateLimitCounter {
    pub fn new(key: impl Into<String>, limit: u64, reset_time: i64) -> Self {
        Self {
            key: key.into(),
            counter: 0,
            limit,
            reset_time,
            subscription: None,
            version: 0,
        }
    }

    pub fn with_subscription(mut self, subscription: Option<String>) -> Self {
        self.subscription = subscription;
        self
    }
}

/// 条件更新结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// 写入成功，返回存储后的计数器（含新版本号）
    Updated(RateLimitCounter),
    /// 版本不匹配，调用方需要重新读取
    Conflict,
}

/// 计数器存储接口
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<RateLimitCounter>, StorageError>;

    /// 条件更新
    ///
    /// # 参数
    /// - `expected_version`: 调用方读取到的版本；`None` 表示仅在计数器不存在时创建
    /// - `counter`: 新值，版本号由存储覆盖为 `expected_version + 1`（新建时为 1）
    async fn conditional_update(
        &self,
        key: &str,
        expected_version: Option<u64>,
        counter: RateLimitCounter,
    ) -> Result<UpdateOutcome, StorageError>;

    /// 清理窗口已经结束的计数器
    ///
    /// 键会自动过期的存储无需实现。
    ///
    /// # 返回
    /// 被移除的数量
    async fn purge_expired(&self, _now_millis: i64) -> Result<usize, StorageError> {
        Ok(0)
    }
}

/// 下一个版本号
pub(crate) fn next_version(expected_version: Option<u64>) -> u64 {
    expected_version.map_or(1, |v| v + 1)
}

/// 内存计数器存储
///
/// `DashMap` 的 entry 持有分片写锁，比较与写入在同一临界区内完成。
#[derive(Debug, Default)]
pub struct MemoryRateLimitStore {
    counters: DashMap<String, RateLimitCounter>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<RateLimitCounter>, StorageError> {
        Ok(self.counters.get(key).map(|c| c.value().clone()))
    }

    async fn conditional_update(
        &self,
        key: &str,
        expected_version: Option<u64>,
        mut counter: RateLimitCounter,
    ) -> Result<UpdateOutcome, StorageError> {
        counter.version = next_version(expected_version);

        match self.counters.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if Some(entry.get().version) != expected_version {
                    trace!("CAS conflict on {}: stored version {}", key, entry.get().version);
                    return Ok(UpdateOutcome::Conflict);
                }
                entry.insert(counter.clone());
            }
            Entry::Vacant(entry) => {
                if expected_version.is_some() {
                    return Ok(UpdateOutcome::Conflict);
                }
                entry.insert(counter.clone());
            }
        }

        Ok(UpdateOutcome::Updated(counter))
    }

    async fn purge_expired(&self, now_millis: i64) -> Result<usize, StorageError> {
        let before = self.counters.len();
        self.counters.retain(|_, c| c.reset_time > now_millis);
        let purged = before.saturating_sub(self.counters.len());
        if purged > 0 {
            trace!("Purged {} expired counters", purged);
        }
        Ok(purged)
    }
}
