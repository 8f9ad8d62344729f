//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 分布式限流计数器
//!
//! 固定窗口的 increment-and-get：读取（或惰性创建）计数器，窗口结束则归零并开启新窗口，
//! 自增后用条件更新写回。版本冲突时重新读取并重算；瞬时存储错误按指数退避有限次重试。
//!
//! # 示例
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use gateron::ratelimit::{MemoryRateLimitStore, RateLimiter};
//!
//! # async fn demo() -> Result<(), gateron::GatewayError> {
//! let limiter = RateLimiter::new(Arc::new(MemoryRateLimitStore::new()));
//! let result = limiter.increment_and_get("app:api:rate-limit", 2, Duration::from_secs(60)).await?;
//! assert!(!result.exceeded);
//! # Ok(())
//! # }
//! ```

pub mod clock;
#[cfg(feature = "redis")]
pub mod redis;
pub mod store;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use crate::config::RateLimitConfig;
use crate::error::{GatewayError, StorageError};

pub use clock::{Clock, ManualClock, SystemClock};
pub use store::{MemoryRateLimitStore, RateLimitCounter, RateLimitStore, UpdateOutcome};

#[cfg(feature = "monitoring")]
use crate::telemetry::GatewayMetrics;

/// increment-and-get 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    /// 自增后的计数
    pub count: u64,
    pub limit: u64,
    /// `count > limit`
    pub exceeded: bool,
    /// 窗口结束时间（epoch 毫秒）
    pub reset_time: i64,
    pub remaining: u64,
}

impl RateLimitResult {
    fn from_counter(counter: &RateLimitCounter) -> Self {
        Self {
            count: counter.counter,
            limit: counter.limit,
            exceeded: counter.counter > counter.limit,
            reset_time: counter.reset_time,
            remaining: counter.limit.saturating_sub(counter.counter),
        }
    }
}

/// 限流器统计
#[derive(Debug, Default, Clone)]
pub struct RateLimiterStats {
    /// 成功的自增次数
    pub increments: Arc<AtomicU64>,
    /// CAS 冲突次数
    pub cas_conflicts: Arc<AtomicU64>,
    /// 瞬时错误重试次数
    pub transient_retries: Arc<AtomicU64>,
    /// 最终失败次数
    pub failures: Arc<AtomicU64>,
}

impl RateLimiterStats {
    pub fn increments(&self) -> u64 {
        self.increments.load(Ordering::Relaxed)
    }

    pub fn cas_conflicts(&self) -> u64 {
        self.cas_conflicts.load(Ordering::Relaxed)
    }

    pub fn transient_retries(&self) -> u64 {
        self.transient_retries.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// 限流器
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
    stats: RateLimiterStats,
    #[cfg(feature = "monitoring")]
    metrics: Option<Arc<GatewayMetrics>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            config: RateLimitConfig::default(),
            stats: RateLimiterStats::default(),
            #[cfg(feature = "monitoring")]
            metrics: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: RateLimitConfig) -> Self {
        self.config = config;
        self
    }

    #[cfg(feature = "monitoring")]
    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn stats(&self) -> &RateLimiterStats {
        &self.stats
    }

    pub fn store(&self) -> &Arc<dyn RateLimitStore> {
        &self.store
    }

    /// 启动后台任务，按固定间隔清理窗口已结束的计数器
    ///
    /// 必须在 tokio 运行时内调用。任务持有限流器的克隆，调用方负责在不再需要时 `abort`。
    pub fn spawn_cleanup(&self, interval: Duration) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = limiter.clock.now_millis();
                match limiter.store.purge_expired(now).await {
                    Ok(0) => {}
                    Ok(purged) => debug!("清理过期计数器: {}", purged),
                    Err(e) => warn!("Store {} cleanup failed: {}", limiter.store.name(), e),
                }
            }
        })
    }

    /// 原子自增并返回窗口内计数
    pub async fn increment_and_get(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<RateLimitResult, GatewayError> {
        self.increment_and_get_for(key, limit, window, None).await
    }

    /// 同 [`increment_and_get`](Self::increment_and_get)，在新建计数器时记录订阅 ID
    pub async fn increment_and_get_for(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        subscription: Option<&str>,
    ) -> Result<RateLimitResult, GatewayError> {
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);

        for attempt in 0..self.config.max_cas_attempts {
            let current = self.execute_with_retry(|| self.store.get(key)).await?;
            let now = self.clock.now_millis();

            let (expected_version, mut next) = match current {
                Some(counter) => (Some(counter.version), counter),
                None => (
                    None,
                    RateLimitCounter::new(key, limit, now.saturating_add(window_ms))
                        .with_subscription(subscription.map(str::to_string)),
                ),
            };

            if now >= next.reset_time {
                trace!("Window of {} elapsed, resetting counter", key);
                next.counter = 0;
                next.reset_time = now.saturating_add(window_ms);
            }
            next.counter += 1;
            next.limit = limit;

            let outcome = self
                .execute_with_retry(|| self.store.conditional_update(key, expected_version, next.clone()))
                .await?;

            match outcome {
                UpdateOutcome::Updated(stored) => {
                    self.stats.increments.fetch_add(1, Ordering::Relaxed);
                    let result = RateLimitResult::from_counter(&stored);
                    debug!(
                        key = key,
                        count = result.count,
                        limit = result.limit,
                        exceeded = result.exceeded,
                        "Rate-limit counter incremented"
                    );
                    return Ok(result);
                }
                UpdateOutcome::Conflict => {
                    self.record_conflict();
                    trace!("CAS conflict on {} (attempt {})", key, attempt + 1);
                    tokio::task::yield_now().await;
                }
            }
        }

        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        warn!(
            "Giving up on {} after {} CAS attempts",
            key, self.config.max_cas_attempts
        );
        Err(StorageError::Conflict(format!(
            "{}: {} 次CAS尝试均冲突",
            key, self.config.max_cas_attempts
        ))
        .into())
    }

    fn record_conflict(&self) {
        self.stats.cas_conflicts.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "monitoring")]
        if let Some(metrics) = &self.metrics {
            metrics.record_cas_conflict();
        }
    }

    /// 带重试的执行，仅重试瞬时错误
    async fn execute_with_retry<F, Fut, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, StorageError>>,
    {
        let mut backoff = self.config.retry_initial_backoff();
        let mut attempt = 0;

        loop {
            match f().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    self.stats.transient_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Store {} failed, retrying in {:?} ({}/{}): {}",
                        self.store.name(),
                        backoff,
                        attempt,
                        self.config.max_retries,
                        e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.mul_f32(2.0);
                }
                Err(e) => {
                    self.stats.failures.fetch_add(1, Ordering::Relaxed);
                    warn!("Store {} failed: {}", self.store.name(), e);
                    return Err(e);
                }
            }
        }
    }
}
