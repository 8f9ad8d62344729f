//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Redis 计数器存储
//!
//! 每个计数器保存为一个 hash：`version` 字段用于比较，`data` 字段保存 JSON。
//! 条件更新由 Lua 脚本完成，比较与写入在 Redis 端原子执行；
//! 键在窗口结束后自动过期。

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, IntoConnectionInfo, RedisError, Script};
use secrecy::{ExposeSecret, Secret};
use std::time::Duration;
use tracing::{debug, error, info};

use super::store::{next_version, RateLimitCounter, RateLimitStore, UpdateOutcome};
use crate::error::StorageError;

/// 条件写入脚本
///
/// 参数: KEYS[1] - key, ARGV[1] - 期望版本（空串表示不存在）, ARGV[2] - 新版本,
/// ARGV[3] - 计数器 JSON, ARGV[4] - 过期时间点（epoch 毫秒）
/// 返回: 1 写入成功, 0 版本冲突
pub const COMPARE_AND_SET_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
local expected = ARGV[1]

if current == false then
    if expected ~= '' then
        return 0
    end
elseif current ~= expected then
    return 0
end

redis.call('HSET', KEYS[1], 'version', ARGV[2], 'data', ARGV[3])
redis.call('PEXPIREAT', KEYS[1], ARGV[4])
return 1
"#;

/// 过期宽限，避免窗口边界上键先于最后一次读取消失
const EXPIRY_GRACE_MS: i64 = 1_000;

/// Redis配置
#[derive(Clone)]
pub struct RedisConfig {
    /// Redis连接URL
    pub url: String,
    /// 数据库索引，未设置时使用 URL 中的值
    pub db: Option<i64>,
    /// 密码（使用 Secret 包装以防止意外泄露）
    pub password: Option<Secret<String>>,
    /// 连接超时
    pub connection_timeout: Duration,
    /// 键前缀
    pub key_prefix: String,
}

impl std::fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConfig")
            .field("url", &self.url)
            .field("db", &self.db)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("connection_timeout", &self.connection_timeout)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            db: None,
            password: None,
            connection_timeout: Duration::from_secs(5),
            key_prefix: "gateron:ratelimit:".to_string(),
        }
    }
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn db(mut self, db: i64) -> Self {
        self.db = Some(db);
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Secret::new(password.into()));
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// 解析连接信息
    ///
    /// 地址、TLS（`rediss://`）和认证信息取自 URL；`db` 和 `password` 设置后覆盖 URL 中的值。
    fn connection_info(&self) -> Result<redis::ConnectionInfo, StorageError> {
        let mut info = self.url.as_str().into_connection_info().map_err(|e| {
            StorageError::ConnectionError(format!("无效的Redis URL {}: {}", self.url, e))
        })?;

        if let Some(db) = self.db {
            info.redis.db = db;
        }
        if let Some(password) = &self.password {
            info.redis.password = Some(password.expose_secret().clone());
        }
        Ok(info)
    }
}

fn map_redis_error(e: RedisError) -> StorageError {
    if e.is_timeout() {
        StorageError::TimeoutError(e.to_string())
    } else if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        StorageError::ConnectionError(e.to_string())
    } else {
        StorageError::QueryError(e.to_string())
    }
}

/// Redis 计数器存储
#[derive(Clone)]
pub struct RedisRateLimitStore {
    conn: ConnectionManager,
    script: Script,
    config: RedisConfig,
}

impl RedisRateLimitStore {
    pub async fn new(config: RedisConfig) -> Result<Self, StorageError> {
        info!("创建Redis计数器存储, URL: {}", config.url);

        let client = Client::open(config.connection_info()?).map_err(|e| {
            error!("创建Redis客户端失败: {}", e);
            StorageError::ConnectionError(format!("创建Redis客户端失败: {}", e))
        })?;

        let conn = tokio::time::timeout(config.connection_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StorageError::TimeoutError("连接Redis超时".to_string()))?
            .map_err(map_redis_error)?;

        info!("Redis连接建立成功");
        Ok(Self {
            conn,
            script: Script::new(COMPARE_AND_SET_SCRIPT),
            config,
        })
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<RateLimitCounter>, StorageError> {
        let mut conn = self.conn.clone();
        let data: Option<String> = redis::cmd("HGET")
            .arg(self.redis_key(key))
            .arg("data")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        data.map(|json| {
            serde_json::from_str(&json)
                .map_err(|e| StorageError::QueryError(format!("计数器反序列化失败: {}", e)))
        })
        .transpose()
    }

    async fn conditional_update(
        &self,
        key: &str,
        expected_version: Option<u64>,
        mut counter: RateLimitCounter,
    ) -> Result<UpdateOutcome, StorageError> {
        counter.version = next_version(expected_version);
        let data = serde_json::to_string(&counter)
            .map_err(|e| StorageError::QueryError(format!("计数器序列化失败: {}", e)))?;

        let mut conn = self.conn.clone();
        let written: i64 = self
            .script
            .key(self.redis_key(key))
            .arg(expected_version.map(|v| v.to_string()).unwrap_or_default())
            .arg(counter.version)
            .arg(data)
            .arg(counter.reset_time.saturating_add(EXPIRY_GRACE_MS))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        if written == 1 {
            Ok(UpdateOutcome::Updated(counter))
        } else {
            debug!("CAS conflict on {} (expected {:?})", key, expected_version);
            Ok(UpdateOutcome::Conflict)
        }
    }
}
