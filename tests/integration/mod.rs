//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 集成测试模块
//!
//! 测试配置加载与外部存储的集成

mod config_loading;
#[cfg(feature = "redis")]
#[allow(unused_imports)]
mod redis_test;
