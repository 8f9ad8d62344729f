//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 端到端测试模块
//!
//! 测试完整的调度流程和场景

mod dispatch_pipeline;
mod hot_redeploy;
mod rate_limit;
mod security_plans;
