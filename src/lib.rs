//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Gateron - API Gateway Dispatch and Policy-Execution Core
//!
//! Matches each request to a deployed API definition, selects a security plan,
//! runs the ordered policy chains around a backend call and emits the response.
//!
//! # API Layers
//!
//! ## Prelude (Quick Start)
//!
//! Use `use gateron::prelude::*;` to import all commonly used types.
//!
//! ## Core API
//!
//! - [`Gateway`] - Dispatcher running the full pipeline for one request
//! - [`ApiRegistry`] - Deployment-event consumer owning the routing snapshot
//! - [`PolicyRegistry`] / [`PolicyChain`] - Policy factories and chain execution
//! - [`SecurityPlanSelector`] - Authentication handler and plan selection
//! - [`RateLimiter`] - Fixed-window increment-and-get counter
//! - [`GatewayError`] / [`ExecutionFailure`] - Error types
//!
//! ## Extensions (feature-gated)
//!
//! - Redis counter store (requires `redis` feature)
//! - Logging bootstrap (requires `telemetry` feature)
//! - Prometheus metrics (requires `monitoring` feature)
//!
//! # Examples
//!
//! ```rust
//! use gateron::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = Arc::new(ApiRegistry::new());
//!     registry
//!         .deploy(
//!             ApiDefinition::new("echo", "/echo")
//!                 .with_plan(Plan::new("free", SecurityType::KeyLess)),
//!         )
//!         .unwrap();
//!
//!     let gateway = Gateway::builder(registry, Arc::new(StaticInvoker::new(200)))
//!         .build()
//!         .unwrap();
//!
//!     let response = gateway
//!         .handle(GatewayRequest::new(HttpMethod::Get, "/echo/hello"))
//!         .await;
//!     assert_eq!(response.status, 200);
//! }
//! ```
//!
//! # Features
//!
//! - **Atomic redeploys**: readers keep their routing snapshot while a new one is swapped in
//! - **Deterministic routing**: longest base path, then host specificity, then deployment time
//! - **Condition expressions**: flows, steps and plan selection rules share one evaluator
//! - **Cancellable chains**: timeouts and client disconnects interrupt at the next await point
//! - **Distributed counters**: compare-and-set rate limiting over memory or Redis

pub mod prelude;

pub mod config;
pub mod constants;
pub mod context;
pub mod definition;
pub mod el;
pub mod error;
pub mod flow;
pub mod gateway;
pub mod policy;
pub mod ratelimit;
pub mod registry;
pub mod reporter;
pub mod security;
#[cfg(any(feature = "telemetry", feature = "monitoring"))]
pub mod telemetry;

// 重新导出常用类型
pub use config::{GatewayConfig, RateLimitConfig, ReportingConfig, SecurityConfig};
pub use context::{
    AttributeValue, CancellationToken, ExecutionContext, GatewayRequest, GatewayResponse,
};
pub use definition::{
    ApiDefinition, Flow, HttpMethod, PathOperator, Phase, Plan, PolicyReference, SecurityType,
    VirtualHost,
};
pub use el::{
    ConditionEvaluator, EvaluationScope, ExpressionConditionEvaluator, LiteralConditionEvaluator,
};
pub use error::{ExecutionFailure, GatewayError, StorageError};
pub use flow::{CompiledFlow, FlowResolver, PathPattern};
pub use gateway::{Gateway, GatewayBuilder, Invoker, StaticInvoker, StreamingResponse};
pub use policy::{
    ChainHook, ChainOutcome, ChainState, ChainStats, ChainStep, Policy, PolicyChain,
    PolicyFactory, PolicyRegistry, PolicyResult, TracingHook,
};
pub use ratelimit::{
    Clock, ManualClock, MemoryRateLimitStore, RateLimitCounter, RateLimitResult, RateLimitStore,
    RateLimiter, SystemClock,
};
#[cfg(feature = "redis")]
pub use ratelimit::redis::{RedisConfig, RedisRateLimitStore};
pub use registry::{
    Api, ApiRegistry, DeploymentEvent, DeploymentOutcome, RegistryStats, RouteMatch,
    RouteResolver,
};
pub use reporter::{MetricsRecord, Reporter, TracingReporter};
pub use security::{
    AuthenticationHandler, CachedSubscriptionService, InMemorySubscriptionService,
    SecurityPlanSelector, SelectedPlan, Subscription, SubscriptionService, SubscriptionStatus,
};
#[cfg(feature = "telemetry")]
pub use telemetry::init_logging;
#[cfg(feature = "monitoring")]
pub use telemetry::{GatewayMetrics, PrometheusReporter};
