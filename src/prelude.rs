//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Prelude module - Commonly used types for quick imports
//!
//! This module re-exports the most commonly used types from Gateron,
//! allowing users to import them with a single `use gateron::prelude::*;`
//! statement instead of importing each type individually.

// Core types - always available
pub use crate::config::GatewayConfig;
pub use crate::context::{ExecutionContext, GatewayRequest, GatewayResponse};
pub use crate::definition::{
    ApiDefinition, Flow, HttpMethod, PathOperator, Phase, Plan, PolicyReference, SecurityType,
    VirtualHost,
};
pub use crate::error::{ExecutionFailure, GatewayError};
pub use crate::gateway::{Gateway, Invoker, StaticInvoker, StreamingResponse};

// Deployment
pub use crate::registry::{ApiRegistry, DeploymentEvent, DeploymentOutcome};

// Policies
pub use crate::policy::{Policy, PolicyChain, PolicyFactory, PolicyRegistry, PolicyResult};

// Security
pub use crate::security::{InMemorySubscriptionService, Subscription, SubscriptionService};

// Rate limiting
pub use crate::ratelimit::{MemoryRateLimitStore, RateLimitResult, RateLimiter};

// Feature-gated exports
#[cfg(feature = "redis")]
pub use crate::ratelimit::redis::RedisRateLimitStore;

#[cfg(feature = "monitoring")]
pub use crate::telemetry::{GatewayMetrics, PrometheusReporter};
