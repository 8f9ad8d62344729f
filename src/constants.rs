//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Centralized configuration constants for Gateron.
//!
//! Default values, well-known attribute names and failure keys shared by the
//! dispatcher, the security chain and the built-in policies.

/// Default request timeout (30 seconds). `0` disables the timeout.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Extra time granted to response-phase policies once the timeout fired.
pub const DEFAULT_REQUEST_TIMEOUT_GRACE_MS: u64 = 30;

// ============================================================================
// Rate Limit Constants
// ============================================================================

/// Maximum number of retries for transient store failures.
pub const DEFAULT_RATE_LIMIT_MAX_RETRIES: u32 = 3;

/// Initial backoff before retrying a transient store failure (doubled on each retry).
pub const DEFAULT_RATE_LIMIT_RETRY_BACKOFF_MS: u64 = 10;

/// Maximum compare-and-set attempts before giving up on a contended counter.
///
/// Each attempt reloads the counter, so this only trips under pathological contention.
pub const DEFAULT_RATE_LIMIT_MAX_CAS_ATTEMPTS: u32 = 64;

/// Interval between sweeps of expired counters (0 disables the sweep).
pub const DEFAULT_RATE_LIMIT_CLEANUP_INTERVAL_MS: u64 = 60_000;

// ============================================================================
// Security Constants
// ============================================================================

/// Default header carrying an API key.
pub const DEFAULT_API_KEY_HEADER: &str = "X-Gravitee-Api-Key";

/// Default query parameter carrying an API key.
pub const DEFAULT_API_KEY_QUERY_PARAM: &str = "api-key";

/// Default handler orders (lower runs first).
pub const DEFAULT_MTLS_HANDLER_ORDER: i32 = 0;
pub const DEFAULT_API_KEY_HANDLER_ORDER: i32 = 100;
pub const DEFAULT_JWT_HANDLER_ORDER: i32 = 200;
pub const DEFAULT_OAUTH2_HANDLER_ORDER: i32 = 300;
pub const DEFAULT_KEYLESS_HANDLER_ORDER: i32 = 1000;

// ============================================================================
// Cache Constants
// ============================================================================

/// Default capacity of the subscription lookup cache.
pub const DEFAULT_SUBSCRIPTION_CACHE_CAPACITY: usize = 10_000;

/// Default capacity of the parsed-expression cache.
pub const DEFAULT_EXPRESSION_CACHE_CAPACITY: usize = 1_024;

/// Well-known execution context attribute names.
pub mod attributes {
    pub const API: &str = "gravitee.attribute.api";
    pub const API_NAME: &str = "gravitee.attribute.api.name";
    pub const API_DEPLOYED_AT: &str = "gravitee.attribute.api.deployed-at";
    pub const CONTEXT_PATH: &str = "gravitee.attribute.context-path";
    pub const PLAN: &str = "gravitee.attribute.plan";
    pub const APPLICATION: &str = "gravitee.attribute.application";
    pub const SUBSCRIPTION_ID: &str = "gravitee.attribute.user-id";
    pub const SECURITY_TYPE: &str = "gravitee.attribute.security.type";
    pub const SECURITY_TOKEN: &str = "gravitee.attribute.security.token";
    pub const CLIENT_CERTIFICATE: &str = "gravitee.attribute.ssl.client-certificate";
    pub const MAPPED_PATH: &str = "gravitee.attribute.mapped-path";
    pub const RESPONSE_BYTES: &str = "gravitee.attribute.response.bytes";
    pub const REQUEST_BYTES: &str = "gravitee.attribute.request.bytes";
}

/// Well-known failure keys.
pub mod keys {
    pub const NO_API_FOUND: &str = "NO_API_FOUND";
    pub const GATEWAY_MISSING_SECURED_REQUEST_PLAN: &str = "GATEWAY_MISSING_SECURED_REQUEST_PLAN";
    pub const GATEWAY_PLAN_UNRESOLVABLE: &str = "GATEWAY_PLAN_UNRESOLVABLE";
    pub const POLICY_EXECUTION_ERROR: &str = "POLICY_EXECUTION_ERROR";
    pub const POLICY_NOT_FOUND: &str = "POLICY_NOT_FOUND";
    pub const REQUEST_TIMEOUT: &str = "REQUEST_TIMEOUT";
    pub const CLIENT_CLOSED_REQUEST: &str = "CLIENT_CLOSED_REQUEST";
    pub const GATEWAY_INVOKER_ERROR: &str = "GATEWAY_INVOKER_ERROR";
    pub const GATEWAY_INTERNAL_ERROR: &str = "GATEWAY_INTERNAL_ERROR";
    pub const RATE_LIMIT_TOO_MANY_REQUESTS: &str = "RATE_LIMIT_TOO_MANY_REQUESTS";
    pub const QUOTA_TOO_MANY_REQUESTS: &str = "QUOTA_TOO_MANY_REQUESTS";
    pub const RATE_LIMIT_SERVER_ERROR: &str = "RATE_LIMIT_SERVER_ERROR";
    pub const API_KEY_INVALID: &str = "API_KEY_INVALID";
}
