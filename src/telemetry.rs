//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 监控和日志模块
//!
//! # 功能
//!
//! - `telemetry` feature：基于 `tracing-subscriber` 的日志初始化（`RUST_LOG` 优先）
//! - `monitoring` feature：Prometheus 网关指标与 [`PrometheusReporter`]
//!
//! # 示例
//!
//! ```rust,no_run
//! # #[cfg(feature = "monitoring")]
//! # fn main() {
//! use gateron::telemetry::GatewayMetrics;
//!
//! let metrics = GatewayMetrics::new().unwrap();
//! metrics.record_request(200, std::time::Duration::from_millis(12));
//! println!("{}", metrics.gather());
//! # }
//! # #[cfg(not(feature = "monitoring"))]
//! # fn main() {}
//! ```

#[cfg(feature = "monitoring")]
pub use metrics::{GatewayMetrics, PrometheusReporter};

// ============================================================================
// 日志初始化
// ============================================================================

/// 初始化全局日志订阅器
///
/// `RUST_LOG` 存在时优先使用，否则使用 `default_filter`（例如 `"gateron=info"`）。
///
/// # 返回
/// - `Err(_)`: 过滤表达式无效或全局订阅器已设置
#[cfg(feature = "telemetry")]
pub fn init_logging(default_filter: &str) -> Result<(), crate::error::GatewayError> {
    use crate::error::GatewayError;
    use tracing_subscriber::EnvFilter;

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)
            .map_err(|e| GatewayError::ConfigError(format!("无效的日志过滤器: {}", e)))?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| GatewayError::Other(format!("日志初始化失败: {}", e)))?;

    tracing::info!("Logging initialized");
    Ok(())
}

#[cfg(feature = "monitoring")]
mod metrics {
    use prometheus::{
        Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
        TextEncoder,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tracing::error;

    use crate::error::GatewayError;
    use crate::reporter::{MetricsRecord, Reporter};

    const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

    fn metric_error(e: prometheus::Error) -> GatewayError {
        GatewayError::Other(format!("指标注册失败: {}", e))
    }

    /// 按状态码归类请求结果
    fn outcome(status: u16) -> &'static str {
        match status {
            0..=399 => "success",
            429 => "rate_limited",
            400..=499 => "client_error",
            _ => "server_error",
        }
    }

    /// 网关指标
    ///
    /// 每个实例持有独立的 [`Registry`]，多个网关实例互不干扰。
    #[derive(Clone)]
    pub struct GatewayMetrics {
        /// 请求总数（按结果分类）
        pub requests_total: IntCounterVec,
        /// 请求延迟分布
        pub request_duration: Histogram,
        /// 处理中的请求数
        pub in_flight: IntGauge,
        /// 限流计数器 CAS 冲突次数
        pub cas_conflicts: IntCounter,
        registry: Registry,
    }

    impl GatewayMetrics {
        pub fn new() -> Result<Self, GatewayError> {
            let registry = Registry::new();

            let requests_total = IntCounterVec::new(
                Opts::new("gateron_requests_total", "Total number of dispatched requests"),
                &["outcome"],
            )
            .map_err(metric_error)?;

            let request_duration = Histogram::with_opts(
                HistogramOpts::new(
                    "gateron_request_duration_seconds",
                    "End-to-end request latency in seconds",
                )
                .buckets(LATENCY_BUCKETS.to_vec()),
            )
            .map_err(metric_error)?;

            let in_flight = IntGauge::new(
                "gateron_requests_in_flight",
                "Number of requests currently being dispatched",
            )
            .map_err(metric_error)?;

            let cas_conflicts = IntCounter::new(
                "gateron_rate_limit_cas_conflicts_total",
                "Compare-and-set conflicts on rate-limit counters",
            )
            .map_err(metric_error)?;

            registry
                .register(Box::new(requests_total.clone()))
                .map_err(metric_error)?;
            registry
                .register(Box::new(request_duration.clone()))
                .map_err(metric_error)?;
            registry
                .register(Box::new(in_flight.clone()))
                .map_err(metric_error)?;
            registry
                .register(Box::new(cas_conflicts.clone()))
                .map_err(metric_error)?;

            Ok(Self {
                requests_total,
                request_duration,
                in_flight,
                cas_conflicts,
                registry,
            })
        }

        pub fn registry(&self) -> &Registry {
            &self.registry
        }

        /// 记录一个完成的请求
        pub fn record_request(&self, status: u16, latency: Duration) {
            self.requests_total.with_label_values(&[outcome(status)]).inc();
            self.request_duration.observe(latency.as_secs_f64());
        }

        pub fn record_cas_conflict(&self) {
            self.cas_conflicts.inc();
        }

        /// Prometheus 文本格式导出
        pub fn gather(&self) -> String {
            let encoder = TextEncoder::new();
            let metric_families = self.registry.gather();
            let mut buffer = Vec::new();
            if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                error!("Failed to encode metrics: {}", e);
                return String::new();
            }
            String::from_utf8(buffer).unwrap_or_default()
        }
    }

    /// 把每个请求的指标记录写入 [`GatewayMetrics`]
    #[derive(Clone)]
    pub struct PrometheusReporter {
        metrics: Arc<GatewayMetrics>,
    }

    impl PrometheusReporter {
        pub fn new(metrics: Arc<GatewayMetrics>) -> Self {
            Self { metrics }
        }

        pub fn metrics(&self) -> &Arc<GatewayMetrics> {
            &self.metrics
        }
    }

    impl Reporter for PrometheusReporter {
        fn name(&self) -> &str {
            "prometheus"
        }

        fn report(&self, record: &MetricsRecord) -> Result<(), GatewayError> {
            self.metrics
                .record_request(record.status, Duration::from_millis(record.latency_ms));
            Ok(())
        }
    }

}
