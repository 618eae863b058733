//! In-process implementation of the searchpipe client: memory cache, retrying
//! HTTP executor, performance monitor and health aggregation.

pub mod cache;
pub mod client;
pub mod config;
pub mod executor;
pub mod health;
pub mod monitor;
pub mod retry;
pub mod validate;

pub use cache::{CacheConfig, CacheKey, CacheStats, MemoryCache};
pub use client::{ClientStats, SearchClient};
pub use config::ClientConfig;
pub use executor::{ExecutorConfig, RequestExecutor};
pub use health::{
    ComponentHealth, HealthAggregator, HealthConfig, HealthProbe, HealthReport, HealthSummary,
};
pub use monitor::{
    AlertSeverity, AlertType, MonitorThresholds, OperationMetrics, OperationTimer,
    PerformanceAlert, PerformanceMonitor, PerformanceSummary,
};
pub use retry::{retry, with_retry, RetryAttempt, RetryObserver, RetryPolicy, Retrying};
