//! Health aggregation over named async probes.
//!
//! Each check cycle runs every registered probe concurrently under its own timeout.
//! A probe that errors, panics or times out is reported as a critical component
//! rather than failing the whole report.

use crate::cache::MemoryCache;
use crate::monitor::{PerformanceAlert, PerformanceMonitor};
use futures_util::future::join_all;
use searchpipe_core::HealthStatus;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    pub last_checked_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ComponentHealth {
    /// Build a result. `name` and `last_checked_ms` are filled in by the aggregator.
    pub fn new(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            status,
            message: message.into(),
            last_checked_ms: now_epoch_ms(),
            details: None,
        }
    }

    pub fn healthy(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Healthy, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Warning, message)
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Critical, message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[async_trait::async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> Result<ComponentHealth, BoxError>;
}

/// Adapter so a plain async closure can be registered as a probe.
pub struct FnProbe<F>(F);

pub fn probe_fn<F, Fut>(f: F) -> FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<ComponentHealth, BoxError>> + Send,
{
    FnProbe(f)
}

#[async_trait::async_trait]
impl<F, Fut> HealthProbe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<ComponentHealth, BoxError>> + Send,
{
    async fn check(&self) -> Result<ComponentHealth, BoxError> {
        (self.0)().await
    }
}

/// Mirrors the monitor's own verdict.
pub struct MonitorProbe(pub Arc<PerformanceMonitor>);

#[async_trait::async_trait]
impl HealthProbe for MonitorProbe {
    async fn check(&self) -> Result<ComponentHealth, BoxError> {
        let summary = self.0.summary();
        let message = format!(
            "{} operations, error rate {:.3}, {} recent alerts",
            summary.total_operations,
            summary.error_rate,
            summary.recent_alerts.len()
        );
        let details = serde_json::json!({
            "total_operations": summary.total_operations,
            "total_failures": summary.total_failures,
            "error_rate": summary.error_rate,
            "average_response_ms": summary.average_response_ms,
            "recent_alerts": summary.recent_alerts.len(),
        });
        Ok(ComponentHealth::new(summary.status, message).with_details(details))
    }
}

/// Warns when the cache is full and mostly missing, which means entries are
/// being churned out before they are reused.
pub struct CacheProbe {
    pub cache: Arc<MemoryCache<serde_json::Value>>,
    pub min_hit_ratio: f64,
    pub min_lookups: u64,
}

impl CacheProbe {
    pub fn new(cache: Arc<MemoryCache<serde_json::Value>>) -> Self {
        Self {
            cache,
            min_hit_ratio: 0.5,
            min_lookups: 10,
        }
    }
}

#[async_trait::async_trait]
impl HealthProbe for CacheProbe {
    async fn check(&self) -> Result<ComponentHealth, BoxError> {
        let st = self.cache.stats();
        let lookups = st.hits + st.misses;
        let full = st.max_size > 0 && st.size >= st.max_size;
        let details = serde_json::to_value(&st)?;
        let c = if full && lookups >= self.min_lookups && st.hit_ratio < self.min_hit_ratio {
            ComponentHealth::warning(format!(
                "cache at capacity ({}/{}) with hit ratio {:.2}",
                st.size, st.max_size, st.hit_ratio
            ))
        } else {
            ComponentHealth::healthy(format!("{}/{} entries", st.size, st.max_size))
        };
        Ok(c.with_details(details))
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub warning: usize,
    pub critical: usize,
    pub unknown: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp_ms: u64,
    pub uptime_s: u64,
    pub components: Vec<ComponentHealth>,
    pub summary: HealthSummary,
    pub alerts: Vec<PerformanceAlert>,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub check_interval: Duration,
    pub probe_timeout: Duration,
    /// How far back monitor alerts count toward the overall status.
    pub alert_window: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            alert_window: crate::monitor::DEFAULT_ALERT_COOLDOWN,
        }
    }
}

/// Overall verdict: any critical wins, then any warning or recent alert, then
/// unknown when nothing is registered.
pub fn overall_status(components: &[ComponentHealth], alerts: &[PerformanceAlert]) -> HealthStatus {
    if components.iter().any(|c| c.status == HealthStatus::Critical) {
        HealthStatus::Critical
    } else if components.iter().any(|c| c.status == HealthStatus::Warning) || !alerts.is_empty()
    {
        HealthStatus::Warning
    } else if components.is_empty() {
        HealthStatus::Unknown
    } else {
        HealthStatus::Healthy
    }
}

pub struct HealthAggregator {
    config: HealthConfig,
    monitor: Option<Arc<PerformanceMonitor>>,
    probes: RwLock<BTreeMap<String, Arc<dyn HealthProbe>>>,
    last: Mutex<Option<HealthReport>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    started_at: Instant,
}

impl HealthAggregator {
    pub fn new(config: HealthConfig, monitor: Option<Arc<PerformanceMonitor>>) -> Self {
        Self {
            config,
            monitor,
            probes: RwLock::new(BTreeMap::new()),
            last: Mutex::new(None),
            timer: Mutex::new(None),
            started_at: Instant::now(),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Register (or replace) a probe under `name`.
    pub fn register(&self, name: impl Into<String>, probe: Arc<dyn HealthProbe>) {
        self.probes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), probe);
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.probes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some()
    }

    pub fn last_report(&self) -> Option<HealthReport> {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub async fn perform_health_check(&self) -> HealthReport {
        let probes: Vec<(String, Arc<dyn HealthProbe>)> = self
            .probes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let timeout = self.config.probe_timeout;
        let handles = probes.iter().map(|(_, probe)| {
            let probe = Arc::clone(probe);
            tokio::spawn(async move { tokio::time::timeout(timeout, probe.check()).await })
        });
        let outcomes = join_all(handles).await;

        let components: Vec<ComponentHealth> = probes
            .iter()
            .zip(outcomes)
            .map(|((name, _), outcome)| {
                let mut c = match outcome {
                    Ok(Ok(Ok(c))) => c,
                    Ok(Ok(Err(e))) => ComponentHealth::critical(format!("probe failed: {e}")),
                    Ok(Err(_)) => ComponentHealth::critical(format!(
                        "probe timed out after {}ms",
                        timeout.as_millis()
                    )),
                    Err(e) if e.is_panic() => ComponentHealth::critical("probe panicked"),
                    Err(e) => ComponentHealth::critical(format!("probe did not complete: {e}")),
                };
                c.name = name.clone();
                c.last_checked_ms = now_epoch_ms();
                c
            })
            .collect();

        let alerts = self
            .monitor
            .as_ref()
            .map(|m| m.recent_alerts(self.config.alert_window))
            .unwrap_or_default();

        let mut summary = HealthSummary {
            total: components.len(),
            ..Default::default()
        };
        for c in &components {
            match c.status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Warning => summary.warning += 1,
                HealthStatus::Critical => summary.critical += 1,
                HealthStatus::Unknown => summary.unknown += 1,
            }
        }

        let report = HealthReport {
            status: overall_status(&components, &alerts),
            timestamp_ms: now_epoch_ms(),
            uptime_s: self.started_at.elapsed().as_secs(),
            components,
            summary,
            alerts,
        };

        match report.status {
            HealthStatus::Healthy | HealthStatus::Unknown => tracing::debug!(
                status = report.status.as_str(),
                components = report.summary.total,
                "health check"
            ),
            HealthStatus::Warning | HealthStatus::Critical => tracing::warn!(
                status = report.status.as_str(),
                warning = report.summary.warning,
                critical = report.summary.critical,
                alerts = report.alerts.len(),
                "health check degraded"
            ),
        }

        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
        report
    }

    /// Start periodic checks. A second call while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut timer = self.timer.lock().unwrap_or_else(|e| e.into_inner());
        if timer.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.check_interval.max(Duration::from_millis(1));
        *timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(this) = weak.upgrade() else {
                    break;
                };
                this.perform_health_check().await;
            }
        }));
        tracing::info!(interval_ms = interval.as_millis() as u64, "health checks started");
    }

    /// Stop periodic checks. Calling it when stopped is a no-op.
    pub fn stop(&self) {
        if let Some(h) = self.timer.lock().unwrap_or_else(|e| e.into_inner()).take() {
            h.abort();
            tracing::info!("health checks stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for HealthAggregator {
    fn drop(&mut self) {
        if let Some(h) = self.timer.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            h.abort();
        }
    }
}
