//! Per-operation latency/outcome tracking with nearest-rank percentiles and
//! threshold alerts.
//!
//! Counters (`count`, `total_ms`, ...) are cumulative. Percentiles come from a bounded
//! ring of recent samples. Ops/sec counts calls in the last [`OPS_WINDOW`], tracked
//! separately from that ring so the rate is not capped by its size.

use searchpipe_core::HealthStatus;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub const DEFAULT_SAMPLE_WINDOW: usize = 1000;
pub const OPS_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_ALERT_COOLDOWN: Duration = Duration::from_secs(300);
const MAX_ALERT_HISTORY: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct MonitorThresholds {
    pub response_time_ms: f64,
    /// Failure fraction (0.0..=1.0).
    pub error_rate: f64,
    pub ops_per_second: f64,
    /// Error-rate alerts need at least this many calls for the operation.
    pub min_samples_for_error_rate: u64,
    #[serde(skip)]
    pub alert_cooldown: Duration,
    pub sample_window: usize,
}

impl Default for MonitorThresholds {
    fn default() -> Self {
        Self {
            response_time_ms: 5_000.0,
            error_rate: 0.1,
            ops_per_second: 100.0,
            min_samples_for_error_rate: 10,
            alert_cooldown: DEFAULT_ALERT_COOLDOWN,
            sample_window: DEFAULT_SAMPLE_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    ResponseTime,
    ErrorRate,
    HighLoad,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceAlert {
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub value: f64,
    pub threshold: f64,
    pub timestamp_ms: u64,
    pub operation: Option<String>,
    #[serde(skip)]
    pub raised_at: Instant,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct OperationMetrics {
    pub count: u64,
    pub total_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub average_ms: f64,
    pub success_count: u64,
    pub failure_count: u64,
    pub error_rate: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub ops_per_second: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSummary {
    pub status: HealthStatus,
    pub uptime_s: u64,
    pub total_operations: u64,
    pub total_failures: u64,
    pub error_rate: f64,
    pub average_response_ms: f64,
    pub operations: BTreeMap<String, OperationMetrics>,
    pub recent_alerts: Vec<PerformanceAlert>,
}

/// Nearest-rank percentile over an ascending slice: `sorted[ceil(n*p) - 1]`.
pub fn nearest_rank(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let rank = (n as f64 * p.clamp(0.0, 1.0)).ceil() as usize;
    sorted[rank.saturating_sub(1).min(n - 1)]
}

#[derive(Debug, Default)]
struct OperationStats {
    count: u64,
    total_ms: f64,
    min_ms: f64,
    max_ms: f64,
    success_count: u64,
    failure_count: u64,
    samples: VecDeque<f64>,
    /// Call times within `OPS_WINDOW`, oldest first.
    recent: VecDeque<Instant>,
    p95_ms: f64,
    p99_ms: f64,
}

impl OperationStats {
    fn record(&mut self, ms: f64, success: bool, now: Instant, window: usize) {
        if self.count == 0 {
            self.min_ms = ms;
            self.max_ms = ms;
        } else {
            self.min_ms = self.min_ms.min(ms);
            self.max_ms = self.max_ms.max(ms);
        }
        self.count += 1;
        self.total_ms += ms;
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }

        self.samples.push_back(ms);
        while self.samples.len() > window.max(1) {
            self.samples.pop_front();
        }
        self.recent.push_back(now);
        while self
            .recent
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) > OPS_WINDOW)
        {
            self.recent.pop_front();
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        self.p95_ms = nearest_rank(&sorted, 0.95);
        self.p99_ms = nearest_rank(&sorted, 0.99);
    }

    fn ops_per_second(&self, now: Instant) -> f64 {
        let recent = self
            .recent
            .iter()
            .rev()
            .take_while(|at| now.saturating_duration_since(**at) <= OPS_WINDOW)
            .count();
        recent as f64 / OPS_WINDOW.as_secs_f64()
    }

    fn error_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.failure_count as f64 / self.count as f64
        }
    }

    fn snapshot(&self, now: Instant) -> OperationMetrics {
        OperationMetrics {
            count: self.count,
            total_ms: self.total_ms,
            min_ms: self.min_ms,
            max_ms: self.max_ms,
            average_ms: if self.count == 0 {
                0.0
            } else {
                self.total_ms / self.count as f64
            },
            success_count: self.success_count,
            failure_count: self.failure_count,
            error_rate: self.error_rate(),
            p95_ms: self.p95_ms,
            p99_ms: self.p99_ms,
            ops_per_second: self.ops_per_second(now),
        }
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    operations: HashMap<String, OperationStats>,
    alerts: VecDeque<PerformanceAlert>,
    last_alert: HashMap<(AlertType, Option<String>), Instant>,
}

#[derive(Debug)]
pub struct PerformanceMonitor {
    thresholds: MonitorThresholds,
    started_at: Instant,
    state: Mutex<MonitorState>,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(MonitorThresholds::default())
    }
}

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

impl PerformanceMonitor {
    pub fn new(thresholds: MonitorThresholds) -> Self {
        Self {
            thresholds,
            started_at: Instant::now(),
            state: Mutex::new(MonitorState::default()),
        }
    }

    pub fn thresholds(&self) -> &MonitorThresholds {
        &self.thresholds
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start timing `name`. Stop the returned timer to record; dropping it unstopped
    /// records a failure.
    pub fn start_operation(&self, name: impl Into<String>) -> OperationTimer<'_> {
        OperationTimer {
            monitor: self,
            name: name.into(),
            started: Instant::now(),
            finished: false,
        }
    }

    pub fn record_operation(&self, name: &str, duration_ms: f64, success: bool) {
        let duration_ms = if duration_ms.is_finite() {
            duration_ms.max(0.0)
        } else {
            0.0
        };
        let now = Instant::now();
        let raised = {
            let mut s = self.lock();
            let stats = s.operations.entry(name.to_string()).or_default();
            stats.record(duration_ms, success, now, self.thresholds.sample_window);
            let error_rate = stats.error_rate();
            let count = stats.count;
            let ops = stats.ops_per_second(now);

            let mut candidates = Vec::new();
            if duration_ms > self.thresholds.response_time_ms {
                candidates.push((
                    AlertType::ResponseTime,
                    duration_ms,
                    self.thresholds.response_time_ms,
                ));
            }
            if count >= self.thresholds.min_samples_for_error_rate
                && error_rate > self.thresholds.error_rate
            {
                candidates.push((AlertType::ErrorRate, error_rate, self.thresholds.error_rate));
            }
            if ops > self.thresholds.ops_per_second {
                candidates.push((AlertType::HighLoad, ops, self.thresholds.ops_per_second));
            }

            let mut raised = Vec::new();
            for (alert_type, value, threshold) in candidates {
                if let Some(a) =
                    self.raise(&mut s, alert_type, value, threshold, Some(name), now)
                {
                    raised.push(a);
                }
            }
            raised
        };

        for a in raised {
            tracing::warn!(
                operation = a.operation.as_deref().unwrap_or("-"),
                alert = ?a.alert_type,
                severity = ?a.severity,
                value = a.value,
                threshold = a.threshold,
                "performance alert"
            );
        }
    }

    fn raise(
        &self,
        s: &mut MonitorState,
        alert_type: AlertType,
        value: f64,
        threshold: f64,
        operation: Option<&str>,
        now: Instant,
    ) -> Option<PerformanceAlert> {
        let key = (alert_type, operation.map(str::to_string));
        if let Some(prev) = s.last_alert.get(&key) {
            if now.saturating_duration_since(*prev) < self.thresholds.alert_cooldown {
                return None;
            }
        }
        let severity = if value > threshold * 2.0 {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };
        let alert = PerformanceAlert {
            alert_type,
            severity,
            value,
            threshold,
            timestamp_ms: now_epoch_ms(),
            operation: key.1.clone(),
            raised_at: now,
        };
        s.last_alert.insert(key, now);
        s.alerts.push_back(alert.clone());
        while s.alerts.len() > MAX_ALERT_HISTORY {
            s.alerts.pop_front();
        }
        Some(alert)
    }

    pub fn metrics(&self, name: &str) -> Option<OperationMetrics> {
        let now = Instant::now();
        self.lock().operations.get(name).map(|o| o.snapshot(now))
    }

    pub fn all_metrics(&self) -> BTreeMap<String, OperationMetrics> {
        let now = Instant::now();
        self.lock()
            .operations
            .iter()
            .map(|(k, o)| (k.clone(), o.snapshot(now)))
            .collect()
    }

    pub fn alerts(&self) -> Vec<PerformanceAlert> {
        self.lock().alerts.iter().cloned().collect()
    }

    pub fn recent_alerts(&self, window: Duration) -> Vec<PerformanceAlert> {
        let now = Instant::now();
        self.lock()
            .alerts
            .iter()
            .filter(|a| now.saturating_duration_since(a.raised_at) <= window)
            .cloned()
            .collect()
    }

    /// One verdict across all operations: critical if any recent critical alert,
    /// warning if any recent alert, else healthy.
    pub fn summary(&self) -> PerformanceSummary {
        let operations = self.all_metrics();
        let recent_alerts = self.recent_alerts(self.thresholds.alert_cooldown);
        let status = match recent_alerts.iter().map(|a| a.severity).max() {
            Some(AlertSeverity::Critical) => HealthStatus::Critical,
            Some(AlertSeverity::Warning) => HealthStatus::Warning,
            None => HealthStatus::Healthy,
        };
        let total_operations: u64 = operations.values().map(|m| m.count).sum();
        let total_failures: u64 = operations.values().map(|m| m.failure_count).sum();
        let total_ms: f64 = operations.values().map(|m| m.total_ms).sum();
        PerformanceSummary {
            status,
            uptime_s: self.started_at.elapsed().as_secs(),
            total_operations,
            total_failures,
            error_rate: if total_operations == 0 {
                0.0
            } else {
                total_failures as f64 / total_operations as f64
            },
            average_response_ms: if total_operations == 0 {
                0.0
            } else {
                total_ms / total_operations as f64
            },
            operations,
            recent_alerts,
        }
    }

    pub fn reset(&self) {
        *self.lock() = MonitorState::default();
    }
}

/// Running measurement returned by [`PerformanceMonitor::start_operation`].
pub struct OperationTimer<'a> {
    monitor: &'a PerformanceMonitor,
    name: String,
    started: Instant,
    finished: bool,
}

impl OperationTimer<'_> {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn stop(mut self, success: bool) -> Duration {
        let d = self.started.elapsed();
        self.finished = true;
        self.monitor
            .record_operation(&self.name, d.as_secs_f64() * 1000.0, success);
        d
    }
}

impl Drop for OperationTimer<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.monitor.record_operation(
                &self.name,
                self.started.elapsed().as_secs_f64() * 1000.0,
                false,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn monitor(t: MonitorThresholds) -> PerformanceMonitor {
        PerformanceMonitor::new(t)
    }

    #[test]
    fn records_cumulative_counters_and_percentiles() {
        let m = PerformanceMonitor::default();
        for i in 1..=100 {
            m.record_operation("api.search", i as f64, i % 10 != 0);
        }
        let s = m.metrics("api.search").unwrap();
        assert_eq!(s.count, 100);
        assert_eq!(s.success_count, 90);
        assert_eq!(s.failure_count, 10);
        assert_eq!(s.min_ms, 1.0);
        assert_eq!(s.max_ms, 100.0);
        assert!((s.average_ms - 50.5).abs() < 1e-9);
        assert_eq!(s.p95_ms, 95.0);
        assert_eq!(s.p99_ms, 99.0);
        assert!((s.error_rate - 0.1).abs() < 1e-9);
        assert!(s.ops_per_second > 0.0);
        assert!(m.metrics("api.news").is_none());
    }

    #[test]
    fn percentiles_use_only_the_bounded_sample_window() {
        let m = monitor(MonitorThresholds {
            sample_window: 10,
            response_time_ms: f64::MAX,
            ..Default::default()
        });
        for _ in 0..50 {
            m.record_operation("op", 1_000.0, true);
        }
        for _ in 0..10 {
            m.record_operation("op", 1.0, true);
        }
        let s = m.metrics("op").unwrap();
        assert_eq!(s.count, 60);
        assert_eq!(s.p99_ms, 1.0);
        assert_eq!(s.max_ms, 1_000.0);
    }

    #[test]
    fn response_time_alert_escalates_and_is_deduplicated() {
        let m = monitor(MonitorThresholds {
            response_time_ms: 10.0,
            ..Default::default()
        });
        m.record_operation("api.crawl", 15.0, true);
        m.record_operation("api.crawl", 50.0, true);
        let alerts = m.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::ResponseTime);
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);
        assert_eq!(alerts[0].operation.as_deref(), Some("api.crawl"));

        // A different operation is a different dedup key.
        m.record_operation("api.news", 50.0, true);
        let alerts = m.alerts();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[1].severity, AlertSeverity::Critical);
        assert_eq!(m.summary().status, HealthStatus::Critical);
    }

    #[test]
    fn zero_cooldown_allows_repeated_alerts() {
        let m = monitor(MonitorThresholds {
            response_time_ms: 10.0,
            alert_cooldown: Duration::ZERO,
            ..Default::default()
        });
        m.record_operation("op", 15.0, true);
        std::thread::sleep(Duration::from_millis(2));
        m.record_operation("op", 15.0, true);
        assert_eq!(m.alerts().len(), 2);
    }

    #[test]
    fn error_rate_alert_waits_for_minimum_samples() {
        let m = monitor(MonitorThresholds {
            error_rate: 0.2,
            min_samples_for_error_rate: 4,
            ..Default::default()
        });
        for _ in 0..3 {
            m.record_operation("api.search", 1.0, false);
        }
        assert!(m.alerts().is_empty());
        m.record_operation("api.search", 1.0, true);
        let a = m.alerts();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].alert_type, AlertType::ErrorRate);
        assert_eq!(a[0].severity, AlertSeverity::Critical);
        assert!((a[0].value - 0.75).abs() < 1e-9);
    }

    #[test]
    fn high_load_alert_uses_sliding_window_rate() {
        let m = monitor(MonitorThresholds {
            ops_per_second: 1.0,
            ..Default::default()
        });
        for _ in 0..100 {
            m.record_operation("api.search", 1.0, true);
        }
        let a = m.alerts();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].alert_type, AlertType::HighLoad);
        assert_eq!(a[0].severity, AlertSeverity::Warning);
        assert_eq!(m.summary().status, HealthStatus::Warning);
    }

    #[test]
    fn high_load_fires_with_default_thresholds_past_the_sample_window() {
        let m = PerformanceMonitor::default();
        let t = m.thresholds().clone();
        let calls = (t.ops_per_second * OPS_WINDOW.as_secs_f64()) as usize + 100;
        assert!(calls > t.sample_window);
        for _ in 0..calls {
            m.record_operation("api.search", 1.0, true);
        }
        let s = m.metrics("api.search").unwrap();
        assert!(s.ops_per_second > t.ops_per_second, "{}", s.ops_per_second);
        let a = m.alerts();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].alert_type, AlertType::HighLoad);
        assert_eq!(m.summary().status, HealthStatus::Warning);
    }

    #[test]
    fn summary_is_healthy_without_alerts_and_aggregates_totals() {
        let m = PerformanceMonitor::default();
        m.record_operation("a", 10.0, true);
        m.record_operation("b", 30.0, false);
        let s = m.summary();
        assert_eq!(s.status, HealthStatus::Healthy);
        assert_eq!(s.total_operations, 2);
        assert_eq!(s.total_failures, 1);
        assert!((s.average_response_ms - 20.0).abs() < 1e-9);
        assert_eq!(s.operations.len(), 2);
        m.reset();
        assert_eq!(m.summary().total_operations, 0);
    }

    #[test]
    fn timer_records_on_stop_and_failure_on_drop() {
        let m = PerformanceMonitor::default();
        let t = m.start_operation("timed");
        std::thread::sleep(Duration::from_millis(5));
        let d = t.stop(true);
        assert!(d >= Duration::from_millis(5));
        let s = m.metrics("timed").unwrap();
        assert_eq!((s.count, s.success_count), (1, 1));
        assert!(s.min_ms >= 5.0);

        {
            let _abandoned = m.start_operation("timed");
        }
        let s = m.metrics("timed").unwrap();
        assert_eq!((s.count, s.failure_count), (2, 1));
    }

    #[test]
    fn nearest_rank_edges() {
        assert_eq!(nearest_rank(&[], 0.95), 0.0);
        assert_eq!(nearest_rank(&[7.0], 0.99), 7.0);
        assert_eq!(nearest_rank(&[1.0, 2.0], 0.5), 1.0);
        assert_eq!(nearest_rank(&[1.0, 2.0], 0.95), 2.0);
    }

    proptest! {
        #[test]
        fn p99_is_never_below_p95(samples in proptest::collection::vec(0.0f64..10_000.0, 1..300)) {
            let m = monitor(MonitorThresholds {
                response_time_ms: f64::MAX,
                ops_per_second: f64::MAX,
                ..Default::default()
            });
            for s in &samples {
                m.record_operation("op", *s, true);
            }
            let s = m.metrics("op").unwrap();
            prop_assert!(s.p99_ms >= s.p95_ms);
            prop_assert!(s.p99_ms <= s.max_ms);
        }
    }
}
