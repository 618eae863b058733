//! `SearchClient` wires cache, executor, monitor and health together behind the
//! three logical operations.

use crate::cache::{CacheKey, CacheStats, MemoryCache};
use crate::config::ClientConfig;
use crate::executor::RequestExecutor;
use crate::health::{
    probe_fn, CacheProbe, ComponentHealth, HealthAggregator, HealthReport, MonitorProbe,
};
use crate::monitor::{PerformanceMonitor, PerformanceSummary};
use crate::retry::RetryObserver;
use crate::validate;
use searchpipe_core::{
    ApiError, CrawlRequest, CrawlResponse, HealthStatus, NewsRequest, NewsResponse, Operation,
    ResponseSource, Result, SearchBackend, SearchRequest, SearchResponse, Served,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinHandle;

type Gate = Arc<tokio::sync::Mutex<()>>;

/// Holds one reference to a key's gate; dropping it (normally or on cancellation)
/// removes the gate from the map once nobody else holds it.
struct GateLease<'a> {
    client: &'a SearchClient,
    key: &'a CacheKey,
    gate: Gate,
}

impl Drop for GateLease<'_> {
    fn drop(&mut self) {
        self.client.release(self.key, &self.gate);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub performance: PerformanceSummary,
    pub cache: CacheStats,
    pub in_flight: usize,
    pub last_health: Option<HealthStatus>,
}

pub struct SearchClient {
    config: ClientConfig,
    cache: Arc<MemoryCache<serde_json::Value>>,
    monitor: Arc<PerformanceMonitor>,
    executor: RequestExecutor,
    health: Arc<HealthAggregator>,
    // One gate per cache key with a call in progress.
    in_flight: Mutex<HashMap<String, Gate>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

fn strip_nulls(v: serde_json::Value) -> serde_json::Value {
    match v {
        serde_json::Value::Object(m) => {
            serde_json::Value::Object(m.into_iter().filter(|(_, v)| !v.is_null()).collect())
        }
        other => other,
    }
}

fn request_body<P: Serialize>(req: &P) -> Result<serde_json::Value> {
    serde_json::to_value(req)
        .map(strip_nulls)
        .map_err(|e| ApiError::validation(vec![format!("request could not be encoded: {e}")]))
}

impl SearchClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let monitor = Arc::new(PerformanceMonitor::new(config.thresholds.clone()));
        let executor = RequestExecutor::new(config.executor_config(), Arc::clone(&monitor))?;
        Ok(Self::assemble(config, monitor, executor))
    }

    pub fn from_env() -> Result<Self> {
        Self::new(ClientConfig::from_env()?)
    }

    /// Same as [`SearchClient::new`] but with a caller-built HTTP client.
    pub fn with_http_client(config: ClientConfig, http: reqwest::Client) -> Result<Self> {
        config.validate()?;
        let monitor = Arc::new(PerformanceMonitor::new(config.thresholds.clone()));
        let executor =
            RequestExecutor::with_client(http, config.executor_config(), Arc::clone(&monitor));
        Ok(Self::assemble(config, monitor, executor))
    }

    fn assemble(
        config: ClientConfig,
        monitor: Arc<PerformanceMonitor>,
        executor: RequestExecutor,
    ) -> Self {
        let cache = Arc::new(MemoryCache::new(config.cache_config()));
        let health = Arc::new(HealthAggregator::new(
            config.health_config(),
            Some(Arc::clone(&monitor)),
        ));
        health.register("performance", Arc::new(MonitorProbe(Arc::clone(&monitor))));
        health.register("cache", Arc::new(CacheProbe::new(Arc::clone(&cache))));
        let upstream = config.clone();
        health.register(
            "upstream_config",
            Arc::new(probe_fn(move || {
                let cfg = upstream.clone();
                async move {
                    Ok::<_, crate::health::BoxError>(match cfg.validate() {
                        Ok(()) => ComponentHealth::healthy(format!("base_url {}", cfg.base_url)),
                        Err(e) => ComponentHealth::critical(e.message.clone())
                            .with_details(serde_json::json!({ "problems": e.details() })),
                    })
                }
            })),
        );

        Self {
            config,
            cache,
            monitor,
            executor,
            health,
            in_flight: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
        }
    }

    pub fn with_retry_observer(mut self, observer: RetryObserver) -> Self {
        self.executor.set_observer(observer);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<MemoryCache<serde_json::Value>> {
        &self.cache
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn health(&self) -> &Arc<HealthAggregator> {
        &self.health
    }

    /// Start the periodic health check and the cache expiry sweep. Idempotent.
    pub fn start_background(&self) {
        self.health.start();
        let mut sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if sweeper.as_ref().map_or(true, |h| h.is_finished()) {
            *sweeper = Some(self.cache.spawn_sweeper());
        }
    }

    pub fn stop_background(&self) {
        self.health.stop();
        if let Some(h) = self.sweeper.lock().unwrap_or_else(|e| e.into_inner()).take() {
            h.abort();
        }
    }

    pub async fn perform_search(&self, req: &SearchRequest) -> Result<Served<SearchResponse>> {
        let body = request_body(req)?;
        self.cached_call(Operation::Search, body).await
    }

    pub async fn perform_news(&self, req: &NewsRequest) -> Result<Served<NewsResponse>> {
        let body = request_body(req)?;
        self.cached_call(Operation::News, body).await
    }

    /// The target URL is re-checked here, so library callers get the same host
    /// restrictions as tool callers.
    pub async fn perform_crawl(&self, req: &CrawlRequest) -> Result<Served<CrawlResponse>> {
        let checked = validate::crawl_request(Some(&req.url), self.config.allow_private_hosts)?;
        let body = request_body(&checked)?;
        self.cached_call(Operation::Crawl, body).await
    }

    fn gate<'a>(&'a self, key: &'a CacheKey) -> GateLease<'a> {
        let mut m = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        let gate = Arc::clone(m.entry(key.as_str().to_string()).or_default());
        GateLease {
            client: self,
            key,
            gate,
        }
    }

    fn release(&self, key: &CacheKey, gate: &Gate) {
        let mut m = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        // Clones are only made under this lock: map + ours means nobody is waiting.
        if Arc::strong_count(gate) <= 2 {
            m.remove(key.as_str());
        }
    }

    fn cached<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        self.cache.get_with(key, |v| T::deserialize(v).ok())
    }

    async fn cached_call<T>(&self, op: Operation, body: serde_json::Value) -> Result<Served<T>>
    where
        T: Serialize + DeserializeOwned + Send,
    {
        let t0 = Instant::now();
        let key = CacheKey::for_request(op, &body);

        // Concurrent misses for one key share a single upstream call: later callers
        // wait here and then find the value in the cache.
        let lease = self.gate(&key);
        let _held = lease.gate.lock().await;
        let out = match self.cached::<T>(&key) {
            Some(value) => {
                tracing::debug!(op = op.as_str(), key = %key, "cache hit");
                Ok(Served {
                    value,
                    source: ResponseSource::Cache,
                    elapsed_ms: t0.elapsed().as_millis(),
                })
            }
            None => self.fetch_and_store(op, &key, &body).await.map(|value| Served {
                value,
                source: ResponseSource::Network,
                elapsed_ms: t0.elapsed().as_millis(),
            }),
        };
        out
    }

    async fn fetch_and_store<T>(
        &self,
        op: Operation,
        key: &CacheKey,
        body: &serde_json::Value,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
    {
        let value: T = self.executor.execute(op, body).await?;
        match serde_json::to_value(&value) {
            Ok(v) => self.cache.set(key, v, Some(self.config.ttl_for(op))),
            Err(e) => tracing::warn!(op = op.as_str(), error = %e, "response not cacheable"),
        }
        Ok(value)
    }

    /// Remove cached entries whose key starts with `pattern` (`search:`, `news:*`, ...).
    pub fn invalidate(&self, pattern: &str) -> usize {
        let n = self.cache.invalidate(pattern);
        tracing::info!(pattern, removed = n, "cache invalidated");
        n
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            performance: self.monitor.summary(),
            cache: self.cache.stats(),
            in_flight: self
                .in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .len(),
            last_health: self.health.last_report().map(|r| r.status),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Run a health check now (independent of the periodic timer).
    pub async fn health_report(&self) -> HealthReport {
        self.health.perform_health_check().await
    }
}

impl Drop for SearchClient {
    fn drop(&mut self) {
        self.stop_background();
    }
}

#[async_trait::async_trait]
impl SearchBackend for SearchClient {
    fn name(&self) -> &'static str {
        "searchpipe"
    }

    async fn search(&self, req: &SearchRequest) -> Result<Served<SearchResponse>> {
        self.perform_search(req).await
    }

    async fn news(&self, req: &NewsRequest) -> Result<Served<NewsResponse>> {
        self.perform_news(req).await
    }

    async fn crawl(&self, req: &CrawlRequest) -> Result<Served<CrawlResponse>> {
        self.perform_crawl(req).await
    }
}
