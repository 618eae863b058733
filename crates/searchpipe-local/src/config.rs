//! Client configuration from `SEARCHPIPE_*` environment variables.
//!
//! Empty or whitespace-only values are treated as unset. Parse failures and
//! range problems are collected and reported together as one `ConfigInvalid`.

use crate::cache::{CacheConfig, DEFAULT_MAX_SIZE, DEFAULT_SWEEP_INTERVAL};
use crate::executor::{ExecutorConfig, DEFAULT_BASE_URL, DEFAULT_TIMEOUT};
use crate::health::{HealthConfig, DEFAULT_CHECK_INTERVAL, DEFAULT_PROBE_TIMEOUT};
use crate::monitor::MonitorThresholds;
use crate::retry::RetryPolicy;
use searchpipe_core::{ApiError, Operation, Result};
use std::str::FromStr;
use std::time::Duration;

pub const ENV_API_KEY: &str = "SEARCHPIPE_API_KEY";
pub const ENV_API_KEY_ALIAS: &str = "SEARCH_API_KEY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    pub search: Duration,
    pub news: Duration,
    pub crawl: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            search: Duration::from_secs(300),
            news: Duration::from_secs(120),
            crawl: Duration::from_secs(3600),
        }
    }
}

#[derive(Clone)]
pub struct ClientConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub cache_ttls: CacheTtls,
    pub cache_max_size: usize,
    pub thresholds: MonitorThresholds,
    pub health_interval: Duration,
    /// Allow crawling loopback / private / link-local hosts.
    pub allow_private_hosts: bool,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("cache_ttls", &self.cache_ttls)
            .field("cache_max_size", &self.cache_max_size)
            .field("thresholds", &self.thresholds)
            .field("health_interval", &self.health_interval)
            .field("allow_private_hosts", &self.allow_private_hosts)
            .finish()
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

struct Reader<F> {
    lookup: F,
    problems: Vec<String>,
}

impl<F: Fn(&str) -> Option<String>> Reader<F> {
    fn string(&self, key: &str) -> Option<String> {
        non_empty((self.lookup)(key))
    }

    fn parsed<T>(&mut self, key: &str, default: T) -> T
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            None => default,
            Some(raw) => match raw.parse::<T>() {
                Ok(v) => v,
                Err(e) => {
                    self.problems.push(format!("{key}={raw:?}: {e}"));
                    default
                }
            },
        }
    }

    fn millis(&mut self, key: &str, default: Duration) -> Duration {
        Duration::from_millis(self.parsed(key, default.as_millis() as u64))
    }

    fn secs(&mut self, key: &str, default: Duration) -> Duration {
        Duration::from_secs(self.parsed(key, default.as_secs()))
    }

    fn flag(&mut self, key: &str) -> bool {
        match self.string(key).map(|s| s.to_ascii_lowercase()) {
            None => false,
            Some(s) => match s.as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    self.problems.push(format!("{key}={s:?}: expected a boolean"));
                    false
                }
            },
        }
    }
}

impl ClientConfig {
    /// Defaults for everything except the key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
            cache_ttls: CacheTtls::default(),
            cache_max_size: DEFAULT_MAX_SIZE,
            thresholds: MonitorThresholds::default(),
            health_interval: DEFAULT_CHECK_INTERVAL,
            allow_private_hosts: false,
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary key lookup, then validate.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut r = Reader {
            lookup,
            problems: Vec::new(),
        };
        let api_key = r
            .string(ENV_API_KEY)
            .or_else(|| r.string(ENV_API_KEY_ALIAS))
            .unwrap_or_default();
        let mut cfg = Self::new(api_key);
        let defaults = cfg.clone();

        if let Some(base) = r.string("SEARCHPIPE_BASE_URL") {
            cfg.base_url = base;
        }
        cfg.timeout = r.millis("SEARCHPIPE_TIMEOUT_MS", defaults.timeout);
        cfg.retry.max_attempts =
            r.parsed("SEARCHPIPE_RETRY_ATTEMPTS", defaults.retry.max_attempts);
        cfg.retry.initial_delay =
            r.millis("SEARCHPIPE_RETRY_DELAY_MS", defaults.retry.initial_delay);
        cfg.retry.max_delay = r.millis("SEARCHPIPE_RETRY_MAX_DELAY_MS", defaults.retry.max_delay);
        cfg.cache_ttls = CacheTtls {
            search: r.secs("SEARCHPIPE_CACHE_TTL_SEARCH_S", defaults.cache_ttls.search),
            news: r.secs("SEARCHPIPE_CACHE_TTL_NEWS_S", defaults.cache_ttls.news),
            crawl: r.secs("SEARCHPIPE_CACHE_TTL_CRAWL_S", defaults.cache_ttls.crawl),
        };
        cfg.cache_max_size = r.parsed("SEARCHPIPE_CACHE_MAX_SIZE", defaults.cache_max_size);
        cfg.thresholds.response_time_ms = r.parsed(
            "SEARCHPIPE_ALERT_RESPONSE_TIME_MS",
            defaults.thresholds.response_time_ms,
        );
        cfg.thresholds.error_rate =
            r.parsed("SEARCHPIPE_ALERT_ERROR_RATE", defaults.thresholds.error_rate);
        cfg.thresholds.ops_per_second =
            r.parsed("SEARCHPIPE_ALERT_OPS_PER_S", defaults.thresholds.ops_per_second);
        cfg.health_interval = r.secs("SEARCHPIPE_HEALTH_INTERVAL_S", defaults.health_interval);
        cfg.allow_private_hosts = r.flag("SEARCHPIPE_ALLOW_PRIVATE_HOSTS");

        let mut problems = r.problems;
        if let Err(e) = cfg.validate() {
            problems.extend(e.details().iter().cloned());
        }
        if problems.is_empty() {
            Ok(cfg)
        } else {
            Err(ApiError::config(problems))
        }
    }

    /// Every problem found, not just the first.
    pub fn validate(&self) -> Result<()> {
        let mut p = Vec::new();
        if self.api_key.trim().is_empty() {
            p.push(format!("{ENV_API_KEY} is required (or {ENV_API_KEY_ALIAS})"));
        }
        match url::Url::parse(&self.base_url) {
            Ok(u) if matches!(u.scheme(), "http" | "https") => {}
            Ok(u) => p.push(format!("base_url scheme must be http or https, got {:?}", u.scheme())),
            Err(e) => p.push(format!("base_url {:?} is not a valid URL: {e}", self.base_url)),
        }
        if self.timeout.is_zero() {
            p.push("timeout must be greater than zero".to_string());
        }
        if !(1..=10).contains(&self.retry.max_attempts) {
            p.push(format!(
                "retry attempts must be between 1 and 10, got {}",
                self.retry.max_attempts
            ));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            p.push("retry delay must not exceed retry max delay".to_string());
        }
        if !(self.retry.backoff_factor >= 1.0) {
            p.push("backoff factor must be >= 1".to_string());
        }
        for (name, ttl) in [
            ("search", self.cache_ttls.search),
            ("news", self.cache_ttls.news),
            ("crawl", self.cache_ttls.crawl),
        ] {
            if ttl.is_zero() {
                p.push(format!("{name} cache ttl must be greater than zero"));
            }
        }
        let t = &self.thresholds;
        if !(t.response_time_ms > 0.0) {
            p.push("response time threshold must be positive".to_string());
        }
        if !(t.error_rate > 0.0 && t.error_rate <= 1.0) {
            p.push(format!("error rate threshold must be in (0, 1], got {}", t.error_rate));
        }
        if !(t.ops_per_second > 0.0) {
            p.push("ops/sec threshold must be positive".to_string());
        }
        if self.health_interval < Duration::from_secs(1) {
            p.push("health interval must be at least 1s".to_string());
        }
        if p.is_empty() {
            Ok(())
        } else {
            Err(ApiError::config(p))
        }
    }

    pub fn ttl_for(&self, op: Operation) -> Duration {
        match op {
            Operation::Search => self.cache_ttls.search,
            Operation::News => self.cache_ttls.news,
            Operation::Crawl => self.cache_ttls.crawl,
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            timeout: self.timeout,
            retry: self.retry.clone(),
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_size: self.cache_max_size,
            default_ttl: self.cache_ttls.search,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            check_interval: self.health_interval,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            alert_window: self.thresholds.alert_cooldown,
        }
    }

    /// Secret-free view for diagnostics.
    pub fn redacted(&self) -> serde_json::Value {
        serde_json::json!({
            "api_key_present": !self.api_key.trim().is_empty(),
            "base_url": self.base_url,
            "timeout_ms": self.timeout.as_millis() as u64,
            "retry": {
                "max_attempts": self.retry.max_attempts,
                "initial_delay_ms": self.retry.initial_delay.as_millis() as u64,
                "max_delay_ms": self.retry.max_delay.as_millis() as u64,
                "backoff_factor": self.retry.backoff_factor,
                "jitter": self.retry.jitter,
            },
            "cache": {
                "max_size": self.cache_max_size,
                "ttl_s": {
                    "search": self.cache_ttls.search.as_secs(),
                    "news": self.cache_ttls.news.as_secs(),
                    "crawl": self.cache_ttls.crawl.as_secs(),
                },
            },
            "thresholds": self.thresholds,
            "health_interval_s": self.health_interval.as_secs(),
            "allow_private_hosts": self.allow_private_hosts,
        })
    }
}
