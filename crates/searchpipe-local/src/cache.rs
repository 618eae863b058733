//! In-memory response cache: TTL expiry (lazy on read + periodic sweep) and strict
//! LRU eviction when a new key would push the map past `max_size`.

use searchpipe_core::Operation;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_SIZE: usize = 1000;
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_size: usize,
    /// TTL used by `set` when the caller passes `None`.
    pub default_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            default_ttl: DEFAULT_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Stable 64-bit FNV-1a. Not collision resistant; entries also carry the
/// normalized string they were hashed from and reads compare it.
pub fn rolling_hash(s: &str) -> u64 {
    let mut h: u64 = 1469598103934665603;
    for b in s.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(1099511628211);
    }
    h
}

/// Sorted `k=v&k=v` rendering of a parameter object with nulls dropped.
pub fn normalize_params(params: &serde_json::Value) -> String {
    match params {
        serde_json::Value::Object(m) => {
            let sorted: BTreeMap<&String, &serde_json::Value> =
                m.iter().filter(|(_, v)| !v.is_null()).collect();
            sorted
                .into_iter()
                .map(|(k, v)| match v {
                    serde_json::Value::String(s) => format!("{k}={s}"),
                    other => format!("{k}={other}"),
                })
                .collect::<Vec<_>>()
                .join("&")
        }
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    key: String,
    fingerprint: String,
}

impl CacheKey {
    /// Key for one upstream request: `<op>:<hash of normalized params>`.
    pub fn for_request<P: Serialize>(op: Operation, params: &P) -> Self {
        let v = serde_json::to_value(params).unwrap_or(serde_json::Value::Null);
        let fingerprint = format!("{}:{}", op.as_str(), normalize_params(&v));
        Self {
            key: format!("{}:{:016x}", op.as_str(), rolling_hash(&fingerprint)),
            fingerprint,
        }
    }

    /// A literal key whose fingerprint is the key itself.
    pub fn raw(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            fingerprint: key.clone(),
            key,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

#[derive(Debug)]
struct CacheEntry<T> {
    data: T,
    created_at: Instant,
    ttl: Duration,
    access_count: u64,
    last_accessed: Instant,
    // Monotonic access order; Instants can tie on coarse clocks.
    access_seq: u64,
    size_estimate_bytes: usize,
    fingerprint: String,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    pub collisions: u64,
    pub size: usize,
    pub max_size: usize,
    pub memory_usage_bytes: usize,
    pub hit_ratio: f64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    sets: u64,
    evictions: u64,
    expirations: u64,
    invalidations: u64,
    collisions: u64,
    memory_usage_bytes: usize,
}

#[derive(Debug)]
struct CacheState<T> {
    entries: HashMap<String, CacheEntry<T>>,
    seq: u64,
    counters: Counters,
}

impl<T> CacheState<T> {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<T>> {
        let e = self.entries.remove(key)?;
        self.counters.memory_usage_bytes = self
            .counters
            .memory_usage_bytes
            .saturating_sub(e.size_estimate_bytes);
        Some(e)
    }

    fn evict_lru(&mut self) -> bool {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.access_seq)
            .map(|(k, _)| k.clone());
        match victim {
            Some(k) => {
                self.remove(&k);
                self.counters.evictions += 1;
                tracing::debug!(key = %k, "cache evicted least-recently-used entry");
                true
            }
            None => false,
        }
    }
}

/// Process-local cache. Callers get clones of stored values, never references.
#[derive(Debug)]
pub struct MemoryCache<T> {
    config: CacheConfig,
    state: Mutex<CacheState<T>>,
}

impl<T: Clone + Serialize> MemoryCache<T> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                seq: 0,
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &CacheKey) -> Option<T> {
        self.get_with(key, |v| Some(v.clone()))
    }

    /// Read through `decode`. An entry that `decode` rejects is dropped and the
    /// lookup counts as a miss.
    pub fn get_with<U>(&self, key: &CacheKey, decode: impl FnOnce(&T) -> Option<U>) -> Option<U> {
        let now = Instant::now();
        let mut s = self.lock();
        let Some(e) = s.entries.get(key.as_str()) else {
            s.counters.misses += 1;
            return None;
        };
        if e.is_expired(now) {
            s.remove(key.as_str());
            s.counters.expirations += 1;
            s.counters.misses += 1;
            return None;
        }
        if e.fingerprint != key.fingerprint() {
            s.counters.collisions += 1;
            s.counters.misses += 1;
            tracing::debug!(key = %key, "cache key hash collision; treating as miss");
            return None;
        }
        let Some(data) = decode(&e.data) else {
            s.remove(key.as_str());
            s.counters.misses += 1;
            tracing::warn!(key = %key, "cached value has unexpected shape; dropped");
            return None;
        };
        let seq = s.next_seq();
        let e = s.entries.get_mut(key.as_str())?;
        e.access_count += 1;
        e.last_accessed = now;
        e.access_seq = seq;
        s.counters.hits += 1;
        Some(data)
    }

    /// Insert or replace. Only inserting a *new* key at capacity evicts.
    pub fn set(&self, key: &CacheKey, value: T, ttl: Option<Duration>) {
        if self.config.max_size == 0 {
            return;
        }
        let size = estimate_size(key.as_str(), &value);
        let now = Instant::now();
        let mut s = self.lock();
        if s.entries.contains_key(key.as_str()) {
            s.remove(key.as_str());
        } else {
            while s.entries.len() >= self.config.max_size {
                if !s.evict_lru() {
                    break;
                }
            }
        }
        let seq = s.next_seq();
        s.entries.insert(
            key.as_str().to_string(),
            CacheEntry {
                data: value,
                created_at: now,
                ttl: ttl.unwrap_or(self.config.default_ttl),
                access_count: 0,
                last_accessed: now,
                access_seq: seq,
                size_estimate_bytes: size,
                fingerprint: key.fingerprint().to_string(),
            },
        );
        s.counters.sets += 1;
        s.counters.memory_usage_bytes += size;
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        self.lock().remove(key.as_str()).is_some()
    }

    /// Remove every key starting with `pattern` (a trailing `*` is accepted and ignored).
    pub fn invalidate(&self, pattern: &str) -> usize {
        let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
        let mut s = self.lock();
        let doomed: Vec<String> = s
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for k in &doomed {
            s.remove(k);
        }
        s.counters.invalidations += doomed.len() as u64;
        doomed.len()
    }

    pub fn clear(&self) -> usize {
        let mut s = self.lock();
        let n = s.entries.len();
        s.entries.clear();
        s.counters.memory_usage_bytes = 0;
        s.counters.invalidations += n as u64;
        n
    }

    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut s = self.lock();
        let expired: Vec<String> = s
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &expired {
            s.remove(k);
        }
        s.counters.expirations += expired.len() as u64;
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many times `key` has been read, if present (expired entries included).
    pub fn access_count(&self, key: &CacheKey) -> Option<u64> {
        self.lock().entries.get(key.as_str()).map(|e| e.access_count)
    }

    pub fn stats(&self) -> CacheStats {
        let s = self.lock();
        let c = &s.counters;
        let lookups = c.hits + c.misses;
        CacheStats {
            hits: c.hits,
            misses: c.misses,
            sets: c.sets,
            evictions: c.evictions,
            expirations: c.expirations,
            invalidations: c.invalidations,
            collisions: c.collisions,
            size: s.entries.len(),
            max_size: self.config.max_size,
            memory_usage_bytes: c.memory_usage_bytes,
            hit_ratio: if lookups == 0 {
                0.0
            } else {
                c.hits as f64 / lookups as f64
            },
        }
    }
}

impl<T: Clone + Serialize + Send + 'static> MemoryCache<T> {
    /// Spawn the periodic expiry sweep. The task exits once the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let every = self.config.sweep_interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(cache) = weak.upgrade() else { break };
                let n = cache.sweep_expired();
                if n > 0 {
                    tracing::debug!(expired = n, "cache sweep removed expired entries");
                }
            }
        })
    }
}

fn estimate_size<T: Serialize>(key: &str, value: &T) -> usize {
    let body = serde_json::to_vec(value).map(|b| b.len()).unwrap_or(0);
    key.len() + body
}
