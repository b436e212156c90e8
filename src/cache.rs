//! # Result Cache
//!
//! Memoizes analysis results keyed by what was analysed and how.
//!
//! Entries live for a fixed TTL counted from insertion (reads do not extend it)
//! and the cache holds at most `capacity` entries. When full, expired entries
//! are purged first and only then is the least recently used live entry evicted.
//! The cache is best-effort: callers treat any [`CacheError`] as a miss.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::report::AnalysisResult;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache lock poisoned")]
    LockPoisoned,
    #[error("cannot serialize cache key: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

#[derive(Serialize)]
struct KeyMaterial<'a> {
    analysis_type: &'a str,
    fingerprint: &'a str,
    options: Value,
}

impl CacheKey {
    /// Hash of the canonical JSON form of `(analysis_type, fingerprint, options)`.
    ///
    /// Object keys are ordered recursively and integral floats are written as
    /// integers, so `{"a":1,"b":2.0}` and `{"b":2,"a":1}` produce the same key.
    pub fn derive(
        analysis_type: &str,
        fingerprint: &str,
        options: &Value,
    ) -> Result<CacheKey, CacheError> {
        let material = KeyMaterial {
            analysis_type,
            fingerprint,
            options: canonicalize(options),
        };
        let bytes = serde_json::to_vec(&material)?;
        Ok(CacheKey(hex::encode(Sha256::digest(&bytes))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = Map::new();
            for (k, v) in entries {
                out.insert(k.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Number(n) => Value::Number(normalize_number(n)),
        other => other.clone(),
    }
}

fn normalize_number(n: &Number) -> Number {
    if n.is_i64() || n.is_u64() {
        return n.clone();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
            Number::from(f as i64)
        }
        _ => n.clone(),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
}

struct Entry {
    value: AnalysisResult,
    expires_at: Instant,
    last_access: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, Entry>,
    lru: BTreeMap<u64, CacheKey>,
    tick: u64,
}

impl CacheState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, key: &CacheKey) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.lru.remove(&entry.last_access);
        Some(entry)
    }

    fn purge_expired(&mut self, now: Instant) -> u64 {
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len() as u64
    }

    fn evict_lru(&mut self) -> bool {
        let oldest = self.lru.iter().next().map(|(_, k)| k.clone());
        match oldest {
            Some(key) => self.remove(&key).is_some(),
            None => false,
        }
    }
}

pub struct ResultCache {
    state: Mutex<CacheState>,
    capacity: usize,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl ResultCache {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            capacity,
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn get(&self, key: &CacheKey) -> Result<Option<AnalysisResult>, CacheError> {
        let now = Instant::now();
        let mut state = self.state.lock().map_err(|_| CacheError::LockPoisoned)?;

        let expired = match state.entries.get(key) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Some(entry) => entry.expires_at <= now,
        };
        if expired {
            state.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let tick = state.next_tick();
        let CacheState { entries, lru, .. } = &mut *state;
        let Some(entry) = entries.get_mut(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };
        lru.remove(&entry.last_access);
        entry.last_access = tick;
        lru.insert(tick, key.clone());
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(entry.value.clone()))
    }

    /// Insert or replace `key`. A zero-capacity cache stores nothing.
    pub fn put(
        &self,
        key: CacheKey,
        value: AnalysisResult,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        if self.capacity == 0 {
            return Ok(());
        }
        let now = Instant::now();
        let mut state = self.state.lock().map_err(|_| CacheError::LockPoisoned)?;
        state.remove(&key);

        if state.entries.len() >= self.capacity {
            let purged = state.purge_expired(now);
            self.expirations.fetch_add(purged, Ordering::Relaxed);
        }
        while state.entries.len() >= self.capacity {
            if !state.evict_lru() {
                break;
            }
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        let tick = state.next_tick();
        state.lru.insert(tick, key.clone());
        state.entries.insert(
            key,
            Entry {
                value,
                expires_at: now + ttl,
                last_access: tick,
            },
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.entries.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}
