//! Layered cache: an in-memory LRU in front of an optional shared KV
//! backend. Absence of a configured backend forces memory-only mode.
//!
//! Eviction: LRU in memory, TTL in the KV layer. KV writers use
//! compare-and-swap semantics for TTL updates so concurrent refreshers do
//! not clobber a newer entry.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use lupa_core::ClockFn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One cached value with its TTL bookkeeping.
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub ttl_seconds: u64,
    pub created_at_unix_ms: u64,
}

impl CacheEntry {
    pub fn is_expired(&self, now_unix_ms: u64) -> bool {
        let expires_at = self
            .created_at_unix_ms
            .saturating_add(self.ttl_seconds.saturating_mul(1_000));
        now_unix_ms >= expires_at
    }
}

#[async_trait]
/// Port for the shared KV layer (memcached/valkey-style). The core only
/// needs get, put, and CAS on the creation stamp.
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;
    async fn put(&self, entry: CacheEntry) -> Result<()>;
    /// Writes only when the stored entry still carries `expected_created_at`
    /// (or is absent and `expected_created_at` is None). Returns whether the
    /// swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_created_at: Option<u64>,
        entry: CacheEntry,
    ) -> Result<bool>;
}

#[derive(Default)]
struct LruInner {
    entries: BTreeMap<String, CacheEntry>,
    /// Most-recently-used last.
    order: Vec<String>,
}

impl LruInner {
    fn touch(&mut self, key: &str) {
        self.order.retain(|existing| existing != key);
        self.order.push(key.to_string());
    }

    fn evict_to(&mut self, capacity: usize) {
        while self.entries.len() > capacity {
            let Some(oldest) = self.order.first().cloned() else {
                break;
            };
            self.order.remove(0);
            self.entries.remove(&oldest);
        }
    }
}

/// The layered cache handle shared across components.
pub struct LayeredCache {
    memory: Mutex<LruInner>,
    capacity: usize,
    kv: Option<Arc<dyn KvStore>>,
    clock: ClockFn,
}

impl LayeredCache {
    pub fn new(capacity: usize, kv: Option<Arc<dyn KvStore>>) -> Self {
        Self::with_clock(capacity, kv, lupa_core::system_clock())
    }

    pub fn with_clock(capacity: usize, kv: Option<Arc<dyn KvStore>>, clock: ClockFn) -> Self {
        Self {
            memory: Mutex::new(LruInner::default()),
            capacity: capacity.max(1),
            kv,
            clock,
        }
    }

    pub fn memory_only(&self) -> bool {
        self.kv.is_none()
    }

    /// Memory first; a KV hit is promoted into memory.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = (self.clock)();
        {
            let mut memory = lock_or_recover(&self.memory);
            match memory.entries.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    let entry = entry.clone();
                    memory.touch(key);
                    return Some(entry);
                }
                Some(_) => {
                    memory.entries.remove(key);
                    memory.order.retain(|existing| existing != key);
                }
                None => {}
            }
        }

        let kv = self.kv.as_ref()?;
        match kv.get(key).await {
            Ok(Some(entry)) if !entry.is_expired(now) => {
                let mut memory = lock_or_recover(&self.memory);
                memory.entries.insert(key.to_string(), entry.clone());
                memory.touch(key);
                memory.evict_to(self.capacity);
                Some(entry)
            }
            Ok(_) => None,
            Err(error) => {
                tracing::warn!(key, error = %error, "kv read failed, treating as miss");
                None
            }
        }
    }

    /// Writes through both layers. KV write is CAS-guarded against the
    /// previously observed stamp.
    pub async fn put(&self, key: &str, value: Value, ttl_seconds: u64) {
        let now = (self.clock)();
        let entry = CacheEntry {
            key: key.to_string(),
            value,
            ttl_seconds,
            created_at_unix_ms: now,
        };

        let previous_stamp = {
            let mut memory = lock_or_recover(&self.memory);
            let previous = memory
                .entries
                .insert(key.to_string(), entry.clone())
                .map(|existing| existing.created_at_unix_ms);
            memory.touch(key);
            memory.evict_to(self.capacity);
            previous
        };

        if let Some(kv) = &self.kv {
            match kv.compare_and_swap(key, previous_stamp, entry).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(key, "kv entry changed concurrently, keeping newer value");
                }
                Err(error) => {
                    tracing::warn!(key, error = %error, "kv write failed, memory retains value");
                }
            }
        }
    }

    pub fn len_in_memory(&self) -> usize {
        lock_or_recover(&self.memory).entries.len()
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
