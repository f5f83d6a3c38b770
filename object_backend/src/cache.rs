//! Key-value caching of backend objects.
//!
//! Blooms and indexes are read far more often than they change (never), so
//! reads flagged `should_cache` consult a [`Cache`] before touching the
//! backing store. Memcached/redis implementations live behind the same
//! trait in their own processes; [`MemCache`] covers single-process use.

use crate::{AppendTracker, RawReader, RawWriter, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    fmt::Debug,
    sync::Arc,
};

/// A byte cache keyed by string.
pub trait Cache: Debug + Send + Sync + 'static {
    /// Fetch a previously stored value.
    fn get(&self, key: &str) -> Option<Bytes>;

    /// Store a value.
    fn set(&self, key: &str, value: Bytes);
}

/// Bounded in-memory [`Cache`] with insertion-order eviction.
#[derive(Debug)]
pub struct MemCache {
    max_entries: usize,
    state: Mutex<MemCacheState>,
}

#[derive(Debug, Default)]
struct MemCacheState {
    entries: HashMap<String, Bytes>,
    order: VecDeque<String>,
}

impl MemCache {
    /// Create a cache holding at most `max_entries` objects.
    pub fn new(max_entries: usize) -> Self {
        assert!(max_entries > 0);
        Self {
            max_entries,
            state: Default::default(),
        }
    }
}

impl Cache for MemCache {
    fn get(&self, key: &str) -> Option<Bytes> {
        self.state.lock().entries.get(key).cloned()
    }

    fn set(&self, key: &str, value: Bytes) {
        let mut state = self.state.lock();
        if state.entries.insert(key.to_string(), value).is_none() {
            state.order.push_back(key.to_string());
        }
        while state.entries.len() > self.max_entries {
            match state.order.pop_front() {
                Some(evicted) => {
                    state.entries.remove(&evicted);
                }
                None => break,
            }
        }
    }
}

fn cache_key(keypath: &[String], name: &str) -> String {
    let mut key = keypath.join(":");
    key.push(':');
    key.push_str(name);
    key
}

/// Decorates a reader/writer pair with a [`Cache`].
///
/// Only calls carrying `should_cache = true` consult or populate the cache.
/// Writes populate before delegating; durability remains the inner
/// writer's job.
#[derive(Debug)]
pub struct CachingBackend {
    reader: Arc<dyn RawReader>,
    writer: Arc<dyn RawWriter>,
    cache: Arc<dyn Cache>,
}

impl CachingBackend {
    /// Wrap `reader`/`writer` with `cache`.
    pub fn new(
        reader: Arc<dyn RawReader>,
        writer: Arc<dyn RawWriter>,
        cache: Arc<dyn Cache>,
    ) -> Self {
        Self {
            reader,
            writer,
            cache,
        }
    }
}

#[async_trait]
impl RawReader for CachingBackend {
    async fn read(&self, name: &str, keypath: &[String], should_cache: bool) -> Result<Bytes> {
        if !should_cache {
            return self.reader.read(name, keypath, false).await;
        }

        let key = cache_key(keypath, name);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }

        let bytes = self.reader.read(name, keypath, true).await?;
        self.cache.set(&key, bytes.clone());
        Ok(bytes)
    }

    async fn read_range(
        &self,
        name: &str,
        keypath: &[String],
        offset: u64,
        len: usize,
    ) -> Result<Bytes> {
        // range reads bypass the cache: they target pages, which are far
        // larger than the hot index/bloom objects this cache is for
        self.reader.read_range(name, keypath, offset, len).await
    }

    async fn list(&self, keypath: &[String]) -> Result<Vec<String>> {
        self.reader.list(keypath).await
    }
}

#[async_trait]
impl RawWriter for CachingBackend {
    async fn write(
        &self,
        name: &str,
        keypath: &[String],
        data: Bytes,
        should_cache: bool,
    ) -> Result<()> {
        if should_cache {
            self.cache.set(&cache_key(keypath, name), data.clone());
        }
        self.writer.write(name, keypath, data, should_cache).await
    }

    async fn append(
        &self,
        name: &str,
        keypath: &[String],
        tracker: Option<AppendTracker>,
        data: &[u8],
    ) -> Result<AppendTracker> {
        self.writer.append(name, keypath, tracker, data).await
    }

    async fn close_append(&self, tracker: AppendTracker) -> Result<()> {
        self.writer.close_append(tracker).await
    }

    async fn delete(&self, name: &str, keypath: &[String]) -> Result<()> {
        self.writer.delete(name, keypath).await
    }
}
