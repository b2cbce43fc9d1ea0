//! Result cache: TTL-bounded memoization shared across flow runs.
//!
//! Two backends behind one contract. TTL is an age bound on the stored
//! timestamp: a stale entry simply misses on read, it is not evicted.
//!
//! The filesystem backend shards entries two levels deep by hash prefix and
//! guards each file with advisory locks so a reader never observes a
//! half-written entry. A missing or corrupt entry reads as absent.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use lru::LruCache;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::{self, StorageBackend};

/// Seconds since the epoch, fractional.
pub(crate) fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Mapping from an opaque cache key to `(timestamp, value)`.
pub trait ResultCache: Send + Sync {
    /// The stored value iff its age is within `ttl`.
    fn get(&self, key: &str, ttl: Duration) -> Option<Value>;
    fn set(&self, key: &str, value: Value);
}

/// In-memory backend with an optional LRU bound
/// (`RESULT_CACHE_MAX_ENTRIES`). `get` refreshes recency.
pub struct MemoryResultCache {
    entries: Mutex<LruCache<String, (f64, Value)>>,
}

impl MemoryResultCache {
    pub fn new(max_entries: Option<usize>) -> Self {
        let entries = match max_entries.and_then(NonZeroUsize::new) {
            Some(bound) => LruCache::new(bound),
            None => LruCache::unbounded(),
        };
        Self {
            entries: Mutex::new(entries),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResultCache for MemoryResultCache {
    fn get(&self, key: &str, ttl: Duration) -> Option<Value> {
        let mut entries = self.entries.lock();
        let (ts, value) = entries.get(key)?;
        if now_ts() - *ts <= ttl.as_secs_f64() {
            Some(value.clone())
        } else {
            None
        }
    }

    fn set(&self, key: &str, value: Value) {
        self.entries.lock().put(key.to_string(), (now_ts(), value));
    }
}

/// Filesystem backend: `<root>/<hh>/<hh2>/<hex-sha256(key)>`, one JSON
/// `[timestamp, value]` tuple per file.
pub struct FilesystemResultCache {
    root: PathBuf,
}

impl FilesystemResultCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.root.join(&digest[0..2]).join(&digest[2..4]).join(digest)
    }

    fn read_entry(path: &Path) -> Option<(f64, Value)> {
        let mut file = File::open(path).ok()?;
        file.lock_shared().ok()?;
        let mut body = String::new();
        let read = file.read_to_string(&mut body);
        let _ = file.unlock();
        read.ok()?;
        serde_json::from_str(&body).ok()
    }

    fn write_entry(path: &Path, ts: f64, value: &Value) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).write(true).open(path)?;
        file.lock_exclusive()?;
        let body = serde_json::to_string(&(ts, value))?;
        file.set_len(0)?;
        file.write_all(body.as_bytes())?;
        file.flush()?;
        let _ = file.unlock();
        Ok(())
    }
}

impl ResultCache for FilesystemResultCache {
    fn get(&self, key: &str, ttl: Duration) -> Option<Value> {
        let (ts, value) = Self::read_entry(&self.entry_path(key))?;
        if now_ts() - ts <= ttl.as_secs_f64() {
            Some(value)
        } else {
            None
        }
    }

    fn set(&self, key: &str, value: Value) {
        let path = self.entry_path(key);
        if let Err(err) = Self::write_entry(&path, now_ts(), &value) {
            debug!(?path, %err, "result cache write failed");
        }
    }
}

static CACHE: Lazy<RwLock<Option<Arc<dyn ResultCache>>>> = Lazy::new(|| RwLock::new(None));

/// The process-wide result cache, built from configuration on first use.
pub fn result_cache() -> Arc<dyn ResultCache> {
    if let Some(cache) = CACHE.read().as_ref() {
        return Arc::clone(cache);
    }
    let mut slot = CACHE.write();
    if let Some(cache) = slot.as_ref() {
        return Arc::clone(cache);
    }
    let cfg = config::config();
    let cache: Arc<dyn ResultCache> = match cfg.result_cache {
        StorageBackend::Filesystem => {
            Arc::new(FilesystemResultCache::new(cfg.result_cache_path.clone()))
        }
        StorageBackend::Memory => {
            Arc::new(MemoryResultCache::new(cfg.result_cache_max_entries))
        }
    };
    *slot = Some(Arc::clone(&cache));
    cache
}

/// Replace the process-wide cache (hosts and tests).
pub fn set_result_cache(cache: Arc<dyn ResultCache>) {
    *CACHE.write() = Some(cache);
}

/// Default cache key: salted SHA-256 over the task name and its bound
/// argument map (positional index → value), rendered with sorted keys.
pub fn default_cache_key(task_name: &str, args: &[Value]) -> String {
    let mut bound = std::collections::BTreeMap::new();
    for (i, arg) in args.iter().enumerate() {
        bound.insert(i.to_string(), arg);
    }
    let rendered = serde_json::to_string(&(task_name, bound)).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(b"weft:v1");
    hasher.update(rendered.as_bytes());
    hex::encode(hasher.finalize())
}
