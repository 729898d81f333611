use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::db::Db;
use crate::error::KvError;
use crate::WriteTx;

/// Outcome of a [`Cache::update`] closure, applied to the cache map only
/// after the engine transaction commits.
pub enum CacheUpdate<T> {
    Put(String, T),
    Delete(String),
    None,
}

/// Monotonic hit/miss counters, snapshotted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// A write-through cache over one bucket of one database.
///
/// Every value crossing the cache boundary is an owned clone; mutating what
/// `get` returned never changes the cache, and the cache never holds a value
/// that was not first written through to the engine.
pub struct Cache<T> {
    map: RwLock<HashMap<String, T>>,
    db: Db,
    bucket: String,
    hits: AtomicU64,
    misses: AtomicU64,
    use_batch: AtomicBool,
}

impl<T> Cache<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    /// Create the bucket if needed and return an empty cache over it.
    pub fn new(db: Db, bucket: impl Into<String>) -> Result<Self, KvError> {
        let bucket = bucket.into();
        db.update(|tx| Ok(tx.create_bucket(&bucket)?))?;
        Ok(Self {
            map: RwLock::new(HashMap::new()),
            db,
            bucket,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            use_batch: AtomicBool::new(false),
        })
    }

    /// Like [`Cache::new`], then pre-populate from the whole bucket.
    pub fn with_load_all(db: Db, bucket: impl Into<String>) -> Result<Self, KvError> {
        let cache = Self::new(db, bucket)?;
        {
            let mut map = cache.map.write();
            cache.db.for_each::<T, _>(&cache.bucket, |k, v| {
                map.insert(k.to_string(), v);
                Ok(())
            })?;
        }
        Ok(cache)
    }

    /// Route write-through puts via the batcher. Returns the old setting.
    pub fn use_batch(&self, v: bool) -> bool {
        self.use_batch.swap(v, Ordering::AcqRel)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Atomic get-or-fill: at most one engine read per miss. The returned
    /// value is always a clone; the cached copy stays private.
    pub fn get(&self, key: &str) -> Result<T, KvError> {
        {
            let map = self.map.read();
            if let Some(v) = map.get(key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(v.clone());
            }
        }
        let mut map = self.map.write();
        if let Some(v) = map.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(v.clone());
        }
        let v: T = self.db.get(&self.bucket, key)?;
        self.misses.fetch_add(1, Ordering::Relaxed);
        map.insert(key.to_string(), v.clone());
        Ok(v)
    }

    /// Write through to the engine, then install the value in the map. The
    /// engine write and the map update happen under the same cache lock so
    /// readers never observe the map ahead of the engine.
    pub fn put(&self, key: &str, v: T) -> Result<(), KvError> {
        let bytes = self.db.codec().encode(&v)?; // marshal outside the engine lock
        let mut map = self.map.write();
        if self.use_batch.load(Ordering::Acquire) {
            let (bucket, key_owned, bytes) = (self.bucket.clone(), key.to_string(), bytes);
            self.db.batch(move |tx| tx.put(&bucket, key_owned.as_bytes(), &bytes))?;
        } else {
            self.db.update(|tx| Ok(tx.put(&self.bucket, key.as_bytes(), &bytes)?))?;
        }
        map.insert(key.to_string(), v);
        Ok(())
    }

    /// Delete from the engine and the map atomically.
    pub fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut map = self.map.write();
        self.db.update(|tx| Ok(tx.delete(&self.bucket, key.as_bytes())?))?;
        map.remove(key);
        Ok(())
    }

    /// Run `f` inside one engine write transaction. A returned
    /// [`CacheUpdate::Put`] is written to the engine within that same
    /// transaction; [`CacheUpdate::Delete`] deletes within it. The cache map
    /// changes only after the transaction commits.
    pub fn update(
        &self,
        f: impl FnOnce(&mut WriteTx) -> Result<CacheUpdate<T>, KvError>,
    ) -> Result<(), KvError> {
        let mut map = self.map.write();
        let outcome = self.db.update(|tx| {
            let outcome = f(tx)?;
            match &outcome {
                CacheUpdate::Put(key, v) => {
                    let bytes = self.db.codec().encode(v)?;
                    tx.put(&self.bucket, key.as_bytes(), &bytes)?;
                }
                CacheUpdate::Delete(key) => {
                    tx.delete(&self.bucket, key.as_bytes())?;
                }
                CacheUpdate::None => {}
            }
            Ok(outcome)
        })?;
        match outcome {
            CacheUpdate::Put(key, v) => {
                map.insert(key, v);
            }
            CacheUpdate::Delete(key) => {
                map.remove(&key);
            }
            CacheUpdate::None => {}
        }
        Ok(())
    }
}
