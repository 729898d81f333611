use std::backtrace::Backtrace;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;

use heron_common::Codec;
use heron_engine::{Engine, EngineError, ReadTx, WriteTx};

use crate::error::KvError;

/// Observer invoked after a write transaction that ran longer than the
/// configured threshold. Receives the call-site backtrace captured *before*
/// the engine was entered, and the total elapsed time.
pub type SlowUpdateFn = Box<dyn Fn(&Backtrace, Duration) + Send>;

struct SlowUpdate {
    min: Duration,
    observe: SlowUpdateFn,
}

struct DbInner {
    engine: RwLock<Option<Engine>>,
    codec: RwLock<Codec>,
    use_batch: AtomicBool,
    slow_installed: AtomicBool,
    // Also serializes observed updates so the observer is never re-entered.
    slow: Mutex<Option<SlowUpdate>>,
    on_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    path: PathBuf,
}

/// A shared handle to one open database. Clones share the same engine;
/// `close` tears the engine down for every clone.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").field("path", &self.inner.path).finish()
    }
}

impl Db {
    pub(crate) fn new(engine: Engine, codec: Codec) -> Self {
        let path = engine.path().to_path_buf();
        Self {
            inner: Arc::new(DbInner {
                engine: RwLock::new(Some(engine)),
                codec: RwLock::new(codec),
                use_batch: AtomicBool::new(false),
                slow_installed: AtomicBool::new(false),
                slow: Mutex::new(None),
                on_close: Mutex::new(None),
                path,
            }),
        }
    }

    pub(crate) fn set_on_close(&self, hook: Box<dyn FnOnce() + Send>) {
        *self.inner.on_close.lock() = Some(hook);
    }

    pub(crate) fn clear_on_close(&self) {
        self.inner.on_close.lock().take();
    }

    pub(crate) fn same_handle(&self, other: &Db) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn codec(&self) -> Codec {
        *self.inner.codec.read()
    }

    /// Replace the value codec for all subsequent typed reads and writes.
    pub fn set_codec(&self, codec: Codec) {
        *self.inner.codec.write() = codec;
    }

    /// Route subsequent `put_bytes` through the coalescing batcher instead of
    /// one transaction per write. Returns the previous setting.
    pub fn use_batch(&self, v: bool) -> bool {
        self.inner.use_batch.swap(v, Ordering::AcqRel)
    }

    /// Install the slow-update observer. At most one per database; a second
    /// installation is a programmer error and panics, as does a threshold
    /// under one millisecond.
    pub fn on_slow_update(
        &self,
        min: Duration,
        observe: impl Fn(&Backtrace, Duration) + Send + 'static,
    ) {
        assert!(min >= Duration::from_millis(1), "slow-update threshold below 1ms");
        let mut slot = self.inner.slow.lock();
        assert!(slot.is_none(), "slow-update observer installed twice");
        *slot = Some(SlowUpdate { min, observe: Box::new(observe) });
        self.inner.slow_installed.store(true, Ordering::Release);
    }

    fn with_engine<R>(&self, f: impl FnOnce(&Engine) -> Result<R, KvError>) -> Result<R, KvError> {
        let guard = self.inner.engine.read();
        match guard.as_ref() {
            Some(engine) => f(engine),
            None => Err(KvError::Closed),
        }
    }

    /// Run `f` in a read transaction.
    pub fn view<R>(&self, f: impl FnOnce(&ReadTx) -> Result<R, KvError>) -> Result<R, KvError> {
        self.with_engine(|engine| {
            let tx = engine.begin_read()?;
            f(&tx)
        })
    }

    /// Run `f` in a write transaction; commit on `Ok`, abort on `Err`.
    pub fn update<R>(&self, f: impl FnOnce(&mut WriteTx) -> Result<R, KvError>) -> Result<R, KvError> {
        if self.inner.slow_installed.load(Ordering::Acquire) {
            self.update_slow(f)
        } else {
            self.run_update(f)
        }
    }

    fn run_update<R>(&self, f: impl FnOnce(&mut WriteTx) -> Result<R, KvError>) -> Result<R, KvError> {
        self.with_engine(|engine| {
            let mut tx = engine.begin_write()?;
            match f(&mut tx) {
                Ok(r) => {
                    tx.commit()?;
                    Ok(r)
                }
                Err(e) => {
                    tx.abort();
                    Err(e)
                }
            }
        })
    }

    fn update_slow<R>(&self, f: impl FnOnce(&mut WriteTx) -> Result<R, KvError>) -> Result<R, KvError> {
        // Capture the call site here, not inside the engine; the elapsed time
        // includes waiting for the observer lock and the writer slot.
        let callers = Backtrace::force_capture();
        let start = Instant::now();
        let slot = self.inner.slow.lock();
        let res = self.run_update(f);
        if let Some(slow) = slot.as_ref() {
            let took = start.elapsed();
            if took >= slow.min {
                (slow.observe)(&callers, took);
            }
        }
        res
    }

    /// Run `f` coalesced with other concurrent batch writers. `f` may be
    /// retried in its own transaction if the shared batch fails.
    pub fn batch<F>(&self, f: F) -> Result<(), KvError>
    where
        F: FnMut(&mut WriteTx) -> Result<(), EngineError> + Send + 'static,
    {
        self.with_engine(|engine| Ok(engine.batch(f)?))
    }

    /// Raw read. Missing bucket is an error; missing key is `None`.
    pub fn get_bytes(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        self.view(|tx| Ok(tx.get(bucket, key.as_bytes())?))
    }

    /// Typed read through the configured codec. A missing key decodes an
    /// empty buffer, which surfaces as a codec error.
    pub fn get<T: DeserializeOwned>(&self, bucket: &str, key: &str) -> Result<T, KvError> {
        self.get_with(bucket, key, self.codec())
    }

    /// Typed read with a one-off codec override.
    pub fn get_with<T: DeserializeOwned>(
        &self,
        bucket: &str,
        key: &str,
        codec: Codec,
    ) -> Result<T, KvError> {
        let raw = self.get_bytes(bucket, key)?.unwrap_or_default();
        Ok(codec.decode(&raw)?)
    }

    /// Raw write; creates the bucket if absent. Honors the batch toggle.
    pub fn put_bytes(&self, bucket: &str, key: &str, val: &[u8]) -> Result<(), KvError> {
        self.put_raw_bytes(bucket, key.as_bytes(), val)
    }

    pub(crate) fn put_raw_bytes(&self, bucket: &str, key: &[u8], val: &[u8]) -> Result<(), KvError> {
        if self.inner.use_batch.load(Ordering::Acquire) {
            let (bucket, key, val) = (bucket.to_string(), key.to_vec(), val.to_vec());
            self.batch(move |tx| tx.put(&bucket, &key, &val))
        } else {
            self.update(|tx| Ok(tx.put(bucket, key, val)?))
        }
    }

    /// Typed write. Encoding happens before the write lock is taken so the
    /// writer slot is held only for the engine write itself.
    pub fn put<T: Serialize>(&self, bucket: &str, key: &str, val: &T) -> Result<(), KvError> {
        self.put_with(bucket, key, val, self.codec())
    }

    /// Typed write with a one-off codec override.
    pub fn put_with<T: Serialize>(
        &self,
        bucket: &str,
        key: &str,
        val: &T,
        codec: Codec,
    ) -> Result<(), KvError> {
        let bytes = codec.encode(val)?;
        self.put_bytes(bucket, key, &bytes)
    }

    /// Deleting a missing key (or from a missing bucket) is success.
    pub fn delete(&self, bucket: &str, key: &str) -> Result<(), KvError> {
        self.update(|tx| Ok(tx.delete(bucket, key.as_bytes())?))
    }

    /// Iterate raw key/value pairs in key order within a read transaction.
    pub fn for_each_bytes(
        &self,
        bucket: &str,
        f: impl FnMut(&[u8], &[u8]) -> Result<(), KvError>,
    ) -> Result<(), KvError> {
        self.view(|tx| tx.for_each(bucket, f))
    }

    /// Typed iteration through the configured codec.
    pub fn for_each<T, F>(&self, bucket: &str, mut f: F) -> Result<(), KvError>
    where
        T: DeserializeOwned,
        F: FnMut(&str, T) -> Result<(), KvError>,
    {
        let codec = self.codec();
        self.for_each_bytes(bucket, |k, v| {
            let val: T = codec.decode(v)?;
            f(String::from_utf8_lossy(k).as_ref(), val)
        })
    }

    /// Advance the bucket's sequence counter, creating the bucket if absent.
    pub fn next_index(&self, bucket: &str) -> Result<u64, KvError> {
        self.update(|tx| Ok(tx.next_sequence(bucket)?))
    }

    /// Read-only observation of the sequence counter; 0 for an absent bucket.
    pub fn current_index(&self, bucket: &str) -> Result<u64, KvError> {
        self.view(|tx| Ok(tx.sequence(bucket)?))
    }

    pub fn set_next_index(&self, bucket: &str, n: u64) -> Result<(), KvError> {
        self.update(|tx| Ok(tx.set_sequence(bucket, n)?))
    }

    pub fn buckets(&self) -> Result<Vec<String>, KvError> {
        self.view(|tx| Ok(tx.buckets()?))
    }

    /// Begin a writable transaction owned by the caller. Used by the remote
    /// server to hold a transaction across requests.
    pub fn begin_write(&self) -> Result<WriteTx, KvError> {
        self.with_engine(|engine| Ok(engine.begin_write()?))
    }

    /// Stream a consistent snapshot of the database file into `w`.
    pub fn write_to<W: std::io::Write>(&self, w: &mut W) -> Result<u64, KvError> {
        self.with_engine(|engine| Ok(engine.write_to(w)?))
    }

    pub fn backup_to_file(&self, path: impl AsRef<Path>) -> Result<u64, KvError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut f = std::fs::File::create(path)?;
        self.write_to(&mut f)
    }

    /// Close the engine. Runs the registry detach hook first, then drops the
    /// engine, invalidating every clone of this handle.
    pub fn close(&self) -> Result<(), KvError> {
        if let Some(hook) = self.inner.on_close.lock().take() {
            hook();
        }
        let engine = self.inner.engine.write().take();
        drop(engine);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multi::{MultiDb, OpenOptions};
    use serde::Deserialize;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct S {
        x: i32,
        y: String,
        nested: Option<Box<S>>,
    }

    fn open_temp() -> (tempfile::TempDir, Db) {
        let dir = tempfile::tempdir().unwrap();
        let mdb = MultiDb::new(dir.path(), ".db", OpenOptions::default());
        let db = mdb.get("x", None).unwrap();
        (dir, db)
    }

    #[test]
    fn typed_roundtrip_both_codecs() {
        let (_dir, db) = open_temp();
        let val = S {
            x: 42,
            y: "answer".into(),
            nested: Some(Box::new(S { x: 7, y: "inner".into(), nested: None })),
        };
        for codec in [Codec::Json, Codec::Binary] {
            db.set_codec(codec);
            db.put("b1", "key", &val).unwrap();
            let back: S = db.get("b1", "key").unwrap();
            assert_eq!(back, val);
        }
    }

    #[test]
    fn get_bytes_missing_key_is_none() {
        let (_dir, db) = open_temp();
        db.put_bytes("b", "k", b"v").unwrap();
        assert_eq!(db.get_bytes("b", "other").unwrap(), None);
        assert!(db.get_bytes("ghost", "k").unwrap_err().is_bucket_not_found());
    }

    #[test]
    fn delete_then_get_roundtrip() {
        let (_dir, db) = open_temp();
        db.put_bytes("b", "k", b"v").unwrap();
        db.delete("b", "k").unwrap();
        assert_eq!(db.get_bytes("b", "k").unwrap(), None);
        // deleting again is still success
        db.delete("b", "k").unwrap();
    }

    #[test]
    fn sequence_counters() {
        let (_dir, db) = open_temp();
        assert_eq!(db.current_index("b").unwrap(), 0);
        let a = db.next_index("b").unwrap();
        let b = db.next_index("b").unwrap();
        assert!(b > a);
        assert_eq!(db.current_index("b").unwrap(), b);
        db.set_next_index("b", 1000).unwrap();
        assert_eq!(db.next_index("b").unwrap(), 1001);
    }

    #[test]
    fn use_batch_toggle_returns_previous() {
        let (_dir, db) = open_temp();
        assert!(!db.use_batch(true));
        assert!(db.use_batch(true));
        db.put_bytes("b", "k", b"batched").unwrap();
        assert_eq!(db.get_bytes("b", "k").unwrap(), Some(b"batched".to_vec()));
        assert!(db.use_batch(false));
    }

    #[test]
    fn slow_update_observer_fires_once_per_slow_update() {
        let (_dir, db) = open_temp();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        db.on_slow_update(Duration::from_millis(1), move |_callers, took| {
            assert!(took >= Duration::from_millis(1));
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        db.update(|tx| {
            std::thread::sleep(Duration::from_millis(20));
            Ok(tx.put("b", b"k", b"v")?)
        })
        .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // fast updates stay silent
        db.update(|tx| Ok(tx.put("b", b"k2", b"v")?)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "installed twice")]
    fn slow_update_observer_single_installation() {
        let (_dir, db) = open_temp();
        db.on_slow_update(Duration::from_millis(1), |_, _| {});
        db.on_slow_update(Duration::from_millis(1), |_, _| {});
    }

    #[test]
    fn closed_handle_rejects_operations() {
        let (_dir, db) = open_temp();
        let clone = db.clone();
        db.close().unwrap();
        assert!(matches!(clone.get_bytes("b", "k"), Err(KvError::Closed)));
    }

    #[test]
    fn typed_for_each_sees_all_entries() {
        let (_dir, db) = open_temp();
        for i in 0..10 {
            db.put("b", &format!("{i:03}"), &S { x: i, y: i.to_string(), nested: None }).unwrap();
        }
        let mut seen = Vec::new();
        db.for_each::<S, _>("b", |k, v| {
            seen.push((k.to_string(), v.x));
            Ok(())
        })
        .unwrap();
        assert_eq!(seen.len(), 10);
        assert_eq!(seen[3], ("003".to_string(), 3));
    }
}
