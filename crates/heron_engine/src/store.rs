use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use redb::{
    ReadTransaction, ReadableTable, TableDefinition, TableHandle, WriteTransaction,
};

use crate::batch::Batcher;
use crate::error::EngineError;

/// User buckets are namespaced so they can never collide with the reserved
/// sequence table.
pub(crate) const BUCKET_PREFIX: &str = "b:";

/// Per-bucket sequence counters, keyed by bucket name.
const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("__seq");

type BucketDef<'a> = TableDefinition<'a, &'static [u8], &'static [u8]>;

fn table_name(bucket: &str) -> String {
    format!("{BUCKET_PREFIX}{bucket}")
}

/// Engine tunables. Batch settings mirror the write-coalescing window: a
/// `batch` call waits at most `max_batch_delay` for other writers to join
/// before committing, or commits immediately once `max_batch_size` calls are
/// queued.
#[derive(Debug, Clone)]
pub struct Options {
    /// Page-cache budget handed to redb, in bytes. `None` keeps redb's default.
    pub cache_size: Option<usize>,
    /// Maximum number of coalesced `batch` calls per write transaction.
    /// Values <= 1 disable coalescing.
    pub max_batch_size: usize,
    /// Maximum time a `batch` leader waits for more writers to join.
    pub max_batch_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cache_size: None,
            max_batch_size: 512,
            max_batch_delay: Duration::from_millis(10),
        }
    }
}

/// One open database file.
pub struct Engine {
    db: redb::Database,
    path: PathBuf,
    batcher: Batcher,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("path", &self.path).finish()
    }
}

impl Engine {
    /// Open (creating if necessary) the database at `path`.
    ///
    /// Returns [`EngineError::AlreadyOpen`] when the file is locked by another
    /// `Engine`, in-process or out.
    pub fn open(path: impl AsRef<Path>, opts: &Options) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();
        let mut builder = redb::Builder::new();
        if let Some(bytes) = opts.cache_size {
            builder.set_cache_size(bytes);
        }
        let db = builder.create(&path)?;
        Ok(Self {
            db,
            path,
            batcher: Batcher::new(opts.max_batch_size, opts.max_batch_delay),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn begin_read(&self) -> Result<ReadTx, EngineError> {
        Ok(ReadTx { inner: self.db.begin_read()? })
    }

    /// Blocks while another write transaction is live.
    pub fn begin_write(&self) -> Result<WriteTx, EngineError> {
        Ok(WriteTx { inner: self.db.begin_write()? })
    }

    /// Run `f` inside a read transaction.
    pub fn view<R>(&self, f: impl FnOnce(&ReadTx) -> Result<R, EngineError>) -> Result<R, EngineError> {
        let tx = self.begin_read()?;
        f(&tx)
    }

    /// Run `f` inside a write transaction; commit on `Ok`, abort on `Err`.
    pub fn update<R>(
        &self,
        f: impl FnOnce(&mut WriteTx) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        let mut tx = self.begin_write()?;
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
    }

    /// Run `f` coalesced with other concurrent `batch` callers in a single
    /// write transaction. `f` may be invoked more than once: when a batch
    /// fails, every member is retried in its own transaction so one caller's
    /// error cannot sink another caller's write.
    pub fn batch<F>(&self, f: F) -> Result<(), EngineError>
    where
        F: FnMut(&mut WriteTx) -> Result<(), EngineError> + Send + 'static,
    {
        self.batcher.run(self, Box::new(f))
    }

    /// Stream a consistent snapshot of the database file into `w`, returning
    /// the number of bytes written. A read transaction is held for the
    /// duration so the page store cannot be compacted mid-copy; commits are
    /// root-switch atomic, so any captured file state decodes to the last
    /// committed root.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<u64, EngineError> {
        let _snapshot = self.db.begin_read()?;
        let mut f = File::open(&self.path)?;
        Ok(io::copy(&mut f, w)?)
    }
}

/// Read-side staged action for [`WriteTx::for_each_update`].
pub enum Staged {
    Keep,
    Set(Vec<u8>),
    Delete,
}

/// A read-only transaction. Values returned from `get` are cloned out of the
/// page cache, never borrowed from it.
pub struct ReadTx {
    inner: ReadTransaction,
}

impl ReadTx {
    pub fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let name = table_name(bucket);
        let table = match self.inner.open_table(BucketDef::new(&name)) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => {
                return Err(EngineError::BucketNotFound(bucket.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(table.get(key)?.map(|g| g.value().to_vec()))
    }

    /// Iterate the bucket in key order. A missing bucket is an empty
    /// iteration, not an error, because hash-sharded callers legitimately
    /// hold buckets on only some shards. Generic over the caller's error
    /// type so higher layers can thread their own errors through.
    pub fn for_each<E>(
        &self,
        bucket: &str,
        mut f: impl FnMut(&[u8], &[u8]) -> Result<(), E>,
    ) -> Result<(), E>
    where
        E: From<EngineError>,
    {
        let name = table_name(bucket);
        let table = match self.inner.open_table(BucketDef::new(&name)) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(e) => return Err(E::from(e.into())),
        };
        for entry in table.iter().map_err(|e| E::from(e.into()))? {
            let (k, v) = entry.map_err(|e| E::from(e.into()))?;
            f(k.value(), v.value())?;
        }
        Ok(())
    }

    /// Cursor walk from `start`, forward or reverse.
    pub fn range<E>(
        &self,
        bucket: &str,
        start: &[u8],
        forward: bool,
        mut f: impl FnMut(&[u8], &[u8]) -> Result<(), E>,
    ) -> Result<(), E>
    where
        E: From<EngineError>,
    {
        let name = table_name(bucket);
        let table = match self.inner.open_table(BucketDef::new(&name)) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(e) => return Err(E::from(e.into())),
        };
        if forward {
            for entry in table.range(start..).map_err(|e| E::from(e.into()))? {
                let (k, v) = entry.map_err(|e| E::from(e.into()))?;
                f(k.value(), v.value())?;
            }
        } else {
            for entry in table.range(..=start).map_err(|e| E::from(e.into()))?.rev() {
                let (k, v) = entry.map_err(|e| E::from(e.into()))?;
                f(k.value(), v.value())?;
            }
        }
        Ok(())
    }

    /// Current sequence value for `bucket`; 0 when the bucket has never
    /// allocated one.
    pub fn sequence(&self, bucket: &str) -> Result<u64, EngineError> {
        let table = match self.inner.open_table(SEQUENCES) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        Ok(table.get(bucket)?.map(|g| g.value()).unwrap_or(0))
    }

    /// Names of all buckets, in table order.
    pub fn buckets(&self) -> Result<Vec<String>, EngineError> {
        let mut out = Vec::new();
        for handle in self.inner.list_tables()? {
            if let Some(bucket) = handle.name().strip_prefix(BUCKET_PREFIX) {
                out.push(bucket.to_string());
            }
        }
        Ok(out)
    }
}

/// A read-write transaction. Owned; may be held across await points and
/// requests, which is what the remote server's lock map does.
pub struct WriteTx {
    inner: WriteTransaction,
}

impl WriteTx {
    fn bucket_exists(&self, bucket: &str) -> Result<bool, EngineError> {
        let name = table_name(bucket);
        for handle in self.inner.list_tables()? {
            if handle.name() == name {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        if !self.bucket_exists(bucket)? {
            return Err(EngineError::BucketNotFound(bucket.to_string()));
        }
        let name = table_name(bucket);
        let table = self.inner.open_table(BucketDef::new(&name))?;
        let value = table.get(key)?.map(|g| g.value().to_vec());
        Ok(value)
    }

    /// Write `key`, creating the bucket if absent.
    pub fn put(&mut self, bucket: &str, key: &[u8], val: &[u8]) -> Result<(), EngineError> {
        let name = table_name(bucket);
        let mut table = self.inner.open_table(BucketDef::new(&name))?;
        table.insert(key, val)?;
        Ok(())
    }

    /// Deleting a missing key, or from a missing bucket, is success.
    pub fn delete(&mut self, bucket: &str, key: &[u8]) -> Result<(), EngineError> {
        if !self.bucket_exists(bucket)? {
            return Ok(());
        }
        let name = table_name(bucket);
        let mut table = self.inner.open_table(BucketDef::new(&name))?;
        table.remove(key)?;
        Ok(())
    }

    /// Create the bucket if it does not exist yet.
    pub fn create_bucket(&mut self, bucket: &str) -> Result<(), EngineError> {
        let name = table_name(bucket);
        self.inner.open_table(BucketDef::new(&name))?;
        Ok(())
    }

    pub fn for_each<E>(
        &self,
        bucket: &str,
        mut f: impl FnMut(&[u8], &[u8]) -> Result<(), E>,
    ) -> Result<(), E>
    where
        E: From<EngineError>,
    {
        if !self.bucket_exists(bucket).map_err(E::from)? {
            return Ok(());
        }
        let name = table_name(bucket);
        let table = self
            .inner
            .open_table(BucketDef::new(&name))
            .map_err(|e| E::from(e.into()))?;
        for entry in table.iter().map_err(|e| E::from(e.into()))? {
            let (k, v) = entry.map_err(|e| E::from(e.into()))?;
            f(k.value(), v.value())?;
        }
        Ok(())
    }

    /// Iterate the bucket, staging writes and deletes that are applied only
    /// after the cursor finishes, so the iteration never observes its own
    /// mutations.
    pub fn for_each_update(
        &mut self,
        bucket: &str,
        mut f: impl FnMut(&[u8], &[u8]) -> Result<Staged, EngineError>,
    ) -> Result<(), EngineError> {
        let mut staged: Vec<(Vec<u8>, Option<Vec<u8>>)> = Vec::new();
        self.for_each(bucket, |k, v| {
            match f(k, v)? {
                Staged::Keep => {}
                Staged::Set(nv) => staged.push((k.to_vec(), Some(nv))),
                Staged::Delete => staged.push((k.to_vec(), None)),
            }
            Ok::<(), EngineError>(())
        })?;
        for (k, action) in staged {
            match action {
                Some(v) => self.put(bucket, &k, &v)?,
                None => self.delete(bucket, &k)?,
            }
        }
        Ok(())
    }

    /// Advance and return the bucket's sequence counter, creating the bucket
    /// if absent.
    pub fn next_sequence(&mut self, bucket: &str) -> Result<u64, EngineError> {
        self.create_bucket(bucket)?;
        let mut table = self.inner.open_table(SEQUENCES)?;
        let next = table.get(bucket)?.map(|g| g.value()).unwrap_or(0) + 1;
        table.insert(bucket, next)?;
        Ok(next)
    }

    /// Set the bucket's sequence counter, creating the bucket if absent.
    pub fn set_sequence(&mut self, bucket: &str, n: u64) -> Result<(), EngineError> {
        self.create_bucket(bucket)?;
        let mut table = self.inner.open_table(SEQUENCES)?;
        table.insert(bucket, n)?;
        Ok(())
    }

    pub fn sequence(&self, bucket: &str) -> Result<u64, EngineError> {
        let table = self.inner.open_table(SEQUENCES)?;
        let value = table.get(bucket)?.map(|g| g.value()).unwrap_or(0);
        Ok(value)
    }

    pub fn buckets(&self) -> Result<Vec<String>, EngineError> {
        let mut out = Vec::new();
        for handle in self.inner.list_tables()? {
            if let Some(bucket) = handle.name().strip_prefix(BUCKET_PREFIX) {
                out.push(bucket.to_string());
            }
        }
        Ok(out)
    }

    pub fn commit(self) -> Result<(), EngineError> {
        self.inner.commit()?;
        Ok(())
    }

    /// Abort, discarding all writes. Errors during abort are logged, not
    /// surfaced: the transaction is gone either way.
    pub fn abort(self) {
        if let Err(e) = self.inner.abort() {
            tracing::warn!("write transaction abort failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(dir.path().join("t.db"), &Options::default()).unwrap();
        (dir, engine)
    }

    #[test]
    fn put_get_roundtrip() {
        let (_dir, engine) = open_temp();
        engine
            .update(|tx| tx.put("b1", b"k", b"v"))
            .unwrap();
        let got = engine.view(|tx| tx.get("b1", b"k")).unwrap();
        assert_eq!(got.as_deref(), Some(&b"v"[..]));
    }

    #[test]
    fn missing_bucket_vs_missing_key() {
        let (_dir, engine) = open_temp();
        let err = engine.view(|tx| tx.get("nope", b"k")).unwrap_err();
        assert!(err.is_bucket_not_found());

        engine.update(|tx| tx.put("b", b"k", b"v")).unwrap();
        let got = engine.view(|tx| tx.get("b", b"other")).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn delete_missing_is_ok() {
        let (_dir, engine) = open_temp();
        engine.update(|tx| tx.delete("ghost", b"k")).unwrap();
        engine.update(|tx| tx.put("b", b"k", b"v")).unwrap();
        engine.update(|tx| tx.delete("b", b"absent")).unwrap();
        engine.update(|tx| tx.delete("b", b"k")).unwrap();
        assert!(engine.view(|tx| tx.get("b", b"k")).unwrap().is_none());
    }

    #[test]
    fn sequences_are_monotonic() {
        let (_dir, engine) = open_temp();
        let a = engine.update(|tx| tx.next_sequence("b")).unwrap();
        let b = engine.update(|tx| tx.next_sequence("b")).unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(engine.view(|tx| tx.sequence("b")).unwrap(), 2);

        engine.update(|tx| tx.set_sequence("b", 100)).unwrap();
        let c = engine.update(|tx| tx.next_sequence("b")).unwrap();
        assert_eq!(c, 101);

        assert_eq!(engine.view(|tx| tx.sequence("never")).unwrap(), 0);
    }

    #[test]
    fn buckets_listing_hides_sequence_table() {
        let (_dir, engine) = open_temp();
        engine.update(|tx| tx.put("zz", b"k", b"v")).unwrap();
        engine.update(|tx| tx.next_sequence("aa")).unwrap();
        let mut buckets = engine.view(|tx| tx.buckets()).unwrap();
        buckets.sort();
        assert_eq!(buckets, vec!["aa".to_string(), "zz".to_string()]);
    }

    #[test]
    fn aborted_update_leaves_no_trace() {
        let (_dir, engine) = open_temp();
        let err = engine.update(|tx| {
            tx.put("b", b"k", b"v")?;
            Err::<(), _>(EngineError::BucketNotFound("forced".into()))
        });
        assert!(err.is_err());
        assert!(engine.view(|tx| tx.get("b", b"k")).is_err()); // bucket never created
    }

    #[test]
    fn second_open_reports_already_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let _first = Engine::open(&path, &Options::default()).unwrap();
        let err = Engine::open(&path, &Options::default()).unwrap_err();
        assert!(err.is_already_open());
    }

    #[test]
    fn for_each_update_stages_mutations() {
        let (_dir, engine) = open_temp();
        engine
            .update(|tx| {
                for i in 0..4u8 {
                    tx.put("b", &[i], &[i])?;
                }
                Ok(())
            })
            .unwrap();
        engine
            .update(|tx| {
                tx.for_each_update("b", |k, _| {
                    Ok(match k[0] {
                        0 => Staged::Delete,
                        1 => Staged::Set(vec![0xFF]),
                        _ => Staged::Keep,
                    })
                })
            })
            .unwrap();
        assert!(engine.view(|tx| tx.get("b", &[0])).unwrap().is_none());
        assert_eq!(engine.view(|tx| tx.get("b", &[1])).unwrap(), Some(vec![0xFF]));
        assert_eq!(engine.view(|tx| tx.get("b", &[2])).unwrap(), Some(vec![2]));
    }

    #[test]
    fn batch_coalesces_and_survives_a_bad_member() {
        let (_dir, engine) = open_temp();
        let engine = std::sync::Arc::new(engine);
        let mut handles = Vec::new();
        for i in 0..8u8 {
            let engine = engine.clone();
            handles.push(std::thread::spawn(move || {
                engine.batch(move |tx| tx.put("b", &[i], &[i]))
            }));
        }
        // One member that always fails must not take the others down with it.
        let bad = {
            let engine = engine.clone();
            std::thread::spawn(move || {
                engine.batch(|_tx| Err(EngineError::BucketNotFound("bad".into())))
            })
        };
        for h in handles {
            h.join().unwrap().unwrap();
        }
        assert!(bad.join().unwrap().is_err());
        for i in 0..8u8 {
            assert_eq!(engine.view(|tx| tx.get("b", &[i])).unwrap(), Some(vec![i]));
        }
    }

    #[test]
    fn write_to_produces_openable_copy() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(dir.path().join("src.db"), &Options::default()).unwrap();
        engine.update(|tx| tx.put("b", b"k", b"v")).unwrap();

        let copy_path = dir.path().join("copy.db");
        let mut out = std::fs::File::create(&copy_path).unwrap();
        let n = engine.write_to(&mut out).unwrap();
        assert!(n > 0);
        drop(out);

        let copy = Engine::open(&copy_path, &Options::default()).unwrap();
        assert_eq!(copy.view(|tx| tx.get("b", b"k")).unwrap(), Some(b"v".to_vec()));
    }
}
