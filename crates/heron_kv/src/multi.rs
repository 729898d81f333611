use std::collections::HashMap;
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use heron_common::Codec;
use heron_engine::Engine;

use crate::db::Db;
use crate::error::KvError;

/// Callback run against a freshly opened database, before it becomes visible
/// in the registry.
pub type InitDbFn = Arc<dyn Fn(&Db) -> Result<(), KvError> + Send + Sync>;

/// Options applied when a registry opens a database.
#[derive(Clone, Default)]
pub struct OpenOptions {
    pub engine: heron_engine::Options,
    /// Value codec; `None` keeps the JSON default.
    pub codec: Option<Codec>,
    /// Buckets created in a single write transaction on first open.
    pub initial_buckets: Vec<String>,
    /// Called once on first open, before initial buckets are created.
    pub init_db: Option<InitDbFn>,
}

impl std::fmt::Debug for OpenOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenOptions")
            .field("engine", &self.engine)
            .field("codec", &self.codec)
            .field("initial_buckets", &self.initial_buckets)
            .field("init_db", &self.init_db.as_ref().map(|_| "..."))
            .finish()
    }
}

/// Every registry ever created, for process-wide [`close_all`].
static REGISTRIES: Lazy<Mutex<Vec<MultiDb>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Backs the free-standing [`open`]: a registry with no prefix and no
/// extension, keyed by the literal path.
static DEFAULT: Lazy<MultiDb> = Lazy::new(|| MultiDb::new("", "", OpenOptions::default()));

/// Open `path` through the process-wide default registry. Two callers with
/// the same path share one handle.
pub fn open(path: impl AsRef<Path>, opts: Option<&OpenOptions>) -> Result<Db, KvError> {
    DEFAULT.get(path.as_ref().to_string_lossy().as_ref(), opts)
}

/// Close every database in every registry. Errors are logged and the first
/// one is returned after all registries have been processed.
pub fn close_all() -> Result<(), KvError> {
    let registries: Vec<MultiDb> = REGISTRIES.lock().clone();
    let mut first = None;
    for registry in registries {
        if let Err(e) = registry.close() {
            tracing::warn!("close_all: {e}");
            first.get_or_insert(e);
        }
    }
    first.map_or(Ok(()), Err)
}

struct MultiInner {
    map: RwLock<HashMap<String, Db>>,
    opts: OpenOptions,
    prefix: PathBuf,
    ext: String,
}

/// A path-indexed registry of shared database handles.
///
/// Invariant: a database file is opened at most once per process. Concurrent
/// `get` calls for the same name race on the engine's file lock; the loser
/// polls the registry until the winner has inserted the shared handle.
#[derive(Clone)]
pub struct MultiDb {
    inner: Arc<MultiInner>,
}

impl MultiDb {
    pub fn new(prefix: impl Into<PathBuf>, ext: impl Into<String>, opts: OpenOptions) -> Self {
        let mdb = Self {
            inner: Arc::new(MultiInner {
                map: RwLock::new(HashMap::new()),
                opts,
                prefix: prefix.into(),
                ext: ext.into(),
            }),
        };
        REGISTRIES.lock().push(mdb.clone());
        mdb
    }

    fn db_path(&self, name: &str) -> PathBuf {
        let p = if self.inner.prefix.as_os_str().is_empty() {
            PathBuf::from(name)
        } else {
            self.inner.prefix.join(name)
        };
        if self.inner.ext.is_empty() {
            p
        } else {
            let mut s = p.into_os_string();
            s.push(&self.inner.ext);
            PathBuf::from(s)
        }
    }

    /// Fetch the shared handle for `name`, opening the file on first use.
    pub fn get(&self, name: &str, opts: Option<&OpenOptions>) -> Result<Db, KvError> {
        let path = self.db_path(name);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if let Some(db) = self.inner.map.read().get(name) {
            return Ok(db.clone());
        }

        let opts = opts.unwrap_or(&self.inner.opts);

        // Open before taking the write lock; the double-check below resolves
        // the race with other openers.
        let engine = match Engine::open(&path, &opts.engine) {
            Ok(engine) => engine,
            Err(e) if e.is_already_open() => {
                // Another caller of this registry holds the file lock and
                // will insert the shared handle shortly.
                loop {
                    if let Some(db) = self.inner.map.read().get(name) {
                        return Ok(db.clone());
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
            Err(e) => return Err(e.into()),
        };

        let mut map = self.inner.map.write();
        if let Some(db) = map.get(name) {
            // Lost the insert race; our handle is redundant.
            drop(engine);
            return Ok(db.clone());
        }

        let db = Db::new(engine, opts.codec.unwrap_or_default());
        if let Some(init) = &opts.init_db {
            init(&db)?;
        }
        if !opts.initial_buckets.is_empty() {
            db.update(|tx| {
                for bucket in &opts.initial_buckets {
                    tx.create_bucket(bucket)?;
                }
                Ok(())
            })?;
        }

        map.insert(name.to_string(), db.clone());

        let registry = self.clone();
        let detach = name.to_string();
        db.set_on_close(Box::new(move || {
            registry.inner.map.write().remove(&detach);
        }));

        Ok(db)
    }

    /// Visit every open database. The callback must not open or close
    /// databases in this registry.
    pub fn for_each_db(
        &self,
        mut f: impl FnMut(&str, &Db) -> Result<(), KvError>,
    ) -> Result<(), KvError> {
        let entries: Vec<(String, Db)> = {
            let map = self.inner.map.read();
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        for (name, db) in &entries {
            f(name, db)?;
        }
        Ok(())
    }

    pub fn close_db(&self, name: &str) -> Result<(), KvError> {
        let db = self.inner.map.write().remove(name);
        if let Some(db) = db {
            db.clear_on_close();
            db.close()?;
        }
        Ok(())
    }

    /// Close every member database. Errors are logged; the first is returned
    /// once all have been attempted.
    pub fn close(&self) -> Result<(), KvError> {
        let entries: Vec<(String, Db)> = self.inner.map.write().drain().collect();
        let mut first = None;
        for (name, db) in entries {
            db.clear_on_close(); // we are handling removal
            if let Err(e) = db.close() {
                tracing::warn!("close {name}: {e}");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    fn snapshot_names(&self, filter: Option<&dyn Fn(&str, &Db) -> bool>) -> Vec<String> {
        let map = self.inner.map.read();
        let mut names: Vec<String> = map
            .iter()
            .filter(|(name, db)| filter.map_or(true, |f| f(name, db)))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Write a zip archive with one entry per member database, named
    /// `<name><ext>`. Returns the total bytes of database content written.
    pub fn backup<W: Write + Seek>(
        &self,
        w: W,
        filter: Option<&dyn Fn(&str, &Db) -> bool>,
    ) -> Result<u64, KvError> {
        let names = self.snapshot_names(filter);
        let mut zip = zip::ZipWriter::new(w);
        let entry_opts = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        let mut total = 0u64;
        for name in names {
            let Some(db) = self.inner.map.read().get(&name).cloned() else { continue };
            zip.start_file(format!("{name}{}", self.inner.ext), entry_opts)?;
            total += db.write_to(&mut zip)?;
        }
        zip.finish()?;
        Ok(total)
    }

    pub fn backup_to_file(
        &self,
        path: impl AsRef<Path>,
        filter: Option<&dyn Fn(&str, &Db) -> bool>,
    ) -> Result<u64, KvError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let f = std::fs::File::create(path)?;
        self.backup(f, filter)
    }

    /// Copy each member database into `<dir>/<name><ext>` as a plain file.
    pub fn backup_to_dir(
        &self,
        dir: impl AsRef<Path>,
        filter: Option<&dyn Fn(&str, &Db) -> bool>,
    ) -> Result<u64, KvError> {
        let dir = dir.as_ref();
        let names = self.snapshot_names(filter);
        let mut total = 0u64;
        for name in names {
            let Some(db) = self.inner.map.read().get(&name).cloned() else { continue };
            total += db.backup_to_file(dir.join(format!("{name}{}", self.inner.ext)))?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_gets_share_one_handle() {
        let dir = tempfile::tempdir().unwrap();
        let mdb = MultiDb::new(dir.path(), ".db", OpenOptions::default());
        let mut handles = Vec::new();
        for i in 0..100 {
            let mdb = mdb.clone();
            handles.push(std::thread::spawn(move || {
                mdb.get(&format!("test{}", i % 3), None).unwrap()
            }));
        }
        let dbs: Vec<Db> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(mdb.inner.map.read().len(), 3);
        // every caller for the same name got the same shared handle
        let reference = mdb.get("test0", None).unwrap();
        for (i, db) in dbs.iter().enumerate() {
            if i % 3 == 0 {
                assert!(db.same_handle(&reference));
            }
        }
        mdb.close().unwrap();
    }

    #[test]
    fn close_detaches_and_reopen_works() {
        let dir = tempfile::tempdir().unwrap();
        let mdb = MultiDb::new(dir.path(), ".db", OpenOptions::default());
        let db = mdb.get("a", None).unwrap();
        db.put_bytes("b", "k", b"v").unwrap();
        db.close().unwrap();
        assert_eq!(mdb.inner.map.read().len(), 0);

        let db = mdb.get("a", None).unwrap();
        assert_eq!(db.get_bytes("b", "k").unwrap(), Some(b"v".to_vec()));
        mdb.close().unwrap();
    }

    #[test]
    fn initial_buckets_and_init_hook_apply_once() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls2 = calls.clone();
        let opts = OpenOptions {
            initial_buckets: vec!["warm".into()],
            init_db: Some(Arc::new(move |_db: &Db| {
                calls2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })),
            ..Default::default()
        };
        let mdb = MultiDb::new(dir.path(), ".db", opts);
        let db = mdb.get("a", None).unwrap();
        let _again = mdb.get("a", None).unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(db.buckets().unwrap().contains(&"warm".to_string()));
        mdb.close().unwrap();
    }

    #[test]
    fn backup_zip_contains_every_member() {
        let dir = tempfile::tempdir().unwrap();
        let mdb = MultiDb::new(dir.path().join("dbs"), ".db", OpenOptions::default());
        for name in ["alpha", "beta"] {
            let db = mdb.get(name, None).unwrap();
            db.put_bytes("b", "k", name.as_bytes()).unwrap();
        }
        let buf = std::io::Cursor::new(Vec::new());
        let n = mdb.backup(buf.clone(), None).unwrap();
        assert!(n > 0);

        let mut written = std::io::Cursor::new(Vec::new());
        mdb.backup(&mut written, None).unwrap();
        written.set_position(0);
        let archive = zip::ZipArchive::new(written).unwrap();
        let mut names: Vec<&str> = archive.file_names().collect();
        names.sort();
        assert_eq!(names, vec!["alpha.db", "beta.db"]);
        mdb.close().unwrap();
    }

    #[test]
    fn backup_to_dir_produces_openable_copies() {
        let dir = tempfile::tempdir().unwrap();
        let mdb = MultiDb::new(dir.path().join("dbs"), ".db", OpenOptions::default());
        let db = mdb.get("solo", None).unwrap();
        db.put_bytes("b", "k", b"v").unwrap();

        let out = dir.path().join("backup");
        std::fs::create_dir_all(&out).unwrap();
        let n = mdb.backup_to_dir(&out, None).unwrap();
        assert!(n > 0);
        mdb.close().unwrap();

        let copy = MultiDb::new(&out, ".db", OpenOptions::default());
        let db = copy.get("solo", None).unwrap();
        assert_eq!(db.get_bytes("b", "k").unwrap(), Some(b"v".to_vec()));
        copy.close().unwrap();
    }
}
