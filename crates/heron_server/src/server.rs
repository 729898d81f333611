use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

use heron_engine::EngineError;
use heron_kv::{Db, KvError, MultiDb, OpenOptions, WriteTx};
use heron_proto as proto;
use heron_proto::{ErrorBody, Op, Request, Stats};

use crate::journal::{Journal, JournalEntry, JournalOptions};

const DB_EXT: &str = ".db";

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Server configuration. `max_unused_lock` bounds how long a held write
/// transaction may sit idle before the reaper rolls it back.
#[derive(Clone)]
pub struct ServerConfig {
    pub db_path: PathBuf,
    pub max_unused_lock: Duration,
    /// When set, every request must carry an equal `Authorization` header.
    pub auth_key: Option<String>,
    /// Convert handler panics into 500 responses instead of unwinding.
    pub catch_panics: bool,
    pub journal: JournalOptions,
    /// Options the registry applies when opening member databases.
    pub open: OpenOptions,
}

impl ServerConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        let db_path = db_path.into();
        let journal = JournalOptions { base: db_path.join("_journal"), ..Default::default() };
        Self {
            db_path,
            max_unused_lock: Duration::from_secs(60),
            auth_key: None,
            catch_panics: true,
            journal,
            open: OpenOptions::default(),
        }
    }
}

/// A held write transaction. The mutex serializes every touch of the engine
/// transaction, including the reaper's rollback; `last_ms` is refreshed on
/// each use and drives the idle timeout.
struct ServerTx {
    tx: Mutex<Option<WriteTx>>,
    last_ms: AtomicU64,
}

impl ServerTx {
    fn new(tx: WriteTx) -> Self {
        Self { tx: Mutex::new(Some(tx)), last_ms: AtomicU64::new(now_ms()) }
    }
}

#[derive(Default)]
struct Counters {
    active_locks: AtomicU64,
    locks: AtomicU64,
    timeouts: AtomicU64,
    gets: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> Stats {
        Stats {
            active_locks: self.active_locks.load(Ordering::Relaxed),
            locks: self.locks.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
        }
    }
}

enum ServerError {
    NotFound(String),
    Internal(String),
}

impl ServerError {
    fn status(&self) -> u16 {
        match self {
            ServerError::NotFound(_) => 404,
            ServerError::Internal(_) => 500,
        }
    }

    fn message(&self) -> &str {
        match self {
            ServerError::NotFound(m) | ServerError::Internal(m) => m,
        }
    }
}

impl From<KvError> for ServerError {
    fn from(e: KvError) -> Self {
        if e.is_bucket_not_found() {
            ServerError::NotFound(e.to_string())
        } else {
            ServerError::Internal(e.to_string())
        }
    }
}

impl From<EngineError> for ServerError {
    fn from(e: EngineError) -> Self {
        ServerError::from(KvError::from(e))
    }
}

/// The remote server. One instance owns a multi-database registry rooted at
/// `db_path`, a lock map of held transactions, counters and the journal.
pub struct Server {
    mdb: MultiDb,
    locks: DashMap<String, Arc<ServerTx>>,
    counters: Counters,
    journal: Journal,
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let mdb = MultiDb::new(config.db_path.clone(), DB_EXT, config.open.clone());
        let journal = Journal::new(config.journal.clone());
        Arc::new(Self { mdb, locks: DashMap::new(), counters: Counters::default(), journal, config })
    }

    pub fn stats(&self) -> Stats {
        self.counters.snapshot()
    }

    /// Path of the journal file current writes land in.
    pub fn journal_path(&self) -> PathBuf {
        self.journal.current_path()
    }

    /// Serve connections from `listener` until `shutdown` resolves.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: impl std::future::Future<Output = ()>,
    ) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let srv = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = srv.handle_conn(stream).await {
                                    tracing::debug!("connection {peer}: {e}");
                                }
                            });
                        }
                        Err(e) => tracing::debug!("accept: {e}"),
                    }
                }
                _ = &mut shutdown => {
                    tracing::info!("server shutting down");
                    break;
                }
            }
        }
        self.shutdown_locks();
        self.journal.close();
    }

    /// Roll back every held transaction; used on shutdown.
    fn shutdown_locks(&self) {
        let names: Vec<String> = self.locks.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, entry)) = self.locks.remove(&name) {
                if let Some(tx) = entry.tx.lock().take() {
                    tx.abort();
                    self.counters.active_locks.fetch_sub(1, Ordering::Relaxed);
                    tracing::info!("rolled back open transaction on {name} at shutdown");
                }
            }
        }
    }

    async fn handle_conn(self: Arc<Self>, stream: TcpStream) -> std::io::Result<()> {
        let (rd, mut wr) = stream.into_split();
        let mut rd = BufReader::new(rd);

        let Some(head) = proto::read_request_head(&mut rd).await? else { return Ok(()) };
        let body = match head.content_length() {
            Some(len) => proto::read_body(&mut rd, len).await?,
            None => Vec::new(),
        };

        if let Some(expected) = self.config.auth_key.as_deref() {
            if head.header("authorization") != Some(expected) {
                return write_response(&mut wr, 401, &ErrorBody::encode("Unauthorized")).await;
            }
        }

        let segments: Vec<String> =
            head.path.split('/').filter(|s| !s.is_empty()).map(str::to_string).collect();
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

        let reply = match (head.method.as_str(), segments.as_slice()) {
            ("GET", ["stats"]) => {
                let body = bincode::serialize(&self.stats()).unwrap_or_default();
                Ok(body)
            }
            ("GET", ["stats.json"]) => {
                let body = serde_json::to_vec(&self.stats()).unwrap_or_default();
                Ok(body)
            }
            ("POST", ["tx", "begin", db]) => {
                let db = db.to_string();
                let srv = self.clone();
                let name = db.clone();
                match self.run_blocking(move || srv.begin(&name)).await {
                    Ok(entry) => {
                        self.spawn_reaper(db, entry);
                        Ok(b"OK".to_vec())
                    }
                    Err(e) => Err(e),
                }
            }
            ("DELETE", ["tx", "commit", db]) => {
                let srv = self.clone();
                let name = db.to_string();
                self.run_blocking(move || srv.unlock(&name, true)).await
            }
            ("DELETE", ["tx", "rollback", db]) => {
                let srv = self.clone();
                let name = db.to_string();
                self.run_blocking(move || srv.unlock(&name, false)).await
            }
            ("POST", ["tx", db]) => {
                match Request::decode(&body) {
                    Ok(req) if req.op == Op::ForEach as u8 => {
                        return self.stream_for_each(&mut wr, db.to_string(), req.bucket, true).await;
                    }
                    Ok(req) => {
                        let srv = self.clone();
                        let name = db.to_string();
                        self.run_blocking(move || srv.tx_op(&name, req)).await
                    }
                    Err(e) => Err(ServerError::Internal(e.to_string())),
                }
            }
            ("POST", ["noTx", db]) => {
                match Request::decode(&body) {
                    Ok(req) if req.op == Op::ForEach as u8 => {
                        return self.stream_for_each(&mut wr, db.to_string(), req.bucket, false).await;
                    }
                    Ok(req) => {
                        let srv = self.clone();
                        let name = db.to_string();
                        self.run_blocking(move || srv.no_tx_op(&name, req)).await
                    }
                    Err(e) => Err(ServerError::Internal(e.to_string())),
                }
            }
            _ => Err(ServerError::NotFound("no such route".to_string())),
        };

        match reply {
            Ok(body) => write_response(&mut wr, 200, &body).await,
            Err(e) => write_response(&mut wr, e.status(), &ErrorBody::encode(e.message())).await,
        }
    }

    /// Engine work runs off the async workers; a panic becomes a 500 when
    /// `catch_panics` is on, otherwise it unwinds as usual.
    async fn run_blocking<R: Send + 'static>(
        &self,
        f: impl FnOnce() -> Result<R, ServerError> + Send + 'static,
    ) -> Result<R, ServerError> {
        match tokio::task::spawn_blocking(f).await {
            Ok(r) => r,
            Err(e) if e.is_panic() => {
                if self.config.catch_panics {
                    tracing::error!("handler panicked");
                    Err(ServerError::Internal("internal panic".to_string()))
                } else {
                    std::panic::resume_unwind(e.into_panic())
                }
            }
            Err(e) => Err(ServerError::Internal(e.to_string())),
        }
    }

    fn valid_name(name: &str) -> Result<(), ServerError> {
        if name.is_empty() || name.contains("..") || name.contains(['/', '\\']) {
            return Err(ServerError::NotFound(format!("bad database name: {name}")));
        }
        Ok(())
    }

    fn open_db(&self, name: &str) -> Result<Db, ServerError> {
        Self::valid_name(name)?;
        Ok(self.mdb.get(name, None)?)
    }

    /// Open or reuse the database, begin a writable transaction and register
    /// it in the lock map. Blocks while another transaction holds the writer.
    fn begin(&self, name: &str) -> Result<Arc<ServerTx>, ServerError> {
        let db = self.open_db(name)?;
        let result = db.begin_write();
        self.journal(
            JournalEntry::op("Begin", name),
            result.as_ref().err().map(|e| e.to_string()),
        );
        let tx = result?;

        let entry = Arc::new(ServerTx::new(tx));
        let replaced = self.locks.insert(name.to_string(), entry.clone());
        self.counters.locks.fetch_add(1, Ordering::Relaxed);
        match replaced {
            None => {
                self.counters.active_locks.fetch_add(1, Ordering::Relaxed);
            }
            Some(old) => {
                // Only reachable if an older entry lingered; its transaction
                // is dead weight now.
                if let Some(old_tx) = old.tx.lock().take() {
                    old_tx.abort();
                }
            }
        }
        Ok(entry)
    }

    /// Remove the lock-map entry and commit or roll back its transaction.
    fn unlock(&self, name: &str, commit: bool) -> Result<Vec<u8>, ServerError> {
        let op = if commit { "Commit" } else { "Rollback" };
        let entry = match self.locks.get(name) {
            Some(e) => e.value().clone(),
            None => {
                self.journal(JournalEntry::op(op, name), Some("no transaction".to_string()));
                return Err(ServerError::NotFound(format!("no transaction for {name}")));
            }
        };
        let mut guard = entry.tx.lock();
        self.locks.remove_if(name, |_, v| Arc::ptr_eq(v, &entry));
        let Some(tx) = guard.take() else {
            return Err(ServerError::NotFound(format!("no transaction for {name}")));
        };
        drop(guard);

        let result = if commit {
            self.counters.commits.fetch_add(1, Ordering::Relaxed);
            tx.commit().map_err(ServerError::from)
        } else {
            self.counters.rollbacks.fetch_add(1, Ordering::Relaxed);
            tx.abort();
            Ok(())
        };
        self.counters.active_locks.fetch_sub(1, Ordering::Relaxed);
        self.journal(
            JournalEntry::op(op, name),
            result.as_ref().err().map(|e| e.message().to_string()),
        );
        result.map(|()| b"OK".to_vec())
    }

    /// Run `f` against the held transaction, refreshing its idle timestamp.
    fn with_tx<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut WriteTx) -> Result<R, ServerError>,
    ) -> Result<R, ServerError> {
        let entry = match self.locks.get(name) {
            Some(e) => e.value().clone(),
            None => return Err(ServerError::NotFound(format!("no transaction for {name}"))),
        };
        let mut guard = entry.tx.lock();
        let Some(tx) = guard.as_mut() else {
            return Err(ServerError::NotFound(format!("no transaction for {name}")));
        };
        entry.last_ms.store(now_ms(), Ordering::Release);
        f(tx)
    }

    fn tx_op(&self, name: &str, req: Request) -> Result<Vec<u8>, ServerError> {
        let op = Op::from_u8(req.op).map_err(|e| ServerError::Internal(e.to_string()))?;
        let result = self.with_tx(name, |tx| match op {
            Op::Get => match tx.get(&req.bucket, req.key.as_bytes())? {
                Some(v) => Ok(v),
                None => Err(ServerError::NotFound(format!("key not found: {}", req.key))),
            },
            Op::Put => {
                tx.put(&req.bucket, req.key.as_bytes(), &req.value)?;
                Ok(b"OK".to_vec())
            }
            Op::Del => {
                tx.delete(&req.bucket, req.key.as_bytes())?;
                Ok(b"OK".to_vec())
            }
            Op::Seq => {
                let seq = tx.next_sequence(&req.bucket)?;
                bincode::serialize(&seq).map_err(|e| ServerError::Internal(e.to_string()))
            }
            Op::SetSeq => {
                let seq: u64 = bincode::deserialize(&req.value)
                    .map_err(|e| ServerError::Internal(e.to_string()))?;
                tx.set_sequence(&req.bucket, seq)?;
                Ok(b"OK".to_vec())
            }
            Op::ForEach => Err(ServerError::Internal("ForEach is streamed".to_string())),
        });
        self.record(op, name, &req, &result);
        result
    }

    fn no_tx_op(&self, name: &str, req: Request) -> Result<Vec<u8>, ServerError> {
        let op = Op::from_u8(req.op).map_err(|e| ServerError::Internal(e.to_string()))?;
        let result = (|| {
            let db = self.open_db(name)?;
            match op {
                Op::Get => match db.get_bytes(&req.bucket, &req.key)? {
                    Some(v) => Ok(v),
                    None => Err(ServerError::NotFound(format!("key not found: {}", req.key))),
                },
                Op::Put => {
                    db.put_bytes(&req.bucket, &req.key, &req.value)?;
                    Ok(b"OK".to_vec())
                }
                Op::Del => {
                    db.delete(&req.bucket, &req.key)?;
                    Ok(b"OK".to_vec())
                }
                Op::Seq => {
                    let seq = db.next_index(&req.bucket)?;
                    bincode::serialize(&seq).map_err(|e| ServerError::Internal(e.to_string()))
                }
                Op::SetSeq => {
                    let seq: u64 = bincode::deserialize(&req.value)
                        .map_err(|e| ServerError::Internal(e.to_string()))?;
                    db.set_next_index(&req.bucket, seq)?;
                    Ok(b"OK".to_vec())
                }
                Op::ForEach => Err(ServerError::Internal("ForEach is streamed".to_string())),
            }
        })();
        self.record(op, name, &req, &result);
        result
    }

    /// Count and journal one dispatched operation.
    fn record(&self, op: Op, name: &str, req: &Request, result: &Result<Vec<u8>, ServerError>) {
        match op {
            Op::Get => {
                self.counters.gets.fetch_add(1, Ordering::Relaxed);
            }
            Op::Put => {
                self.counters.puts.fetch_add(1, Ordering::Relaxed);
            }
            Op::Del => {
                self.counters.deletes.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        let mut entry = JournalEntry::op(op.to_string(), name).bucket(&req.bucket).key(&req.key);
        if op == Op::Put {
            entry = entry.value(req.value.clone());
        }
        self.journal(entry, result.as_ref().err().map(|e| e.message().to_string()));
    }

    fn journal(&self, entry: JournalEntry, err: Option<String>) {
        if let Err(e) = self.journal.write(entry, err.as_deref()) {
            tracing::warn!("journal write failed: {e}");
        }
    }

    /// Stream a bucket's pairs as length-prefixed frames. Engine iteration
    /// runs on a blocking thread, feeding frames through a channel; the
    /// socket is flushed after every frame.
    async fn stream_for_each(
        self: &Arc<Self>,
        wr: &mut OwnedWriteHalf,
        name: String,
        bucket: String,
        in_tx: bool,
    ) -> std::io::Result<()> {
        if in_tx && !self.locks.contains_key(&name) {
            let body = ErrorBody::encode(format!("no transaction for {name}"));
            return write_response(wr, 404, &body).await;
        }

        let (frames, mut rx) = tokio::sync::mpsc::channel::<(Vec<u8>, Vec<u8>)>(64);
        let srv = self.clone();
        let db_name = name.clone();
        let bucket_name = bucket.clone();
        let worker = tokio::task::spawn_blocking(move || {
            let send = |k: &[u8], v: &[u8]| {
                frames.blocking_send((k.to_vec(), v.to_vec())).map_err(|_| {
                    EngineError::Io(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "stream receiver dropped",
                    ))
                })
            };
            let result: Result<(), ServerError> = if in_tx {
                srv.with_tx(&db_name, |tx| {
                    tx.for_each(&bucket_name, |k, v| send(k, v)).map_err(ServerError::from)
                })
            } else {
                srv.open_db(&db_name).and_then(|db| {
                    db.for_each_bytes(&bucket_name, |k, v| Ok(send(k, v)?))
                        .map_err(ServerError::from)
                })
            };
            if let Err(e) = &result {
                let _ = frames.blocking_send((proto::ERROR_KEY.to_vec(), e.message().as_bytes().to_vec()));
            }
            let _ = frames.blocking_send((Vec::new(), Vec::new()));
            srv.journal(
                JournalEntry::op("ForEach", &db_name).bucket(&bucket_name),
                result.err().map(|e| e.message().to_string()),
            );
        });

        wr.write_all(proto::response_head(200, None).as_bytes()).await?;
        while let Some((k, v)) = rx.recv().await {
            let frame = proto::encode_frame(&k, &v)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            wr.write_all(&frame).await?;
            wr.flush().await?;
        }
        let _ = worker.await;
        wr.shutdown().await
    }

    /// One watcher per `begin`. Exits as soon as the entry leaves the map;
    /// rolls the transaction back once it has sat idle past the limit.
    fn spawn_reaper(self: &Arc<Self>, name: String, entry: Arc<ServerTx>) {
        let srv = self.clone();
        let max = self.config.max_unused_lock;
        tokio::spawn(async move {
            let tick = (max / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let current = match srv.locks.get(&name) {
                    Some(e) => e.value().clone(),
                    None => return,
                };
                if !Arc::ptr_eq(&current, &entry) {
                    return; // a newer transaction took the slot
                }
                let idle = now_ms().saturating_sub(entry.last_ms.load(Ordering::Acquire));
                if u128::from(idle) <= max.as_millis() {
                    continue;
                }

                let mut guard = entry.tx.lock();
                // Re-check under the mutex: an operation may have landed
                // between the idle check and the lock.
                let idle = now_ms().saturating_sub(entry.last_ms.load(Ordering::Acquire));
                if u128::from(idle) <= max.as_millis() {
                    continue;
                }
                srv.locks.remove_if(&name, |_, v| Arc::ptr_eq(v, &entry));
                if let Some(tx) = guard.take() {
                    tx.abort();
                    srv.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    srv.counters.active_locks.fetch_sub(1, Ordering::Relaxed);
                    drop(guard);
                    srv.journal(JournalEntry::op("Timeout", &name), None);
                    tracing::info!("dropped idle transaction lock on {name}");
                }
                return;
            }
        });
    }
}

async fn write_response(wr: &mut OwnedWriteHalf, status: u16, body: &[u8]) -> std::io::Result<()> {
    wr.write_all(proto::response_head(status, Some(body.len())).as_bytes()).await?;
    wr.write_all(body).await?;
    wr.flush().await?;
    wr.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation_rejects_traversal() {
        assert!(Server::valid_name("shinyDB").is_ok());
        assert!(Server::valid_name("").is_err());
        assert!(Server::valid_name("..").is_err());
        assert!(Server::valid_name("a/b").is_err());
        assert!(Server::valid_name("a\\b").is_err());
    }

    #[test]
    fn counters_snapshot_reflects_increments() {
        let counters = Counters::default();
        counters.locks.fetch_add(2, Ordering::Relaxed);
        counters.gets.fetch_add(1, Ordering::Relaxed);
        let s = counters.snapshot();
        assert_eq!(s.locks, 2);
        assert_eq!(s.gets, 1);
        assert_eq!(s.timeouts, 0);
    }
}
