//! Remote client for the HeronDB server.
//!
//! One TCP connection per request (the transport is connection-stateless),
//! transport failures retried with a fixed sleep, and a client-side read
//! cache of encoded values keyed by `(db, bucket, key)`. Transactions mirror
//! the server's lock model: `begin` registers the database name in a local
//! lock map, and cache updates made inside a transaction are deferred until
//! the server acknowledges the commit.

mod tx;

pub use tx::Tx;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use heron_common::{Codec, CodecError};
use heron_proto as proto;
use heron_proto::{ErrorBody, Op, ProtoError, Request, Stats};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("transport failed after {attempts} attempts: {source}")]
    Transport { attempts: u32, source: std::io::Error },

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("no lock for {0}")]
    NoLock(String),

    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    #[error("protocol: {0}")]
    Proto(#[from] ProtoError),

    #[error("stream: {0}")]
    Stream(String),
}

type CacheKey = (String, String, String);

pub struct Client {
    host: String,
    /// Transport retry attempts before giving up.
    pub retry_count: u32,
    /// Sleep between transport retries.
    pub retry_sleep: Duration,
    /// Sent as the `Authorization` header when set.
    pub auth_key: Option<String>,
    /// Value codec; must match what writers of the same data use.
    pub codec: Codec,

    locks: DashMap<String, u64>,
    next_tx: AtomicU64,
    cache: DashMap<CacheKey, Vec<u8>>,
}

impl Client {
    /// `addr` is `http://host:port` or plain `host:port`.
    pub fn new(addr: &str) -> Self {
        let host = addr.trim_end_matches('/');
        let host = host.strip_prefix("http://").unwrap_or(host).to_string();
        Self {
            host,
            retry_count: 100,
            retry_sleep: Duration::from_millis(100),
            auth_key: None,
            codec: Codec::Binary,
            locks: DashMap::new(),
            next_tx: AtomicU64::new(0),
            cache: DashMap::new(),
        }
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Typed read; the cache is consulted first. Every return value is
    /// decoded fresh from the cached bytes, so callers can never mutate the
    /// cache through what they were handed.
    pub async fn get<T: DeserializeOwned>(
        &self,
        db: &str,
        bucket: &str,
        key: &str,
    ) -> Result<T, ClientError> {
        let ck = cache_key(db, bucket, key);
        if let Some(bytes) = self.cache.get(&ck) {
            return Ok(self.codec.decode(&bytes)?);
        }
        let req = Request::new(Op::Get, bucket, key, Vec::new());
        let body = self.do_request("POST", &format!("/noTx/{db}"), &req.encode()?).await?;
        let v = self.codec.decode(&body)?;
        self.cache.insert(ck, body);
        Ok(v)
    }

    /// Typed write-through; the encoded bytes land in the cache only after
    /// the server acknowledged the write.
    pub async fn put<T: Serialize>(
        &self,
        db: &str,
        bucket: &str,
        key: &str,
        v: &T,
    ) -> Result<(), ClientError> {
        let bytes = self.codec.encode(v)?;
        let req = Request::new(Op::Put, bucket, key, bytes.clone());
        self.do_request("POST", &format!("/noTx/{db}"), &req.encode()?).await?;
        self.cache.insert(cache_key(db, bucket, key), bytes);
        Ok(())
    }

    pub async fn delete(&self, db: &str, bucket: &str, key: &str) -> Result<(), ClientError> {
        let req = Request::new(Op::Del, bucket, key, Vec::new());
        self.do_request("POST", &format!("/noTx/{db}"), &req.encode()?).await?;
        self.cache.remove(&cache_key(db, bucket, key));
        Ok(())
    }

    pub async fn next_index(&self, db: &str, bucket: &str) -> Result<u64, ClientError> {
        let req = Request::new(Op::Seq, bucket, "", Vec::new());
        let body = self.do_request("POST", &format!("/noTx/{db}"), &req.encode()?).await?;
        decode_u64(&body)
    }

    pub async fn set_next_index(&self, db: &str, bucket: &str, n: u64) -> Result<(), ClientError> {
        let value = bincode::serialize(&n).map_err(|e| ClientError::Proto(e.into()))?;
        let req = Request::new(Op::SetSeq, bucket, "", value);
        self.do_request("POST", &format!("/noTx/{db}"), &req.encode()?).await?;
        Ok(())
    }

    /// Stream a bucket. Every decoded pair is installed in the cache before
    /// the callback sees it; an empty key ends the stream.
    pub async fn for_each<T, F>(&self, db: &str, bucket: &str, mut f: F) -> Result<(), ClientError>
    where
        T: DeserializeOwned,
        F: FnMut(&str, T) -> Result<(), ClientError>,
    {
        let req = Request::new(Op::ForEach, bucket, "", Vec::new());
        let mut stream = self.open_stream("POST", &format!("/noTx/{db}"), &req.encode()?).await?;
        self.drain_stream(&mut stream, db, bucket, &mut f).await
    }

    pub(crate) async fn drain_stream<T, F>(
        &self,
        stream: &mut BufReader<TcpStream>,
        db: &str,
        bucket: &str,
        f: &mut F,
    ) -> Result<(), ClientError>
    where
        T: DeserializeOwned,
        F: FnMut(&str, T) -> Result<(), ClientError>,
    {
        loop {
            let (k, v) = proto::read_frame(stream).await?;
            if k.is_empty() {
                return Ok(());
            }
            if k.as_slice() == proto::ERROR_KEY {
                return Err(ClientError::Stream(String::from_utf8_lossy(&v).into_owned()));
            }
            let key = String::from_utf8_lossy(&k).into_owned();
            let val: T = self.codec.decode(&v)?;
            self.cache.insert(cache_key(db, bucket, &key), v);
            f(&key, val)?;
        }
    }

    /// Begin a server-held transaction on `db` and register it locally.
    pub async fn begin(&self, db: &str) -> Result<Tx<'_>, ClientError> {
        self.do_request("POST", &format!("/tx/begin/{db}"), &[]).await?;
        let id = self.next_tx.fetch_add(1, Ordering::Relaxed) + 1;
        self.locks.insert(db.to_string(), id);
        Ok(Tx::new(self, db.to_string(), id))
    }

    pub async fn stats(&self) -> Result<Stats, ClientError> {
        let body = self.do_request("GET", "/stats", &[]).await?;
        Ok(bincode::deserialize(&body).map_err(ProtoError::from)?)
    }

    /// Roll back every transaction this client still holds.
    pub async fn close(&self) -> Result<(), ClientError> {
        let names: Vec<String> = self.locks.iter().map(|e| e.key().clone()).collect();
        let mut first = None;
        for db in names {
            if self.locks.remove(&db).is_some() {
                if let Err(e) = self.do_request("DELETE", &format!("/tx/rollback/{db}"), &[]).await
                {
                    tracing::warn!("rollback {db} on close: {e}");
                    first.get_or_insert(e);
                }
            }
        }
        first.map_or(Ok(()), Err)
    }

    // ── internal plumbing ──────────────────────────────────────────────

    pub(crate) fn take_lock(&self, db: &str, id: u64) -> bool {
        self.locks.remove_if(db, |_, v| *v == id).is_some()
    }

    pub(crate) fn cache_insert(&self, db: &str, bucket: &str, key: &str, bytes: Vec<u8>) {
        self.cache.insert(cache_key(db, bucket, key), bytes);
    }

    pub(crate) fn cache_remove(&self, db: &str, bucket: &str, key: &str) {
        self.cache.remove(&cache_key(db, bucket, key));
    }

    async fn send_once(
        &self,
        method: &str,
        path: &str,
        body: &[u8],
    ) -> std::io::Result<(u16, Vec<u8>)> {
        let mut stream = TcpStream::connect(&self.host).await?;
        let head = proto::request_head(method, path, &self.host, self.auth_key.as_deref(), body.len());
        stream.write_all(head.as_bytes()).await?;
        stream.write_all(body).await?;
        stream.flush().await?;

        let mut rd = BufReader::new(stream);
        let resp = proto::read_response_head(&mut rd).await?;
        let body = match resp.content_length() {
            Some(len) => proto::read_body(&mut rd, len).await?,
            None => {
                let mut buf = Vec::new();
                rd.read_to_end(&mut buf).await?;
                buf
            }
        };
        Ok((resp.status, body))
    }

    pub(crate) async fn do_request(
        &self,
        method: &str,
        path: &str,
        body: &[u8],
    ) -> Result<Vec<u8>, ClientError> {
        let mut attempts = 0u32;
        loop {
            match self.send_once(method, path, body).await {
                Ok((status, body)) => return check_status(status, body),
                Err(source) => {
                    attempts += 1;
                    if attempts >= self.retry_count.max(1) {
                        return Err(ClientError::Transport { attempts, source });
                    }
                    tokio::time::sleep(self.retry_sleep).await;
                }
            }
        }
    }

    async fn connect_stream(
        &self,
        method: &str,
        path: &str,
        body: &[u8],
    ) -> std::io::Result<(u16, BufReader<TcpStream>, Vec<u8>)> {
        let mut stream = TcpStream::connect(&self.host).await?;
        let head = proto::request_head(method, path, &self.host, self.auth_key.as_deref(), body.len());
        stream.write_all(head.as_bytes()).await?;
        stream.write_all(body).await?;
        stream.flush().await?;

        let mut rd = BufReader::new(stream);
        let resp = proto::read_response_head(&mut rd).await?;
        if resp.status == 200 {
            return Ok((200, rd, Vec::new()));
        }
        let err_body = match resp.content_length() {
            Some(len) => proto::read_body(&mut rd, len).await?,
            None => Vec::new(),
        };
        Ok((resp.status, rd, err_body))
    }

    pub(crate) async fn open_stream(
        &self,
        method: &str,
        path: &str,
        body: &[u8],
    ) -> Result<BufReader<TcpStream>, ClientError> {
        let mut attempts = 0u32;
        loop {
            match self.connect_stream(method, path, body).await {
                Ok((200, rd, _)) => return Ok(rd),
                Ok((status, _, err_body)) => {
                    check_status(status, err_body)?;
                    return Err(ClientError::Stream(format!("unexpected status {status}")));
                }
                Err(source) => {
                    attempts += 1;
                    if attempts >= self.retry_count.max(1) {
                        return Err(ClientError::Transport { attempts, source });
                    }
                    tokio::time::sleep(self.retry_sleep).await;
                }
            }
        }
    }
}

fn cache_key(db: &str, bucket: &str, key: &str) -> CacheKey {
    (db.to_string(), bucket.to_string(), key.to_string())
}

pub(crate) fn decode_u64(body: &[u8]) -> Result<u64, ClientError> {
    Ok(bincode::deserialize(body).map_err(ProtoError::from)?)
}

fn check_status(status: u16, body: Vec<u8>) -> Result<Vec<u8>, ClientError> {
    match status {
        200 => Ok(body),
        401 => Err(ClientError::Unauthorized),
        _ => {
            let message = ErrorBody::decode(&body)
                .map(|e| e.message)
                .unwrap_or_else(|| String::from_utf8_lossy(&body).into_owned());
            if status == 404 {
                Err(ClientError::NotFound(message))
            } else {
                Err(ClientError::Server { status, message })
            }
        }
    }
}
