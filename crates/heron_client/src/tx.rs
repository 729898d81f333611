use serde::de::DeserializeOwned;
use serde::Serialize;

use heron_proto::{Op, Request};

use crate::{decode_u64, Client, ClientError};

enum CacheOp {
    Put { bucket: String, key: String, value: Vec<u8> },
    Delete { bucket: String, key: String },
}

/// A client-side handle to a server-held transaction.
///
/// Writes go to the server immediately; the matching client-cache updates
/// are deferred and run only once the server acknowledges `commit`, so a
/// rolled-back transaction never pollutes the read cache.
pub struct Tx<'c> {
    client: &'c Client,
    db: String,
    id: u64,
    prefix: String,
    updates: Vec<CacheOp>,
}

impl<'c> Tx<'c> {
    pub(crate) fn new(client: &'c Client, db: String, id: u64) -> Self {
        let prefix = format!("/tx/{db}");
        Self { client, db, id, prefix, updates: Vec::new() }
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    /// Read through the held transaction; sees the transaction's own
    /// uncommitted writes. Bypasses the client cache.
    pub async fn get<T: DeserializeOwned>(&self, bucket: &str, key: &str) -> Result<T, ClientError> {
        let req = Request::new(Op::Get, bucket, key, Vec::new());
        let body = self.client.do_request("POST", &self.prefix, &req.encode()?).await?;
        Ok(self.client.codec.decode(&body)?)
    }

    pub async fn put<T: Serialize>(
        &mut self,
        bucket: &str,
        key: &str,
        v: &T,
    ) -> Result<(), ClientError> {
        let bytes = self.client.codec.encode(v)?;
        let req = Request::new(Op::Put, bucket, key, bytes.clone());
        self.client.do_request("POST", &self.prefix, &req.encode()?).await?;
        self.updates.push(CacheOp::Put {
            bucket: bucket.to_string(),
            key: key.to_string(),
            value: bytes,
        });
        Ok(())
    }

    pub async fn delete(&mut self, bucket: &str, key: &str) -> Result<(), ClientError> {
        let req = Request::new(Op::Del, bucket, key, Vec::new());
        self.client.do_request("POST", &self.prefix, &req.encode()?).await?;
        self.updates.push(CacheOp::Delete { bucket: bucket.to_string(), key: key.to_string() });
        Ok(())
    }

    pub async fn next_index(&self, bucket: &str) -> Result<u64, ClientError> {
        let req = Request::new(Op::Seq, bucket, "", Vec::new());
        let body = self.client.do_request("POST", &self.prefix, &req.encode()?).await?;
        decode_u64(&body)
    }

    pub async fn set_next_index(&self, bucket: &str, n: u64) -> Result<(), ClientError> {
        let value = bincode::serialize(&n).map_err(heron_proto::ProtoError::from)?;
        let req = Request::new(Op::SetSeq, bucket, "", value);
        self.client.do_request("POST", &self.prefix, &req.encode()?).await?;
        Ok(())
    }

    /// Stream the bucket through the held transaction, observing its own
    /// uncommitted writes. Decoded pairs are installed in the client cache.
    pub async fn for_each<T, F>(&self, bucket: &str, mut f: F) -> Result<(), ClientError>
    where
        T: DeserializeOwned,
        F: FnMut(&str, T) -> Result<(), ClientError>,
    {
        let req = Request::new(Op::ForEach, bucket, "", Vec::new());
        let mut stream = self.client.open_stream("POST", &self.prefix, &req.encode()?).await?;
        self.client.drain_stream(&mut stream, &self.db, bucket, &mut f).await
    }

    /// Commit on the server, then apply the deferred cache updates. Fails
    /// with [`ClientError::NoLock`] if this transaction was already
    /// released (for instance by a concurrent rollback or `close`).
    pub async fn commit(self) -> Result<(), ClientError> {
        if !self.client.take_lock(&self.db, self.id) {
            return Err(ClientError::NoLock(self.db));
        }
        self.client.do_request("DELETE", &format!("/tx/commit/{}", self.db), &[]).await?;
        for op in self.updates {
            match op {
                CacheOp::Put { bucket, key, value } => {
                    self.client.cache_insert(&self.db, &bucket, &key, value);
                }
                CacheOp::Delete { bucket, key } => {
                    self.client.cache_remove(&self.db, &bucket, &key);
                }
            }
        }
        Ok(())
    }

    /// Roll back on the server; deferred cache updates are discarded.
    pub async fn rollback(self) -> Result<(), ClientError> {
        if !self.client.take_lock(&self.db, self.id) {
            return Err(ClientError::NoLock(self.db));
        }
        self.client.do_request("DELETE", &format!("/tx/rollback/{}", self.db), &[]).await?;
        Ok(())
    }
}
