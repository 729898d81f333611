//! Bucket-wise database-to-database copy with a transform.

use crate::db::Db;
use crate::error::KvError;
use crate::seg::SegDb;

/// The surface the converter needs from either side. Implemented by [`Db`]
/// and [`SegDb`] so plain and segmented databases convert interchangeably.
pub trait Store {
    fn buckets(&self) -> Result<Vec<String>, KvError>;
    fn current_index(&self, bucket: &str) -> Result<u64, KvError>;
    fn set_next_index(&self, bucket: &str, n: u64) -> Result<(), KvError>;
    fn use_batch(&self, v: bool) -> bool;
    fn put_raw(&self, bucket: &str, key: &[u8], val: &[u8]) -> Result<(), KvError>;
    fn for_each_raw(
        &self,
        bucket: &str,
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), KvError>,
    ) -> Result<(), KvError>;
}

impl Store for Db {
    fn buckets(&self) -> Result<Vec<String>, KvError> {
        Db::buckets(self)
    }

    fn current_index(&self, bucket: &str) -> Result<u64, KvError> {
        Db::current_index(self, bucket)
    }

    fn set_next_index(&self, bucket: &str, n: u64) -> Result<(), KvError> {
        Db::set_next_index(self, bucket, n)
    }

    fn use_batch(&self, v: bool) -> bool {
        Db::use_batch(self, v)
    }

    fn put_raw(&self, bucket: &str, key: &[u8], val: &[u8]) -> Result<(), KvError> {
        self.put_raw_bytes(bucket, key, val)
    }

    fn for_each_raw(
        &self,
        bucket: &str,
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), KvError>,
    ) -> Result<(), KvError> {
        self.for_each_bytes(bucket, f)
    }
}

impl Store for SegDb {
    fn buckets(&self) -> Result<Vec<String>, KvError> {
        SegDb::buckets(self)
    }

    fn current_index(&self, bucket: &str) -> Result<u64, KvError> {
        SegDb::current_index(self, bucket)
    }

    fn set_next_index(&self, bucket: &str, n: u64) -> Result<(), KvError> {
        SegDb::set_next_index(self, bucket, n)
    }

    fn use_batch(&self, v: bool) -> bool {
        SegDb::use_batch(self, v)
    }

    fn put_raw(&self, bucket: &str, key: &[u8], val: &[u8]) -> Result<(), KvError> {
        // Routing hashes the textual key, same as the typed write path.
        let key_str = String::from_utf8_lossy(key);
        self.put_bytes(bucket, key_str.as_ref(), val)
    }

    fn for_each_raw(
        &self,
        bucket: &str,
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), KvError>,
    ) -> Result<(), KvError> {
        self.for_each_bytes(bucket, f)
    }
}

/// Copy every bucket of `src` into `dst`, transforming each pair through
/// `f`. Returning `None` skips the pair. Per-bucket sequence counters are
/// copied before the data. Batching is disabled on both sides for the
/// duration and restored afterwards, error or not.
pub fn convert<F>(dst: &dyn Store, src: &dyn Store, mut f: F) -> Result<(), KvError>
where
    F: FnMut(&str, &[u8], &[u8]) -> Option<Vec<u8>>,
{
    let prev_dst = dst.use_batch(false);
    let prev_src = src.use_batch(false);

    let result = (|| {
        for bucket in src.buckets()? {
            let seq = src.current_index(&bucket)?;
            if seq > 0 {
                dst.set_next_index(&bucket, seq)?;
            }
            src.for_each_raw(&bucket, &mut |k, v| {
                if let Some(nv) = f(&bucket, k, v) {
                    dst.put_raw(&bucket, k, &nv)?;
                }
                Ok(())
            })?;
        }
        Ok(())
    })();

    dst.use_batch(prev_dst);
    src.use_batch(prev_src);
    result
}
