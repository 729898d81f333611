//! The HeronDB key-value layer.
//!
//! [`Db`] is the typed facade over one engine file; [`MultiDb`] is a
//! path-indexed registry of shared handles with race-free opens; [`SegDb`]
//! fans keys out over N databases by hash; [`Cache`] is a per-bucket
//! write-through cache with clone-on-boundary semantics; [`convert`] copies
//! databases bucket-by-bucket with a transform.

mod cache;
mod convert;
mod db;
mod error;
mod multi;
mod seg;

pub use cache::{Cache, CacheStats, CacheUpdate};
pub use convert::{convert, Store};
pub use db::Db;
pub use error::KvError;
pub use multi::{close_all, open, InitDbFn, MultiDb, OpenOptions};
pub use seg::{default_segment_by_key, SegDb};

pub use heron_common::{Codec, CodecError};
pub use heron_engine::{Engine, EngineError, Options as EngineOptions, ReadTx, Staged, WriteTx};
