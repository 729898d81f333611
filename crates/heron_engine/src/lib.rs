//! Embedded storage engine facade for HeronDB.
//!
//! Wraps one [`redb`] database per file and exposes the surface the rest of
//! the system is written against: named buckets of raw key/value pairs,
//! read/write transactions, per-bucket sequence counters, coalesced batch
//! writes and file-level snapshot backup.
//!
//! The engine is single-writer: `begin_write` blocks while another write
//! transaction is live anywhere in the process.

mod batch;
mod error;
mod store;

pub use error::EngineError;
pub use store::{Engine, Options, ReadTx, Staged, WriteTx};
