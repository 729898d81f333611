//! The HeronDB remote server: an HTTP surface over the KV layer with
//! server-held write transactions, an idle-lock reaper and an append-only
//! operation journal.

mod journal;
mod server;

pub use journal::{Journal, JournalEntry, JournalFormat, JournalOptions};
pub use server::{Server, ServerConfig};
