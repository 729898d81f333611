//! Append-only operation journal with time-bucketed file rotation.
//!
//! The target file name is `now.format(pattern)` plus an extension; when the
//! formatted name changes (because the pattern contains date fields), the
//! journal closes the old file and opens the next one. Rotation frequency is
//! therefore entirely in the caller's hands.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalFormat {
    /// One JSON object per line.
    Json,
    /// Length-prefixed bincode records.
    Binary,
}

impl JournalFormat {
    fn ext(&self) -> &'static str {
        match self {
            JournalFormat::Json => ".json",
            JournalFormat::Binary => ".bin",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JournalOptions {
    /// Directory the journal files live under; created on demand.
    pub base: PathBuf,
    /// chrono format pattern selecting the file, e.g. `%Y-%m-%d` for daily
    /// rotation.
    pub pattern: String,
    pub format: JournalFormat,
}

impl Default for JournalOptions {
    fn default() -> Self {
        Self {
            base: PathBuf::from("./journal"),
            pattern: "%Y-%m-%d".to_string(),
            format: JournalFormat::Json,
        }
    }
}

/// One journaled operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JournalEntry {
    #[serde(default)]
    pub ts: i64,
    pub op: String,
    pub db: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bucket: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl JournalEntry {
    pub fn op(op: impl Into<String>, db: impl Into<String>) -> Self {
        Self { op: op.into(), db: db.into(), ..Default::default() }
    }

    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn value(mut self, value: Vec<u8>) -> Self {
        self.value = Some(value);
        self
    }
}

struct OpenJournalFile {
    name: String,
    file: File,
}

pub struct Journal {
    opts: JournalOptions,
    current: Mutex<Option<OpenJournalFile>>,
}

impl Journal {
    pub fn new(opts: JournalOptions) -> Self {
        Self { opts, current: Mutex::new(None) }
    }

    /// Stamp and append `entry`. The operation's error, if any, is recorded
    /// in the entry; a journal I/O failure is returned to the caller, who is
    /// expected to log it and carry on.
    pub fn write(&self, mut entry: JournalEntry, err: Option<&str>) -> io::Result<()> {
        entry.ts = Utc::now().timestamp();
        if let Some(msg) = err {
            entry.error = msg.to_string();
        }

        let mut current = self.current.lock();
        let file = self.rotate(&mut current)?;
        match self.opts.format {
            JournalFormat::Json => {
                serde_json::to_writer(&mut *file, &entry)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                file.write_all(b"\n")
            }
            JournalFormat::Binary => {
                let payload = bincode::serialize(&entry)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                file.write_all(&(payload.len() as u32).to_le_bytes())?;
                file.write_all(&payload)
            }
        }
    }

    fn rotate<'a>(
        &self,
        current: &'a mut Option<OpenJournalFile>,
    ) -> io::Result<&'a mut File> {
        let name = format!("{}{}", Utc::now().format(&self.opts.pattern), self.opts.format.ext());
        let stale = current.as_ref().map(|o| o.name != name).unwrap_or(true);
        if stale {
            current.take(); // close the previous file
            let path = self.opts.base.join(&name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            *current = Some(OpenJournalFile { name, file });
        }
        match current.as_mut() {
            Some(open) => Ok(&mut open.file),
            None => Err(io::Error::new(io::ErrorKind::Other, "journal file not open")),
        }
    }

    /// Path of the file the next write would land in.
    pub fn current_path(&self) -> PathBuf {
        let name = format!("{}{}", Utc::now().format(&self.opts.pattern), self.opts.format.ext());
        self.opts.base.join(name)
    }

    pub fn close(&self) {
        self.current.lock().take();
    }
}
