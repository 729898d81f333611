use heron_common::CodecError;
use heron_engine::EngineError;
use thiserror::Error;

/// Errors of the key-value layer.
#[derive(Error, Debug)]
pub enum KvError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("database is closed")]
    Closed,
}

impl KvError {
    pub fn is_bucket_not_found(&self) -> bool {
        matches!(self, KvError::Engine(e) if e.is_bucket_not_found())
    }
}
