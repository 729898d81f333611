use thiserror::Error;

/// Errors surfaced by the engine facade.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The database file is already open by another `Engine` in this process
    /// (or by another process holding the file lock). Callers that manage a
    /// registry treat this as "wait for the other opener".
    #[error("database file already open")]
    AlreadyOpen,

    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("engine: {0}")]
    Redb(#[from] redb::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn is_already_open(&self) -> bool {
        matches!(self, EngineError::AlreadyOpen)
    }

    pub fn is_bucket_not_found(&self) -> bool {
        matches!(self, EngineError::BucketNotFound(_))
    }
}

impl From<redb::DatabaseError> for EngineError {
    fn from(e: redb::DatabaseError) -> Self {
        match e {
            redb::DatabaseError::DatabaseAlreadyOpen => EngineError::AlreadyOpen,
            other => EngineError::Redb(other.into()),
        }
    }
}

impl From<redb::TransactionError> for EngineError {
    fn from(e: redb::TransactionError) -> Self {
        EngineError::Redb(e.into())
    }
}

impl From<redb::TableError> for EngineError {
    fn from(e: redb::TableError) -> Self {
        match e {
            redb::TableError::TableDoesNotExist(name) => {
                EngineError::BucketNotFound(store_name_to_bucket(&name))
            }
            other => EngineError::Redb(other.into()),
        }
    }
}

impl From<redb::StorageError> for EngineError {
    fn from(e: redb::StorageError) -> Self {
        EngineError::Redb(e.into())
    }
}

impl From<redb::CommitError> for EngineError {
    fn from(e: redb::CommitError) -> Self {
        EngineError::Redb(e.into())
    }
}

/// Strip the internal table-name prefix when reporting a missing bucket.
fn store_name_to_bucket(name: &str) -> String {
    name.strip_prefix(crate::store::BUCKET_PREFIX)
        .unwrap_or(name)
        .to_string()
}
