use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("metadata encoding error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("index corruption for user {user_id}: {detail}")]
    IndexCorruption { user_id: u64, detail: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

impl Error {
    /// Whether this error means a durable write may not have landed.
    ///
    /// Persistence failures leave the in-memory state ahead of the durable
    /// state; callers on the best-effort path log these instead of failing
    /// the user-facing operation.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Redb(_)
                | Error::RedbStorage(_)
                | Error::RedbTransaction(_)
                | Error::RedbTable(_)
                | Error::RedbCommit(_)
        )
    }
}
