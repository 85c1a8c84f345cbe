/// Errors from storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A unique key is already taken.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The repository head moved since it was read.
    #[error("head mismatch for {did}: expected {expected}, found {actual}")]
    HeadMismatch {
        did: String,
        expected: String,
        actual: String,
    },

    /// The operation is not valid in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Stored bytes do not hash to the requested CID.
    #[error("hash mismatch for block {0}")]
    HashMismatch(String),

    /// Row encoding or decoding failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Failure reported by the storage backend.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

macro_rules! backend_error {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for StoreError {
                fn from(e: $ty) -> Self {
                    Self::Backend(e.to_string())
                }
            }
        )*
    };
}

backend_error!(
    redb::Error,
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<burrow_types::TypeError> for StoreError {
    fn from(e: burrow_types::TypeError) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
