use burrow_store::StoreError;
use burrow_types::TypeError;

/// Errors produced by repository operations.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// The repository, record or block does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request is malformed or not valid for the repository's state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A record key violates the key grammar.
    #[error("invalid record key: {0}")]
    InvalidKey(String),

    /// The repository head moved underneath the commit.
    #[error("commit conflict: {0}")]
    CommitConflict(String),

    /// The storage backend failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A block or record could not be encoded, decoded or verified.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A collaborator outside the repository failed, e.g. identity lookup.
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl RepoError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<StoreError> for RepoError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::HeadMismatch { did, expected, actual } => {
                Self::CommitConflict(format!("head of {did} is {actual}, expected {expected}"))
            }
            StoreError::AlreadyExists(what) => Self::InvalidOperation(format!("already exists: {what}")),
            StoreError::InvalidOperation(msg) => Self::InvalidOperation(msg),
            StoreError::HashMismatch(cid) => Self::Encoding(format!("block {cid} does not match its hash")),
            StoreError::Serialization(msg) => Self::Encoding(msg),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<TypeError> for RepoError {
    fn from(e: TypeError) -> Self {
        match e {
            TypeError::InvalidRecordKey(_) | TypeError::InvalidTid(_) => Self::InvalidKey(e.to_string()),
            TypeError::Encoding(msg) => Self::Encoding(msg),
            other => Self::InvalidOperation(other.to_string()),
        }
    }
}

/// Convenience alias used throughout the repo crate.
pub type RepoResult<T> = Result<T, RepoError>;
