use thiserror::Error;

/// Errors produced by type parsing and encoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid DID: {0}")]
    InvalidDid(String),

    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    #[error("invalid collection NSID: {0}")]
    InvalidNsid(String),

    #[error("invalid record key: {0}")]
    InvalidRecordKey(String),

    #[error("invalid TID: {0}")]
    InvalidTid(String),

    #[error("invalid CID: {0}")]
    InvalidCid(String),

    #[error("invalid record path: {0}")]
    InvalidPath(String),

    #[error("encoding error: {0}")]
    Encoding(String),
}
