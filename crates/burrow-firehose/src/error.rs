/// Errors produced by the firehose.
#[derive(Debug, thiserror::Error)]
pub enum FirehoseError {
    /// A frame or payload could not be encoded or decoded.
    #[error("frame encoding error: {0}")]
    Encoding(String),

    /// The transport rejected a frame.
    #[error("failed to write frame: {0}")]
    Sink(String),

    /// The session is not in a state that allows the operation.
    #[error("invalid session state: {0}")]
    InvalidState(String),
}

/// Convenience alias used throughout the firehose crate.
pub type Result<T> = std::result::Result<T, FirehoseError>;
