use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use burrow_repo::RepoError;
use burrow_store::StoreError;
use burrow_types::TypeError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Errors returned by handlers, rendered as XRPC `{error, message}` bodies.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("blob not found: {0}")]
    BlobNotFound(String),

    #[error("repository not found: {0}")]
    RepoNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("swap failed: {0}")]
    InvalidSwap(String),

    #[error("authentication required: {0}")]
    AuthRequired(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

impl ServerError {
    /// XRPC error name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RecordNotFound(_) => "RecordNotFound",
            Self::BlobNotFound(_) => "BlobNotFound",
            Self::RepoNotFound(_) => "RepoNotFound",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::InvalidSwap(_) => "InvalidSwap",
            Self::AuthRequired(_) => "AuthRequired",
            Self::InvalidToken(_) => "InvalidToken",
            Self::Storage(_) | Self::Config(_) | Self::Io(_) | Self::Internal(_) => "InternalServerError",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::RecordNotFound(_) | Self::BlobNotFound(_) | Self::RepoNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::InvalidSwap(_) => StatusCode::CONFLICT,
            Self::AuthRequired(_) | Self::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            Self::Storage(_) | Self::Config(_) | Self::Io(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Map a repository error from a record lookup, where not found means
    /// the record rather than the repository.
    pub fn record_lookup(err: RepoError) -> Self {
        match err {
            RepoError::NotFound(m) => Self::RecordNotFound(m),
            other => other.into(),
        }
    }
}

impl From<RepoError> for ServerError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound(m) => Self::RepoNotFound(m),
            RepoError::InvalidOperation(m) | RepoError::InvalidKey(m) | RepoError::Encoding(m) => {
                Self::InvalidRequest(m)
            }
            RepoError::CommitConflict(m) => Self::InvalidSwap(m),
            RepoError::Storage(m) | RepoError::Upstream(m) => Self::Storage(m),
        }
    }
}

/// Store errors reach handlers only from blob operations.
impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(m) => Self::BlobNotFound(m),
            StoreError::InvalidOperation(m) => Self::InvalidRequest(m),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<TypeError> for ServerError {
    fn from(err: TypeError) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

impl From<JsonRejection> for ServerError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ServerError {
    fn from(rejection: QueryRejection) -> Self {
        Self::InvalidRequest(rejection.body_text())
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        let body = Json(json!({
            "error": self.name(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}
