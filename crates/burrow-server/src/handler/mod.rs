//! XRPC handlers, one module per namespace.

pub mod account;
pub mod health;
pub mod identity;
pub mod repo;
pub mod subscribe;
pub mod sync;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use burrow_repo::CommitRef;
use burrow_types::{Did, Handle};
use serde_json::{json, Value};

use crate::auth::{Credentials, Identity};
use crate::error::ServerResult;
use crate::resolver::HandleResolver;
use crate::state::AppState;

pub const CAR_MIME_TYPE: &str = "application/vnd.ipld.car";

/// Default and maximum page sizes for listings.
pub const DEFAULT_LIMIT: usize = 50;
pub const MAX_LIMIT: usize = 100;

/// The authenticated caller of a request.
pub struct Caller(pub Identity);

#[async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = crate::error::ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let credentials = Credentials::from_headers(&parts.headers);
        Ok(Self(state.auth.authenticate(&credentials).await?))
    }
}

/// A repository named by DID or by handle.
pub(crate) async fn resolve_repo(state: &AppState, repo: &str) -> ServerResult<Did> {
    if repo.starts_with("did:") {
        return Ok(Did::parse(repo)?);
    }
    state.resolver.resolve(&Handle::parse(repo)?).await
}

pub(crate) fn page_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

pub(crate) fn commit_json(commit: &CommitRef) -> Value {
    json!({ "cid": commit.cid.to_string(), "rev": commit.rev.to_string() })
}

pub(crate) fn car_response(bytes: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, CAR_MIME_TYPE)], bytes).into_response()
}
