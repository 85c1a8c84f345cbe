use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::Json;
use burrow_types::{Did, Handle};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::{Action, Identity};
use crate::error::{ServerError, ServerResult};
use crate::handler::Caller;
use crate::resolver::HandleResolver;
use crate::state::{blocking, AppState};

#[derive(Debug, Deserialize)]
pub struct ResolveHandleParams {
    pub handle: String,
}

pub async fn resolve_handle(
    State(state): State<AppState>,
    params: Result<Query<ResolveHandleParams>, QueryRejection>,
) -> ServerResult<Json<Value>> {
    let Query(params) = params?;
    let did = state.resolver.resolve(&Handle::parse(params.handle)?).await?;
    Ok(Json(json!({ "did": did.to_string() })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateHandleRequest {
    pub handle: String,
    /// Account to rename; defaults to the caller's own.
    pub did: Option<String>,
}

pub async fn update_handle(
    State(state): State<AppState>,
    Caller(caller): Caller,
    payload: Result<Json<UpdateHandleRequest>, JsonRejection>,
) -> ServerResult<Json<Value>> {
    let Json(req) = payload?;
    let did = match (req.did, &caller) {
        (Some(did), _) => Did::parse(did)?,
        (None, Identity::Account(did)) => did.clone(),
        (None, _) => return Err(ServerError::InvalidRequest("did is required".into())),
    };
    caller.require(&Action::Write(did.clone()))?;
    let handle = Handle::parse(req.handle)?;

    let manager = Arc::clone(&state.manager);
    let old = {
        let (did, handle) = (did.clone(), handle.clone());
        blocking(move || {
            let old = manager.describe_repo(&did)?.handle;
            manager.update_handle(&did, &handle)?;
            Ok(old)
        })
        .await?
    };
    state.resolver.bust(&old);
    state.resolver.bust(&handle);
    Ok(Json(json!({})))
}
