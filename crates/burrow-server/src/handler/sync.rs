use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use burrow_types::{parse_cid, Did, Nsid, RecordKey};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ServerError, ServerResult};
use crate::handler::{car_response, page_limit};
use crate::state::{blocking, AppState};

#[derive(Debug, Deserialize)]
pub struct RepoParams {
    pub did: String,
}

pub async fn get_repo(
    State(state): State<AppState>,
    params: Result<Query<RepoParams>, QueryRejection>,
) -> ServerResult<Response> {
    let Query(params) = params?;
    let did = Did::parse(params.did)?;
    let manager = Arc::clone(&state.manager);
    let car = blocking(move || Ok(manager.export_repo(&did)?)).await?;
    Ok(car_response(car))
}

/// `?did=...&cids=a&cids=b`; repeated keys are collected by hand.
pub async fn get_blocks(
    State(state): State<AppState>,
    params: Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> ServerResult<Response> {
    let Query(params) = params?;
    let mut did = None;
    let mut cids = Vec::new();
    for (key, value) in params {
        match key.as_str() {
            "did" => did = Some(Did::parse(value)?),
            "cids" => cids.push(parse_cid(&value)?),
            _ => {}
        }
    }
    let did = did.ok_or_else(|| ServerError::InvalidRequest("did is required".into()))?;
    let manager = Arc::clone(&state.manager);
    let car = blocking(move || Ok(manager.get_blocks(&did, &cids)?)).await?;
    Ok(car_response(car))
}

#[derive(Debug, Deserialize)]
pub struct RecordParams {
    pub did: String,
    pub collection: String,
    pub rkey: String,
}

/// Proof of a record's presence or absence as an export stream.
pub async fn get_record(
    State(state): State<AppState>,
    params: Result<Query<RecordParams>, QueryRejection>,
) -> ServerResult<Response> {
    let Query(params) = params?;
    let did = Did::parse(params.did)?;
    let collection = Nsid::parse(params.collection)?;
    let rkey = RecordKey::parse(params.rkey)?;
    let manager = Arc::clone(&state.manager);
    let car = blocking(move || Ok(manager.record_proof(&did, &collection, &rkey)?)).await?;
    Ok(car_response(car))
}

pub async fn get_latest_commit(
    State(state): State<AppState>,
    params: Result<Query<RepoParams>, QueryRejection>,
) -> ServerResult<Json<Value>> {
    let Query(params) = params?;
    let did = Did::parse(params.did)?;
    let manager = Arc::clone(&state.manager);
    let commit = blocking(move || Ok(manager.latest_commit(&did)?)).await?;
    Ok(Json(super::commit_json(&commit)))
}

pub async fn get_repo_status(
    State(state): State<AppState>,
    params: Result<Query<RepoParams>, QueryRejection>,
) -> ServerResult<Json<Value>> {
    let Query(params) = params?;
    let did = Did::parse(params.did)?;
    let manager = Arc::clone(&state.manager);
    let status = blocking(move || Ok(manager.repo_status(&did)?)).await?;
    Ok(Json(json!({
        "did": status.did.to_string(),
        "active": status.active,
        "rev": status.rev.to_string(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

pub async fn list_repos(
    State(state): State<AppState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> ServerResult<Json<Value>> {
    let Query(params) = params?;
    let limit = page_limit(params.limit);
    let cursor = params.cursor.map(Did::parse).transpose()?;
    let manager = Arc::clone(&state.manager);
    let repos = blocking(move || Ok(manager.list_repos(cursor.as_ref(), limit)?)).await?;

    let next = if repos.len() == limit {
        repos.last().map(|r| r.did.to_string())
    } else {
        None
    };
    let repos: Vec<Value> = repos
        .iter()
        .map(|r| {
            json!({
                "did": r.did.to_string(),
                "head": r.head.to_string(),
                "rev": r.rev.to_string(),
                "active": r.active,
            })
        })
        .collect();
    let mut body = json!({ "repos": repos });
    if let Some(cursor) = next {
        body["cursor"] = json!(cursor);
    }
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub struct BlobParams {
    pub did: String,
    pub cid: String,
}

pub async fn get_blob(
    State(state): State<AppState>,
    params: Result<Query<BlobParams>, QueryRejection>,
) -> ServerResult<Response> {
    let Query(params) = params?;
    let did = Did::parse(params.did)?;
    let cid = parse_cid(&params.cid)?;
    let blobs = Arc::clone(&state.blobs);
    let (row, data) = blocking(move || Ok(blobs.get(&did, &cid)?)).await?;
    Ok(([(header::CONTENT_TYPE, row.mime_type)], data).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ListBlobsParams {
    pub did: String,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

pub async fn list_blobs(
    State(state): State<AppState>,
    params: Result<Query<ListBlobsParams>, QueryRejection>,
) -> ServerResult<Json<Value>> {
    let Query(params) = params?;
    let did = Did::parse(params.did)?;
    let limit = page_limit(params.limit);
    let cursor = params
        .cursor
        .map(|c| c.parse::<u64>())
        .transpose()
        .map_err(|e| ServerError::InvalidRequest(format!("bad cursor: {e}")))?;

    let manager = Arc::clone(&state.manager);
    let blobs = Arc::clone(&state.blobs);
    let rows = blocking(move || {
        manager.latest_commit(&did)?;
        Ok(blobs.list(&did, cursor, limit)?)
    })
    .await?;

    let next = if rows.len() == limit {
        rows.last().map(|r| r.id.to_string())
    } else {
        None
    };
    let cids: Vec<String> = rows.iter().filter_map(|r| r.cid.map(|c| c.to_string())).collect();
    let mut body = json!({ "cids": cids });
    if let Some(cursor) = next {
        body["cursor"] = json!(cursor);
    }
    Ok(Json(body))
}
