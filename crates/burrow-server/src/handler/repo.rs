use std::sync::Arc;

use axum::body::Body;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::Json;
use burrow_repo::{RepoManager, WriteAction, WriteOp, WriteResult};
use burrow_store::{ChunkedWriter, ListQuery};
use burrow_types::value::{decode_dag_cbor, ipld_from_json, ipld_to_json};
use burrow_types::{parse_cid, BlobRef, Cid, Did, Ipld, Nsid, RecordKey, Tid};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::auth::{Action, Identity};
use crate::error::{ServerError, ServerResult};
use crate::handler::{commit_json, page_limit, resolve_repo, Caller};
use crate::state::{blocking, AppState};

const WRITE_TYPE_PREFIX: &str = "com.atproto.repo.applyWrites#";

// ---- Writes ----

#[derive(Debug, Deserialize)]
pub struct WriteItem {
    #[serde(rename = "$type")]
    pub kind: String,
    pub collection: String,
    pub rkey: Option<String>,
    pub value: Option<Value>,
}

impl WriteItem {
    fn into_op(self) -> ServerResult<WriteOp> {
        let action = match self.kind.strip_prefix(WRITE_TYPE_PREFIX).unwrap_or(&self.kind) {
            "create" => WriteAction::Create,
            "update" => WriteAction::Update,
            "delete" => WriteAction::Delete,
            other => return Err(ServerError::InvalidRequest(format!("unknown write type {other}"))),
        };
        Ok(WriteOp {
            action,
            collection: self.collection,
            rkey: self.rkey,
            value: self.value.as_ref().map(ipld_from_json).transpose()?,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyWritesRequest {
    pub repo: String,
    pub writes: Vec<WriteItem>,
    pub swap_commit: Option<String>,
}

pub async fn apply_writes(
    State(state): State<AppState>,
    Caller(caller): Caller,
    payload: Result<Json<ApplyWritesRequest>, JsonRejection>,
) -> ServerResult<Json<Value>> {
    let Json(req) = payload?;
    let did = writable_repo(&caller, &req.repo)?;
    let writes = req
        .writes
        .into_iter()
        .map(WriteItem::into_op)
        .collect::<ServerResult<Vec<_>>>()?;
    let results = commit(&state.manager, did, writes, req.swap_commit).await?;

    let commit = results.first().map(|r| commit_json(&r.commit));
    let results: Vec<Value> = results
        .iter()
        .map(|r| {
            let mut item = json!({ "$type": format!("{WRITE_TYPE_PREFIX}{}Result", r.action) });
            if let Some(cid) = r.cid {
                item["uri"] = json!(r.uri.to_string());
                item["cid"] = json!(cid.to_string());
            }
            item
        })
        .collect();
    Ok(Json(json!({ "commit": commit, "results": results })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRecordRequest {
    pub repo: String,
    pub collection: String,
    pub rkey: Option<String>,
    pub record: Value,
    pub swap_commit: Option<String>,
}

pub async fn create_record(
    State(state): State<AppState>,
    Caller(caller): Caller,
    payload: Result<Json<CreateRecordRequest>, JsonRejection>,
) -> ServerResult<Json<Value>> {
    let Json(req) = payload?;
    let did = writable_repo(&caller, &req.repo)?;
    let op = WriteOp::create(req.collection, req.rkey.as_deref(), ipld_from_json(&req.record)?);
    let results = commit(&state.manager, did, vec![op], req.swap_commit).await?;
    Ok(Json(record_written(&results)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutRecordRequest {
    pub repo: String,
    pub collection: String,
    pub rkey: String,
    pub record: Value,
    pub swap_commit: Option<String>,
}

/// Create or replace the record at a fixed key.
pub async fn put_record(
    State(state): State<AppState>,
    Caller(caller): Caller,
    payload: Result<Json<PutRecordRequest>, JsonRejection>,
) -> ServerResult<Json<Value>> {
    let Json(req) = payload?;
    let did = writable_repo(&caller, &req.repo)?;
    let op = WriteOp::upsert(req.collection, req.rkey, ipld_from_json(&req.record)?);
    let results = commit(&state.manager, did, vec![op], req.swap_commit).await?;
    Ok(Json(record_written(&results)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRecordRequest {
    pub repo: String,
    pub collection: String,
    pub rkey: String,
    pub swap_commit: Option<String>,
}

pub async fn delete_record(
    State(state): State<AppState>,
    Caller(caller): Caller,
    payload: Result<Json<DeleteRecordRequest>, JsonRejection>,
) -> ServerResult<Json<Value>> {
    let Json(req) = payload?;
    let did = writable_repo(&caller, &req.repo)?;
    let op = WriteOp::delete(req.collection, req.rkey);
    let results = commit(&state.manager, did, vec![op], req.swap_commit).await?;
    Ok(Json(json!({ "commit": results.first().map(|r| commit_json(&r.commit)) })))
}

fn writable_repo(caller: &Identity, repo: &str) -> ServerResult<Did> {
    let did = Did::parse(repo)?;
    caller.require(&Action::Write(did.clone()))?;
    Ok(did)
}

async fn commit(
    manager: &Arc<RepoManager>,
    did: Did,
    writes: Vec<WriteOp>,
    swap_commit: Option<String>,
) -> ServerResult<Vec<WriteResult>> {
    let swap = swap_commit.as_deref().map(parse_cid).transpose()?;
    let manager = Arc::clone(manager);
    blocking(move || Ok(manager.apply_writes(&did, &writes, swap.as_ref())?)).await
}

fn record_written(results: &[WriteResult]) -> ServerResult<Value> {
    let result = results
        .first()
        .ok_or_else(|| ServerError::Internal("commit produced no results".into()))?;
    Ok(json!({
        "uri": result.uri.to_string(),
        "cid": result.cid.map(|c| c.to_string()),
        "commit": commit_json(&result.commit),
    }))
}

// ---- Reads ----

#[derive(Debug, Deserialize)]
pub struct GetRecordParams {
    pub repo: String,
    pub collection: String,
    pub rkey: String,
    /// Only return the record if its current version has this CID.
    pub cid: Option<String>,
}

pub async fn get_record(
    State(state): State<AppState>,
    params: Result<Query<GetRecordParams>, QueryRejection>,
) -> ServerResult<Json<Value>> {
    let Query(params) = params?;
    let did = resolve_repo(&state, &params.repo).await?;
    let collection = Nsid::parse(params.collection)?;
    let rkey = RecordKey::parse(params.rkey)?;
    let want: Option<Cid> = params.cid.as_deref().map(parse_cid).transpose()?;

    let manager = Arc::clone(&state.manager);
    let (uri, row) = blocking(move || {
        manager.latest_commit(&did)?;
        let row = manager
            .get_record(&did, &collection, &rkey)
            .map_err(ServerError::record_lookup)?;
        Ok((format!("at://{did}/{collection}/{rkey}"), row))
    })
    .await?;
    if want.is_some_and(|cid| cid != row.cid) {
        return Err(ServerError::RecordNotFound(format!("{uri} at {}", row.cid)));
    }
    Ok(Json(json!({
        "uri": uri,
        "cid": row.cid.to_string(),
        "value": record_value(&row.value)?,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ListRecordsParams {
    pub repo: String,
    pub collection: String,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
    pub reverse: Option<bool>,
}

pub async fn list_records(
    State(state): State<AppState>,
    params: Result<Query<ListRecordsParams>, QueryRejection>,
) -> ServerResult<Json<Value>> {
    let Query(params) = params?;
    let did = resolve_repo(&state, &params.repo).await?;
    let collection = Nsid::parse(params.collection)?;
    let query = ListQuery {
        limit: page_limit(params.limit),
        cursor: params.cursor.as_deref().map(Tid::parse).transpose()?,
        reverse: params.reverse.unwrap_or(false),
    };

    let manager = Arc::clone(&state.manager);
    let uri_prefix = format!("at://{did}/{collection}");
    let (rows, cursor) = blocking(move || Ok(manager.list_records(&did, &collection, &query)?)).await?;
    let records = rows
        .iter()
        .map(|row| {
            Ok(json!({
                "uri": format!("{uri_prefix}/{}", row.rkey),
                "cid": row.cid.to_string(),
                "value": record_value(&row.value)?,
            }))
        })
        .collect::<ServerResult<Vec<_>>>()?;

    let mut body = json!({ "records": records });
    if let Some(cursor) = cursor {
        body["cursor"] = json!(cursor.to_string());
    }
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub struct DescribeRepoParams {
    pub repo: String,
}

pub async fn describe_repo(
    State(state): State<AppState>,
    params: Result<Query<DescribeRepoParams>, QueryRejection>,
) -> ServerResult<Json<Value>> {
    let Query(params) = params?;
    let did = resolve_repo(&state, &params.repo).await?;
    let manager = Arc::clone(&state.manager);
    let desc = blocking(move || Ok(manager.describe_repo(&did)?)).await?;
    Ok(Json(json!({
        "did": desc.did.to_string(),
        "handle": desc.handle.to_string(),
        "handleIsCorrect": true,
        "collections": desc.collections.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
    })))
}

fn record_value(bytes: &[u8]) -> ServerResult<Value> {
    let value: Ipld = decode_dag_cbor(bytes).map_err(|e| ServerError::Storage(e.to_string()))?;
    Ok(ipld_to_json(&value))
}

// ---- Blobs ----

/// Stream the request body into chunked blob storage.
///
/// The body is forwarded chunk by chunk to a blocking writer, so at most a
/// few chunks are held in memory regardless of the blob size.
pub async fn upload_blob(
    State(state): State<AppState>,
    Caller(caller): Caller,
    headers: HeaderMap,
    body: Body,
) -> ServerResult<Json<Value>> {
    let did = match caller {
        Identity::Account(did) => did,
        Identity::Admin => return Err(ServerError::InvalidRequest("blob uploads need an account token".into())),
        Identity::Anonymous => return Err(ServerError::AuthRequired("uploadBlob needs a bearer token".into())),
    };
    let mime_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let blobs = Arc::clone(&state.blobs);
    let upload = {
        let did = did.clone();
        blocking(move || Ok(blobs.begin_upload(&did, mime_type.as_deref())?)).await?
    };

    // `None` marks the end of the body; a dropped sender aborts the upload.
    let (tx, mut rx) = mpsc::channel::<Option<Bytes>>(4);
    let writer = tokio::task::spawn_blocking(move || -> ServerResult<BlobRef> {
        let mut writer = ChunkedWriter::new(upload);
        loop {
            match rx.blocking_recv() {
                Some(Some(chunk)) => writer.write(&chunk)?,
                Some(None) => return Ok(writer.finish()?),
                None => return Err(ServerError::InvalidRequest("upload aborted".into())),
            }
        }
    });

    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(%did, error = %e, "blob upload body failed");
                return Err(ServerError::InvalidRequest(format!("reading body: {e}")));
            }
        };
        if tx.send(Some(chunk)).await.is_err() {
            // The writer failed; its error is returned below.
            break;
        }
    }
    let _ = tx.send(None).await;
    drop(tx);

    let blob = writer
        .await
        .map_err(|e| ServerError::Internal(format!("blob writer failed: {e}")))??;
    debug!(%did, cid = %blob.cid, size = blob.size, "blob uploaded");
    Ok(Json(json!({ "blob": blob.to_json() })))
}
