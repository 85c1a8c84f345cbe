use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::{self, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handler::{account, health, identity, repo, subscribe, sync};
use crate::state::AppState;

/// Build the axum router with every XRPC endpoint.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(cors::Any)
        .allow_origin(cors::Any);

    Router::new()
        .route("/xrpc/_health", get(health::health))
        // server
        .route("/xrpc/com.atproto.server.describeServer", get(account::describe_server))
        .route("/xrpc/com.atproto.server.createAccount", post(account::create_account))
        // identity
        .route("/xrpc/com.atproto.identity.resolveHandle", get(identity::resolve_handle))
        .route("/xrpc/com.atproto.identity.updateHandle", post(identity::update_handle))
        // repo
        .route("/xrpc/com.atproto.repo.applyWrites", post(repo::apply_writes))
        .route("/xrpc/com.atproto.repo.createRecord", post(repo::create_record))
        .route("/xrpc/com.atproto.repo.putRecord", post(repo::put_record))
        .route("/xrpc/com.atproto.repo.deleteRecord", post(repo::delete_record))
        .route("/xrpc/com.atproto.repo.getRecord", get(repo::get_record))
        .route("/xrpc/com.atproto.repo.listRecords", get(repo::list_records))
        .route("/xrpc/com.atproto.repo.describeRepo", get(repo::describe_repo))
        .route("/xrpc/com.atproto.repo.uploadBlob", post(repo::upload_blob))
        // sync
        .route("/xrpc/com.atproto.sync.getRepo", get(sync::get_repo))
        .route("/xrpc/com.atproto.sync.getBlocks", get(sync::get_blocks))
        .route("/xrpc/com.atproto.sync.getRecord", get(sync::get_record))
        .route("/xrpc/com.atproto.sync.getLatestCommit", get(sync::get_latest_commit))
        .route("/xrpc/com.atproto.sync.getRepoStatus", get(sync::get_repo_status))
        .route("/xrpc/com.atproto.sync.listRepos", get(sync::list_repos))
        .route("/xrpc/com.atproto.sync.getBlob", get(sync::get_blob))
        .route("/xrpc/com.atproto.sync.listBlobs", get(sync::list_blobs))
        .route("/xrpc/com.atproto.sync.subscribeRepos", get(subscribe::subscribe_repos))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
}
