use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use burrow_crypto::SigningKey;
use burrow_types::{Did, Handle};
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::auth::Action;
use crate::error::{ServerError, ServerResult};
use crate::handler::Caller;
use crate::state::{blocking, AppState};

const DID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";

pub async fn describe_server(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "did": state.config.service_did,
        "availableUserDomains": [format!(".{}", state.config.hostname)],
        "inviteCodeRequired": false,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccountRequest {
    pub handle: String,
    pub did: Option<String>,
    /// Hex-encoded Ed25519 secret key; generated when absent.
    pub signing_key: Option<String>,
}

pub async fn create_account(
    State(state): State<AppState>,
    Caller(caller): Caller,
    payload: Result<Json<CreateAccountRequest>, JsonRejection>,
) -> ServerResult<Json<Value>> {
    caller.require(&Action::Admin)?;
    let Json(req) = payload?;

    let handle = Handle::parse(req.handle)?;
    let did = match req.did {
        Some(did) => Did::parse(did)?,
        None => generate_did()?,
    };
    let key = match req.signing_key {
        Some(hex) => SigningKey::from_hex(&hex).map_err(|e| ServerError::InvalidRequest(format!("signing key: {e}")))?,
        None => SigningKey::generate(),
    };

    let manager = Arc::clone(&state.manager);
    let commit = {
        let (did, handle) = (did.clone(), handle.clone());
        blocking(move || Ok(manager.create_repo(&did, &handle, &key)?)).await?
    };
    let token = state.auth.issue_token(&did).await?;
    state.resolver.bust(&handle);
    info!(%did, %handle, "account created");

    Ok(Json(json!({
        "did": did.to_string(),
        "handle": handle.to_string(),
        "accessToken": token,
        "commit": super::commit_json(&commit),
    })))
}

/// A fresh `did:plc` style identifier.
pub fn generate_did() -> ServerResult<Did> {
    let mut rng = rand::thread_rng();
    let ident: String = (0..24)
        .map(|_| char::from(DID_ALPHABET[rng.gen_range(0..DID_ALPHABET.len())]))
        .collect();
    Ok(Did::parse(format!("did:plc:{ident}"))?)
}
