use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use burrow_types::Did;
use rand::RngCore;
use tracing::debug;

use crate::config::TokenGrant;
use crate::error::{ServerError, ServerResult};

/// Who is making a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Identity {
    Anonymous,
    Account(Did),
    Admin,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credentials {
    Bearer(String),
    Anonymous,
}

impl Credentials {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| Self::Bearer(t.trim().to_string()))
            .unwrap_or(Self::Anonymous)
    }
}

#[derive(Clone, Debug)]
pub enum Action {
    /// Mutate the given repository.
    Write(Did),
    /// Create accounts.
    Admin,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Write(did) => write!(f, "write:{did}"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

impl Identity {
    pub fn may(&self, action: &Action) -> bool {
        match (self, action) {
            (Self::Admin, _) => true,
            (Self::Account(did), Action::Write(repo)) => did == repo,
            _ => false,
        }
    }

    /// Fail unless this identity may perform `action`.
    pub fn require(&self, action: &Action) -> ServerResult<()> {
        match self {
            _ if self.may(action) => Ok(()),
            Self::Anonymous => Err(ServerError::AuthRequired(format!("{action} needs a bearer token"))),
            _ => Err(ServerError::InvalidToken(format!("token does not grant {action}"))),
        }
    }
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> ServerResult<Identity>;

    /// Mint a bearer token for an account.
    async fn issue_token(&self, did: &Did) -> ServerResult<String>;
}

/// Opaque bearer tokens: an optional admin token, the grants from the
/// configuration and tokens issued at account creation. Issued tokens live
/// only as long as the process.
pub struct TokenAuth {
    admin_token: Option<String>,
    tokens: RwLock<HashMap<String, Did>>,
}

impl TokenAuth {
    pub fn new(admin_token: Option<String>, grants: &[TokenGrant]) -> ServerResult<Self> {
        let mut tokens = HashMap::new();
        for grant in grants {
            let did = Did::parse(grant.did.as_str()).map_err(|e| ServerError::Config(e.to_string()))?;
            tokens.insert(grant.token.clone(), did);
        }
        Ok(Self {
            admin_token: admin_token.filter(|t| !t.is_empty()),
            tokens: RwLock::new(tokens),
        })
    }
}

#[async_trait]
impl AuthProvider for TokenAuth {
    async fn authenticate(&self, credentials: &Credentials) -> ServerResult<Identity> {
        let token = match credentials {
            Credentials::Anonymous => return Ok(Identity::Anonymous),
            Credentials::Bearer(token) => token,
        };
        if self.admin_token.as_deref() == Some(token.as_str()) {
            return Ok(Identity::Admin);
        }
        let tokens = self.tokens.read().expect("token table poisoned");
        tokens
            .get(token)
            .map(|did| Identity::Account(did.clone()))
            .ok_or_else(|| ServerError::InvalidToken("unknown bearer token".into()))
    }

    async fn issue_token(&self, did: &Did) -> ServerResult<String> {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = hex::encode(raw);
        self.tokens
            .write()
            .expect("token table poisoned")
            .insert(token.clone(), did.clone());
        debug!(%did, "bearer token issued");
        Ok(token)
    }
}
