use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use burrow_firehose::DEFAULT_SUBSCRIBER_BUFFER;
use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

/// Server settings, read from a TOML file. Every field has a default.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Public host name; account handles live under it.
    pub hostname: String,
    /// DID the server itself answers to in `describeServer`.
    pub service_did: String,
    /// Directory holding the database file. `None` keeps everything in
    /// memory.
    pub data_dir: Option<PathBuf>,
    pub max_blob_size: u64,
    /// Queue length of each firehose subscriber.
    pub firehose_buffer: usize,
    /// Seconds a resolved handle stays cached.
    pub resolver_ttl_secs: u64,
    /// Bearer token allowed to create accounts and write to any repository.
    pub admin_token: Option<String>,
    pub tokens: Vec<TokenGrant>,
}

/// A static bearer token bound to one account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub token: String,
    pub did: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 2583)),
            hostname: "localhost".into(),
            service_did: "did:web:localhost".into(),
            data_dir: None,
            max_blob_size: 50 * 1024 * 1024,
            firehose_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            resolver_ttl_secs: 300,
            admin_token: None,
            tokens: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml(s: &str) -> ServerResult<Self> {
        toml::from_str(s).map_err(|e| ServerError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> ServerResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Path of the database file, if the server is persistent.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join("burrow.redb"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = ServerConfig::default();
        assert_eq!(c.bind_addr, "127.0.0.1:2583".parse::<SocketAddr>().unwrap());
        assert_eq!(c.firehose_buffer, DEFAULT_SUBSCRIBER_BUFFER);
        assert!(c.data_dir.is_none());
        assert!(c.database_path().is_none());
        assert!(c.tokens.is_empty());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let c = ServerConfig::from_toml(
            r#"
            hostname = "pds.example"
            data_dir = "/var/lib/burrow"
            admin_token = "secret"

            [[tokens]]
            token = "t1"
            did = "did:example:alice"
            "#,
        )
        .unwrap();
        assert_eq!(c.hostname, "pds.example");
        assert_eq!(c.database_path(), Some(PathBuf::from("/var/lib/burrow/burrow.redb")));
        assert_eq!(c.admin_token.as_deref(), Some("secret"));
        assert_eq!(c.tokens[0].did, "did:example:alice");
        assert_eq!(c.max_blob_size, ServerConfig::default().max_blob_size);
    }

    #[test]
    fn bad_toml_is_a_config_error() {
        assert!(matches!(ServerConfig::from_toml("bind_addr = 12"), Err(ServerError::Config(_))));
    }
}
