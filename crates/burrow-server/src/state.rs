use std::sync::Arc;
use std::time::Duration;

use burrow_firehose::EventBus;
use burrow_repo::RepoManager;
use burrow_store::{BlobStore, InMemoryStorage, RedbStorage, Storage};
use burrow_types::TidClock;
use tracing::info;

use crate::auth::{AuthProvider, TokenAuth};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::resolver::{CachingResolver, LocalResolver};

/// Shared handles passed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub manager: Arc<RepoManager>,
    pub blobs: Arc<BlobStore>,
    pub auth: Arc<dyn AuthProvider>,
    pub resolver: Arc<CachingResolver<LocalResolver>>,
}

impl AppState {
    /// Open the configured storage and wire the components together.
    pub fn from_config(config: ServerConfig) -> ServerResult<Self> {
        let storage: Arc<dyn Storage> = match config.database_path() {
            Some(path) => {
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                info!(path = %path.display(), "opening database");
                Arc::new(RedbStorage::persistent(&path).map_err(|e| ServerError::Storage(e.to_string()))?)
            }
            None => {
                info!("using in-memory storage");
                Arc::new(InMemoryStorage::new())
            }
        };
        Self::with_storage(config, storage)
    }

    pub fn with_storage(config: ServerConfig, storage: Arc<dyn Storage>) -> ServerResult<Self> {
        let clock = Arc::new(TidClock::random());
        let bus = Arc::new(EventBus::new(config.firehose_buffer));
        let manager = Arc::new(RepoManager::new(Arc::clone(&storage), bus, Arc::clone(&clock)));
        let blobs = Arc::new(BlobStore::new(storage, clock).with_max_size(config.max_blob_size));
        let auth = Arc::new(TokenAuth::new(config.admin_token.clone(), &config.tokens)?);
        let resolver = Arc::new(CachingResolver::new(
            LocalResolver::new(Arc::clone(&manager)),
            Duration::from_secs(config.resolver_ttl_secs),
        ));
        Ok(Self {
            config: Arc::new(config),
            manager,
            blobs,
            auth,
            resolver,
        })
    }
}

/// Run synchronous storage work on the blocking pool.
pub async fn blocking<T, F>(f: F) -> ServerResult<T>
where
    F: FnOnce() -> ServerResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ServerError::Internal(format!("blocking task failed: {e}")))?
}
