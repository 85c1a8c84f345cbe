use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use burrow_repo::RepoManager;
use burrow_types::{Did, Handle};
use tokio::sync::OnceCell;
use tracing::{debug, trace};

use crate::error::{ServerError, ServerResult};

/// Maps handles to account DIDs.
#[async_trait]
pub trait HandleResolver: Send + Sync {
    async fn resolve(&self, handle: &Handle) -> ServerResult<Did>;
}

/// Resolves handles against the local account table.
pub struct LocalResolver {
    manager: Arc<RepoManager>,
}

impl LocalResolver {
    pub fn new(manager: Arc<RepoManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl HandleResolver for LocalResolver {
    async fn resolve(&self, handle: &Handle) -> ServerResult<Did> {
        let manager = Arc::clone(&self.manager);
        let handle = handle.clone();
        let did = tokio::task::spawn_blocking(move || manager.resolve_handle(&handle))
            .await
            .map_err(|e| ServerError::Internal(e.to_string()))?;
        did.map_err(|e| match e {
            burrow_repo::RepoError::NotFound(m) => ServerError::InvalidRequest(format!("unable to resolve {m}")),
            other => other.into(),
        })
    }
}

struct Slot {
    created: Instant,
    cell: OnceCell<Did>,
}

/// Caches resolutions for a fixed time.
///
/// Concurrent lookups of the same handle share one call to the inner
/// resolver; lookups of different handles never wait on each other.
/// Failures are not cached.
pub struct CachingResolver<R> {
    inner: R,
    ttl: Duration,
    slots: Mutex<HashMap<Handle, Arc<Slot>>>,
}

impl<R: HandleResolver> CachingResolver<R> {
    pub fn new(inner: R, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Drop a cached resolution.
    pub fn bust(&self, handle: &Handle) {
        self.slots.lock().expect("resolver cache poisoned").remove(handle);
    }

    pub fn len(&self) -> usize {
        self.slots.lock().expect("resolver cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, handle: &Handle) -> Arc<Slot> {
        let mut slots = self.slots.lock().expect("resolver cache poisoned");
        slots.retain(|_, s| s.created.elapsed() < self.ttl);
        Arc::clone(slots.entry(handle.clone()).or_insert_with(|| {
            Arc::new(Slot {
                created: Instant::now(),
                cell: OnceCell::new(),
            })
        }))
    }
}

#[async_trait]
impl<R: HandleResolver> HandleResolver for CachingResolver<R> {
    async fn resolve(&self, handle: &Handle) -> ServerResult<Did> {
        let slot = self.slot(handle);
        if let Some(did) = slot.cell.get() {
            trace!(%handle, "resolver cache hit");
            return Ok(did.clone());
        }
        let did = slot
            .cell
            .get_or_try_init(|| async {
                debug!(%handle, "resolving handle");
                self.inner.resolve(handle).await
            })
            .await?;
        Ok(did.clone())
    }
}
