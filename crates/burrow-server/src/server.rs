use std::future::Future;

use tokio::net::TcpListener;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::router::build_router;
use crate::state::AppState;

/// Personal Data Server: storage, commit pipeline and XRPC surface.
pub struct PdsServer {
    state: AppState,
}

impl PdsServer {
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        Ok(Self {
            state: AppState::from_config(config)?,
        })
    }

    pub fn from_state(state: AppState) -> Self {
        Self { state }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Build the router (useful for testing).
    pub fn router(&self) -> axum::Router {
        build_router(self.state.clone())
    }

    /// Serve on the configured address until ctrl-c.
    pub async fn serve(self) -> ServerResult<()> {
        let listener = TcpListener::bind(self.config().bind_addr).await?;
        self.serve_on(listener, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
    }

    /// Serve on `listener` until `shutdown` resolves. Open firehose
    /// sessions are closed when it does.
    pub async fn serve_on<F>(self, listener: TcpListener, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        let bus = self.state.manager.bus().clone();
        info!(%addr, hostname = %self.config().hostname, "burrow listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.await;
                bus.close();
            })
            .await
            .map_err(|e| ServerError::Internal(e.to_string()))?;
        info!("burrow stopped");
        Ok(())
    }
}
