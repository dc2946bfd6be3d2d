//! HTTP server for the Synapse MCP OAuth proxy.

pub mod auth;
pub mod oauth;
pub mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::Config;
use crate::connection::AuthMode;

/// The proxy's HTTP server.
pub struct McpServer {
    config: Arc<Config>,
    auth: AuthMode,
}

impl McpServer {
    #[must_use]
    pub fn new(config: Config, auth: AuthMode) -> Self {
        Self { config: Arc::new(config), auth }
    }

    #[must_use]
    pub const fn auth(&self) -> &AuthMode {
        &self.auth
    }

    /// Build the router without binding a socket.
    #[must_use]
    pub fn router(&self) -> axum::Router {
        let state = Arc::new(transport::HttpState::new(Arc::clone(&self.config), self.auth.clone()));
        transport::create_router(state)
    }

    /// Run the server until Ctrl+C.
    ///
    /// # Errors
    ///
    /// Returns error on bind or server failure.
    pub async fn run_http(self, addr: SocketAddr) -> anyhow::Result<()> {
        tracing::info!(auth_mode = self.auth.name(), "Starting HTTP server");

        let cleanup = self.auth.oauth().map(|proxy| {
            Arc::clone(proxy).start_cleanup_task(self.config.cleanup_interval)
        });

        let router = self.router();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("HTTP server listening on http://{}", addr);

        axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await?;

        if let Some(handle) = cleanup {
            handle.abort();
        }
        tracing::info!("HTTP server shut down");
        Ok(())
    }
}

impl std::fmt::Debug for McpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpServer").field("auth", &self.auth).finish()
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install CTRL+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Received shutdown signal");
}
