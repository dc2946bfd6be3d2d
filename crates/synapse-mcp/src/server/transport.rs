//! HTTP transport.
//!
//! Routes:
//! - `/health`: liveness and auth mode
//! - OAuth discovery, registration, authorization, callback and token endpoints
//! - `/session`: who the current bearer token belongs to (protected)
//!
//! Middleware order is fixed here: tracing wraps CORS, and bearer
//! authentication is applied only to the protected routes.

use std::num::NonZeroU32;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::auth::require_bearer;
use super::oauth::handlers;
use crate::config::Config;
use crate::connection::{AuthMode, resolve_credentials};
use crate::error::ProxyResult;

/// Shared state for HTTP handlers.
pub struct HttpState {
    pub auth: AuthMode,
    pub config: Arc<Config>,
    /// Throttle for `POST /register`.
    pub registration_limiter: DefaultDirectRateLimiter,
}

impl HttpState {
    #[must_use]
    pub fn new(config: Arc<Config>, auth: AuthMode) -> Self {
        let per_minute =
            NonZeroU32::new(config.registrations_per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            auth,
            config,
            registration_limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
        }
    }
}

impl std::fmt::Debug for HttpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpState").field("auth", &self.auth).finish()
    }
}

/// Create the HTTP router.
pub fn create_router(state: Arc<HttpState>) -> Router {
    let protected = Router::new()
        .route("/session", get(handle_session))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), require_bearer));

    let redirect_path = state.config.redirect_path.clone();

    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/.well-known/oauth-protected-resource", get(handlers::handle_protected_resource))
        .route("/.well-known/oauth-authorization-server", get(handlers::handle_auth_server_metadata))
        .route("/register", post(handlers::handle_register))
        .route("/authorize", get(handlers::handle_authorize_get))
        .route(
            &redirect_path,
            get(handlers::handle_callback_get).post(handlers::handle_callback_post),
        )
        .route("/token", post(handlers::handle_token))
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn health_check(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "synapse-mcp",
        "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        "version": env!("CARGO_PKG_VERSION"),
        "auth_mode": state.auth.name(),
        "is_oauth_configured": state.config.is_oauth_configured()
    }))
}

/// Identify the user behind the request's credentials.
async fn handle_session(State(state): State<Arc<HttpState>>) -> ProxyResult<impl IntoResponse> {
    let credentials = resolve_credentials(&state.auth).await?;
    Ok(Json(serde_json::json!({
        "authenticated": true,
        "auth_mode": state.auth.name(),
        "subject": credentials.subject
    })))
}
