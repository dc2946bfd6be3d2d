//! Bearer authentication for protected routes.
//!
//! In OAuth mode every protected request must carry an upstream access
//! token that passes JWT verification; the verified token is then made
//! available to the handler (and anything it calls) for the rest of the
//! request. PAT mode has a single server-side credential and lets requests
//! through.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderValue, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Bearer};

use super::oauth::proxy::with_request_token;
use super::transport::HttpState;
use crate::connection::AuthMode;
use crate::error::ProxyError;

/// `WWW-Authenticate` challenge pointing clients at the resource metadata.
fn challenge(state: &HttpState, error: Option<&str>) -> HeaderValue {
    let metadata = format!("{}/.well-known/oauth-protected-resource", state.config.origin());
    let value = match error {
        Some(error) => format!(r#"Bearer error="{error}", resource_metadata="{metadata}""#),
        None => format!(r#"Bearer resource_metadata="{metadata}""#),
    };
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("Bearer"))
}

fn unauthorized(state: &HttpState, err: ProxyError, error_code: Option<&str>) -> Response {
    let mut response = err.into_response();
    response.headers_mut().insert(header::WWW_AUTHENTICATE, challenge(state, error_code));
    response
}

/// Middleware: require and verify a bearer token in OAuth mode.
pub async fn require_bearer(
    State(state): State<Arc<HttpState>>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    request: Request,
    next: Next,
) -> Response {
    let proxy = match &state.auth {
        AuthMode::Pat(_) => return next.run(request).await,
        AuthMode::OAuth(proxy) => Arc::clone(proxy),
    };

    let Some(TypedHeader(Authorization(bearer))) = bearer else {
        tracing::debug!(path = %request.uri().path(), "Missing bearer token");
        return unauthorized(&state, ProxyError::AuthenticationRequired, None);
    };

    match proxy.verify_token(bearer.token()).await {
        Ok(verified) => {
            tracing::debug!(client_id = %verified.client_id, sub = ?verified.sub, "Bearer token verified");
            with_request_token(verified, next.run(request)).await
        }
        Err(e) => {
            tracing::info!(kind = ?e.kind, "Rejected bearer token");
            unauthorized(&state, e.into(), Some("invalid_token"))
        }
    }
}
