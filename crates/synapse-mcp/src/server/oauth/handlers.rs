//! OAuth 2.0 endpoint handlers.
//!
//! Implements:
//! - RFC 9728: OAuth Protected Resource Metadata
//! - RFC 8414: OAuth Authorization Server Metadata
//! - RFC 7591: Dynamic Client Registration
//! - RFC 6749: Authorization Code Grant (proxied to the upstream IdP)

use std::sync::Arc;

use axum::{
    Form, Json,
    extract::{Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use axum_extra::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Basic};
use serde::Deserialize;

use super::base::{AuthorizeParams, CallbackParams, TokenParams};
use super::proxy::SessionAwareProxy;
use super::store::OAuthStore;
use super::types::{ClientRegistration, UpstreamTokens};
use crate::error::{ProxyError, ProxyResult, RegistrationError};
use crate::server::transport::HttpState;

fn oauth_proxy(state: &HttpState) -> ProxyResult<&Arc<SessionAwareProxy>> {
    state
        .auth
        .oauth()
        .ok_or_else(|| ProxyError::invalid_request("OAuth is not configured on this server"))
}

// ─── RFC 9728: Protected Resource Metadata ───────────────────────────────────

/// `GET /.well-known/oauth-protected-resource`
///
/// Tells clients where to find the authorization server for this resource.
pub async fn handle_protected_resource(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "resource": state.config.server_url,
        "authorization_servers": [format!("{}/", state.config.origin())],
        "scopes_supported": state.config.required_scopes,
        "bearer_methods_supported": ["header"]
    }))
}

// ─── RFC 8414: Authorization Server Metadata ─────────────────────────────────

/// `GET /.well-known/oauth-authorization-server`
pub async fn handle_auth_server_metadata(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let origin = state.config.origin();
    Json(serde_json::json!({
        "issuer": origin,
        "authorization_endpoint": format!("{origin}/authorize"),
        "token_endpoint": format!("{origin}/token"),
        "registration_endpoint": format!("{origin}/register"),
        "scopes_supported": state.config.required_scopes,
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "token_endpoint_auth_methods_supported": ["none", "client_secret_post", "client_secret_basic"],
        "code_challenge_methods_supported": ["S256"]
    }))
}

// ─── RFC 7591: Dynamic Client Registration ───────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub client_name: Option<String>,
    pub redirect_uris: Option<Vec<String>>,
    #[serde(default)]
    pub grant_types: Vec<String>,
    #[serde(default)]
    pub response_types: Vec<String>,
    pub token_endpoint_auth_method: Option<String>,
    pub scope: Option<String>,
}

/// `POST /register`
///
/// Register a new OAuth client dynamically.
pub async fn handle_register(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<RegisterRequest>,
) -> ProxyResult<Response> {
    let proxy = oauth_proxy(&state)?;

    if state.registration_limiter.check().is_err() {
        tracing::warn!("Dynamic client registration rate limit exceeded");
        return Err(ProxyError::RateLimited);
    }

    if !req.response_types.is_empty() && !req.response_types.iter().any(|t| t == "code") {
        return Err(RegistrationError::invalid("response_types must include code").into());
    }

    let auth_method = req.token_endpoint_auth_method.unwrap_or_else(|| "none".to_owned());
    let client_secret = match auth_method.as_str() {
        "none" => None,
        "client_secret_post" | "client_secret_basic" => Some(OAuthStore::generate_token()),
        other => {
            return Err(RegistrationError::invalid(format!(
                "unsupported token_endpoint_auth_method '{other}'"
            ))
            .into());
        }
    };

    let registration = ClientRegistration {
        client_id: uuid::Uuid::new_v4().to_string(),
        client_secret,
        client_name: req.client_name,
        redirect_uris: req.redirect_uris.unwrap_or_default(),
        grant_types: req.grant_types,
        token_endpoint_auth_method: auth_method,
        scope: req.scope,
    };

    let client = proxy.register_client(registration).await?;

    let mut body = serde_json::json!({
        "client_id": client.client_id,
        "client_id_issued_at": chrono::Utc::now().timestamp(),
        "client_name": client.client_name,
        "redirect_uris": client.redirect_uris,
        "grant_types": client.grant_types,
        "response_types": ["code"],
        "token_endpoint_auth_method": client.token_endpoint_auth_method
    });
    if let Some(secret) = client.client_secret {
        body["client_secret"] = serde_json::Value::String(secret);
        body["client_secret_expires_at"] = serde_json::Value::from(0);
    }
    if let Some(scope) = client.scope {
        body["scope"] = serde_json::Value::String(scope);
    }

    Ok((StatusCode::CREATED, Json(body)).into_response())
}

// ─── Authorization Endpoint ──────────────────────────────────────────────────

/// `GET /authorize`
///
/// Validate the request and send the browser to the upstream IdP.
pub async fn handle_authorize_get(
    State(state): State<Arc<HttpState>>,
    Query(params): Query<AuthorizeParams>,
) -> ProxyResult<Response> {
    let location = oauth_proxy(&state)?.authorize(&params).await?;
    Ok(redirect(&location))
}

// ─── Upstream Callback ───────────────────────────────────────────────────────

/// `GET <redirect_path>`
pub async fn handle_callback_get(
    State(state): State<Arc<HttpState>>,
    Query(params): Query<CallbackParams>,
) -> ProxyResult<Response> {
    handle_callback(&state, &params).await
}

/// `POST <redirect_path>` (form_post response mode)
pub async fn handle_callback_post(
    State(state): State<Arc<HttpState>>,
    Form(params): Form<CallbackParams>,
) -> ProxyResult<Response> {
    handle_callback(&state, &params).await
}

async fn handle_callback(state: &HttpState, params: &CallbackParams) -> ProxyResult<Response> {
    let location = oauth_proxy(state)?.handle_idp_callback(params).await?;
    Ok(redirect(&location))
}

// ─── Token Endpoint ──────────────────────────────────────────────────────────

/// `POST /token`
///
/// Exchange a proxy-issued code or an upstream refresh token. Client
/// credentials may come from the form or an HTTP basic header.
pub async fn handle_token(
    State(state): State<Arc<HttpState>>,
    basic: Option<TypedHeader<Authorization<Basic>>>,
    Form(mut params): Form<TokenParams>,
) -> ProxyResult<Response> {
    let proxy = oauth_proxy(&state)?;

    if let Some(TypedHeader(Authorization(credentials))) = basic {
        if params.client_id.is_none() {
            params.client_id = Some(credentials.username().to_owned());
        }
        if params.client_secret.is_none() {
            params.client_secret = Some(credentials.password().to_owned());
        }
    }

    let tokens = proxy.exchange_token(&params).await?;
    Ok(token_success(&tokens))
}

/// Build a token response with required OAuth 2.0 cache headers (RFC 6749 §5.1).
fn token_success(tokens: &UpstreamTokens) -> Response {
    let mut response = Json(tokens).into_response();

    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    response
}

fn redirect(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (StatusCode::FOUND, [(header::LOCATION, value)]).into_response(),
        Err(_) => ProxyError::Internal("redirect location is not a valid header".into()).into_response(),
    }
}
