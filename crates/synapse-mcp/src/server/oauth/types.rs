//! OAuth 2.0 types for the session-aware proxy.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::RegistrationError;

pub const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";
pub const GRANT_REFRESH_TOKEN: &str = "refresh_token";

/// Lifetime of pending authorizations and proxy-issued client codes: 10 minutes.
const FLOW_STEP_LIFETIME: u64 = 600;

fn default_auth_method() -> String {
    "none".to_owned()
}

/// A registered OAuth client, as persisted by the client registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRegistration {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub grant_types: Vec<String>,
    #[serde(default = "default_auth_method")]
    pub token_endpoint_auth_method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl ClientRegistration {
    /// Public client with the given redirect URIs and no grant types yet.
    #[must_use]
    pub fn new(client_id: impl Into<String>, redirect_uris: Vec<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            client_name: None,
            redirect_uris,
            grant_types: Vec::new(),
            token_endpoint_auth_method: default_auth_method(),
            scope: None,
        }
    }

    /// Ensure `refresh_token` accompanies `authorization_code`.
    ///
    /// Many MCP clients register with `["authorization_code"]` only and would
    /// otherwise be unable to refresh. An empty list means both.
    pub fn normalize_grant_types(&mut self) {
        if self.grant_types.is_empty() {
            self.grant_types =
                vec![GRANT_AUTHORIZATION_CODE.to_owned(), GRANT_REFRESH_TOKEN.to_owned()];
            return;
        }
        let has = |grant: &str| self.grant_types.iter().any(|g| g == grant);
        if has(GRANT_AUTHORIZATION_CODE) && !has(GRANT_REFRESH_TOKEN) {
            self.grant_types.push(GRANT_REFRESH_TOKEN.to_owned());
        }
    }

    /// Validate client metadata (RFC 7591 §2).
    pub fn validate(&self) -> Result<(), RegistrationError> {
        if self.client_id.trim().is_empty() {
            return Err(RegistrationError::invalid("client_id is required"));
        }
        if self.redirect_uris.is_empty() {
            return Err(RegistrationError::invalid("redirect_uris is required"));
        }
        for uri in &self.redirect_uris {
            Url::parse(uri)
                .map_err(|e| RegistrationError::invalid(format!("invalid redirect_uri '{uri}': {e}")))?;
        }
        if !self.grant_types.iter().any(|g| g == GRANT_AUTHORIZATION_CODE) {
            return Err(RegistrationError::invalid("grant_types must include authorization_code"));
        }
        Ok(())
    }

    /// Whether `candidate` matches one of the registered redirect URIs.
    ///
    /// Matching is exact, except that loopback redirects may use any port
    /// (RFC 8252 §7.3): native clients bind an ephemeral port per login.
    #[must_use]
    pub fn allows_redirect(&self, candidate: &str) -> bool {
        if self.redirect_uris.iter().any(|u| u == candidate) {
            return true;
        }
        let Ok(candidate) = Url::parse(candidate) else {
            return false;
        };
        if !is_loopback(&candidate) {
            return false;
        }
        self.redirect_uris.iter().filter_map(|u| Url::parse(u).ok()).any(|registered| {
            is_loopback(&registered)
                && registered.scheme() == candidate.scheme()
                && registered.host_str() == candidate.host_str()
                && registered.path() == candidate.path()
        })
    }

    #[must_use]
    pub fn is_confidential(&self) -> bool {
        self.client_secret.is_some()
    }
}

fn is_loopback(url: &Url) -> bool {
    url.scheme() == "http" && matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"))
}

/// Where a client-table entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientSource {
    /// Pre-shared descriptor from configuration; wins on id conflicts.
    Static,
    /// Dynamic registration (RFC 7591), possibly reloaded from the registry.
    Dynamic,
}

/// A client-table entry.
#[derive(Debug, Clone)]
pub struct RegisteredClient {
    pub source: ClientSource,
    pub registration: ClientRegistration,
}

/// An upstream access token handed to a client, as tracked by the token cache.
#[derive(Debug, Clone)]
pub struct AccessTokenRecord {
    /// Client that received the token.
    pub client_id: String,
    pub scopes: Vec<String>,
    /// Expiry in epoch seconds, when the upstream reported one.
    pub expires_at: Option<u64>,
    /// When the proxy first saw the token.
    pub issued_at: Instant,
}

impl AccessTokenRecord {
    #[must_use]
    pub fn new(client_id: impl Into<String>, scopes: Vec<String>, expires_at: Option<u64>) -> Self {
        Self { client_id: client_id.into(), scopes, expires_at, issued_at: Instant::now() }
    }
}

/// Result of a successful bearer token verification. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedAccessToken {
    pub raw_token: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub expires_at: Option<u64>,
    pub sub: Option<String>,
}

/// Token endpoint response from the upstream identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamTokens {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_owned()
}

impl UpstreamTokens {
    /// Granted scopes, split from the space-delimited `scope` field.
    #[must_use]
    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .map(|s| s.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default()
    }
}

/// An authorization request forwarded upstream, keyed by the transaction id
/// sent as the upstream `state`.
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    pub client_id: String,
    pub redirect_uri: String,
    /// The client's own `state`, forwarded back verbatim.
    pub client_state: Option<String>,
    pub code_challenge: String,
    pub scope: String,
    pub created_at: Instant,
}

impl PendingAuthorization {
    /// Check if the transaction has expired (10 minute lifetime).
    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed().as_secs() > FLOW_STEP_LIFETIME
    }
}

/// A one-time code the proxy issues to the client after the upstream exchange.
#[derive(Debug, Clone)]
pub struct ClientCode {
    pub client_id: String,
    pub redirect_uri: String,
    pub code_challenge: String,
    pub tokens: UpstreamTokens,
    pub created_at: Instant,
    pub used: bool,
}

impl ClientCode {
    /// Check if the code has expired (10 minute lifetime).
    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed().as_secs() > FLOW_STEP_LIFETIME
    }
}
