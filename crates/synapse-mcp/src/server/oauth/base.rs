//! Minimal authorization-code proxy in front of the upstream IdP.
//!
//! The proxy is the authorization server MCP clients talk to, but it never
//! authenticates users itself:
//!
//! 1. `authorize` validates the client and PKCE parameters, parks the request
//!    under a random transaction id and redirects the browser upstream.
//! 2. The upstream IdP calls back with a code; the proxy exchanges it for
//!    upstream tokens and hands the client a one-time code of its own.
//! 3. `exchange_token` checks the client's PKCE verifier against that code
//!    and returns the upstream tokens, recording the access token in the
//!    shared [`TokenCache`].

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};
use url::Url;

use super::jwt::TokenVerifier;
use super::pkce;
use super::store::OAuthStore;
use super::token_cache::TokenCache;
use super::types::{
    AccessTokenRecord, ClientRegistration, ClientSource, GRANT_AUTHORIZATION_CODE,
    GRANT_REFRESH_TOKEN, PendingAuthorization, RegisteredClient, UpstreamTokens,
    VerifiedAccessToken,
};
use super::upstream::UpstreamClient;
use crate::config::Config;
use crate::error::{ProxyError, ProxyResult, UpstreamError, VerificationError};

/// Query of `GET /authorize`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthorizeParams {
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub response_type: Option<String>,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub scope: Option<String>,
}

/// Parameters the upstream IdP sends to the callback.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Form of `POST /token`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenParams {
    pub grant_type: String,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
}

/// Where the proxy lives and what it asks the upstream for.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Scheme and authority the OAuth routes are served from.
    pub server_url: String,
    pub redirect_path: String,
    /// Scope requested upstream when the client does not name one.
    pub default_scope: String,
}

impl ProxySettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            server_url: config.origin(),
            redirect_path: config.redirect_path.clone(),
            default_scope: config.required_scopes.join(" "),
        }
    }

    #[must_use]
    pub fn callback_url(&self) -> String {
        format!("{}{}", self.server_url, self.redirect_path)
    }
}

/// Base authorization-code proxy.
pub struct OAuthProxy {
    store: OAuthStore,
    upstream: UpstreamClient,
    verifier: Arc<dyn TokenVerifier>,
    settings: ProxySettings,
}

impl OAuthProxy {
    #[must_use]
    pub fn new(
        store: OAuthStore,
        upstream: UpstreamClient,
        verifier: Arc<dyn TokenVerifier>,
        settings: ProxySettings,
    ) -> Self {
        Self { store, upstream, verifier, settings }
    }

    #[must_use]
    pub fn store(&self) -> &OAuthStore {
        &self.store
    }

    #[must_use]
    pub fn token_cache(&self) -> &TokenCache {
        self.store.token_cache()
    }

    #[must_use]
    pub fn verifier(&self) -> &Arc<dyn TokenVerifier> {
        &self.verifier
    }

    /// Add a client to the in-memory table. Returns `false` if a static
    /// client with the same id blocked a dynamic insert.
    pub async fn register_client(&self, source: ClientSource, registration: ClientRegistration) -> bool {
        self.store.put_client(source, registration).await
    }

    pub async fn get_client(&self, client_id: &str) -> Option<RegisteredClient> {
        self.store.get_client(client_id).await
    }

    /// Validate an authorization request and build the upstream redirect.
    pub async fn authorize(&self, params: &AuthorizeParams) -> ProxyResult<String> {
        let client_id = required(params.client_id.as_deref(), "client_id")?;
        let redirect_uri = required(params.redirect_uri.as_deref(), "redirect_uri")?;
        let code_challenge = required(params.code_challenge.as_deref(), "code_challenge")?;

        if params.response_type.as_deref() != Some("code") {
            return Err(ProxyError::InvalidRequest {
                error: "unsupported_response_type",
                description: "response_type must be 'code'".into(),
            });
        }
        if params.code_challenge_method.as_deref() != Some(pkce::METHOD_S256) {
            return Err(ProxyError::invalid_request("code_challenge_method must be 'S256'"));
        }

        let client = self
            .store
            .get_client(client_id)
            .await
            .ok_or_else(|| ProxyError::invalid_client("Unknown client_id"))?;

        if !client.registration.allows_redirect(redirect_uri) {
            return Err(ProxyError::invalid_request("redirect_uri not registered for this client"));
        }

        let scope = params
            .scope
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.settings.default_scope)
            .to_owned();

        let txn_id = self
            .store
            .create_pending(PendingAuthorization {
                client_id: client_id.to_owned(),
                redirect_uri: redirect_uri.to_owned(),
                client_state: params.state.clone(),
                code_challenge: code_challenge.to_owned(),
                scope: scope.clone(),
                created_at: std::time::Instant::now(),
            })
            .await;

        let mut upstream_url = Url::parse(&self.upstream.endpoints().authorization_endpoint)
            .map_err(|e| ProxyError::Internal(format!("invalid upstream authorization endpoint: {e}")))?;
        upstream_url
            .query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", self.upstream.client_id())
            .append_pair("redirect_uri", &self.settings.callback_url())
            .append_pair("scope", &scope)
            .append_pair("state", &txn_id);

        info!(client_id = %client_id, scope = %scope, "Forwarding authorization to upstream");
        Ok(upstream_url.into())
    }

    /// Complete the upstream leg and return the client redirect location.
    ///
    /// The client's own `state` is forwarded verbatim and omitted when the
    /// client sent none.
    pub async fn handle_idp_callback(&self, params: &CallbackParams) -> ProxyResult<String> {
        let txn_id = required(params.state.as_deref(), "state")?;
        let pending = self
            .store
            .take_pending(txn_id)
            .await
            .ok_or_else(|| ProxyError::invalid_request("Unknown or expired authorization transaction"))?;

        if let Some(error) = params.error.as_deref() {
            warn!(client_id = %pending.client_id, error = %error, "Upstream denied authorization");
            let mut pairs = vec![("error", error)];
            if let Some(description) = params.error_description.as_deref() {
                pairs.push(("error_description", description));
            }
            return client_redirect(&pending, &pairs);
        }

        let code = required(params.code.as_deref(), "code")?;
        let tokens = self
            .upstream
            .exchange_code(code, &self.settings.callback_url())
            .await
            .map_err(upstream_grant_error)?;

        let client_code = self.store.create_client_code(&pending, tokens).await;
        info!(client_id = %pending.client_id, "Upstream code exchanged, redirecting client");
        client_redirect(&pending, &[("code", client_code.as_str())])
    }

    /// Token endpoint: `authorization_code` and `refresh_token` grants.
    pub async fn exchange_token(&self, params: &TokenParams) -> ProxyResult<UpstreamTokens> {
        match params.grant_type.as_str() {
            GRANT_AUTHORIZATION_CODE => self.exchange_authorization_code(params).await,
            GRANT_REFRESH_TOKEN => self.exchange_refresh_token(params).await,
            other => Err(ProxyError::InvalidRequest {
                error: "unsupported_grant_type",
                description: format!("grant_type '{other}' is not supported"),
            }),
        }
    }

    pub async fn verify_token(&self, token: &str) -> Result<VerifiedAccessToken, VerificationError> {
        self.verifier.verify_token(token).await
    }

    async fn exchange_authorization_code(&self, params: &TokenParams) -> ProxyResult<UpstreamTokens> {
        let code = required(params.code.as_deref(), "code")?;
        let code_verifier = required(params.code_verifier.as_deref(), "code_verifier")?;

        let client_code = self
            .store
            .consume_client_code(code)
            .await
            .ok_or_else(|| ProxyError::invalid_grant("Invalid or expired authorization code"))?;

        if params.client_id.as_deref().is_some_and(|id| id != client_code.client_id) {
            return Err(ProxyError::invalid_grant("client_id mismatch"));
        }
        self.authenticate_client(&client_code.client_id, params.client_secret.as_deref())
            .await?;

        if params.redirect_uri.as_deref().is_some_and(|uri| uri != client_code.redirect_uri) {
            return Err(ProxyError::invalid_grant("redirect_uri mismatch"));
        }

        if !pkce::verify_s256(code_verifier, &client_code.code_challenge) {
            return Err(ProxyError::invalid_grant("PKCE verification failed"));
        }

        self.record_tokens(&client_code.client_id, &client_code.tokens).await;
        info!(client_id = %client_code.client_id, "Issued upstream tokens to client");
        Ok(client_code.tokens)
    }

    async fn exchange_refresh_token(&self, params: &TokenParams) -> ProxyResult<UpstreamTokens> {
        let refresh_token = required(params.refresh_token.as_deref(), "refresh_token")?;

        let owner = self.store.take_refresh_owner(refresh_token).await;
        let client_id = match (owner, params.client_id.as_deref()) {
            (Some(owner), Some(requested)) if owner != requested => {
                self.store.bind_refresh_token(refresh_token, &owner).await;
                return Err(ProxyError::invalid_grant("refresh_token was issued to another client"));
            }
            (Some(owner), _) => owner,
            (None, Some(requested)) => requested.to_owned(),
            (None, None) => return Err(ProxyError::invalid_request("Missing client_id")),
        };

        if let Err(e) = self.authenticate_client(&client_id, params.client_secret.as_deref()).await {
            self.store.bind_refresh_token(refresh_token, &client_id).await;
            return Err(e);
        }

        let mut tokens = match self.upstream.refresh(refresh_token, params.scope.as_deref()).await {
            Ok(tokens) => tokens,
            Err(e) => {
                // A transport failure leaves the refresh token usable.
                if matches!(e, UpstreamError::Http(_)) {
                    self.store.bind_refresh_token(refresh_token, &client_id).await;
                }
                return Err(upstream_grant_error(e));
            }
        };

        // Upstream may not rotate refresh tokens.
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(refresh_token.to_owned());
        }

        self.record_tokens(&client_id, &tokens).await;
        info!(client_id = %client_id, "Refreshed upstream tokens");
        Ok(tokens)
    }

    async fn authenticate_client(&self, client_id: &str, secret: Option<&str>) -> ProxyResult<RegisteredClient> {
        let client = self
            .store
            .get_client(client_id)
            .await
            .ok_or_else(|| ProxyError::invalid_client("Unknown client"))?;

        if client.registration.is_confidential()
            && secret != client.registration.client_secret.as_deref()
        {
            return Err(ProxyError::invalid_client("Client authentication failed"));
        }
        Ok(client)
    }

    async fn record_tokens(&self, client_id: &str, tokens: &UpstreamTokens) {
        let expires_at = tokens.expires_in.map(|secs| epoch_now().saturating_add(secs));
        self.token_cache()
            .insert(
                tokens.access_token.clone(),
                AccessTokenRecord::new(client_id, tokens.scopes(), expires_at),
            )
            .await;
        if let Some(refresh_token) = tokens.refresh_token.as_deref() {
            self.store.bind_refresh_token(refresh_token, client_id).await;
        }
    }
}

impl std::fmt::Debug for OAuthProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthProxy")
            .field("upstream", &self.upstream)
            .field("settings", &self.settings)
            .finish()
    }
}

fn required<'a>(value: Option<&'a str>, name: &str) -> ProxyResult<&'a str> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ProxyError::invalid_request(format!("Missing {name}")))
}

fn client_redirect(pending: &PendingAuthorization, pairs: &[(&str, &str)]) -> ProxyResult<String> {
    let mut url = Url::parse(&pending.redirect_uri)
        .map_err(|e| ProxyError::Internal(format!("stored redirect_uri is invalid: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        for (key, value) in pairs {
            query.append_pair(key, value);
        }
        if let Some(state) = pending.client_state.as_deref() {
            query.append_pair("state", state);
        }
    }
    Ok(url.into())
}

/// Upstream 4xx on a grant means the grant is bad, not that the proxy is.
fn upstream_grant_error(err: UpstreamError) -> ProxyError {
    match err {
        UpstreamError::Status { status, body } if (400..500).contains(&status) => {
            warn!(status, body = %body, "Upstream rejected grant");
            ProxyError::invalid_grant("Upstream identity provider rejected the grant")
        }
        other => other.into(),
    }
}

fn epoch_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use sha2::{Digest, Sha256};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::error::VerificationErrorKind;

    const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    const NO_SCOPES: &[String] = &[];

    struct RejectAll;

    #[async_trait]
    impl TokenVerifier for RejectAll {
        async fn verify_token(&self, _token: &str) -> Result<VerifiedAccessToken, VerificationError> {
            Err(VerificationError::new(VerificationErrorKind::BadSignature, "test"))
        }

        fn required_scopes(&self) -> &[String] {
            NO_SCOPES
        }
    }

    async fn proxy_for(server: &MockServer) -> OAuthProxy {
        let config = Config::for_testing(&server.uri());
        let upstream = UpstreamClient::from_config(&config).unwrap().unwrap();
        let proxy = OAuthProxy::new(
            OAuthStore::default(),
            upstream,
            Arc::new(RejectAll),
            ProxySettings::from_config(&config),
        );
        let mut reg = ClientRegistration::new("client1", vec!["http://localhost:3000/cb".into()]);
        reg.normalize_grant_types();
        assert!(proxy.register_client(ClientSource::Dynamic, reg).await);
        proxy
    }

    fn authorize_params(state: Option<&str>) -> AuthorizeParams {
        AuthorizeParams {
            client_id: Some("client1".into()),
            redirect_uri: Some("http://localhost:3000/cb".into()),
            response_type: Some("code".into()),
            state: state.map(str::to_owned),
            code_challenge: Some(URL_SAFE_NO_PAD.encode(Sha256::digest(VERIFIER.as_bytes()))),
            code_challenge_method: Some("S256".into()),
            scope: None,
        }
    }

    fn query_value(location: &str, key: &str) -> Option<String> {
        Url::parse(location)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    async fn mount_token_endpoint(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "upstream-at",
                "token_type": "Bearer",
                "expires_in": 3600,
                "refresh_token": "upstream-rt",
                "scope": "openid view"
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_authorize_redirects_upstream_with_transaction_state() {
        let server = MockServer::start().await;
        let proxy = proxy_for(&server).await;

        let location = proxy.authorize(&authorize_params(Some("client-state"))).await.unwrap();
        assert!(location.starts_with(&format!("{}/authorize?", server.uri())));
        assert_eq!(query_value(&location, "client_id").as_deref(), Some("proxy-client"));
        assert_eq!(
            query_value(&location, "redirect_uri").as_deref(),
            Some("http://localhost:9000/oauth/callback")
        );
        assert_eq!(query_value(&location, "scope").as_deref(), Some("openid view"));
        // The client's state never goes upstream
        assert_ne!(query_value(&location, "state").as_deref(), Some("client-state"));
    }

    #[tokio::test]
    async fn test_authorize_rejects_bad_requests() {
        let server = MockServer::start().await;
        let proxy = proxy_for(&server).await;

        let mut params = authorize_params(None);
        params.redirect_uri = Some("https://evil.example/cb".into());
        assert!(proxy.authorize(&params).await.is_err());

        let mut params = authorize_params(None);
        params.code_challenge_method = Some("plain".into());
        assert!(proxy.authorize(&params).await.is_err());

        let mut params = authorize_params(None);
        params.client_id = Some("unknown".into());
        let err = proxy.authorize(&params).await.unwrap_err();
        assert_eq!(err.status_and_code().1, "invalid_client");
    }

    #[tokio::test]
    async fn test_full_code_flow() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server).await;
        let proxy = proxy_for(&server).await;

        let upstream = proxy.authorize(&authorize_params(Some("xyz"))).await.unwrap();
        let txn = query_value(&upstream, "state");

        let location = proxy
            .handle_idp_callback(&CallbackParams {
                code: Some("upstream-code".into()),
                state: txn,
                ..CallbackParams::default()
            })
            .await
            .unwrap();
        assert!(location.starts_with("http://localhost:3000/cb?code="));
        assert!(location.ends_with("&state=xyz"));

        let tokens = proxy
            .exchange_token(&TokenParams {
                grant_type: "authorization_code".into(),
                code: query_value(&location, "code"),
                redirect_uri: Some("http://localhost:3000/cb".into()),
                code_verifier: Some(VERIFIER.into()),
                client_id: Some("client1".into()),
                ..TokenParams::default()
            })
            .await
            .unwrap();
        assert_eq!(tokens.access_token, "upstream-at");

        let record = proxy.token_cache().get("upstream-at").await.unwrap();
        assert_eq!(record.client_id, "client1");
        assert_eq!(record.scopes, vec!["openid", "view"]);
        assert!(record.expires_at.is_some());
    }

    #[tokio::test]
    async fn test_absent_client_state_is_omitted() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server).await;
        let proxy = proxy_for(&server).await;

        let upstream = proxy.authorize(&authorize_params(None)).await.unwrap();
        let location = proxy
            .handle_idp_callback(&CallbackParams {
                code: Some("upstream-code".into()),
                state: query_value(&upstream, "state"),
                ..CallbackParams::default()
            })
            .await
            .unwrap();
        assert!(query_value(&location, "state").is_none());
    }

    #[tokio::test]
    async fn test_upstream_error_is_relayed_to_client() {
        let server = MockServer::start().await;
        let proxy = proxy_for(&server).await;

        let upstream = proxy.authorize(&authorize_params(Some("s1"))).await.unwrap();
        let location = proxy
            .handle_idp_callback(&CallbackParams {
                state: query_value(&upstream, "state"),
                error: Some("access_denied".into()),
                ..CallbackParams::default()
            })
            .await
            .unwrap();
        assert_eq!(query_value(&location, "error").as_deref(), Some("access_denied"));
        assert_eq!(query_value(&location, "state").as_deref(), Some("s1"));
        assert!(query_value(&location, "code").is_none());
    }

    #[tokio::test]
    async fn test_wrong_verifier_and_code_reuse() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server).await;
        let proxy = proxy_for(&server).await;

        let upstream = proxy.authorize(&authorize_params(None)).await.unwrap();
        let location = proxy
            .handle_idp_callback(&CallbackParams {
                code: Some("c".into()),
                state: query_value(&upstream, "state"),
                ..CallbackParams::default()
            })
            .await
            .unwrap();
        let code = query_value(&location, "code");

        let params = TokenParams {
            grant_type: "authorization_code".into(),
            code: code.clone(),
            code_verifier: Some("x".repeat(43)),
            ..TokenParams::default()
        };
        let err = proxy.exchange_token(&params).await.unwrap_err();
        assert_eq!(err.status_and_code().1, "invalid_grant");

        // The code was consumed by the failed attempt
        let params = TokenParams { code_verifier: Some(VERIFIER.into()), ..params };
        assert!(proxy.exchange_token(&params).await.is_err());
        assert!(proxy.token_cache().is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_transaction_rejected() {
        let server = MockServer::start().await;
        let proxy = proxy_for(&server).await;
        let err = proxy
            .handle_idp_callback(&CallbackParams {
                code: Some("c".into()),
                state: Some("forged".into()),
                ..CallbackParams::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.status_and_code().1, "invalid_request");
    }

    #[tokio::test]
    async fn test_refresh_keeps_binding_and_records_token() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server).await;
        let proxy = proxy_for(&server).await;
        proxy.store().bind_refresh_token("old-rt", "client1").await;

        let err = proxy
            .exchange_token(&TokenParams {
                grant_type: "refresh_token".into(),
                refresh_token: Some("old-rt".into()),
                client_id: Some("someone-else".into()),
                ..TokenParams::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.status_and_code().1, "invalid_grant");

        let tokens = proxy
            .exchange_token(&TokenParams {
                grant_type: "refresh_token".into(),
                refresh_token: Some("old-rt".into()),
                ..TokenParams::default()
            })
            .await
            .unwrap();
        assert_eq!(tokens.access_token, "upstream-at");
        assert!(proxy.token_cache().contains("upstream-at").await);
        assert_eq!(proxy.store().take_refresh_owner("upstream-rt").await.as_deref(), Some("client1"));
    }

    #[tokio::test]
    async fn test_confidential_client_must_present_its_secret() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server).await;
        let proxy = proxy_for(&server).await;
        let mut reg = ClientRegistration::new("secret-client", vec!["http://localhost:3000/cb".into()]);
        reg.client_secret = Some("s3cret".into());
        reg.normalize_grant_types();
        assert!(proxy.register_client(ClientSource::Dynamic, reg).await);
        proxy.store().bind_refresh_token("rt-1", "secret-client").await;

        let refresh = |secret: Option<&str>| TokenParams {
            grant_type: "refresh_token".into(),
            refresh_token: Some("rt-1".into()),
            client_secret: secret.map(str::to_owned),
            ..TokenParams::default()
        };

        let err = proxy.exchange_token(&refresh(None)).await.unwrap_err();
        assert_eq!(err.status_and_code().1, "invalid_client");
        let err = proxy.exchange_token(&refresh(Some("wrong"))).await.unwrap_err();
        assert_eq!(err.status_and_code().1, "invalid_client");

        let tokens = proxy.exchange_token(&refresh(Some("s3cret"))).await.unwrap();
        assert_eq!(tokens.access_token, "upstream-at");
    }

    #[tokio::test]
    async fn test_unsupported_grant() {
        let server = MockServer::start().await;
        let proxy = proxy_for(&server).await;
        let err = proxy
            .exchange_token(&TokenParams { grant_type: "password".into(), ..TokenParams::default() })
            .await
            .unwrap_err();
        assert_eq!(err.status_and_code().1, "unsupported_grant_type");
    }
}
