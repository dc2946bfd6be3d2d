//! Client for the upstream identity provider's token endpoint.

use std::time::Duration;

use tracing::{debug, warn};

use super::types::{GRANT_AUTHORIZATION_CODE, GRANT_REFRESH_TOKEN, UpstreamTokens};
use crate::config::{Config, UpstreamEndpoints};
use crate::error::UpstreamError;

/// Longest upstream error body kept in errors and logs.
const MAX_ERROR_BODY: usize = 512;

/// Token endpoint client authenticating with HTTP basic client credentials.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    endpoints: UpstreamEndpoints,
    client_id: String,
    client_secret: String,
}

impl UpstreamClient {
    /// Create a new upstream client.
    ///
    /// # Errors
    ///
    /// Returns error if HTTP client initialization fails.
    pub fn new(
        endpoints: UpstreamEndpoints,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("synapse-mcp/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            endpoints,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        })
    }

    /// Build from configuration. Returns `Ok(None)` when OAuth is not configured.
    pub fn from_config(config: &Config) -> Result<Option<Self>, reqwest::Error> {
        config
            .oauth
            .as_ref()
            .map(|oauth| {
                Self::new(
                    config.endpoints.clone(),
                    oauth.client_id.clone(),
                    oauth.client_secret.clone(),
                    config.upstream_timeout,
                )
            })
            .transpose()
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn endpoints(&self) -> &UpstreamEndpoints {
        &self.endpoints
    }

    /// Exchange an upstream authorization code.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<UpstreamTokens, UpstreamError> {
        debug!("Exchanging authorization code with upstream");
        self.token_request(&[
            ("grant_type", GRANT_AUTHORIZATION_CODE),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ])
        .await
    }

    /// Refresh an upstream token, optionally narrowing the scope.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        scope: Option<&str>,
    ) -> Result<UpstreamTokens, UpstreamError> {
        debug!("Refreshing token with upstream");
        let mut form = vec![("grant_type", GRANT_REFRESH_TOKEN), ("refresh_token", refresh_token)];
        if let Some(scope) = scope {
            form.push(("scope", scope));
        }
        self.token_request(&form).await
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<UpstreamTokens, UpstreamError> {
        let response = self
            .http
            .post(&self.endpoints.token_endpoint)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .header(reqwest::header::ACCEPT, "application/json")
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY).rev().find(|&i| body.is_char_boundary(i)).unwrap_or(0);
                body.truncate(cut);
            }
            warn!(status = status.as_u16(), body = %body, "Upstream token endpoint rejected request");
            return Err(UpstreamError::Status { status: status.as_u16(), body });
        }

        Ok(response.json::<UpstreamTokens>().await?)
    }
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("token_endpoint", &self.endpoints.token_endpoint)
            .field("client_id", &self.client_id)
            .finish()
    }
}
