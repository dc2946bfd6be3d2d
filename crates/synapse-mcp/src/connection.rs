//! Credentials for outbound calls to the Synapse data API.
//!
//! Callers ask for the credential of the user behind the current request and
//! open their own connection with it; no token is ever shared between users.

use std::sync::Arc;

use crate::error::{ProxyError, ProxyResult};
use crate::server::oauth::SessionAwareProxy;

/// How requests are authenticated.
#[derive(Clone)]
pub enum AuthMode {
    /// Production: per-user upstream tokens obtained through the OAuth proxy.
    OAuth(Arc<SessionAwareProxy>),
    /// Development: one personal access token for every request.
    Pat(String),
}

impl AuthMode {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::OAuth(_) => "oauth",
            Self::Pat(_) => "pat",
        }
    }

    #[must_use]
    pub fn oauth(&self) -> Option<&Arc<SessionAwareProxy>> {
        match self {
            Self::OAuth(proxy) => Some(proxy),
            Self::Pat(_) => None,
        }
    }
}

impl std::fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Credential for one downstream connection.
#[derive(Clone, PartialEq, Eq)]
pub struct DownstreamCredentials {
    /// Bearer token to present to the data API.
    pub token: String,
    /// Upstream subject; `None` in PAT mode.
    pub subject: Option<String>,
}

impl std::fmt::Debug for DownstreamCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownstreamCredentials").field("subject", &self.subject).finish()
    }
}

/// Resolve the credential for the user behind the current request.
///
/// # Errors
///
/// `AuthenticationRequired` when OAuth is active and no live token is mapped
/// for the current user; `Storage` when the user token store fails.
pub async fn resolve_credentials(mode: &AuthMode) -> ProxyResult<DownstreamCredentials> {
    match mode {
        AuthMode::Pat(pat) => Ok(DownstreamCredentials { token: pat.clone(), subject: None }),
        AuthMode::OAuth(proxy) => {
            let (token, subject) = proxy
                .get_token_for_current_user()
                .await?
                .ok_or(ProxyError::AuthenticationRequired)?;
            tracing::debug!(subject = %subject, "Resolved downstream credentials");
            Ok(DownstreamCredentials { token, subject: Some(subject) })
        }
    }
}
